//! tests/integration/lifecycle.rs
//!
//! Puppet lifecycle and whole-run aborts.
#![cfg(unix)]

use crate::common::harness::{test_feed, FakeNetwork, TestRun};
use std::time::Duration;
use test_log::test;

#[test(tokio::test)]
async fn stopping_twice_fails_the_second_stop() {
    let mut run = TestRun::new().unwrap();
    let summary = run
        .run("enter alice\nstart alice fake-sbot\nstop alice\nstop alice")
        .await;

    let out = run.output();
    assert!(!summary.aborted);
    assert_eq!((summary.passed, summary.failed), (3, 1), "{out}");
    assert!(out.contains("ok 3 - stop alice\n"));
    assert!(out.contains("# alice has been stopped\n"));
    assert!(out.contains("not ok 4 - stop alice\n# puppet alice is not running\n"));
    assert!(!run.sim.puppet("alice").unwrap().is_running());
}

#[test(tokio::test)]
async fn restart_keeps_the_port() {
    let mut run = TestRun::new().unwrap();
    let summary = run
        .run("enter alice\nstart alice fake-sbot\nstop alice\nstart alice fake-sbot")
        .await;

    let out = run.output();
    assert!(summary.success(), "{out}");
    let port = run.sim.puppet("alice").unwrap().port().unwrap();
    let id_line = format!("# alice (0 messages) has id {}\n", FakeNetwork::feed_on(port));
    assert_eq!(out.matches(&id_line).count(), 2, "{out}");
}

#[test(tokio::test)]
async fn undeclared_puppet_bails_out() {
    let mut run = TestRun::new().unwrap();
    let summary = run.run("enter alice\nstart ghost fake-sbot\nenter bob").await;

    let out = run.output();
    assert!(summary.aborted);
    assert!(out.contains("ok 1 - enter alice\n"));
    assert!(out.contains("Bail out! fatal: there is no puppet declared as ghost"), "{out}");
    assert!(out.contains("(start ghost fake-sbot)"));
    assert!(!out.contains("enter bob"));
    // Shutdown still runs.
    assert!(out.contains("# Closing all puppets"));
}

#[test(tokio::test)]
async fn unknown_implementation_bails_out() {
    let mut run = TestRun::new().unwrap();
    let summary = run.run("enter alice\nstart alice go-sbot").await;
    assert!(summary.aborted);
    assert!(run
        .output()
        .contains("Bail out! no such language implementation passed to simulator on startup (go-sbot)"));
}

#[test(tokio::test)]
async fn blank_line_aborts_before_anything_runs() {
    let mut run = TestRun::new().unwrap();
    let summary = run.run("enter alice\n\nenter bob").await;

    let out = run.output();
    assert!(summary.aborted);
    assert_eq!(summary.passed, 0);
    assert!(out.contains("Bail out! line 2"), "{out}");
    assert!(!out.contains("ok 1"));
}

#[test(tokio::test)]
async fn cancelled_run_stops_before_the_next_instruction() {
    let mut run = TestRun::new().unwrap();
    run.cancel.cancel();
    let summary = run.run("enter alice\nenter bob").await;

    assert!(summary.cancelled);
    assert!(!summary.success());
    assert!(run
        .output()
        .contains("# Context canceled, stopping execution\n"));
}

#[test(tokio::test)]
async fn verbose_runs_echo_the_script() {
    let mut run = TestRun::with_config(|c| c.verbose = true).unwrap();
    run.run("enter alice").await;
    assert!(run
        .output()
        .contains("# Start test file\n# 1 enter alice\n# End test file\n"));
}

#[test(tokio::test)]
async fn cancel_during_a_settle_ends_the_run_cleanly() {
    let mut run = TestRun::with_config(|c| c.timing.start_settle_ms = 5_000).unwrap();
    let token = run.cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
    });
    let summary = run.run("enter alice\nstart alice fake-sbot\nenter bob").await;

    let out = run.output();
    assert!(summary.cancelled);
    assert_eq!(summary.failed, 0, "{out}");
    assert!(!out.contains("not ok"));
    assert!(out.contains("# Context canceled, stopping execution\n"));
    assert!(!run.sim.puppet("alice").unwrap().is_running());
}

#[test(tokio::test)]
async fn hops_and_caps_reach_the_shim() {
    let mut run = TestRun::new().unwrap();
    let summary = run
        .run("enter alice\nhops alice 5\ncaps alice Y2Fwcw==\nstart alice fake-sbot")
        .await;

    assert!(summary.success(), "{}", run.output());
    let log = run.puppet_log("alice");
    assert!(log.contains("env CAPS=Y2Fwcw== HOPS=5 SECRET= LOG_OFFSET=\n"), "{log}");
}

#[test(tokio::test)]
async fn invalid_caps_bail_out() {
    let mut run = TestRun::new().unwrap();
    let summary = run.run("enter alice\ncaps alice not-base64!\nstart alice fake-sbot").await;

    let out = run.output();
    assert!(summary.aborted);
    assert!(
        out.contains("Bail out! capability key not-base64! was not a valid base64 sequence (caps alice not-base64!)"),
        "{out}"
    );
    assert!(!out.contains("start alice"));
}

#[test(tokio::test)]
async fn load_without_fixtures_bails_out() {
    let mut run = TestRun::new().unwrap();
    let summary = run
        .run(&format!("enter alice\nload alice {}", test_feed(1)))
        .await;

    assert!(summary.aborted);
    assert!(run
        .output()
        .contains("Bail out! no fixtures provided, yet tried to load feed from log.offset"));
}

#[test(tokio::test)]
async fn load_of_an_unknown_identity_bails_out() {
    let known = test_feed(1);
    let stranger = test_feed(2);
    let mut run = TestRun::with_fixtures(&[(known, "puppet-00000", 3)]).unwrap();
    let summary = run.run(&format!("enter alice\nload alice {stranger}")).await;

    assert!(summary.aborted);
    assert!(run
        .output()
        .contains(&format!("Bail out! cannot find id {stranger} in the fixtures identity map")));
}

#[test(tokio::test)]
async fn fixture_backed_start_uses_the_fixture_identity() {
    let alice = test_feed(1);
    let mut run = TestRun::with_fixtures(&[(alice.clone(), "puppet-00000", 12)]).unwrap();
    run.net.preload(&alice, 12);
    let summary = run
        .run(&format!(
            "enter alice\n\
             load alice {alice}\n\
             enter bob\n\
             start alice fake-sbot\n\
             start bob fake-sbot\n\
             has bob alice@latest"
        ))
        .await;

    let out = run.output();
    assert!(summary.success(), "{out}");
    // No whoami: the fake peer on alice's port would have answered with
    // its own port-derived identity.
    let port = run.sim.puppet("alice").unwrap().port().unwrap();
    assert_ne!(FakeNetwork::feed_on(port), alice);
    assert_eq!(run.sim.puppet("alice").unwrap().feed.as_ref(), Some(&alice));
    assert_eq!(run.sim.puppet("alice").unwrap().seqno(), 12);
    assert!(out.contains(&format!("# alice (12 messages) has id {alice}\n")));
    assert!(out.contains("# assuming alice@latest => alice@12\n"));

    let root = run.fixtures.clone().unwrap();
    let log = run.puppet_log("alice");
    let secret = root.join("puppet-00000").join("secret");
    let offset = root.join("puppet-00000").join("flume").join("log.offset");
    assert!(
        log.contains(&format!("SECRET={} LOG_OFFSET={}\n", secret.display(), offset.display())),
        "{log}"
    );
}

#[test(tokio::test)]
async fn alloffsets_and_skipoffset_pick_the_log() {
    let alice = test_feed(1);
    let bob = test_feed(2);
    let mut run = TestRun::with_fixtures(&[
        (alice.clone(), "puppet-00000", 4),
        (bob.clone(), "puppet-00001", 7),
    ])
    .unwrap();
    let summary = run
        .run(&format!(
            "enter alice\n\
             load alice {alice}\n\
             alloffsets alice\n\
             enter bob\n\
             load bob {bob}\n\
             skipoffset bob\n\
             start alice fake-sbot\n\
             start bob fake-sbot"
        ))
        .await;
    assert!(summary.success(), "{}", run.output());

    let root = run.fixtures.clone().unwrap();
    let all = root.join("puppet-all").join("flume").join("log.offset");
    let alice_log = run.puppet_log("alice");
    assert!(alice_log.contains(&format!("LOG_OFFSET={}\n", all.display())), "{alice_log}");

    let bob_log = run.puppet_log("bob");
    let secret = root.join("puppet-00001").join("secret");
    assert!(
        bob_log.contains(&format!("SECRET={} LOG_OFFSET=\n", secret.display())),
        "{bob_log}"
    );
}
