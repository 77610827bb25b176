//! tests/integration/engine.rs
//!
//! Scripts run against the fake network: replication assertions, retries
//! and how failures are reported.
#![cfg(unix)]

use crate::common::harness::{FakeNetwork, TestRun};
use std::time::Duration;
use test_log::test;

#[test(tokio::test)]
async fn connected_puppets_replicate() {
    let mut run = TestRun::new().unwrap();
    let summary = run
        .run(
            "enter alice\n\
             enter bob\n\
             start alice fake-sbot\n\
             start bob fake-sbot\n\
             post alice\n\
             connect bob alice\n\
             has bob alice@latest\n\
             disconnect bob alice",
        )
        .await;

    let out = run.output();
    assert!(summary.success(), "{out}");
    assert_eq!(summary.passed, 8);
    assert!(out.starts_with("TAP version 13\n"));
    assert!(out.contains("ok 7 - has bob alice@latest\n# assuming alice@latest => alice@1\n"));
    assert!(out.contains("\n1..8\n"));
    assert!(out.contains("# End of simulation"));
    assert!(out.contains("# Puppet count: 2"));
    assert!(out.contains("# Closing all puppets"));

    let bob_port = run.sim.puppet("bob").unwrap().port().unwrap();
    let alice = run.sim.puppet("alice").unwrap().feed.clone().unwrap();
    assert_eq!(run.net.held(bob_port, alice.as_str()), Some(1));
}

#[test(tokio::test)]
async fn start_reports_identity_and_log() {
    let mut run = TestRun::new().unwrap();
    run.run("enter alice\nstart alice fake-sbot").await;

    let port = run.sim.puppet("alice").unwrap().port().unwrap();
    let feed = FakeNetwork::feed_on(port);
    assert_eq!(run.sim.puppet("alice").unwrap().feed.as_ref(), Some(&feed));
    let out = run.output();
    assert!(out.contains(&format!("# alice (0 messages) has id {feed}\n")), "{out}");
    assert!(out.contains("# logging to alice.txt\n"));
    assert!(run.sim.puppet_dir().join("fake-sbot-alice").is_dir());
}

#[test(tokio::test)]
async fn failed_has_does_not_abort_the_run() {
    let mut run = TestRun::new().unwrap();
    let summary = run
        .run(
            "enter alice\n\
             enter bob\n\
             start alice fake-sbot\n\
             start bob fake-sbot\n\
             post alice\n\
             has bob alice@latest\n\
             post alice",
        )
        .await;

    let out = run.output();
    assert!(!summary.aborted);
    assert_eq!((summary.passed, summary.failed), (6, 1));
    let alice = run.sim.puppet("alice").unwrap().feed.clone().unwrap();
    assert!(out.contains("not ok 6 - has bob alice@latest\n"), "{out}");
    assert!(out.contains(&format!("# expected bob to have alice ({alice}); it didn't\n")));
    assert!(out.contains("ok 7 - post alice\n"));
    assert!(out.contains("\n1..7\n"));
    assert_eq!(run.sim.puppet("alice").unwrap().seqno(), 2);
}

#[test(tokio::test)]
async fn sequence_mismatch_names_both_sides() {
    let mut run = TestRun::new().unwrap();
    let summary = run
        .run(
            "enter alice\n\
             enter bob\n\
             start alice fake-sbot\n\
             start bob fake-sbot\n\
             post alice\n\
             connect bob alice\n\
             post alice\n\
             has bob alice@latest",
        )
        .await;

    assert_eq!(summary.failed, 1);
    let alice = run.sim.puppet("alice").unwrap().feed.clone().unwrap();
    let out = run.output();
    assert!(
        out.contains(&format!("# expected: {alice} at sequence 2\n# was: {alice} at sequence 1\n")),
        "{out}"
    );
}

#[test(tokio::test)]
async fn has_nothing_at_sequence_zero_passes() {
    let mut run = TestRun::new().unwrap();
    let summary = run
        .run("enter alice\nenter bob\nstart alice fake-sbot\nstart bob fake-sbot\nhas bob alice@0")
        .await;
    assert!(summary.success(), "{}", run.output());
}

#[test(tokio::test)]
async fn wait_is_credited_to_running_puppets() {
    let mut run = TestRun::new().unwrap();
    run.run(
        "enter alice\n\
         enter bob\n\
         enter carol\n\
         start alice fake-sbot\n\
         start bob fake-sbot\n\
         wait 500",
    )
    .await;

    assert_eq!(run.sim.puppet("alice").unwrap().slept(), Duration::from_millis(500));
    assert_eq!(run.sim.puppet("bob").unwrap().slept(), Duration::from_millis(500));
    assert_eq!(run.sim.puppet("carol").unwrap().slept(), Duration::ZERO);
}

#[test(tokio::test)]
async fn connect_and_disconnect_both_settle() {
    let mut run = TestRun::with_config(|c| c.timing.connect_settle_ms = 200).unwrap();
    let summary = run
        .run(
            "enter alice\n\
             enter bob\n\
             start alice fake-sbot\n\
             start bob fake-sbot\n\
             connect alice bob\n\
             disconnect alice bob",
        )
        .await;

    assert!(summary.success(), "{}", run.output());
    assert_eq!(run.sim.puppet("alice").unwrap().slept(), Duration::from_millis(400));
    assert_eq!(run.sim.puppet("bob").unwrap().slept(), Duration::from_millis(400));
}

#[test(tokio::test)]
async fn latest_of_an_unknown_feed_is_not_assumed_zero() {
    let mut run = TestRun::new().unwrap();
    let summary = run
        .run("enter alice\nenter bob\nstart alice fake-sbot\nstart bob fake-sbot\nhas bob alice@latest")
        .await;

    let out = run.output();
    assert_eq!(summary.failed, 1, "{out}");
    assert!(out.contains("not ok 5 - has bob alice@latest\n"));
    assert!(out.contains("it didn't"));
}

#[test(tokio::test)]
async fn waituntil_retries_then_gives_up() {
    let mut run = TestRun::new().unwrap();
    let summary = run
        .run(
            "enter alice\n\
             enter bob\n\
             start alice fake-sbot\n\
             start bob fake-sbot\n\
             post alice\n\
             waituntil bob alice@latest\n\
             connect bob alice\n\
             waituntil bob alice@latest",
        )
        .await;

    let out = run.output();
    assert_eq!(summary.failed, 1, "{out}");
    assert!(out.contains("# waituntil had an error on attempt 1/2 failed"));
    assert!(out.contains("not ok 6 - waituntil bob alice@latest\n"));
    assert!(out.contains("ok 8 - waituntil bob alice@latest\n# assuming alice@latest => alice@1\n"));
}

#[test(tokio::test)]
async fn follow_state_is_asserted() {
    let mut run = TestRun::new().unwrap();
    let summary = run
        .run(
            "enter alice\n\
             enter bob\n\
             start alice fake-sbot\n\
             start bob fake-sbot\n\
             follow alice bob\n\
             isfollowing alice bob\n\
             isnotfollowing alice bob\n\
             unfollow alice bob\n\
             isnotfollowing alice bob",
        )
        .await;

    let out = run.output();
    assert_eq!((summary.passed, summary.failed), (8, 1), "{out}");
    assert!(out.contains("not ok 7 - isnotfollowing alice bob\n"));
    assert!(out.contains("should not follow"));
    assert_eq!(run.sim.puppet("alice").unwrap().seqno(), 2);
}

#[test(tokio::test)]
async fn publish_and_log() {
    let mut run = TestRun::new().unwrap();
    let summary = run
        .run(
            "enter alice\n\
             start alice fake-sbot\n\
             publish alice (type post) (text hello)\n\
             log alice 1",
        )
        .await;

    let out = run.output();
    assert!(summary.success(), "{out}");
    assert!(out.contains("\"text\": \"hello\""), "{out}");
    assert_eq!(run.sim.puppet("alice").unwrap().total_messages(), 1);
}
