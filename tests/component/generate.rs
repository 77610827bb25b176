//! tests/component/generate.rs
//!
//! Fixtures on disk through expectation and script generation, then back
//! through the script parser.

use ed25519_dalek::SigningKey;
use gossip_netsim::{
    fixtures::{read_expectations, EXPECTATIONS_FILE, FOLLOW_GRAPH_FILE, IDENTITY_MAP_FILE},
    instruction::{parse_script, Op},
    feed::FeedId,
    App, Config,
};
use serde_json::json;
use std::{collections::BTreeSet, fs, path::Path};
use tempfile::tempdir;
use test_log::test;

fn feed(n: u8) -> String {
    FeedId::from_key(&SigningKey::from_bytes(&[n; 32]).verifying_key()).to_string()
}

/// Four identities: 0 follows 1, 1 follows 2, 2 follows 3, and 3 blocks 2.
fn write_fixtures(root: &Path) {
    let identities: serde_json::Map<String, serde_json::Value> = (0..4u8)
        .map(|n| (feed(n), json!({"folder": format!("puppet-{n:05}"), "latest": 10 + n as u64})))
        .collect();
    fs::write(root.join(IDENTITY_MAP_FILE), serde_json::to_string(&identities).unwrap()).unwrap();

    let graph = json!({
        feed(0): {feed(1): true},
        feed(1): {feed(2): true},
        feed(2): {feed(3): true},
        feed(3): {feed(2): false},
    });
    fs::write(root.join(FOLLOW_GRAPH_FILE), graph.to_string()).unwrap();
}

fn config(root: &Path, focused: usize, hops: usize) -> Config {
    let mut config = Config::default();
    config.fixtures = Some(root.to_path_buf());
    config.hops = hops;
    config.generate.focused = focused;
    config.generate.out = root.join("out");
    config
}

#[test]
fn generated_script_asserts_the_expectation_map() {
    let dir = tempdir().unwrap();
    write_fixtures(dir.path());
    let app = App::new(config(dir.path(), 1, 2)).unwrap();
    let mut echo = Vec::new();
    app.generate(&mut echo).unwrap();

    let out = dir.path().join("out");
    let expectations = read_expectations(&out.join(EXPECTATIONS_FILE)).unwrap();
    let expected: BTreeSet<String> = [feed(1), feed(2)].into_iter().collect();
    assert_eq!(expectations[&feed(0)], expected);
    // puppet-00003 blocks puppet-00002.
    assert!(expectations[&feed(2)].is_empty());

    let script = String::from_utf8(echo).unwrap();
    let instructions = parse_script(&script).unwrap();
    let has: Vec<String> = instructions
        .iter()
        .filter(|i| matches!(i.op, Op::Has { .. }))
        .map(|i| i.line.clone())
        .collect();
    assert_eq!(
        has,
        vec![
            "has puppet-00000 puppet-00001@latest",
            "has puppet-00000 puppet-00002@latest",
        ]
    );
}

#[test]
fn generated_script_round_trips() {
    let dir = tempdir().unwrap();
    write_fixtures(dir.path());
    let app = App::new(config(dir.path(), 2, 2)).unwrap();
    let mut echo = Vec::new();
    app.generate(&mut echo).unwrap();

    let script = fs::read_to_string(dir.path().join("out").join("netsim-test.txt")).unwrap();
    let reparsed: Vec<String> = parse_script(&script)
        .unwrap()
        .iter()
        .map(|i| i.op.to_string())
        .collect();
    assert_eq!(reparsed, script.lines().collect::<Vec<_>>());
}

#[test]
fn blocked_edge_is_never_connected() {
    let dir = tempdir().unwrap();
    write_fixtures(dir.path());
    let app = App::new(config(dir.path(), 4, 3)).unwrap();
    let mut echo = Vec::new();
    app.generate(&mut echo).unwrap();

    let script = String::from_utf8(echo).unwrap();
    assert!(script.contains("connect puppet-00001 puppet-00002"));
    assert!(!script.contains("connect puppet-00002 puppet-00003"), "{script}");
}

#[test]
fn every_loaded_identity_is_valid() {
    let dir = tempdir().unwrap();
    write_fixtures(dir.path());
    let app = App::new(config(dir.path(), 1, 1)).unwrap();
    let mut echo = Vec::new();
    app.generate(&mut echo).unwrap();

    for instr in parse_script(&String::from_utf8(echo).unwrap()).unwrap() {
        if let Op::Load { id, .. } = instr.op {
            assert!(id.parse::<FeedId>().is_ok(), "{id}");
        }
    }
}
