//! src/content.rs
//!
//! Parses the small `(key value)` syntax accepted by the `publish` command
//! into a JSON message body.
//!
//! `(type post) (value.content hello)` becomes
//! `{"type": "post", "value": {"content": "hello"}}`. Groups without a value,
//! such as `(beep)`, are ignored.

use serde_json::{Map, Value};

pub fn parse_content(line: &str) -> Value {
    let mut root = Map::new();
    for (key, value) in groups(line) {
        insert_path(&mut root, key, value);
    }
    Value::Object(root)
}

/// Yields every `(key value)` pair, where `key` has no whitespace and the
/// group contains no nested parentheses.
fn groups(line: &str) -> impl Iterator<Item = (&str, &str)> {
    let mut rest = line;
    std::iter::from_fn(move || loop {
        let open = rest.find('(')?;
        let body_start = open + 1;
        let close = body_start + rest[body_start..].find(')')?;
        let body = &rest[body_start..close];
        if let Some(inner) = body.rfind('(') {
            // An unclosed group; resume from the innermost opening paren.
            rest = &rest[body_start + inner..];
            continue;
        }
        rest = &rest[close + 1..];
        let Some(split) = body.find(char::is_whitespace) else {
            continue;
        };
        let (key, value) = (&body[..split], &body[split + 1..]);
        if key.is_empty() || value.is_empty() {
            continue;
        }
        return Some((key, value));
    })
}

fn insert_path(root: &mut Map<String, Value>, key: &str, value: &str) {
    let mut parts: Vec<&str> = key.split('.').collect();
    let Some(leaf) = parts.pop() else {
        return;
    };
    let mut node = root;
    for part in parts {
        let entry = node
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        node = match entry {
            Value::Object(map) => map,
            _ => return,
        };
    }
    node.insert(leaf.to_string(), Value::String(value.to_string()));
}
