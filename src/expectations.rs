//! src/expectations.rs
//!
//! Computes, for every peer of a follow graph, the set of peers it is
//! expected to replicate within `max_hops`.
//!
//! Levels are built as a synchronized wavefront: every peer's level `k` is
//! derived from the level `k - 1` sets of all peers, so level `k` is fully
//! computed for the whole graph before anyone advances to `k + 1`.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// What one peer says about another. Absence from the graph means unknown.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Relation {
    Follow,
    Block,
    Unknown,
}

impl From<&Value> for Relation {
    fn from(value: &Value) -> Self {
        match value {
            Value::Bool(true) => Relation::Follow,
            Value::Bool(false) => Relation::Block,
            _ => Relation::Unknown,
        }
    }
}

/// peer id -> (peer id -> relation)
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FollowGraph {
    relations: BTreeMap<String, BTreeMap<String, Relation>>,
}

/// peer id -> ids it should have replicated (never including itself)
pub type ExpectationMap = BTreeMap<String, BTreeSet<String>>;

impl FollowGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `src` to the graph without any relations.
    pub fn add_peer(&mut self, src: &str) {
        self.relations.entry(src.to_string()).or_default();
    }

    pub fn set(&mut self, src: &str, dst: &str, relation: Relation) {
        self.relations
            .entry(src.to_string())
            .or_default()
            .insert(dst.to_string(), relation);
    }

    pub fn relation(&self, src: &str, dst: &str) -> Relation {
        self.relations
            .get(src)
            .and_then(|r| r.get(dst))
            .copied()
            .unwrap_or(Relation::Unknown)
    }

    pub fn peers(&self) -> impl Iterator<Item = &str> {
        self.relations.keys().map(String::as_str)
    }

    /// Peers `src` follows, in id order.
    pub fn follows<'a>(&'a self, src: &str) -> impl Iterator<Item = &'a str> {
        self.with_relation(src, Relation::Follow)
    }

    pub fn blocks<'a>(&'a self, src: &str) -> impl Iterator<Item = &'a str> {
        self.with_relation(src, Relation::Block)
    }

    pub fn is_blocking(&self, src: &str, dst: &str) -> bool {
        self.relation(src, dst) == Relation::Block
    }

    fn with_relation<'a>(&'a self, src: &str, wanted: Relation) -> impl Iterator<Item = &'a str> {
        self.relations
            .get(src)
            .into_iter()
            .flat_map(|r| r.iter())
            .filter(move |(_, rel)| **rel == wanted)
            .map(|(id, _)| id.as_str())
    }
}

impl<'de> Deserialize<'de> for FollowGraph {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = BTreeMap::<String, BTreeMap<String, Value>>::deserialize(deserializer)?;
        let relations = raw
            .into_iter()
            .map(|(id, rels)| {
                let rels = rels
                    .iter()
                    .map(|(other, v)| (other.clone(), Relation::from(v)))
                    .collect();
                (id, rels)
            })
            .collect();
        Ok(Self { relations })
    }
}

impl Serialize for FollowGraph {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let raw: BTreeMap<&str, BTreeMap<&str, Value>> = self
            .relations
            .iter()
            .map(|(id, rels)| {
                let rels = rels
                    .iter()
                    .map(|(other, rel)| {
                        let v = match rel {
                            Relation::Follow => Value::Bool(true),
                            Relation::Block => Value::Bool(false),
                            Relation::Unknown => Value::Null,
                        };
                        (other.as_str(), v)
                    })
                    .collect();
                (id.as_str(), rels)
            })
            .collect();
        raw.serialize(serializer)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExpectationArgs {
    pub max_hops: usize,
    /// Expect blocked peers to be replicated anyway.
    pub replicate_blocked: bool,
}

/// Returns a map of id -> ids expected to be replicated.
pub fn produce_expectations(args: ExpectationArgs, graph: &FollowGraph) -> ExpectationMap {
    // levels[peer][k] is the set of peers reached at hop level k.
    let mut levels: BTreeMap<&str, Vec<BTreeSet<&str>>> = graph
        .peers()
        .map(|id| {
            let mut hops = vec![BTreeSet::from([id])];
            if args.max_hops >= 1 {
                hops.push(graph.follows(id).collect());
            }
            (id, hops)
        })
        .collect();

    for k in 2..=args.max_hops {
        // Compute every peer's level k from the finished level k - 1 before
        // writing any of them back.
        let next: Vec<(&str, BTreeSet<&str>)> = levels
            .iter()
            .map(|(&id, hops)| (id, expand(args, graph, &levels, id, &hops[k - 1], k - 1)))
            .collect();
        for (id, level) in next {
            if let Some(hops) = levels.get_mut(id) {
                hops.push(level);
            }
        }
    }

    levels
        .into_iter()
        .map(|(id, hops)| {
            let expected = hops
                .into_iter()
                .flatten()
                .filter(|&other| other != id)
                // `other` blocked us: we should not expect to replicate them.
                .filter(|&other| args.replicate_blocked || !graph.is_blocking(other, id))
                .map(str::to_string)
                .collect();
            (id.to_string(), expected)
        })
        .collect()
}

/// Union over each friend of the friend's own set at `prior`, minus anyone
/// `id` itself blocks.
fn expand<'a>(
    args: ExpectationArgs,
    graph: &FollowGraph,
    levels: &BTreeMap<&'a str, Vec<BTreeSet<&'a str>>>,
    id: &str,
    friends: &BTreeSet<&'a str>,
    prior: usize,
) -> BTreeSet<&'a str> {
    friends
        .iter()
        .filter_map(|friend| levels.get(friend).and_then(|hops| hops.get(prior)))
        .flatten()
        .copied()
        .filter(|candidate| args.replicate_blocked || !graph.is_blocking(id, candidate))
        .collect()
}
