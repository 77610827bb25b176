//! src/generation.rs
//!
//! Turns a follow graph into a runnable test script.
//!
//! A shuffled focus group of `puppet-%05d` peers is started and kept
//! running. From each focus peer the follow graph is walked up to
//! `max_hops`, and every discovered follow edge becomes a short-lived
//! connection between its two endpoints. Edges are played farthest first
//! so data trickles inward before the focus group syncs with its direct
//! follows. After the configured number of sweeps, every focus peer
//! asserts it holds each expected feed at its latest sequence.

use crate::{
    error::{Error, Result},
    expectations::{ExpectationMap, FollowGraph},
    fixtures::IdentityMap,
};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use std::{
    collections::{BTreeMap, BTreeSet},
    io::Write,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GenerateArgs {
    /// Implementation every `start` line names.
    pub sbot: String,
    pub focused: usize,
    pub max_hops: usize,
    pub seed: u64,
    pub passes: usize,
    /// Pause after each `connect`; zero emits no `wait` lines.
    pub wait_ms: u64,
}

/// A follow edge found while walking out from a focus peer.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Edge {
    pub src: String,
    pub dst: String,
    /// 1 for a focus peer's own follows, 2 for theirs, and so on.
    pub depth: usize,
}

pub struct Generator<'a> {
    args: GenerateArgs,
    graph: &'a FollowGraph,
    ids_to_names: BTreeMap<String, String>,
    names_to_ids: BTreeMap<String, String>,
    focus_group: Vec<String>,
    running: BTreeSet<String>,
    waited_ms: u64,
}

impl<'a> Generator<'a> {
    pub fn new(args: GenerateArgs, identities: &IdentityMap, graph: &'a FollowGraph) -> Self {
        let names_to_ids: BTreeMap<String, String> = identities
            .names_to_ids()
            .into_iter()
            .map(|(name, id)| (name.to_string(), id.to_string()))
            .collect();
        let ids_to_names = names_to_ids
            .iter()
            .map(|(name, id)| (id.clone(), name.clone()))
            .collect();

        let mut focus_group: Vec<String> = (0..args.focused).map(|i| format!("puppet-{i:05}")).collect();
        focus_group.shuffle(&mut StdRng::seed_from_u64(args.seed));

        Self {
            args,
            graph,
            ids_to_names,
            names_to_ids,
            focus_group,
            running: BTreeSet::new(),
            waited_ms: 0,
        }
    }

    pub fn focus_group(&self) -> &[String] {
        &self.focus_group
    }

    /// Every follow edge reachable from the focus group, in discovery order.
    /// Each edge appears once even when several focus peers reach it.
    pub fn traversal(&self) -> Result<Vec<Edge>> {
        let mut edges = Vec::new();
        let mut recorded = BTreeSet::new();
        for name in &self.focus_group {
            let id = self.id(name)?;
            let mut seen = BTreeSet::new();
            for edge in self.walk(id, self.args.max_hops, 1, &mut seen) {
                if recorded.insert((edge.src.clone(), edge.dst.clone())) {
                    edges.push(edge);
                }
            }
        }
        Ok(edges)
    }

    /// Depth-first from `id`: first the edges to every unseen follow, then
    /// each of those follows' own edges one level further out.
    fn walk(&self, id: &str, hops_left: usize, depth: usize, seen: &mut BTreeSet<String>) -> Vec<Edge> {
        seen.insert(id.to_string());
        if hops_left == 0 {
            return Vec::new();
        }
        let follows: Vec<&str> = self.graph.follows(id).collect();
        let mut edges: Vec<Edge> = follows
            .iter()
            .filter(|other| !seen.contains(**other))
            .map(|other| Edge {
                src: id.to_string(),
                dst: other.to_string(),
                depth,
            })
            .collect();
        for other in follows {
            if seen.contains(other) {
                continue;
            }
            edges.extend(self.walk(other, hops_left - 1, depth + 1, seen));
        }
        edges
    }

    /// Writes the whole script to `out`.
    pub fn generate(&mut self, expectations: &ExpectationMap, out: &mut dyn Write) -> Result<()> {
        let mut edges = self.traversal()?;
        edges.reverse();

        for (name, id) in &self.names_to_ids {
            writeln!(out, "enter {name}")?;
            writeln!(out, "load {name} {id}")?;
        }

        let focus = self.focus_group.clone();
        self.start(&focus, out)?;
        for pass in 0..self.args.passes {
            tracing::debug!(pass, edges = edges.len(), "Emitting connection sweep");
            for edge in &edges {
                self.batch_connect(edge, out)?;
            }
        }

        for name in &focus {
            let id = self.id(name)?;
            let mut expected = expectations
                .get(id)
                .into_iter()
                .flatten()
                .map(|other| self.name(other).map(str::to_string))
                .collect::<Result<Vec<_>>>()?;
            expected.sort();
            for other in expected {
                writeln!(out, "has {name} {other}@latest")?;
            }
        }

        for name in &focus {
            if self.running.remove(name) {
                writeln!(out, "stop {name}")?;
            }
        }
        writeln!(
            out,
            "comment total wait time: {} seconds",
            self.waited_ms as f64 / 1000.0
        )?;
        Ok(())
    }

    /// Renders each focus peer's traversal as `<depth> <name> (via <name>)`.
    pub fn describe_traversal(&self, out: &mut dyn Write) -> Result<()> {
        for name in &self.focus_group {
            writeln!(out, "0 {name}")?;
            let mut seen = BTreeSet::new();
            for edge in self.walk(self.id(name)?, self.args.max_hops, 1, &mut seen) {
                let dst = self.name(&edge.dst)?;
                if edge.depth == 1 {
                    writeln!(out, "{} {dst}", edge.depth)?;
                } else {
                    writeln!(out, "{} {dst} (via {})", edge.depth, self.name(&edge.src)?)?;
                }
            }
            writeln!(out)?;
        }
        Ok(())
    }

    fn batch_connect(&mut self, edge: &Edge, out: &mut dyn Write) -> Result<()> {
        // The destination would refuse the source.
        if self.graph.is_blocking(&edge.dst, &edge.src) {
            return Ok(());
        }
        let src = self.name(&edge.src)?.to_string();
        let dst = self.name(&edge.dst)?.to_string();
        let pair = [src.clone(), dst.clone()];

        self.start(&pair, out)?;
        writeln!(out, "waituntil {src} {src}@latest")?;
        writeln!(out, "connect {src} {dst}")?;
        if self.args.wait_ms > 0 {
            writeln!(out, "wait {}", self.args.wait_ms)?;
            self.waited_ms += self.args.wait_ms;
        }
        writeln!(out, "waituntil {src} {dst}@latest")?;
        writeln!(out, "disconnect {src} {dst}")?;
        self.stop_scaffolding(&pair, out)
    }

    fn start(&mut self, names: &[String], out: &mut dyn Write) -> Result<()> {
        for name in names {
            if self.running.insert(name.clone()) {
                writeln!(out, "start {name} {}", self.args.sbot)?;
            }
        }
        Ok(())
    }

    /// Stops every running peer in `names` that is not part of the focus
    /// group.
    fn stop_scaffolding(&mut self, names: &[String], out: &mut dyn Write) -> Result<()> {
        for name in names {
            if self.focus_group.contains(name) {
                continue;
            }
            if self.running.remove(name) {
                writeln!(out, "stop {name}")?;
            }
        }
        Ok(())
    }

    fn id(&self, name: &str) -> Result<&str> {
        self.names_to_ids
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| Error::UnknownFixtureId(name.to_string()))
    }

    fn name(&self, id: &str) -> Result<&str> {
        self.ids_to_names
            .get(id)
            .map(String::as_str)
            .ok_or_else(|| Error::UnknownFixtureId(id.to_string()))
    }
}
