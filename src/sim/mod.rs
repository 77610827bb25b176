//! src/sim/mod.rs
//!
//! The execution engine. A `Simulator` owns the puppet registry and runs a
//! parsed script strictly in order, one instruction at a time, reporting
//! every outcome as TAP.
//!
//! Each instruction ends in exactly one of three ways: `ok`, `not ok` with a
//! diagnostic (the run continues), or `Bail out!` for structural errors
//! (the run stops after the normal shutdown path).

pub mod ops;
pub mod report;
pub mod retry;

use crate::{
    config::{validate_caps, Config, Timing},
    content::parse_content,
    error::{Error, Result},
    feed::FeedId,
    fixtures::IdentityMap,
    instruction::{parse_script, Instruction, Op, Seqno, SeqnoTarget},
    ports::PortAllocator,
    puppet::{Launch, Puppet, SHIM},
    rpc::{Connector, Session},
};
use report::{render_metrics, PuppetMetrics, TapReporter};
use retry::RetryPolicy;
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;

/// How a run ended.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub passed: usize,
    pub failed: usize,
    pub aborted: bool,
    pub cancelled: bool,
}

impl RunSummary {
    pub fn success(&self) -> bool {
        self.failed == 0 && !self.aborted && !self.cancelled
    }
}

pub struct Simulator {
    puppets: BTreeMap<String, Puppet>,
    implementations: BTreeMap<String, PathBuf>,
    identities: IdentityMap,
    fixtures: Option<PathBuf>,
    caps: String,
    hops: usize,
    verbose: bool,
    timing: Timing,
    retry: RetryPolicy,
    puppet_dir: PathBuf,
    ports: PortAllocator,
    connector: Arc<dyn Connector>,
    reporter: TapReporter,
    cancel: CancellationToken,
    /// Total time the engine spent in deliberate sleeps.
    slept: Duration,
}

impl Simulator {
    /// Validates the run configuration, indexes the implementations and
    /// prepares a clean puppet output directory.
    pub fn new(
        config: &Config,
        connector: Arc<dyn Connector>,
        reporter: TapReporter,
        cancel: CancellationToken,
    ) -> Result<Self> {
        config.validate()?;
        let implementations = register_implementations(&config.implementations)?;
        let identities = match &config.fixtures {
            Some(root) => IdentityMap::load(root)?,
            None => IdentityMap::default(),
        };
        let puppet_dir = prepare_puppet_dir(&config.out)?;
        tracing::info!(
            puppet_dir = %puppet_dir.display(),
            implementations = implementations.len(),
            fixtures = ?config.fixtures,
            "Simulator ready"
        );

        Ok(Self {
            puppets: BTreeMap::new(),
            implementations,
            identities,
            fixtures: config.fixtures.clone(),
            caps: config.caps.clone(),
            hops: config.hops,
            verbose: config.verbose,
            timing: config.timing.clone(),
            retry: RetryPolicy::from(&config.wait_until),
            puppet_dir,
            ports: PortAllocator::new(config.base_port, config.timing.port_attempts),
            connector,
            reporter,
            cancel,
            slept: Duration::ZERO,
        })
    }

    pub fn puppet(&self, name: &str) -> Result<&Puppet> {
        self.puppets
            .get(name)
            .ok_or_else(|| Error::UnknownPuppet(name.to_string()))
    }

    fn puppet_mut(&mut self, name: &str) -> Result<&mut Puppet> {
        self.puppets
            .get_mut(name)
            .ok_or_else(|| Error::UnknownPuppet(name.to_string()))
    }

    pub fn puppet_dir(&self) -> &Path {
        &self.puppet_dir
    }

    /// Parses and executes a whole script, then shuts every puppet down.
    pub async fn run_script(&mut self, text: &str) -> RunSummary {
        self.reporter.version();
        let summary = match parse_script(text) {
            Ok(instructions) => {
                if self.verbose {
                    self.reporter.diagnostic("Start test file");
                    for instr in &instructions {
                        self.reporter.diagnostic(&format!("{} {}", instr.index, instr.line));
                    }
                    self.reporter.diagnostic("End test file");
                }
                self.execute(&instructions).await
            }
            Err(e) => {
                self.reporter.bail_out(&e.to_string());
                RunSummary {
                    aborted: true,
                    ..Default::default()
                }
            }
        };
        self.shutdown().await;
        summary
    }

    /// Runs instructions in order. Does not stop puppets; see [`Self::shutdown`].
    pub async fn execute(&mut self, instructions: &[Instruction]) -> RunSummary {
        let started = Instant::now();
        let mut summary = RunSummary::default();

        for instr in instructions {
            if self.cancel.is_cancelled() {
                self.reporter.diagnostic("Context canceled, stopping execution");
                summary.cancelled = true;
                return summary;
            }
            tracing::debug!(index = instr.index, line = %instr.line, "Executing instruction");

            match self.step(&instr.op).await {
                Ok(notes) => {
                    summary.passed += 1;
                    self.reporter.ok(instr.index, &instr.line);
                    for note in notes {
                        self.reporter.diagnostic(&note);
                    }
                }
                Err(Error::Cancelled) => {
                    self.reporter.diagnostic("Context canceled, stopping execution");
                    summary.cancelled = true;
                    return summary;
                }
                Err(e) if e.is_fatal() => {
                    tracing::error!(index = instr.index, error = %e, "Aborting run");
                    self.reporter.bail_out(&format!("{e} ({})", instr.line));
                    summary.aborted = true;
                    return summary;
                }
                Err(e) => {
                    summary.failed += 1;
                    self.reporter.not_ok(instr.index, &instr.line);
                    self.reporter.diagnostic(&e.to_string());
                }
            }
        }

        self.reporter.plan(instructions.len());
        let elapsed = started.elapsed();
        self.reporter.diagnostic("End of simulation");
        self.reporter
            .diagnostic(&format!("Total time: {}", report::format_duration(elapsed)));
        self.reporter.diagnostic(&format!(
            "Active time: {}",
            report::format_duration(elapsed.saturating_sub(self.slept))
        ));
        self.reporter
            .diagnostic(&format!("Puppet count: {}", self.puppets.len()));
        summary
    }

    /// Stops timers, refreshes message counts, prints the metrics table and
    /// stops every puppet that is still running.
    pub async fn shutdown(&mut self) {
        let names: Vec<String> = self
            .puppets
            .values()
            .filter(|p| p.is_running())
            .map(|p| p.name.clone())
            .collect();
        for name in &names {
            if let Some(p) = self.puppets.get_mut(name) {
                p.stop_timer();
            }
            if let Err(note) = self.refresh_message_count(name).await {
                self.reporter.diagnostic(&note);
            }
        }

        self.reporter.diagnostic(&render_metrics(&self.metrics()));
        self.reporter.diagnostic("Closing all puppets");

        let grace = self.timing.stop_grace();
        for name in &names {
            if let Some(p) = self.puppets.get_mut(name) {
                match p.stop(grace).await {
                    Ok(report) => {
                        for problem in report.problems {
                            tracing::warn!(puppet = %name, %problem, "Problem during shutdown");
                        }
                    }
                    Err(e) => tracing::warn!(puppet = %name, error = %e, "Could not stop puppet"),
                }
            }
        }
    }

    pub fn metrics(&self) -> Vec<PuppetMetrics> {
        self.puppets
            .values()
            .map(|p| PuppetMetrics {
                name: p.name.clone(),
                total: p.total_time(),
                active: p.active_time(),
                messages: p.total_messages(),
            })
            .collect()
    }

    /// Executes one instruction, returning diagnostics to print on success.
    async fn step(&mut self, op: &Op) -> Result<Vec<String>> {
        match op {
            Op::Comment { .. } => Ok(Vec::new()),
            Op::Enter { name } => {
                if self.puppets.contains_key(name) {
                    return Ok(vec![format!("{name} was already declared")]);
                }
                self.puppets
                    .insert(name.clone(), Puppet::new(name.clone(), self.caps.clone(), self.hops));
                Ok(Vec::new())
            }
            Op::Load { name, id } => {
                let root = self.fixtures.as_ref().ok_or(Error::MissingFixtures)?;
                tracing::trace!(fixtures = %root.display(), %id, "Loading fixture identity");
                let info = self.identities.get(id)?.clone();
                let feed: FeedId = id.parse()?;
                self.puppet_mut(name)?
                    .load_fixture(&info.folder, feed, info.latest);
                Ok(Vec::new())
            }
            Op::SkipOffset { name } => {
                self.puppet_mut(name)?.skip_offset = true;
                Ok(Vec::new())
            }
            Op::AllOffsets { name } => {
                self.puppet_mut(name)?.all_offsets = true;
                Ok(Vec::new())
            }
            Op::Hops { name, hops } => {
                self.puppet_mut(name)?.hops = *hops;
                Ok(Vec::new())
            }
            Op::Caps { name, caps } => {
                validate_caps(caps)?;
                self.puppet_mut(name)?.caps = caps.clone();
                Ok(Vec::new())
            }
            Op::Start { name, implementation } => self.start(name, implementation).await,
            Op::Stop { name } => self.stop(name).await,
            Op::Log { name, count } => {
                let session = self.session(name)?;
                ops::log_stream(self.connector.as_ref(), &session, *count).await
            }
            Op::Wait { ms } => {
                self.sleep(Duration::from_millis(*ms)).await?;
                Ok(Vec::new())
            }
            Op::WaitUntil { src, target } => self.wait_until(src, target).await,
            Op::Follow { src, dst } => self.follow(src, dst, true).await,
            Op::Unfollow { src, dst } => self.follow(src, dst, false).await,
            Op::IsFollowing { src, dst } => self.check_following(src, dst, true).await,
            Op::IsNotFollowing { src, dst } => self.check_following(src, dst, false).await,
            Op::Post { name } => self.publish(name, ops::canned_post()).await,
            Op::Publish { name, content } => self.publish(name, parse_content(content)).await,
            Op::Connect { src, dst } => {
                let (session, port, feed) = self.route(src, dst)?;
                let result = ops::connect(self.connector.as_ref(), &session, port, &feed).await;
                self.sleep(self.timing.connect_settle()).await?;
                result.map(|()| Vec::new())
            }
            Op::Disconnect { src, dst } => {
                let (session, port, feed) = self.route(src, dst)?;
                let result = ops::disconnect(self.connector.as_ref(), &session, port, &feed).await;
                self.sleep(self.timing.connect_settle()).await?;
                result.map(|()| Vec::new())
            }
            Op::Has { src, target } => self.has(src, target).await,
        }
    }

    async fn start(&mut self, name: &str, implementation: &str) -> Result<Vec<String>> {
        let shim = self
            .implementations
            .get(implementation)
            .map(|dir| dir.join(SHIM))
            .ok_or_else(|| Error::UnknownImplementation(implementation.to_string()))?;
        let puppet = self.puppet(name)?;
        if puppet.is_running() {
            return Err(Error::AlreadyRunning(name.to_string()));
        }
        // A puppet keeps its first port for the whole run.
        let port = match puppet.port() {
            Some(port) => port,
            None => self.ports.acquire().await?,
        };

        let directory = self.puppet_dir.join(format!("{implementation}-{name}"));
        fs::create_dir_all(&directory)?;
        let log_path = self.puppet_dir.join(format!("{name}.txt"));
        let launch = Launch {
            shim: &shim,
            log_path: &log_path,
            fixtures: self.fixtures.as_deref(),
            verbose: self.verbose,
        };
        let puppet = self
            .puppets
            .get_mut(name)
            .ok_or_else(|| Error::UnknownPuppet(name.to_string()))?;
        puppet.directory = directory;
        puppet.start(port, &launch)?;
        puppet.start_timer();

        self.sleep(self.timing.start_settle()).await?;

        // Fixture-backed puppets already know who they are.
        if !self.puppet(name)?.uses_fixtures() {
            let session = self.session(name)?;
            let feed = ops::whoami(self.connector.as_ref(), &session).await?;
            let puppet = self.puppet_mut(name)?;
            match &puppet.feed {
                Some(known) if *known != feed => {
                    return Err(Error::Assertion(format!(
                        "{name} came back as {feed}, expected {known}"
                    )));
                }
                _ => puppet.feed = Some(feed),
            }
        }
        self.refresh_message_count(name)
            .await
            .map_err(Error::Transport)?;

        let puppet = self.puppet(name)?;
        let feed = puppet.feed.as_ref().map(ToString::to_string).unwrap_or_default();
        Ok(vec![
            format!("{name} ({} messages) has id {feed}", puppet.total_messages()),
            format!("logging to {name}.txt"),
        ])
    }

    async fn stop(&mut self, name: &str) -> Result<Vec<String>> {
        let puppet = self.puppet(name)?;
        if !puppet.is_running() {
            return Err(Error::NotRunning(name.to_string()));
        }
        let feed = puppet.feed.as_ref().map(ToString::to_string).unwrap_or_default();

        let mut notes = Vec::new();
        if let Err(note) = self.refresh_message_count(name).await {
            notes.push(note);
        }
        notes.push(format!("stopping {name} ({feed})"));

        let grace = self.timing.stop_grace();
        let report = self.puppet_mut(name)?.stop(grace).await?;
        notes.extend(report.problems);
        notes.push(format!("{name} has been stopped"));
        Ok(notes)
    }

    async fn follow(&mut self, src: &str, dst: &str, following: bool) -> Result<Vec<String>> {
        let feed = self.feed_of(dst)?;
        let session = self.session(src)?;
        let result = ops::publish(self.connector.as_ref(), &session, ops::contact(&feed, following)).await;
        self.puppet_mut(src)?.bump_seqno();
        result.map(|()| Vec::new())
    }

    async fn publish(&mut self, name: &str, content: serde_json::Value) -> Result<Vec<String>> {
        let session = self.session(name)?;
        let result = ops::publish(self.connector.as_ref(), &session, content).await;
        self.puppet_mut(name)?.bump_seqno();
        result.map(|()| Vec::new())
    }

    async fn check_following(&mut self, src: &str, dst: &str, expected: bool) -> Result<Vec<String>> {
        let source = self.feed_of(src)?;
        let dest = self.feed_of(dst)?;
        let session = self.session(src)?;
        let following = ops::is_following(self.connector.as_ref(), &session, &source, &dest).await?;
        match (expected, following) {
            (true, false) => Err(Error::Assertion(format!("{source} did not follow {dest}"))),
            (false, true) => Err(Error::Assertion(format!(
                "{source} should not follow {dest}\nactual: {source} is following {dest}"
            ))),
            _ => Ok(Vec::new()),
        }
    }

    /// Resolves `name@latest` against the named puppet's own counter.
    fn resolve(&self, target: &SeqnoTarget) -> Result<(u64, Option<String>)> {
        let dst = self.puppet(&target.name)?;
        Ok(match target.seqno {
            Seqno::At(n) => (n, None),
            Seqno::Latest => {
                let n = dst.seqno();
                let name = &target.name;
                (n, Some(format!("assuming {name}@latest => {name}@{n}")))
            }
        })
    }

    async fn has(&mut self, src: &str, target: &SeqnoTarget) -> Result<Vec<String>> {
        let session = self.session(src)?;
        let dst_feed = self.feed_of(&target.name)?;
        let (asserted, assumption) = self.resolve(target)?;

        let latest = ops::latest_sequences(self.connector.as_ref(), &session).await?;
        let Some(held) = latest.iter().find(|l| l.id == dst_feed.as_str()) else {
            // Only an explicit `@0` expects the feed to be unknown.
            if target.seqno == Seqno::At(0) {
                return Ok(assumption.into_iter().collect());
            }
            return Err(Error::Assertion(format!(
                "expected {src} to have {} ({dst_feed}); it didn't",
                target.name
            )));
        };
        if held.sequence != asserted {
            return Err(Error::Assertion(format!(
                "expected: {dst_feed} at sequence {asserted}\nwas: {} at sequence {}",
                held.id, held.sequence
            )));
        }
        Ok(assumption.into_iter().collect())
    }

    async fn wait_until(&mut self, src: &str, target: &SeqnoTarget) -> Result<Vec<String>> {
        let session = self.session(src)?;
        let dst_feed = self.feed_of(&target.name)?;
        let (asserted, assumption) = self.resolve(target)?;
        let timeout = self.timing.history_timeout();
        let connector = self.connector.clone();

        let retried = self
            .retry
            .run(&self.cancel, |_| {
                ops::history(connector.as_ref(), &session, &dst_feed, asserted, timeout)
            })
            .await;
        for failure in &retried.failures {
            self.reporter
                .diagnostic(&format!("waituntil had an error on {failure}"));
        }
        self.account_sleep(retried.slept);

        match retried.result {
            Ok(_) => Ok(assumption.into_iter().collect()),
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(e) => Err(Error::Assertion(format!(
                "{src} expected {}@{asserted}: {e}",
                target.name
            ))),
        }
    }

    /// Session of `src` plus the address half of `dst`.
    fn route(&self, src: &str, dst: &str) -> Result<(Session, u16, FeedId)> {
        let session = self.session(src)?;
        let dst_puppet = self.puppet(dst)?;
        let port = dst_puppet
            .port()
            .ok_or_else(|| Error::NotRunning(dst.to_string()))?;
        Ok((session, port, self.feed_of(dst)?))
    }

    fn session(&self, name: &str) -> Result<Session> {
        let puppet = self.puppet(name)?;
        let port = puppet
            .port()
            .ok_or_else(|| Error::NotRunning(name.to_string()))?;
        Ok(Session {
            port,
            caps: puppet.caps.clone(),
            secret: puppet.directory.join("secret"),
        })
    }

    fn feed_of(&self, name: &str) -> Result<FeedId> {
        self.puppet(name)?
            .feed
            .clone()
            .ok_or_else(|| Error::NoFeedId(name.to_string()))
    }

    /// Best effort; a failure comes back as a diagnostic line.
    async fn refresh_message_count(&mut self, name: &str) -> std::result::Result<(), String> {
        let counted = match self.session(name) {
            Ok(session) => ops::count_messages(self.connector.as_ref(), &session).await,
            Err(e) => Err(e),
        };
        match counted {
            Ok(count) => {
                if let Some(p) = self.puppets.get_mut(name) {
                    p.set_total_messages(count);
                }
                Ok(())
            }
            Err(e) => {
                tracing::warn!(puppet = %name, error = %e, "Could not count messages");
                Err(format!(
                    "{name} had an error when trying to count db messages ({e})"
                ))
            }
        }
    }

    /// Sleeps for `d` and credits it to every running puppet.
    async fn sleep(&mut self, d: Duration) -> Result<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(d) => {}
        }
        self.account_sleep(d);
        Ok(())
    }

    fn account_sleep(&mut self, d: Duration) {
        self.slept += d;
        for puppet in self.puppets.values_mut().filter(|p| p.is_running()) {
            puppet.add_sleep(d);
        }
    }
}

/// Indexes implementation folders by their last path component. Each must
/// exist and carry a `sim-shim.sh`.
pub fn register_implementations(folders: &[PathBuf]) -> Result<BTreeMap<String, PathBuf>> {
    let mut registry = BTreeMap::new();
    for folder in folders {
        let dir = std::path::absolute(folder).unwrap_or_else(|_| folder.clone());
        if !dir.is_dir() {
            return Err(Error::InvalidImplementation {
                path: folder.clone(),
                reason: "language implementation folder does not exist".into(),
            });
        }
        if !dir.join(SHIM).is_file() {
            return Err(Error::InvalidImplementation {
                path: folder.clone(),
                reason: format!("{SHIM} is missing from root of sbot folder"),
            });
        }
        let key = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::InvalidImplementation {
                path: folder.clone(),
                reason: "folder has no name".into(),
            })?;
        tracing::debug!(implementation = %key, path = %dir.display(), "Registered implementation");
        registry.insert(key, dir);
    }
    Ok(registry)
}

/// Normalises `dir` to end in a `puppets` component, then wipes and
/// recreates it.
pub fn prepare_puppet_dir(dir: &Path) -> Result<PathBuf> {
    let dir = if dir.file_name().is_some_and(|n| n == "puppets") {
        dir.to_path_buf()
    } else {
        dir.join("puppets")
    };
    let dir = std::path::absolute(&dir)?;
    if dir.exists() {
        fs::remove_dir_all(&dir)?;
    }
    fs::create_dir_all(&dir)?;
    Ok(dir)
}
