//! src/puppet.rs
//!
//! One simulated peer: its declared configuration, its identity, the
//! optimistic count of messages it has authored, and the external process
//! that runs it.
//!
//! A puppet is spawned through its implementation's `sim-shim.sh`, invoked
//! as `sim-shim.sh <puppet-dir> <port>` with the capability key and hop
//! limit in its environment.

use crate::{
    error::{Error, Result},
    feed::FeedId,
    fixtures::FixturePaths,
};
use std::{
    fs::OpenOptions,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    process::{Child, Command},
    sync::Mutex,
    task::JoinHandle,
};

pub const SHIM: &str = "sim-shim.sh";

#[derive(Debug)]
pub struct Puppet {
    pub name: String,
    pub caps: String,
    pub hops: usize,
    /// Known after the first successful start, or up front when loaded from
    /// fixtures. Never changes once set.
    pub feed: Option<FeedId>,
    /// Fixture folder holding this identity's secret and log.
    pub fixture: Option<String>,
    pub skip_offset: bool,
    pub all_offsets: bool,
    pub directory: PathBuf,
    port: Option<u16>,
    seqno: u64,
    total_messages: u64,
    total_time: Duration,
    slept: Duration,
    last_start: Option<Instant>,
    process: Option<Process>,
}

#[derive(Debug)]
struct Process {
    child: Child,
    /// Copies of the process output to stdout, only in verbose mode.
    tees: Vec<JoinHandle<()>>,
}

/// Where and how to spawn a puppet.
pub struct Launch<'a> {
    pub shim: &'a Path,
    pub log_path: &'a Path,
    pub fixtures: Option<&'a Path>,
    /// Mirror the process output on stdout as well as the log file.
    pub verbose: bool,
}

/// What happened while tearing a puppet down. Teardown problems are
/// reported, never raised.
#[derive(Debug, Default)]
pub struct StopReport {
    pub status: Option<ExitStatus>,
    pub problems: Vec<String>,
}

impl Puppet {
    pub fn new(name: impl Into<String>, caps: impl Into<String>, hops: usize) -> Self {
        Self {
            name: name.into(),
            caps: caps.into(),
            hops,
            feed: None,
            fixture: None,
            skip_offset: false,
            all_offsets: false,
            directory: PathBuf::new(),
            port: None,
            seqno: 0,
            total_messages: 0,
            total_time: Duration::ZERO,
            slept: Duration::ZERO,
            last_start: None,
            process: None,
        }
    }

    /// Binds this puppet to a fixture identity whose log already holds
    /// `latest` messages.
    pub fn load_fixture(&mut self, folder: &str, feed: FeedId, latest: u64) {
        self.fixture = Some(folder.to_string());
        self.feed = Some(feed);
        self.seqno = latest;
    }

    pub fn uses_fixtures(&self) -> bool {
        self.feed.is_some() && self.fixture.is_some()
    }

    pub fn is_running(&self) -> bool {
        self.process.is_some()
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn seqno(&self) -> u64 {
        self.seqno
    }

    /// Counts a message published through this puppet, whether or not the
    /// publish reached the network.
    pub fn bump_seqno(&mut self) {
        self.seqno += 1;
    }

    pub fn total_messages(&self) -> u64 {
        self.total_messages
    }

    pub fn set_total_messages(&mut self, count: u64) {
        self.total_messages = count;
    }

    pub fn total_time(&self) -> Duration {
        self.total_time
    }

    pub fn slept(&self) -> Duration {
        self.slept
    }

    pub fn active_time(&self) -> Duration {
        self.total_time.saturating_sub(self.slept)
    }

    pub fn add_sleep(&mut self, d: Duration) {
        self.slept += d;
    }

    pub fn start_timer(&mut self) {
        self.last_start = Some(Instant::now());
    }

    /// Folds the running interval into the total. Idempotent.
    pub fn stop_timer(&mut self) {
        if let Some(started) = self.last_start.take() {
            self.total_time += started.elapsed();
        }
    }

    /// Variables handed to the shim.
    pub fn environment(&self, fixtures: Option<&Path>) -> Vec<(&'static str, String)> {
        let mut env = vec![("CAPS", self.caps.clone()), ("HOPS", self.hops.to_string())];
        if let (Some(root), Some(folder), true) = (fixtures, &self.fixture, self.uses_fixtures()) {
            let paths = FixturePaths { root, folder };
            env.push(("SECRET", paths.secret().display().to_string()));
            if !self.skip_offset {
                let offset = paths.log_offset(self.all_offsets);
                env.push(("LOG_OFFSET", offset.display().to_string()));
            }
        }
        env
    }

    /// Spawns the puppet on `port`. Returns once the process exists; the
    /// peer inside it may not be reachable yet.
    pub fn start(&mut self, port: u16, launch: &Launch<'_>) -> Result<()> {
        if self.is_running() {
            return Err(Error::AlreadyRunning(self.name.clone()));
        }
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(launch.log_path)
            .map_err(|source| self.process_error("could not create log file", source))?;

        let mut cmd = Command::new(launch.shim);
        cmd.arg(&self.directory)
            .arg(port.to_string())
            .envs(self.environment(launch.fixtures))
            .stdin(Stdio::null())
            .kill_on_drop(true);
        let tee_log = if launch.verbose {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
            Some(log)
        } else {
            let stderr_log = log
                .try_clone()
                .map_err(|source| self.process_error("could not share log file", source))?;
            cmd.stdout(Stdio::from(log)).stderr(Stdio::from(stderr_log));
            None
        };

        let mut child = cmd.spawn().map_err(|source| {
            let message = format!(
                "failure when creating puppet, see {} for information",
                launch.log_path.display()
            );
            self.process_error(message, source)
        })?;

        let mut tees = Vec::new();
        if let Some(log) = tee_log {
            let log = Arc::new(Mutex::new(tokio::fs::File::from_std(log)));
            if let Some(stdout) = child.stdout.take() {
                tees.push(tee(stdout, log.clone()));
            }
            if let Some(stderr) = child.stderr.take() {
                tees.push(tee(stderr, log));
            }
        }

        tracing::info!(puppet = %self.name, port, pid = ?child.id(), "Puppet process spawned");
        self.port = Some(port);
        self.process = Some(Process { child, tees });
        Ok(())
    }

    /// Interrupts the process, force-kills it if it outlives `grace`, then
    /// reaps it and closes its log. Only a puppet that is not running is an
    /// error.
    pub async fn stop(&mut self, grace: Duration) -> Result<StopReport> {
        let Some(mut process) = self.process.take() else {
            return Err(Error::NotRunning(self.name.clone()));
        };
        let mut report = StopReport::default();

        if let Err(e) = interrupt(&mut process.child) {
            report
                .problems
                .push(format!("could not interrupt {} ({e})", self.name));
        }

        report.status = match tokio::time::timeout(grace, process.child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                report.problems.push(format!("failure when stopping puppet ({e})"));
                None
            }
            Err(_) => {
                tracing::warn!(puppet = %self.name, ?grace, "Puppet ignored interrupt, killing it");
                if let Err(e) = process.child.kill().await {
                    report.problems.push(format!("failure when killing puppet ({e})"));
                }
                process.child.wait().await.ok()
            }
        };

        for tee in process.tees {
            if let Err(e) = tee.await {
                report.problems.push(format!("failure when closing logfile ({e})"));
            }
        }

        self.stop_timer();
        tracing::info!(puppet = %self.name, status = ?report.status, "Puppet stopped");
        Ok(report)
    }

    fn process_error(&self, message: impl Into<String>, source: std::io::Error) -> Error {
        Error::Process {
            puppet: self.name.clone(),
            message: message.into(),
            source,
        }
    }
}

#[cfg(unix)]
fn interrupt(child: &mut Child) -> std::io::Result<()> {
    use nix::{
        sys::signal::{kill, Signal},
        unistd::Pid,
    };
    // No pid means the process was already reaped.
    let Some(pid) = child.id() else {
        return Ok(());
    };
    let pid = i32::try_from(pid).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    kill(Pid::from_raw(pid), Signal::SIGINT).map_err(std::io::Error::from)
}

#[cfg(not(unix))]
fn interrupt(child: &mut Child) -> std::io::Result<()> {
    child.start_kill()
}

fn tee<R>(mut pipe: R, log: Arc<Mutex<tokio::fs::File>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; 8 * 1024];
        let mut stdout = tokio::io::stdout();
        loop {
            let n = match pipe.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            if let Err(e) = stdout.write_all(&buf[..n]).await {
                tracing::debug!(error = %e, "Could not echo puppet output");
            }
            let mut file = log.lock().await;
            if let Err(e) = file.write_all(&buf[..n]).await {
                tracing::warn!(error = %e, "Could not write puppet log");
                break;
            }
        }
        let _ = log.lock().await.flush().await;
    })
}
