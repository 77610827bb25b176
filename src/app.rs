//! src/app.rs
//!
//! Defines the `App` struct, which owns the configuration and the shutdown
//! token and runs one of the binary's modes to completion.

use crate::{
    config::Config,
    error::{Error, Result},
    expectations::{produce_expectations, ExpectationArgs, ExpectationMap},
    fixtures::{
        load_follow_graph, path_and_file, write_expectations, IdentityMap, EXPECTATIONS_FILE,
        FOLLOW_GRAPH_FILE,
    },
    generation::{GenerateArgs, Generator},
    rpc::JsonLineConnector,
    sim::{report::TapReporter, Simulator},
};
use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};
use tokio_util::sync::CancellationToken;

/// What the binary was asked to do.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Execute the configured test script.
    Run,
    /// Write the expectation map for the fixtures' follow graph.
    Expectations,
    /// Write expectations and a generated test script.
    Generate,
    /// Print the focus group's traversal of the follow graph.
    FollowGraph,
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "run" => Ok(Mode::Run),
            "expectations" => Ok(Mode::Expectations),
            "generate" => Ok(Mode::Generate),
            "follow-graph" => Ok(Mode::FollowGraph),
            other => Err(Error::UnknownMode(other.to_string())),
        }
    }
}

pub struct App {
    config: Config,
    shutdown_token: CancellationToken,
}

impl App {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            shutdown_token: CancellationToken::new(),
        })
    }

    /// A token that stops the run when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub async fn run(self, mode: Mode) -> Result<()> {
        tracing::info!(?mode, "🚀 Starting netsim");
        match mode {
            Mode::Run => {
                let signals = tokio::spawn(wait_for_signal(self.shutdown_token.clone()));
                let res = self.simulate().await;
                signals.abort();
                res
            }
            Mode::Expectations => {
                let path = path_and_file(&self.config.generate.out, EXPECTATIONS_FILE);
                self.expectations(&path).map(|_| ())
            }
            Mode::Generate => self.generate(&mut io::stdout()),
            Mode::FollowGraph => self.follow_graph(&mut io::stdout()),
        }
    }

    async fn simulate(&self) -> Result<()> {
        let script = fs::read_to_string(&self.config.spec).map_err(|e| {
            tracing::error!(spec = %self.config.spec.display(), error = %e, "Failed to read test script");
            e
        })?;
        let mut sim = Simulator::new(
            &self.config,
            Arc::new(JsonLineConnector),
            TapReporter::stdout(),
            self.shutdown_token.clone(),
        )?;
        let summary = sim.run_script(&script).await;
        tracing::info!(
            passed = summary.passed,
            failed = summary.failed,
            aborted = summary.aborted,
            cancelled = summary.cancelled,
            "👋 Simulation finished"
        );
        if summary.success() {
            Ok(())
        } else {
            Err(Error::Assertion(format!(
                "{} of {} instructions failed",
                summary.failed,
                summary.passed + summary.failed
            )))
        }
    }

    fn fixtures_root(&self) -> Result<&Path> {
        self.config.fixtures.as_deref().ok_or(Error::MissingFixtures)
    }

    /// Computes the expectation map from the fixtures' follow graph and
    /// writes it to `path`.
    pub fn expectations(&self, path: &Path) -> Result<ExpectationMap> {
        let graph = load_follow_graph(&self.fixtures_root()?.join(FOLLOW_GRAPH_FILE))?;
        let args = ExpectationArgs {
            max_hops: self.config.hops,
            replicate_blocked: self.config.generate.replicate_blocked,
        };
        let expectations = produce_expectations(args, &graph);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        write_expectations(path, &expectations)?;
        tracing::info!(path = %path.display(), peers = expectations.len(), "Wrote expectations");
        Ok(expectations)
    }

    /// Writes expectations and a generated script into the generate output
    /// directory, echoing the script to `echo`.
    pub fn generate(&self, echo: &mut dyn Write) -> Result<()> {
        let root = self.fixtures_root()?;
        let identities = IdentityMap::load(root)?;
        let graph = load_follow_graph(&root.join(FOLLOW_GRAPH_FILE))?;

        let out_dir = &self.config.generate.out;
        let expectations = self.expectations(&out_dir.join(EXPECTATIONS_FILE))?;

        let mut script = Vec::new();
        Generator::new(self.generate_args(), &identities, &graph).generate(&expectations, &mut script)?;

        let path = self.script_path();
        fs::write(&path, &script)?;
        echo.write_all(&script)?;
        tracing::info!(path = %path.display(), "Wrote generated test script");
        Ok(())
    }

    /// Writes each focus peer's traversal of the follow graph to `out`.
    pub fn follow_graph(&self, out: &mut dyn Write) -> Result<()> {
        let root = self.fixtures_root()?;
        let identities = IdentityMap::load(root)?;
        let graph = load_follow_graph(&root.join(FOLLOW_GRAPH_FILE))?;
        Generator::new(self.generate_args(), &identities, &graph).describe_traversal(out)
    }

    fn generate_args(&self) -> GenerateArgs {
        GenerateArgs {
            sbot: self.config.generate.sbot.clone(),
            focused: self.config.generate.focused,
            max_hops: self.config.hops,
            seed: self.config.generate.seed,
            passes: self.config.generate.passes,
            wait_ms: self.config.generate.wait_ms,
        }
    }

    fn script_path(&self) -> PathBuf {
        let name = self
            .config
            .spec
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("netsim-test.txt"));
        self.config.generate.out.join(name)
    }
}

/// Cancels `token` on Ctrl+C, or SIGTERM on unix.
async fn wait_for_signal(token: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                tracing::warn!(error = %e, "Cannot listen for Ctrl+C");
                return;
            }
            tracing::info!("Ctrl+C received. Cancelling the run...");
        }
        _ = terminate => tracing::info!("SIGTERM received. Cancelling the run..."),
    }
    token.cancel();
}
