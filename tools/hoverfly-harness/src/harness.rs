//! Per-worker setup and the scoped record/replay run around one test body.

use crate::config::{HarnessConfig, JournalConfig};
use crate::errors::HarnessError;
use crate::logging::{append_run_log, scoped_run_logger, JsonlLogger};
use crate::proxy::admin::AdminClient;
use crate::proxy::journal::TrafficJournal;
use crate::proxy::network_log::NetworkLogWriter;
use crate::proxy::session::ProxySession;
use crate::runtime::HarnessRuntime;
use crate::simulation::descriptor::{
    ResolvedSimulation, SimulationDescriptor, GENERATED_DIR, STATIC_DIR,
};
use crate::simulation::freshness::{should_record, FreshnessDecision, FreshnessFlags};
use crate::simulation::merger::{sweep_scratch_files, SimulationMerger};
use crate::types::{TrafficMode, WorkerPorts};
use serde_json::json;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::path::PathBuf;

pub const STATIC_REFRESH_SKIP: &str = "Static simulation has no expiry. No need to run test.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestReport {
    Passed,
    Failed(String),
    Skipped(String),
}

/// What a test body sees of its proxy while it runs.
pub struct ProxyHandle<'a> {
    ports: &'a WorkerPorts,
    mode: TrafficMode,
    admin: AdminClient<'a>,
    journal: &'a JournalConfig,
}

impl ProxyHandle<'_> {
    pub fn proxy_port(&self) -> u16 {
        self.ports.proxy_port
    }

    pub fn admin_port(&self) -> u16 {
        self.ports.admin_port
    }

    pub fn proxy_url(&self) -> String {
        format!("http://localhost:{}", self.ports.proxy_port)
    }

    pub fn mode(&self) -> TrafficMode {
        self.mode
    }

    pub fn journal(&self) -> Result<TrafficJournal, HarnessError> {
        crate::proxy::journal::fetch_journal(
            &self.admin,
            self.journal.page_size,
            self.journal.max_pages,
        )
    }

    pub fn clear_journal(&self) -> Result<(), HarnessError> {
        self.admin.clear_journal()
    }
}

enum BodyOutcome {
    Passed,
    Failed(String),
    Panicked(Box<dyn std::any::Any + Send>),
}

pub struct HarnessContext {
    config: HarnessConfig,
    runtime: HarnessRuntime,
    ports: WorkerPorts,
    log_dir: PathBuf,
    logger: JsonlLogger,
}

impl HarnessContext {
    /// Creates the fixture directories and the worker log directory.
    ///
    /// Each context owns its run log under the worker log directory, so
    /// several contexts may run side by side on separate threads.
    pub fn setup(config: HarnessConfig, runtime: HarnessRuntime) -> Result<Self, HarnessError> {
        let ports = WorkerPorts::for_worker(
            config.proxy.proxy_port,
            config.proxy.admin_port,
            config.run.worker_id.as_deref(),
        );
        let data_dir = &config.simulations.data_dir;
        let fs = runtime.file_system.as_ref();
        fs.create_dir_all(data_dir)?;
        fs.create_dir_all(&data_dir.join(STATIC_DIR))?;
        fs.create_dir_all(&data_dir.join(GENERATED_DIR))?;
        let log_dir = config.logging.log_dir.join(&ports.worker_label);
        fs.create_dir_all(&log_dir)?;
        let logger = JsonlLogger::new(log_dir.join(&config.logging.run_log_file));
        let _log_scope = scoped_run_logger(logger.clone());
        append_run_log(
            "info",
            "harness.setup.completed",
            json!({
                "worker": ports.worker_label,
                "proxy_port": ports.proxy_port,
                "admin_port": ports.admin_port,
                "data_dir": data_dir.display().to_string(),
            }),
        );
        Ok(Self {
            config,
            runtime,
            ports,
            log_dir,
            logger,
        })
    }

    pub fn ports(&self) -> &WorkerPorts {
        &self.ports
    }

    fn scratch_id(&self) -> String {
        self.ports.admin_port.to_string()
    }

    fn merger(&self) -> SimulationMerger<'_> {
        SimulationMerger::new(
            self.runtime.file_system.as_ref(),
            self.runtime.clock.as_ref(),
            &self.config.simulations.scratch_dir,
        )
    }

    pub fn resolve(&self, descriptor: &SimulationDescriptor) -> ResolvedSimulation {
        descriptor.resolve(
            &self.config.simulations.data_dir,
            &self.config.simulations.scratch_dir,
            &self.scratch_id(),
        )
    }

    /// Picks the traffic mode for `descriptor` without touching the proxy.
    pub fn decide(
        &self,
        descriptor: &SimulationDescriptor,
        resolved: &ResolvedSimulation,
    ) -> FreshnessDecision {
        let flags = FreshnessFlags {
            force_live: self.config.run.force_live,
            refresh_expired: self.config.run.refresh_expired,
        };
        if let SimulationDescriptor::Static(_) = descriptor {
            // statics ignore force_live; a lone fixture is only recorded while absent
            let exists = self.runtime.file_system.exists(&resolved.target);
            if resolved.recordable && !exists {
                return FreshnessDecision::Record;
            }
            if flags.refresh_expired {
                return FreshnessDecision::SkipTest(STATIC_REFRESH_SKIP.to_string());
            }
            return FreshnessDecision::Replay;
        }
        should_record(
            self.runtime.file_system.as_ref(),
            self.runtime.clock.as_ref(),
            &resolved.target,
            descriptor.max_age(),
            flags,
        )
    }

    /// Runs `body` against a proxy set up for `descriptor`.
    ///
    /// The proxy is killed on every exit path. A crash detected after the body
    /// overrides its outcome; a panic in the body is resumed once teardown is
    /// done unless that override applies.
    pub fn run<F>(
        &self,
        descriptor: &SimulationDescriptor,
        body: F,
    ) -> Result<TestReport, HarnessError>
    where
        F: FnOnce(&ProxyHandle<'_>) -> Result<(), String>,
    {
        let _log_scope = scoped_run_logger(self.logger.clone());
        let resolved = self.resolve(descriptor);
        let mode = match self.decide(descriptor, &resolved) {
            FreshnessDecision::SkipTest(reason) => {
                append_run_log(
                    "info",
                    "test.run.skipped",
                    json!({"target": resolved.target.display().to_string(), "reason": reason}),
                );
                return Ok(TestReport::Skipped(reason));
            }
            FreshnessDecision::Record => TrafficMode::Record,
            FreshnessDecision::Replay => TrafficMode::Replay,
        };
        append_run_log(
            "info",
            "test.run.started",
            json!({
                "mode": mode.as_str(),
                "target": resolved.target.display().to_string(),
                "static_fixtures": descriptor.static_fixtures(),
                "worker": self.ports.worker_label,
            }),
        );

        let mut session = ProxySession::start(
            &self.runtime,
            &self.config.proxy,
            self.ports.clone(),
            &self.log_dir,
        )?;
        match mode {
            TrafficMode::Record => {
                let arguments = descriptor
                    .capture_overrides()
                    .unwrap_or(&self.config.simulations.capture_arguments);
                session.begin_recording(arguments)?;
            }
            TrafficMode::Replay => {
                let path = resolved.materialize(&self.merger(), &self.scratch_id())?;
                session.begin_replay(&path)?;
            }
        }

        let handle = ProxyHandle {
            ports: &self.ports,
            mode,
            admin: session.admin(),
            journal: &self.config.journal,
        };
        let outcome = match catch_unwind(AssertUnwindSafe(|| body(&handle))) {
            Ok(Ok(())) => BodyOutcome::Passed,
            Ok(Err(message)) => BodyOutcome::Failed(message),
            Err(payload) => BodyOutcome::Panicked(payload),
        };

        let crash = session.detect_crash();
        let saved = match (&outcome, &crash, mode) {
            (BodyOutcome::Passed, Ok(()), TrafficMode::Record) => session
                .finalize_recording(&resolved.target, &self.config.hosts.ignore)
                .map(|_| ()),
            (_, _, TrafficMode::Record) => {
                append_run_log(
                    "info",
                    "simulation.recording.discarded",
                    json!({"target": resolved.target.display().to_string()}),
                );
                Ok(())
            }
            _ => Ok(()),
        };

        let journal = session
            .fetch_journal(self.config.journal.page_size, self.config.journal.max_pages)
            .map_err(|e| HarnessError::JournalUnavailable(e.to_string()));
        let network_log = NetworkLogWriter {
            fs: self.runtime.file_system.as_ref(),
            log_dir: &self.log_dir,
            mode,
            sensitive_hosts: &self.config.hosts.sensitive,
            body_limit: self.config.journal.body_truncate_limit,
        }
        .write(journal);
        session.stop();

        crash?;
        saved?;
        network_log?;
        let report = match outcome {
            BodyOutcome::Passed => TestReport::Passed,
            BodyOutcome::Failed(message) => TestReport::Failed(message),
            BodyOutcome::Panicked(payload) => resume_unwind(payload),
        };
        append_run_log(
            "info",
            "test.run.finished",
            json!({"mode": mode.as_str(), "report": format!("{report:?}")}),
        );
        Ok(report)
    }

    /// Removes the worker scratch files; call once after the last test.
    pub fn teardown(&self) -> Result<Vec<PathBuf>, HarnessError> {
        let _log_scope = scoped_run_logger(self.logger.clone());
        sweep_scratch_files(
            self.runtime.file_system.as_ref(),
            &self.config.simulations.scratch_dir,
        )
    }
}
