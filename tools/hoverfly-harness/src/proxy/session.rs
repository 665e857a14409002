//! Ownership of one proxy process for the duration of a single test.

use crate::config::ProxyConfig;
use crate::errors::HarnessError;
use crate::logging::append_run_log;
use crate::proxy::admin::AdminClient;
use crate::proxy::journal::{fetch_journal, TrafficJournal};
use crate::runtime::{HarnessRuntime, ProcessRequest};
use crate::simulation::document::SimulationDocument;
use crate::simulation::sanitizer::sanitize;
use crate::types::{ProxyMode, SessionState, WorkerPorts};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

pub const PROXY_LOG_FILE: &str = "hoverfly.log";
const CRASH_PROBE_ATTEMPTS: usize = 2;

pub fn validate_transition(from: SessionState, to: SessionState) -> Result<(), HarnessError> {
    use SessionState as S;

    let allowed = match from {
        S::Starting => matches!(to, S::Ready | S::Stopped),
        S::Ready => matches!(to, S::Spying | S::Recording | S::Replaying | S::Stopped),
        S::Spying => matches!(to, S::Recording | S::Replaying | S::Stopped),
        S::Recording | S::Replaying => matches!(to, S::Stopped),
        S::Stopped => false,
    };

    if !allowed {
        return Err(HarnessError::IllegalTransition(format!(
            "{} -> {}",
            from.as_str(),
            to.as_str()
        )));
    }
    Ok(())
}

pub struct ProxySession<'a> {
    runtime: &'a HarnessRuntime,
    config: &'a ProxyConfig,
    ports: WorkerPorts,
    log_file: PathBuf,
    state: SessionState,
    handle: Option<u64>,
}

impl<'a> ProxySession<'a> {
    /// Launches the proxy and leaves it spying.
    ///
    /// Each attempt that misses the readiness deadline appends a process
    /// listing to the proxy log and kills the launched process before the
    /// next attempt.
    pub fn start(
        runtime: &'a HarnessRuntime,
        config: &'a ProxyConfig,
        ports: WorkerPorts,
        log_dir: &Path,
    ) -> Result<Self, HarnessError> {
        runtime.file_system.create_dir_all(log_dir)?;
        let mut session = Self {
            runtime,
            config,
            ports,
            log_file: log_dir.join(PROXY_LOG_FILE),
            state: SessionState::Starting,
            handle: None,
        };

        if config.stop_stale_processes && !session.ports.is_parallel_worker() {
            session.stop_stale_processes();
        }

        let attempts = config.start_attempts.max(1);
        for attempt in 1..=attempts {
            let handle = runtime.process_runner.spawn(
                ProcessRequest::new(config.binary.clone(), session.launch_args())
                    .logging_to(&session.log_file),
            )?;
            session.handle = Some(handle);
            append_run_log(
                "info",
                "proxy.start.attempt",
                json!({
                    "attempt": attempt,
                    "proxy_port": session.ports.proxy_port,
                    "admin_port": session.ports.admin_port,
                }),
            );

            if session.wait_until_ready()? {
                session.transition(SessionState::Ready)?;
                session.admin().set_mode(ProxyMode::Spy, None)?;
                session.transition(SessionState::Spying)?;
                append_run_log(
                    "info",
                    "proxy.start.ready",
                    json!({"attempt": attempt, "admin_port": session.ports.admin_port}),
                );
                return Ok(session);
            }

            append_run_log(
                "warn",
                "proxy.start.timeout",
                json!({"attempt": attempt, "admin_port": session.ports.admin_port}),
            );
            session.dump_process_listing();
            session.kill_process();
        }

        session.transition(SessionState::Stopped)?;
        Err(HarnessError::StartupTimeout(format!(
            "admin port {} not ready after {attempts} attempts of {}ms",
            session.ports.admin_port, config.startup_timeout_ms
        )))
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn admin(&self) -> AdminClient<'a> {
        AdminClient::new(self.runtime.transport.as_ref(), self.ports.admin_port)
    }

    pub fn begin_recording(&mut self, capture_arguments: &Value) -> Result<(), HarnessError> {
        self.transition(SessionState::Recording)?;
        self.admin()
            .set_mode(ProxyMode::Capture, Some(capture_arguments))?;
        append_run_log(
            "info",
            "proxy.mode.recording",
            json!({"admin_port": self.ports.admin_port, "arguments": capture_arguments}),
        );
        Ok(())
    }

    /// Imports the simulation at `path`; the proxy keeps spying so unmatched
    /// requests still reach the network.
    pub fn begin_replay(&mut self, path: &Path) -> Result<(), HarnessError> {
        self.transition(SessionState::Replaying)?;
        let document = self.runtime.file_system.read_to_string(path)?;
        self.admin().import_simulation(&document)?;
        append_run_log(
            "info",
            "proxy.mode.replaying",
            json!({"admin_port": self.ports.admin_port, "simulation": path.display().to_string()}),
        );
        Ok(())
    }

    /// Probes the admin root twice; two refusals mean the process is gone.
    pub fn detect_crash(&self) -> Result<(), HarnessError> {
        let admin = self.admin();
        let mut last = None;
        for _ in 0..CRASH_PROBE_ATTEMPTS {
            match admin.ping() {
                Ok(()) => return Ok(()),
                Err(err) if err.is_connection() => {
                    append_run_log(
                        "warn",
                        "proxy.crash.probe_failed",
                        json!({"admin_port": self.ports.admin_port, "error": err.to_string()}),
                    );
                    last = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(HarnessError::ProxyCrashed(format!(
            "admin port {} unreachable: {}",
            self.ports.admin_port,
            last.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// Exports captured traffic, sanitizes it and writes it to `target`.
    pub fn finalize_recording(
        &self,
        target: &Path,
        hosts_to_ignore: &[String],
    ) -> Result<SimulationDocument, HarnessError> {
        if self.state != SessionState::Recording {
            return Err(HarnessError::IllegalTransition(format!(
                "finalize recording while {}",
                self.state.as_str()
            )));
        }
        let captured = self.admin().export_simulation()?;
        let captured_pairs = captured.data.pairs.len();
        let clean = sanitize(captured, hosts_to_ignore);
        if let Some(parent) = target.parent() {
            self.runtime.file_system.create_dir_all(parent)?;
        }
        self.runtime
            .file_system
            .write_string(target, &clean.to_pretty_json()?)?;
        append_run_log(
            "info",
            "simulation.recording.saved",
            json!({
                "path": target.display().to_string(),
                "captured_pairs": captured_pairs,
                "saved_pairs": clean.data.pairs.len(),
            }),
        );
        Ok(clean)
    }

    pub fn fetch_journal(
        &self,
        page_size: usize,
        max_pages: usize,
    ) -> Result<TrafficJournal, HarnessError> {
        fetch_journal(&self.admin(), page_size, max_pages)
    }

    /// Kills the proxy process. Safe to call more than once.
    pub fn stop(&mut self) {
        if self.state == SessionState::Stopped {
            return;
        }
        self.kill_process();
        self.state = SessionState::Stopped;
        append_run_log(
            "info",
            "proxy.stopped",
            json!({"admin_port": self.ports.admin_port}),
        );
    }

    fn transition(&mut self, next: SessionState) -> Result<(), HarnessError> {
        validate_transition(self.state, next)?;
        self.state = next;
        Ok(())
    }

    fn launch_args(&self) -> Vec<String> {
        let mut args = vec![
            "-pp".to_string(),
            self.ports.proxy_port.to_string(),
            "-ap".to_string(),
            self.ports.admin_port.to_string(),
        ];
        args.extend(self.config.extra_args());
        args
    }

    fn wait_until_ready(&self) -> Result<bool, HarnessError> {
        let clock = self.runtime.clock.as_ref();
        let deadline = clock.now() + self.config.startup_timeout();
        let admin = self.admin();
        loop {
            if admin.is_ready()? {
                return Ok(true);
            }
            let now = clock.now();
            if now >= deadline {
                return Ok(false);
            }
            clock.sleep_until((now + self.config.poll_interval()).min(deadline))?;
        }
    }

    fn stop_stale_processes(&self) {
        let result = self.runtime.process_runner.run(ProcessRequest::new(
            self.config.stop_command.clone(),
            vec!["stop".to_string()],
        ));
        if let Err(err) = result {
            append_run_log(
                "debug",
                "proxy.stale_stop.failed",
                json!({"command": self.config.stop_command, "error": err.to_string()}),
            );
        }
    }

    fn dump_process_listing(&self) {
        let result = self.runtime.process_runner.run(
            ProcessRequest::new("ps", vec!["-ef".to_string()]).logging_to(&self.log_file),
        );
        if let Err(err) = result {
            append_run_log(
                "warn",
                "proxy.ps_dump.failed",
                json!({"error": err.to_string()}),
            );
        }
    }

    fn kill_process(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(err) = self.runtime.process_runner.kill(handle) {
                append_run_log(
                    "warn",
                    "proxy.kill.failed",
                    json!({"handle": handle, "error": err.to_string()}),
                );
            }
        }
    }
}

impl Drop for ProxySession<'_> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::{validate_transition, ProxySession, PROXY_LOG_FILE};
    use crate::config::{HarnessConfig, ProxyConfig};
    use crate::errors::HarnessError;
    use crate::proxy::fake::{FakeProxy, ServedResponse};
    use crate::runtime::{FakeClock, FakeFileSystem, FakeProcessRunner, FileSystem, HarnessRuntime};
    use crate::types::{ProxyMode, SessionState, WorkerPorts};
    use serde_json::json;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::{Duration, SystemTime};

    struct Fixture {
        runtime: HarnessRuntime,
        proxy: FakeProxy,
        processes: FakeProcessRunner,
        fs: FakeFileSystem,
        clock: FakeClock,
    }

    fn fixture() -> Fixture {
        let proxy = FakeProxy::new();
        let processes = FakeProcessRunner::default();
        let fs = FakeFileSystem::default();
        let clock = FakeClock::new(SystemTime::UNIX_EPOCH + Duration::from_secs(1_717_243_200));
        let runtime = HarnessRuntime {
            clock: Arc::new(clock.clone()),
            file_system: Arc::new(fs.clone()),
            process_runner: Arc::new(processes.clone()),
            transport: Arc::new(proxy.clone()),
        };
        Fixture {
            runtime,
            proxy,
            processes,
            fs,
            clock,
        }
    }

    fn proxy_config() -> ProxyConfig {
        HarnessConfig::default().proxy
    }

    fn main_ports() -> WorkerPorts {
        WorkerPorts::for_worker(8500, 8888, None)
    }

    #[test]
    fn start_stops_stale_processes_then_spies() {
        let fx = fixture();
        let config = proxy_config();
        let session = ProxySession::start(&fx.runtime, &config, main_ports(), Path::new("/logs/main"))
            .expect("start");
        assert_eq!(session.state(), SessionState::Spying);
        assert_eq!(fx.proxy.mode(), ProxyMode::Spy);

        let spawned = fx.processes.spawned();
        assert_eq!(spawned[0].program, "hoverctl");
        assert_eq!(spawned[0].args, vec!["stop"]);
        assert_eq!(spawned[1].program, "hoverfly");
        assert_eq!(spawned[1].args, vec!["-pp", "8500", "-ap", "8888"]);
        assert_eq!(
            spawned[1].log_file.as_deref(),
            Some(Path::new("/logs/main").join(PROXY_LOG_FILE).as_path())
        );
    }

    #[test]
    fn parallel_workers_skip_stale_cleanup_and_pass_extra_args() {
        let fx = fixture();
        let mut config = proxy_config();
        config.extra_args = "-db memory  -tls-verification=false".to_string();
        let ports = WorkerPorts::for_worker(8500, 8888, Some("gw2"));
        let _session =
            ProxySession::start(&fx.runtime, &config, ports, Path::new("/logs/gw2")).expect("start");
        let spawned = fx.processes.spawned();
        assert_eq!(spawned.len(), 1);
        assert_eq!(
            spawned[0].args,
            vec!["-pp", "8502", "-ap", "8890", "-db", "memory", "-tls-verification=false"]
        );
    }

    #[test]
    fn slow_start_is_polled_until_ready() {
        let fx = fixture();
        fx.proxy.refuse_ready_probes(4);
        let config = proxy_config();
        let session = ProxySession::start(&fx.runtime, &config, main_ports(), Path::new("/logs"))
            .expect("start");
        assert_eq!(session.state(), SessionState::Spying);
        assert_eq!(fx.clock.sleeps().len(), 4);
        // only the hoverctl cleanup and one launch
        assert_eq!(fx.processes.spawned().len(), 2);
    }

    #[test]
    fn startup_timeout_retries_then_fails_without_leaking_processes() {
        let fx = fixture();
        fx.proxy.set_down(true);
        let mut config = proxy_config();
        config.stop_stale_processes = false;
        let err = ProxySession::start(&fx.runtime, &config, main_ports(), Path::new("/logs"))
            .err()
            .expect("timeout");
        assert!(matches!(err, HarnessError::StartupTimeout(_)));

        let spawned = fx.processes.spawned();
        let launches = spawned.iter().filter(|r| r.program == "hoverfly").count();
        let listings = spawned.iter().filter(|r| r.program == "ps").count();
        assert_eq!(launches, 3);
        assert_eq!(listings, 3);
        // every launched proxy handle is killed
        assert_eq!(fx.processes.kills().len(), 3);
    }

    #[test]
    fn recording_is_sanitized_and_persisted() {
        let fx = fixture();
        let config = proxy_config();
        let mut session = ProxySession::start(&fx.runtime, &config, main_ports(), Path::new("/logs"))
            .expect("start");
        session
            .begin_recording(&json!({"headersWhitelist": ["Cookie"]}))
            .expect("record");
        fx.proxy.serve(
            "api.example.com",
            ServedResponse::ok("{}")
                .with_header("Set-Cookie", "a=b; Expires=Wed, 01 Jan 2025 00:00:00 GMT;"),
        );
        fx.proxy.serve("localhost:5000", ServedResponse::ok("local"));

        let target = Path::new("/data/generated/rec.json");
        let saved = session
            .finalize_recording(target, &["localhost".to_string()])
            .expect("saved");
        assert_eq!(saved.data.pairs.len(), 1);
        assert_eq!(saved.data.pairs[0].response.headers["Set-Cookie"], vec!["a=b; "]);
        let text = fx.fs.read_to_string(target).expect("written");
        assert!(text.contains("Hoverfly-Cache-Served"));
    }

    #[test]
    fn storage_failure_while_saving_surfaces_from_finalize() {
        let fx = fixture();
        let config = proxy_config();
        let mut session = ProxySession::start(&fx.runtime, &config, main_ports(), Path::new("/logs"))
            .expect("start");
        session
            .begin_recording(&json!({"headersWhitelist": ["Cookie"]}))
            .expect("record");
        fx.proxy.serve("api.example.com", ServedResponse::ok("{}"));

        fx.fs
            .set_fail_next(HarnessError::Io("read-only file system".to_string()));
        let target = Path::new("/data/generated/rec.json");
        let err = session
            .finalize_recording(target, &[])
            .expect_err("write fails");
        assert!(matches!(err, HarnessError::Io(m) if m.contains("read-only")));
        assert!(!fx.fs.exists(target));
    }

    #[test]
    fn replay_imports_the_file_bytes() {
        let fx = fixture();
        let sim = json!({
            "data": {"pairs": [{
                "request": {"destination": [{"matcher": "exact", "value": "api.example.com"}]},
                "response": {"status": 200, "body": "recorded", "headers": {}}
            }]},
            "meta": {"timeExported": "2024-06-01T11:00:00Z"}
        });
        fx.fs
            .write_string(Path::new("/data/static/a.json"), &sim.to_string())
            .expect("seed");
        let config = proxy_config();
        let mut session = ProxySession::start(&fx.runtime, &config, main_ports(), Path::new("/logs"))
            .expect("start");
        session
            .begin_replay(Path::new("/data/static/a.json"))
            .expect("replay");
        assert_eq!(fx.proxy.imported_pairs().len(), 1);
        let served = fx.proxy.serve("api.example.com", ServedResponse::ok("live"));
        assert_eq!(served.body, "recorded");
        assert!(session.finalize_recording(Path::new("/x.json"), &[]).is_err());
    }

    #[test]
    fn single_refused_probe_is_not_a_crash() {
        let fx = fixture();
        let config = proxy_config();
        let session = ProxySession::start(&fx.runtime, &config, main_ports(), Path::new("/logs"))
            .expect("start");
        fx.proxy.refuse_pings(1);
        session.detect_crash().expect("alive");
        fx.proxy.refuse_pings(2);
        let err = session.detect_crash().expect_err("crashed");
        assert!(matches!(err, HarnessError::ProxyCrashed(_)));
    }

    #[test]
    fn drop_kills_the_process_once() {
        let fx = fixture();
        let mut config = proxy_config();
        config.stop_stale_processes = false;
        {
            let mut session =
                ProxySession::start(&fx.runtime, &config, main_ports(), Path::new("/logs"))
                    .expect("start");
            session.stop();
            session.stop();
        }
        assert_eq!(fx.processes.kills(), vec![0]);
    }

    #[test]
    fn transition_table_rejects_leaving_stopped() {
        validate_transition(SessionState::Spying, SessionState::Replaying).expect("allowed");
        let err = validate_transition(SessionState::Stopped, SessionState::Recording)
            .expect_err("must reject");
        assert!(matches!(err, HarnessError::IllegalTransition(m) if m.contains("stopped -> recording")));
        assert!(validate_transition(SessionState::Recording, SessionState::Replaying).is_err());
    }
}
