pub mod config;
pub mod errors;
pub mod harness;
pub mod logging;
pub mod proxy;
pub mod runtime;
pub mod simulation;
pub mod types;

use clap::{error::ErrorKind, Parser, Subcommand};
use config::{load_config, CliOverrides, EnvMap};
use errors::HarnessError;
use proxy::admin::AdminClient;
use proxy::journal::fetch_journal;
use runtime::HarnessRuntime;
use simulation::document::{to_pretty_json, SimulationDocument};
use simulation::freshness::{should_record, FreshnessDecision, FreshnessFlags};
use simulation::merger::{sweep_scratch_files, SimulationMerger};
use simulation::sanitizer::sanitize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use types::WorkerPorts;

#[derive(Debug, Clone, Parser)]
#[command(name = "hoverfly-harness")]
#[command(about = "Record and replay HTTP traffic for tests through a managed Hoverfly proxy")]
pub struct Cli {
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    /// Always record, even when a simulation exists.
    #[arg(long, global = true, default_value_t = false)]
    pub force_live: bool,
    /// Re-record expired simulations and skip current ones.
    #[arg(long, global = true, default_value_t = false)]
    pub refresh_expired: bool,
    /// Extra arguments appended to the proxy command line.
    #[arg(long, global = true, allow_hyphen_values = true)]
    pub proxy_extra_args: Option<String>,
    #[arg(long, global = true)]
    pub worker: Option<String>,
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Report whether a simulation file would be recorded, replayed or skipped.
    Status {
        file: PathBuf,
        #[arg(long)]
        max_age: Option<u64>,
    },
    /// Combine simulation files into the worker scratch file.
    Merge {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        #[arg(long = "block")]
        block: Vec<String>,
    },
    /// Clean a recorded simulation in place.
    Sanitize {
        file: PathBuf,
        #[arg(long = "ignore-host")]
        ignore_host: Vec<String>,
    },
    /// Dump the running proxy's full traffic journal.
    Journal {
        #[arg(long)]
        admin_port: Option<u16>,
    },
    /// Delete leftover scratch files.
    Sweep,
}

pub fn run() -> Result<i32, HarnessError> {
    let args = std::env::args_os().collect::<Vec<_>>();
    let env = std::env::vars_os().collect::<Vec<_>>();
    let cwd = std::env::current_dir().map_err(|e| HarnessError::Io(e.to_string()))?;
    let runtime = HarnessRuntime::new();
    let mut stdout = std::io::stdout();
    run_with_runtime(&args, &env, &cwd, &runtime, &mut stdout)
}

pub fn run_with_runtime(
    args: &[std::ffi::OsString],
    env: &[(std::ffi::OsString, std::ffi::OsString)],
    cwd: &Path,
    runtime: &HarnessRuntime,
    out: &mut dyn Write,
) -> Result<i32, HarnessError> {
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(error) => match error.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                write_out(out, &error.to_string())?;
                return Ok(0);
            }
            _ => return Err(HarnessError::Cli(error.to_string())),
        },
    };

    let env_map = env_to_map(env);
    let mut overrides = CliOverrides::from_env(&env_map);
    if cli.config.is_some() {
        overrides.config_path = cli.config.clone();
    }
    overrides.force_live |= cli.force_live;
    overrides.refresh_expired |= cli.refresh_expired;
    if cli.proxy_extra_args.is_some() {
        overrides.proxy_extra_args = cli.proxy_extra_args.clone();
    }
    if cli.worker.is_some() {
        overrides.worker_id = cli.worker.clone();
    }
    overrides.data_dir = cli.data_dir.clone();

    let cfg = load_config(&overrides, cwd, runtime.file_system.as_ref())?;
    let ports = WorkerPorts::for_worker(
        cfg.proxy.proxy_port,
        cfg.proxy.admin_port,
        cfg.run.worker_id.as_deref(),
    );

    match cli.command {
        Command::Status { file, max_age } => {
            let decision = should_record(
                runtime.file_system.as_ref(),
                runtime.clock.as_ref(),
                &cwd.join(file),
                max_age.map(Duration::from_secs),
                FreshnessFlags {
                    force_live: cfg.run.force_live,
                    refresh_expired: cfg.run.refresh_expired,
                },
            );
            let line = match decision {
                FreshnessDecision::Record => "record".to_string(),
                FreshnessDecision::Replay => "replay".to_string(),
                FreshnessDecision::SkipTest(reason) => format!("skip: {reason}"),
            };
            write_out(out, &line)?;
        }
        Command::Merge { files, block } => {
            let merger = SimulationMerger::new(
                runtime.file_system.as_ref(),
                runtime.clock.as_ref(),
                &cfg.simulations.scratch_dir,
            );
            let inputs = files.iter().map(|f| cwd.join(f)).collect::<Vec<_>>();
            let merged = merger.merge(&inputs, &block, &ports.admin_port.to_string())?;
            write_out(out, &merged.display().to_string())?;
        }
        Command::Sanitize { file, ignore_host } => {
            let hosts = if ignore_host.is_empty() {
                cfg.hosts.ignore.clone()
            } else {
                ignore_host
            };
            let kept = sanitize_file(runtime, &cwd.join(file), &hosts)?;
            write_out(out, &format!("sanitized: {kept} pairs kept"))?;
        }
        Command::Journal { admin_port } => {
            let client = AdminClient::new(
                runtime.transport.as_ref(),
                admin_port.unwrap_or(ports.admin_port),
            );
            let journal = fetch_journal(&client, cfg.journal.page_size, cfg.journal.max_pages)?;
            write_out(out, &to_pretty_json(&journal)?)?;
        }
        Command::Sweep => {
            let removed = sweep_scratch_files(
                runtime.file_system.as_ref(),
                &cfg.simulations.scratch_dir,
            )?;
            write_out(out, &format!("removed {} scratch files", removed.len()))?;
        }
    }
    Ok(0)
}

fn sanitize_file(
    runtime: &HarnessRuntime,
    path: &Path,
    hosts: &[String],
) -> Result<usize, HarnessError> {
    let fs = runtime.file_system.as_ref();
    let document = SimulationDocument::parse(&fs.read_to_string(path)?)?;
    let clean = sanitize(document, hosts);
    fs.write_string(path, &clean.to_pretty_json()?)?;
    Ok(clean.data.pairs.len())
}

fn write_out(out: &mut dyn Write, text: &str) -> Result<(), HarnessError> {
    writeln!(out, "{}", text.trim_end()).map_err(|e| HarnessError::Io(e.to_string()))
}

fn env_to_map(env: &[(std::ffi::OsString, std::ffi::OsString)]) -> EnvMap {
    let mut map = EnvMap::new();
    for (key, value) in env {
        if let (Some(key), Some(value)) = (key.to_str(), value.to_str()) {
            map.insert(key.to_string(), value.to_string());
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::run_with_runtime;
    use crate::errors::HarnessError;
    use crate::proxy::fake::FakeProxy;
    use crate::runtime::{
        FakeClock, FakeFileSystem, FakeProcessRunner, FileSystem, HarnessRuntime,
    };
    use serde_json::json;
    use std::ffi::OsString;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::{Duration, SystemTime};

    fn runtime(fs: &FakeFileSystem, proxy: &FakeProxy) -> HarnessRuntime {
        HarnessRuntime {
            clock: Arc::new(FakeClock::new(
                SystemTime::UNIX_EPOCH + Duration::from_secs(1_717_243_200),
            )),
            file_system: Arc::new(fs.clone()),
            process_runner: Arc::new(FakeProcessRunner::default()),
            transport: Arc::new(proxy.clone()),
        }
    }

    fn run(
        args: &[&str],
        env: &[(&str, &str)],
        runtime: &HarnessRuntime,
    ) -> Result<String, HarnessError> {
        let args = std::iter::once("hoverfly-harness")
            .chain(args.iter().copied())
            .map(OsString::from)
            .collect::<Vec<_>>();
        let env = env
            .iter()
            .map(|(k, v)| (OsString::from(k), OsString::from(v)))
            .collect::<Vec<_>>();
        let mut out = Vec::new();
        run_with_runtime(&args, &env, Path::new("/work"), runtime, &mut out)?;
        Ok(String::from_utf8(out).expect("utf8"))
    }

    fn sim(stamp: &str) -> String {
        json!({"data": {"pairs": []}, "meta": {"timeExported": stamp}}).to_string()
    }

    #[test]
    fn status_reports_each_decision() {
        let fs = FakeFileSystem::with_file("/work/sim.json", sim("2024-06-01T11:00:00Z"));
        let proxy = FakeProxy::new();
        let rt = runtime(&fs, &proxy);

        assert_eq!(run(&["status", "sim.json"], &[], &rt).expect("status"), "replay\n");
        assert_eq!(run(&["status", "missing.json"], &[], &rt).expect("status"), "record\n");
        assert_eq!(
            run(&["status", "sim.json", "--max-age", "1800", "--refresh-expired"], &[], &rt)
                .expect("status"),
            "record\n"
        );
        let skipped = run(
            &["status", "sim.json", "--max-age", "7200"],
            &[("HOVERFLY_REFRESH_EXPIRED", "1")],
            &rt,
        )
        .expect("status");
        assert!(skipped.starts_with("skip: Simulation up-to-date"));
        assert_eq!(
            run(&["--force-live", "status", "sim.json"], &[], &rt).expect("status"),
            "record\n"
        );
    }

    #[test]
    fn merge_writes_worker_scratch_file() {
        let fs = FakeFileSystem::with_file("/work/a.json", sim("2024-06-01T11:00:00Z"));
        let proxy = FakeProxy::new();
        let rt = runtime(&fs, &proxy);
        let out = run(
            &["merge", "a.json", "--block", "example.com", "--worker", "gw1"],
            &[],
            &rt,
        )
        .expect("merge");
        assert_eq!(out, "/work/combined_temp_8889.json\n");
        let merged = fs
            .read_to_string(Path::new("/work/combined_temp_8889.json"))
            .expect("merged");
        assert!(merged.contains("example.com"));
    }

    #[test]
    fn journal_dumps_all_pages() {
        let fs = FakeFileSystem::default();
        let proxy = FakeProxy::new();
        for i in 0..12 {
            proxy.push_journal_entry(&format!("h{i}.com"), "ok", false);
        }
        let rt = runtime(&fs, &proxy);
        let out = run(&["journal"], &[], &rt).expect("journal");
        let value: serde_json::Value = serde_json::from_str(&out).expect("json");
        assert_eq!(value["journal"].as_array().map(Vec::len), Some(12));
        assert_eq!(value["total"], 12);
    }

    #[test]
    fn unknown_subcommand_is_a_cli_error() {
        let fs = FakeFileSystem::default();
        let proxy = FakeProxy::new();
        let rt = runtime(&fs, &proxy);
        let err = run(&["explode"], &[], &rt).expect_err("cli");
        assert!(matches!(err, HarnessError::Cli(_)));
    }
}
