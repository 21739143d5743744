use crate::backend;
use crate::channel::OutputEvent;
use crate::config::loader::{BackendKind, LauncherConfig};
use crate::config::types::{LauncherError, RunResult, RunStatus};
use crate::judge::{Judge, TestSuite};
use crate::kernel::signal::ShutdownSignals;
use crate::launcher::Launcher;
use crate::observability::audit;
use crate::runtime::registry::{self, ImageRegistry};
use crate::safety::workspace::WorkspaceManager;
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Exit code for a run the launcher itself could not finish
const EXIT_ERRORED: i32 = 70;
const EXIT_TIMED_OUT: i32 = 124;
/// 128 + SIGKILL
const EXIT_KILLED: i32 = 137;

#[derive(Parser)]
#[command(author, version, about = "Run commands inside per-run runtime containers", long_about = None)]
struct Cli {
    /// Configuration file (default: $RUNBOX_CONFIG, then ./runbox.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Append audit events as JSON lines to this file
    #[arg(long, global = true)]
    audit_log: Option<PathBuf>,
    /// Container backend override
    #[arg(long, value_enum, global = true)]
    backend: Option<BackendArg>,
    /// Daemon endpoint for the remote backend
    #[arg(long, global = true)]
    host: Option<String>,
    /// Permit the host backend (no container isolation)
    #[arg(long, global = true)]
    allow_degraded: bool,
    /// Wall clock limit in milliseconds
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,
    /// Memory limit in MB
    #[arg(long, global = true)]
    memory_mb: Option<u64>,
    /// CPU quota in fractional cores
    #[arg(long, global = true)]
    cpus: Option<f64>,
    /// Maximum number of processes
    #[arg(long, global = true)]
    pids: Option<u32>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum BackendArg {
    Docker,
    Remote,
    Host,
}

impl From<BackendArg> for BackendKind {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Docker => BackendKind::Docker,
            BackendArg::Remote => BackendKind::Remote,
            BackendArg::Host => BackendKind::Host,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// List supported runtimes and their images
    Runtimes,
    /// Run a command in a fresh container, streaming its output
    Run {
        /// Runtime identifier (e.g. java17, python)
        #[arg(long)]
        runtime: String,
        /// Data written to the process's stdin
        #[arg(long)]
        stdin: Option<String>,
        /// Environment variable for the process (KEY=VALUE, repeatable)
        #[arg(long = "env", value_name = "KEY=VALUE")]
        env: Vec<String>,
        /// Print the final result as JSON on stderr
        #[arg(long)]
        json: bool,
        /// Command and arguments to execute
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// Execute a solution once against the given stdin
    ExecuteCode {
        /// Language of the solution (python, javascript, java)
        #[arg(long)]
        language: String,
        /// Source code as string
        #[arg(long)]
        code: String,
        /// Input data to pass to stdin
        #[arg(long)]
        stdin: Option<String>,
    },
    /// Judge a solution against a test case file
    Judge {
        #[arg(long)]
        language: String,
        /// Source code as string
        #[arg(long)]
        code: String,
        /// JSON file with testCases and hiddenTestCases
        #[arg(long)]
        cases: PathBuf,
        /// Submit against the hidden cases, stopping at the first failure
        #[arg(long)]
        hidden: bool,
    },
    /// Remove leftover run workspaces
    Cleanup {
        /// Only remove workspaces older than this many seconds
        #[arg(long, default_value_t = 3600)]
        older_than_secs: u64,
    },
}

/// Parse arguments, execute the command and return the process exit code.
pub fn run() -> Result<i32> {
    env_logger::init();
    let cli = Cli::parse();

    if let Some(path) = &cli.audit_log {
        audit::init_audit_logger(path)
            .with_context(|| format!("failed to open audit log {}", path.display()))?;
    }

    if let Commands::Cleanup { older_than_secs } = &cli.command {
        let manager = WorkspaceManager::at_runtime_root()?;
        let cleaned = manager.cleanup_old_workspaces(Duration::from_secs(*older_than_secs))?;
        eprintln!(
            "Removed {} stale workspace(s) under {}",
            cleaned,
            manager.base_dir().display()
        );
        return Ok(0);
    }

    let config = load_config(&cli)?;
    let registry = registry::install_global(ImageRegistry::from_entries(&config.runtimes)?)?;

    if let Commands::Runtimes = &cli.command {
        print_runtimes(&registry)?;
        return Ok(0);
    }

    let runtime = backend::from_config(&config.backend)?;
    let launcher = Arc::new(Launcher::new(&config, registry, runtime)?);
    log::info!("Using {} backend", launcher.backend_name());
    watch_signals(Arc::clone(&launcher))?;

    match cli.command {
        Commands::Run {
            runtime,
            stdin,
            env,
            json,
            command,
        } => run_command(&launcher, &runtime, stdin, &env, json, &command),
        Commands::ExecuteCode {
            language,
            code,
            stdin,
        } => {
            let judge = Judge::new(&launcher, WorkspaceManager::at_runtime_root()?);
            let execution = judge.execute(&language, &code, stdin.as_deref().unwrap_or(""))?;
            let report = serde_json::json!({
                "output": execution.output.answer,
                "timeMs": execution.output.time_ms,
                "durationMs": execution.result.duration_ms,
                "stdout": execution.result.stdout,
                "stderr": execution.result.stderr,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(0)
        }
        Commands::Judge {
            language,
            code,
            cases,
            hidden,
        } => {
            let content = std::fs::read_to_string(&cases)
                .with_context(|| format!("failed to read {}", cases.display()))?;
            let suite: TestSuite = serde_json::from_str(&content)
                .with_context(|| format!("failed to parse {}", cases.display()))?;
            let judge = Judge::new(&launcher, WorkspaceManager::at_runtime_root()?);

            if hidden {
                let outcome = judge.submit(&language, &code, &suite.hidden_test_cases)?;
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                let reports = judge.run_cases(&language, &code, &suite.test_cases);
                let all_passed = reports.iter().all(|report| report.passed);
                println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({ "testResults": reports }))?
                );
                if !all_passed {
                    return Ok(1);
                }
            }
            Ok(0)
        }
        Commands::Runtimes | Commands::Cleanup { .. } => Ok(0),
    }
}

fn load_config(cli: &Cli) -> Result<LauncherConfig> {
    let mut config = match &cli.config {
        Some(path) => LauncherConfig::load_from_file(path)?,
        None => LauncherConfig::load_default()?,
    };

    if let Some(kind) = cli.backend {
        config.backend.kind = kind.into();
    }
    if let Some(host) = &cli.host {
        config.backend.host = Some(host.clone());
    }
    if cli.allow_degraded {
        config.backend.allow_degraded = true;
    }
    if let Some(timeout_ms) = cli.timeout_ms {
        config.defaults.timeout_ms = timeout_ms;
    }
    if let Some(memory_mb) = cli.memory_mb {
        config.defaults.limits.memory_mb = memory_mb;
    }
    if let Some(cpus) = cli.cpus {
        config.defaults.limits.cpus = cpus;
    }
    if let Some(pids) = cli.pids {
        config.defaults.limits.pids_limit = pids;
    }

    config.validate()?;
    Ok(config)
}

fn print_runtimes(registry: &ImageRegistry) -> Result<()> {
    let runtimes: Vec<_> = registry
        .runtimes()
        .iter()
        .map(|spec| {
            serde_json::json!({
                "id": spec.id,
                "image": spec.image.to_string(),
                "aliases": spec.aliases,
                "baseImage": spec.base_image,
                "description": spec.description,
            })
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&runtimes)?);
    Ok(())
}

/// Cancel in-flight runs once SIGINT, SIGTERM or SIGHUP arrives.
fn watch_signals(launcher: Arc<Launcher>) -> Result<()> {
    let signals = ShutdownSignals::install()?;
    std::thread::Builder::new()
        .name("runbox-signals".to_string())
        .spawn(move || {
            let signal = signals.wait();
            let cancelled = launcher.shutdown();
            eprintln!("Received {:?}, cancelled {} run(s)", signal, cancelled);
        })
        .context("failed to start signal watcher")?;
    Ok(())
}

fn parse_env(pairs: &[String]) -> Result<Vec<(String, String)>> {
    pairs
        .iter()
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
            _ => bail!("invalid --env '{}': expected KEY=VALUE", pair),
        })
        .collect()
}

fn run_command(
    launcher: &Launcher,
    runtime: &str,
    stdin: Option<String>,
    env: &[String],
    json: bool,
    command: &[String],
) -> Result<i32> {
    let Some((program, args)) = command.split_first() else {
        bail!("no command given");
    };

    let mut builder = launcher.request(runtime, program).args(args.iter().cloned());
    if let Some(data) = stdin {
        builder = builder.stdin(data);
    }
    for (key, value) in parse_env(env)? {
        builder = builder.env(key, value);
    }
    let request = builder.build()?;

    let mut ticket = launcher.submit(request)?;
    if let Some(stream) = ticket.take_stream() {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        for event in stream {
            match event {
                OutputEvent::Stdout(bytes) => {
                    let mut out = stdout.lock();
                    out.write_all(&bytes)?;
                    out.flush()?;
                }
                OutputEvent::Stderr(bytes) => {
                    let mut err = stderr.lock();
                    err.write_all(&bytes)?;
                    err.flush()?;
                }
                OutputEvent::Finished(_) => break,
            }
        }
    }

    let result = ticket.wait();
    if json {
        eprintln!("{}", serde_json::to_string_pretty(&result)?);
    } else if result.status != RunStatus::Completed {
        eprintln!("runbox: run {} {}", result.run_id, describe_stop(&result));
    }
    Ok(status_exit_code(&result))
}

fn describe_stop(result: &RunResult) -> String {
    match result.status {
        RunStatus::TimedOut => format!("timed out after {} ms", result.duration_ms),
        RunStatus::Killed => "was cancelled".to_string(),
        RunStatus::Errored => format!(
            "errored: {}",
            result.error_message.as_deref().unwrap_or("unknown failure")
        ),
        RunStatus::Completed => "completed".to_string(),
    }
}

/// Shell-style exit code for a finished run.
fn status_exit_code(result: &RunResult) -> i32 {
    match result.status {
        RunStatus::Completed => match (result.exit_code, result.signal) {
            (Some(code), _) => code,
            (None, Some(signal)) => 128 + signal,
            (None, None) => EXIT_ERRORED,
        },
        RunStatus::TimedOut => EXIT_TIMED_OUT,
        RunStatus::Killed => EXIT_KILLED,
        RunStatus::Errored => EXIT_ERRORED,
    }
}

/// Exit code for an error that ended the CLI before a run finished.
pub fn error_exit_code(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<LauncherError>()
        .map(LauncherError::exit_code)
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(status: RunStatus, exit_code: Option<i32>, signal: Option<i32>) -> RunResult {
        RunResult {
            run_id: "r".to_string(),
            status,
            exit_code,
            signal,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 10,
            truncated: false,
            error_message: None,
        }
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn run_takes_trailing_command() {
        let cli = Cli::try_parse_from([
            "runbox", "--backend", "host", "run", "--runtime", "python", "--env", "A=1", "--",
            "echo", "-n", "hi",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                runtime,
                env,
                command,
                ..
            } => {
                assert_eq!(runtime, "python");
                assert_eq!(env, vec!["A=1"]);
                assert_eq!(command, vec!["echo", "-n", "hi"]);
            }
            _ => panic!("expected run"),
        }
        assert!(matches!(cli.backend, Some(BackendArg::Host)));
    }

    #[test]
    fn env_pairs_need_a_key() {
        let parsed = parse_env(&["A=1".to_string(), "B=x=y".to_string()]).unwrap();
        assert_eq!(parsed[1], ("B".to_string(), "x=y".to_string()));
        assert!(parse_env(&["=1".to_string()]).is_err());
        assert!(parse_env(&["NOVALUE".to_string()]).is_err());
    }

    #[test]
    fn exit_codes_follow_shell_conventions() {
        assert_eq!(status_exit_code(&result(RunStatus::Completed, Some(3), None)), 3);
        assert_eq!(status_exit_code(&result(RunStatus::Completed, None, Some(9))), 137);
        assert_eq!(status_exit_code(&result(RunStatus::TimedOut, None, Some(9))), 124);
        assert_eq!(status_exit_code(&result(RunStatus::Killed, None, Some(9))), 137);
        assert_eq!(status_exit_code(&result(RunStatus::Errored, None, None)), 70);
    }

    #[test]
    fn launcher_errors_keep_their_exit_codes() {
        let err = anyhow::Error::from(LauncherError::UnsupportedRuntime("cobol".to_string()));
        assert_eq!(error_exit_code(&err), 64);
        assert_eq!(error_exit_code(&anyhow::anyhow!("other")), 1);
    }
}
