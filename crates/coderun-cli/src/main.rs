//! coderun CLI - one-shot confined runs and daemon client
//!
//! `coderun exec` is the container entrypoint: it reads one submission,
//! runs it, and prints exactly one JSON result on stdout. Logs go to
//! stderr.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use coderun_core::config::{default_socket_path, parse_size};
use coderun_core::protocol::{self, PAYLOAD_ENV, Request, Response};
use coderun_core::{ConfinementPolicy, ExecutionResult, Language, Runner, Submission, workspace};
use serde_json::Value;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, Instant};
use tokio::net::UnixStream;

/// `EX_USAGE`: the payload could not be decoded
const EXIT_BAD_PAYLOAD: u8 = 64;
/// `EX_SOFTWARE`: the runner failed, not the submission
const EXIT_INTERNAL: u8 = 70;

/// Workspaces older than this are leftovers of a killed runner
const STALE_WORKSPACE_AGE: Duration = Duration::from_secs(3600);

#[derive(Parser)]
#[command(name = "coderun")]
#[command(author, version, about = "Confined runner for untrusted submissions")]
struct Cli {
    /// Workspace root (overrides CODERUN_WORKSPACE_ROOT)
    #[arg(long, global = true)]
    workspace_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one JSON submission and print its result
    Exec {
        /// Read the submission from this file instead of PAYLOAD or stdin
        #[arg(long)]
        payload_file: Option<PathBuf>,
    },

    /// Run a source file directly and print the result
    Run {
        /// Source file to run
        file: PathBuf,

        /// Language (defaults to the file extension)
        #[arg(short, long)]
        language: Option<Language>,

        /// File fed to the program's stdin
        #[arg(long)]
        stdin: Option<PathBuf>,

        /// Wall-clock limit in milliseconds
        #[arg(short, long)]
        time_limit_ms: Option<u64>,

        /// Memory limit, e.g. 256m
        #[arg(short, long)]
        memory: Option<String>,
    },

    /// Verify this process can enforce the policy, then print it
    Check,

    /// Get daemon status
    Status {
        /// Socket path (defaults to CODERUN_SOCKET env var or /run/coderun/coderun.sock)
        #[arg(short, long)]
        socket: Option<PathBuf>,
    },

    /// Ping the daemon
    Ping {
        /// Socket path (defaults to CODERUN_SOCKET env var or /run/coderun/coderun.sock)
        #[arg(short, long)]
        socket: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("coderun=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Exec { payload_file } => {
            let policy = load_policy(cli.workspace_root.as_deref())?;
            exec(policy, payload_file.as_deref()).await
        }

        Commands::Run {
            file,
            language,
            stdin,
            time_limit_ms,
            memory,
        } => {
            let policy = load_policy(cli.workspace_root.as_deref())?;
            let language = match language {
                Some(language) => language,
                None => language_from_extension(&file)?,
            };
            let source = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;

            let mut submission = Submission::new(language, source);
            if let Some(path) = stdin {
                let input = std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                submission = submission.with_stdin(input);
            }
            if let Some(ms) = time_limit_ms {
                submission = submission.with_time_limit_ms(ms);
            }
            if let Some(size) = memory {
                submission = submission.with_memory_limit(parse_size(&size)?);
            }

            let runner = Runner::new(policy)?;
            let result = runner.run(&submission).await;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(exit_code(&result))
        }

        Commands::Check => {
            let policy = load_policy(cli.workspace_root.as_deref())?;
            let identity = policy.verify_process()?;
            tracing::info!(?identity, "process can enforce the policy");
            println!("{}", serde_json::to_string_pretty(&policy)?);
            Ok(ExitCode::SUCCESS)
        }

        Commands::Status { socket } => {
            let socket = socket.unwrap_or_else(default_socket_path);
            match call(&socket, &Request::Status).await? {
                Response::Status { total, idle, busy } => {
                    println!("workers: {total} total, {idle} idle, {busy} busy");
                    Ok(ExitCode::SUCCESS)
                }
                other => unexpected(&other),
            }
        }

        Commands::Ping { socket } => {
            let socket = socket.unwrap_or_else(default_socket_path);
            let start = Instant::now();
            match call(&socket, &Request::Ping).await? {
                Response::Pong => {
                    println!("pong from {} in {:?}", socket.display(), start.elapsed());
                    Ok(ExitCode::SUCCESS)
                }
                other => unexpected(&other),
            }
        }
    }
}

fn load_policy(workspace_root: Option<&Path>) -> Result<ConfinementPolicy> {
    let mut policy = ConfinementPolicy::from_env().context("invalid CODERUN_* configuration")?;
    if let Some(root) = workspace_root {
        policy.workspace_root = root.to_path_buf();
    }
    Ok(policy)
}

/// The backend contract: one JSON object on stdout, whatever happens
async fn exec(policy: ConfinementPolicy, payload_file: Option<&Path>) -> Result<ExitCode> {
    let started = Instant::now();

    let submission = match read_submission(payload_file) {
        Ok(submission) => submission,
        Err(e) => {
            tracing::error!(error = %e, "undecodable submission");
            eprintln!("coderun: {e:#}");
            return Ok(ExitCode::from(EXIT_BAD_PAYLOAD));
        }
    };

    let runner = match Runner::new(policy) {
        Ok(runner) => runner,
        Err(e) => {
            tracing::error!(error = %e, "runner refused to start");
            let result = ExecutionResult::internal(e.to_string(), started.elapsed());
            println!("{}", serde_json::to_string(&result.redacted())?);
            return Ok(ExitCode::from(EXIT_INTERNAL));
        }
    };

    if let Err(e) = workspace::sweep_stale(&runner.policy().workspace_root, STALE_WORKSPACE_AGE) {
        tracing::warn!(error = %e, "failed to sweep stale workspaces");
    }

    if submission.is_graded() {
        let report = runner.grade(&submission).await;
        println!("{}", serde_json::to_string(&report.redacted())?);
        Ok(if report.is_internal() {
            ExitCode::from(EXIT_INTERNAL)
        } else {
            ExitCode::SUCCESS
        })
    } else {
        let result = runner.run(&submission).await;
        println!("{}", serde_json::to_string(&result.redacted())?);
        Ok(exit_code(&result))
    }
}

fn read_submission(payload_file: Option<&Path>) -> Result<Submission> {
    if let Some(path) = payload_file {
        let raw = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        return Ok(protocol::decode_submission(&raw)?);
    }

    if let Ok(encoded) = std::env::var(PAYLOAD_ENV) {
        return Ok(protocol::decode_payload_env(&encoded)?);
    }

    let mut raw = Vec::new();
    std::io::stdin()
        .read_to_end(&mut raw)
        .context("failed to read submission from stdin")?;
    Ok(protocol::decode_submission(&raw)?)
}

fn language_from_extension(file: &Path) -> Result<Language> {
    let ext = file
        .extension()
        .and_then(|e| e.to_str())
        .with_context(|| format!("cannot infer language of {}; pass --language", file.display()))?;
    Ok(ext.parse()?)
}

fn exit_code(result: &ExecutionResult) -> ExitCode {
    if result.is_internal() {
        ExitCode::from(EXIT_INTERNAL)
    } else {
        ExitCode::SUCCESS
    }
}

async fn call(socket: &Path, request: &Request) -> Result<Response> {
    let mut stream = UnixStream::connect(socket)
        .await
        .with_context(|| format!("failed to connect to {}", socket.display()))?;
    protocol::write_frame(&mut stream, &protocol::encode(request)?).await?;
    let frame = protocol::read_frame(&mut stream)
        .await?
        .context("daemon closed the connection")?;
    Ok(protocol::decode(&frame)?)
}

fn unexpected(response: &Response) -> Result<ExitCode> {
    let shown: Value = serde_json::to_value(response)?;
    anyhow::bail!("unexpected response: {shown}")
}
