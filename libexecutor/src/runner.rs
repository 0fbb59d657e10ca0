use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use log::debug;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::time::{Duration, Instant, sleep};
use tokio_util::sync::CancellationToken;

use crate::context::WorkerContext;
use crate::handle::ExecutionResult;
use crate::logsink::LogSink;

/// Workers report their return value as a single stdout line prefixed with
/// this marker.
pub const RESULT_MARKER: &str = "::stark-result::";

pub struct SubprocessSpec {
    pub command: String,
    pub bundle_path: PathBuf,
    pub context: WorkerContext,
    pub args: serde_json::Value,
    pub max_memory_mb: Option<u64>,
}

enum Outcome {
    Exited(std::process::ExitStatus),
    Cancelled,
    TimedOut,
}

/// Run a bundle in an isolated subprocess. Only the bundle file, the
/// serializable context and the args cross the boundary (as env vars).
pub async fn run_subprocess(
    spec: SubprocessSpec,
    sink: Arc<LogSink>,
    cancel: CancellationToken,
    kill: CancellationToken,
) -> ExecutionResult {
    let started = Instant::now();
    let duration_ms = |started: Instant| started.elapsed().as_millis() as u64;

    let context_json = match serde_json::to_string(&spec.context) {
        Ok(json) => json,
        Err(e) => {
            return ExecutionResult::failed(format!("context not serializable: {e}"), 1, 0);
        }
    };
    let args_json = spec.args.to_string();

    let mut command = Command::new(&spec.command);
    if spec.command == "node"
        && let Some(mb) = spec.max_memory_mb
    {
        command.arg(format!("--max-old-space-size={mb}"));
    }
    command
        .arg(&spec.bundle_path)
        .env_clear()
        .envs(&spec.context.env)
        .env("STARK_CONTEXT", context_json)
        .env("STARK_ARGS", args_json)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            return ExecutionResult::failed(
                format!("failed to spawn {}: {e}", spec.command),
                1,
                duration_ms(started),
            );
        }
    };

    let return_value: Arc<Mutex<Option<serde_json::Value>>> = Arc::new(Mutex::new(None));
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(spawn_stdout_reader(stdout, sink.clone(), return_value.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(spawn_stream_reader(stderr, sink.clone(), "stderr"));
    }

    let timeout_ms = spec.context.timeout_ms;
    let deadline = async move {
        if timeout_ms > 0 {
            sleep(Duration::from_millis(timeout_ms)).await;
        } else {
            std::future::pending::<()>().await;
        }
    };

    let outcome = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => Outcome::Exited(status),
            Err(e) => {
                return ExecutionResult::failed(
                    format!("waiting on worker failed: {e}"),
                    1,
                    duration_ms(started),
                );
            }
        },
        _ = kill.cancelled() => Outcome::Cancelled,
        _ = cancel.cancelled() => Outcome::Cancelled,
        _ = deadline => Outcome::TimedOut,
    };

    if !matches!(outcome, Outcome::Exited(_)) {
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
    for reader in readers {
        let _ = reader.await;
    }

    match outcome {
        Outcome::Exited(status) => {
            let code = status.code().unwrap_or(1);
            debug!("worker for {} exited with {code}", spec.context.pod_id);
            if code == 0 {
                let value = return_value.lock().unwrap().take();
                ExecutionResult::succeeded(value, duration_ms(started))
            } else {
                ExecutionResult::failed(
                    format!("worker exited with code {code}"),
                    code,
                    duration_ms(started),
                )
            }
        }
        Outcome::Cancelled => ExecutionResult::cancelled(duration_ms(started)),
        Outcome::TimedOut => ExecutionResult::failed(
            format!("execution exceeded {timeout_ms}ms"),
            1,
            duration_ms(started),
        ),
    }
}

fn spawn_stdout_reader(
    stream: impl AsyncRead + Unpin + Send + 'static,
    sink: Arc<LogSink>,
    return_value: Arc<Mutex<Option<serde_json::Value>>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(payload) = line.strip_prefix(RESULT_MARKER) {
                match serde_json::from_str(payload) {
                    Ok(value) => *return_value.lock().unwrap() = Some(value),
                    Err(e) => sink.line("stdout", &format!("bad result payload: {e}")),
                }
            } else {
                sink.line("stdout", &line);
            }
        }
    })
}

fn spawn_stream_reader(
    stream: impl AsyncRead + Unpin + Send + 'static,
    sink: Arc<LogSink>,
    name: &'static str,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            sink.line(name, &line);
        }
    })
}
