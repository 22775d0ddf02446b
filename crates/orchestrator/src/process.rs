//! Child process supervision for agent runs.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::log_stream::{LogStream, StageLog};

/// How long to wait for output pumps after the child exits.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct AgentCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: PathBuf,
    /// Written to the child's stdin, which is then closed
    pub stdin: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        matches!(self, Self::Exited(status) if status.success())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub timeout: Duration,
    pub kill_grace: Duration,
}

enum Interrupt {
    Cancelled,
    TimedOut,
}

/// Spawn `cmd`, stream its output into `log`, and wait for it to finish.
///
/// Cancellation and timeout both terminate the child: graceful signal
/// first, forced kill once `kill_grace` elapses.
pub async fn run_supervised(
    cmd: AgentCommand,
    log: Arc<StageLog>,
    cancel: &CancellationToken,
    limits: Limits,
) -> std::io::Result<ProcessExit> {
    let mut command = Command::new(&cmd.program);
    command
        .args(&cmd.args)
        .envs(cmd.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .current_dir(&cmd.cwd)
        .stdin(if cmd.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    // own process group, so termination reaches everything the agent spawns
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command.spawn()?;
    debug!(program = %cmd.program, pid = ?child.id(), "Agent process spawned");

    if let (Some(input), Some(mut stdin)) = (cmd.stdin, child.stdin.take()) {
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(input.as_bytes()).await {
                // a child that never reads stdin is fine
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    debug!(error = %e, "Failed to write agent stdin");
                }
            }
            let _ = stdin.shutdown().await;
        });
    }

    let mut pumps = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        pumps.push(pump_lines(stdout, LogStream::Stdout, Arc::clone(&log)));
    }
    if let Some(stderr) = child.stderr.take() {
        pumps.push(pump_lines(stderr, LogStream::Stderr, Arc::clone(&log)));
    }

    let interrupt = tokio::select! {
        status = child.wait() => {
            let status = status?;
            drain(pumps).await;
            return Ok(ProcessExit::Exited(status));
        }
        _ = cancel.cancelled() => Interrupt::Cancelled,
        _ = tokio::time::sleep(limits.timeout) => Interrupt::TimedOut,
    };

    terminate(&mut child, limits.kill_grace).await;
    drain(pumps).await;

    Ok(match interrupt {
        Interrupt::Cancelled => ProcessExit::Cancelled,
        Interrupt::TimedOut => ProcessExit::TimedOut,
    })
}

fn pump_lines<R>(mut rd: R, stream: LogStream, log: Arc<StageLog>) -> JoinHandle<std::io::Result<u64>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; 16 * 1024];
        let mut total = 0u64;
        let mut line_buf: Vec<u8> = Vec::with_capacity(8 * 1024);

        loop {
            let n = rd.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            total += n as u64;

            line_buf.extend_from_slice(&buf[..n]);
            while let Some(pos) = line_buf.iter().position(|&b| b == b'\n') {
                let mut one = line_buf.drain(..=pos).collect::<Vec<u8>>();
                trim_newline(&mut one);
                log.push(stream, String::from_utf8_lossy(&one).into_owned());
            }
        }

        // last line without a trailing newline
        if !line_buf.is_empty() {
            trim_newline(&mut line_buf);
            if !line_buf.is_empty() {
                log.push(stream, String::from_utf8_lossy(&line_buf).into_owned());
            }
        }

        Ok(total)
    })
}

fn trim_newline(v: &mut Vec<u8>) {
    while matches!(v.last(), Some(b'\n') | Some(b'\r')) {
        v.pop();
    }
}

/// Wait for the output pumps concurrently; streams still held open by
/// stray descendants are abandoned after `DRAIN_TIMEOUT`.
async fn drain(pumps: Vec<JoinHandle<std::io::Result<u64>>>) {
    futures::future::join_all(pumps.into_iter().map(drain_one)).await;
}

async fn drain_one(pump: JoinHandle<std::io::Result<u64>>) {
    let abort = pump.abort_handle();
    match tokio::time::timeout(DRAIN_TIMEOUT, pump).await {
        Ok(Ok(Ok(bytes))) => debug!(bytes, "Output stream drained"),
        Ok(Ok(Err(e))) => warn!(error = %e, "Output stream read failed"),
        Ok(Err(e)) => warn!(error = %e, "Output pump task failed"),
        Err(_) => {
            warn!("Output stream still open after process exit, abandoning");
            abort.abort();
        }
    }
}

/// SIGTERM the agent's process group, then SIGKILL whatever is left once
/// `grace` elapses or the agent itself has exited.
async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            let group = Pid::from_raw(pid as i32);
            let mut exited = false;
            match killpg(group, Signal::SIGTERM) {
                Ok(()) => match tokio::time::timeout(grace, child.wait()).await {
                    Ok(Ok(status)) => {
                        debug!(pid, ?status, "Agent process exited after SIGTERM");
                        exited = true;
                    }
                    _ => warn!(pid, grace_ms = grace.as_millis() as u64, "Agent ignored SIGTERM, killing"),
                },
                Err(e) => debug!(pid, error = %e, "Failed to send SIGTERM"),
            }

            match killpg(group, Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => debug!(pid, error = %e, "Failed to kill agent process group"),
            }
            if exited {
                return;
            }
        }
    }

    #[cfg(not(unix))]
    let _ = grace;

    if let Err(e) = child.kill().await {
        debug!(error = %e, "Failed to kill agent process");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use formic_core::Stage;
    use uuid::Uuid;

    fn sh(script: &str) -> AgentCommand {
        AgentCommand {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env: Vec::new(),
            cwd: std::env::temp_dir(),
            stdin: None,
        }
    }

    fn limits() -> Limits {
        Limits {
            timeout: Duration::from_secs(10),
            kill_grace: Duration::from_millis(500),
        }
    }

    fn new_log() -> Arc<StageLog> {
        Arc::new(StageLog::new(Uuid::new_v4(), Stage::Brief))
    }

    #[tokio::test]
    async fn test_captures_both_streams() {
        let log = new_log();
        let exit = run_supervised(
            sh("echo out1; echo err1 >&2; printf 'partial'"),
            Arc::clone(&log),
            &CancellationToken::new(),
            limits(),
        )
        .await
        .unwrap();

        assert!(exit.success());
        let lines: Vec<String> = log.history().into_iter().map(|l| l.line).collect();
        assert!(lines.contains(&"out1".to_string()));
        assert!(lines.contains(&"err1".to_string()));
        assert!(lines.contains(&"partial".to_string()));
    }

    #[tokio::test]
    async fn test_nonzero_exit() {
        let exit = run_supervised(sh("exit 3"), new_log(), &CancellationToken::new(), limits())
            .await
            .unwrap();
        match exit {
            ProcessExit::Exited(status) => assert_eq!(status.code(), Some(3)),
            other => panic!("unexpected exit: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stdin_input() {
        let log = new_log();
        let mut cmd = sh("cat");
        cmd.stdin = Some("from stdin\n".to_string());

        let exit = run_supervised(cmd, Arc::clone(&log), &CancellationToken::new(), limits())
            .await
            .unwrap();
        assert!(exit.success());
        assert_eq!(log.contents(), "from stdin");
    }

    #[tokio::test]
    async fn test_cancel_terminates() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let exit = run_supervised(sh("exec sleep 30"), new_log(), &cancel, limits())
            .await
            .unwrap();

        assert_eq!(exit, ProcessExit::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_sigterm_ignored_escalates_to_kill() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let started = std::time::Instant::now();
        let exit = run_supervised(
            sh("trap '' TERM; exec sleep 30"),
            new_log(),
            &cancel,
            limits(),
        )
        .await
        .unwrap();

        assert_eq!(exit, ProcessExit::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    fn process_alive(pid: i32) -> bool {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        // a zombie still answers signal 0; treat it as gone
        let zombie = std::fs::read_to_string(format!("/proc/{}/stat", pid))
            .ok()
            .and_then(|stat| stat.rsplit(')').next().map(|rest| rest.trim_start().starts_with('Z')))
            .unwrap_or(false);
        kill(Pid::from_raw(pid), None).is_ok() && !zombie
    }

    #[tokio::test]
    async fn test_cancel_kills_descendants() {
        let log = new_log();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let watched = Arc::clone(&log);
        tokio::spawn(async move {
            while !watched.contents().contains("child ") {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let exit = run_supervised(
            sh("sleep 30 & echo \"child $!\"; wait"),
            Arc::clone(&log),
            &cancel,
            limits(),
        )
        .await
        .unwrap();

        assert_eq!(exit, ProcessExit::Cancelled);
        // the pipes closed with the group instead of waiting out the drain
        assert!(started.elapsed() < DRAIN_TIMEOUT);

        let pid: i32 = log
            .contents()
            .lines()
            .find_map(|l| l.strip_prefix("child "))
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while process_alive(pid) && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!process_alive(pid), "descendant {} survived cancellation", pid);
    }

    #[tokio::test]
    async fn test_timeout() {
        let exit = run_supervised(
            sh("exec sleep 30"),
            new_log(),
            &CancellationToken::new(),
            Limits {
                timeout: Duration::from_millis(200),
                kill_grace: Duration::from_millis(200),
            },
        )
        .await
        .unwrap();
        assert_eq!(exit, ProcessExit::TimedOut);
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let mut cmd = sh("true");
        cmd.program = "/nonexistent/formic-agent".to_string();
        let result = run_supervised(cmd, new_log(), &CancellationToken::new(), limits()).await;
        assert!(result.is_err());
    }
}
