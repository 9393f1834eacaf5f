//! Executor: run external commands under a timeout as non-blocking
//! background tasks. The only component in the system that suspends.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Restricted `PATH` forced on every child process.
pub const CHILD_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

const CAPTURE_CHUNK: usize = 8 * 1024;

fn base_command(argv0: &str) -> Command {
    let mut cmd = Command::new(argv0);
    cmd.stdin(Stdio::null());
    cmd.env("PATH", CHILD_PATH);
    cmd.kill_on_drop(true);
    cmd
}

/// Run `argv` under `timeout_sec`, discarding output. Returns the exit
/// status for a clean exit, `128+signal` when signalled, or `-1` on timeout
/// (the child is killed).
pub async fn run_rc(timeout_sec: f64, argv0: &str, args: &[String]) -> i32 {
    let mut cmd = base_command(argv0);
    cmd.args(args);
    cmd.stdout(Stdio::null());
    cmd.stderr(Stdio::null());
    debug!(argv0, ?args, "Executor: run_rc");

    let child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            warn!(argv0, error = %e, "Executor: spawn failed");
            return -1;
        }
    };
    run_with_timeout(child, timeout_sec).await
}

async fn run_with_timeout(mut child: tokio::process::Child, timeout_sec: f64) -> i32 {
    match tokio::time::timeout(Duration::from_secs_f64(timeout_sec), child.wait()).await {
        Ok(Ok(status)) => status_to_rc(status),
        Ok(Err(e)) => {
            warn!(error = %e, "Executor: wait failed");
            -1
        }
        Err(_) => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            -1
        }
    }
}

#[cfg(unix)]
fn status_to_rc(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    if let Some(code) = status.code() {
        code
    } else if let Some(sig) = status.signal() {
        128 + sig
    } else {
        -1
    }
}

/// Result of a [`capture`] invocation.
#[derive(Debug, Clone)]
pub struct CaptureResult {
    /// Exit status, or `-1` on timeout.
    pub rc: i32,
    /// Merged stdout+stderr, bounded by 8 KiB back-pressured reads.
    pub out: String,
}

/// Run `argv` under `timeout_sec`, merging stdout+stderr into a single
/// buffer. On timeout, yields `{rc:-1, out:"TIMEOUT after <sec>s\n"}`.
pub async fn capture(timeout_sec: f64, argv0: &str, args: &[String]) -> CaptureResult {
    let mut cmd = base_command(argv0);
    cmd.args(args);
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    debug!(argv0, ?args, "Executor: capture");

    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            warn!(argv0, error = %e, "Executor: spawn failed");
            return CaptureResult {
                rc: -1,
                out: format!("spawn failed: {e}\n"),
            };
        }
    };

    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let read_fut = async {
        let mut out = Vec::new();
        let mut buf = [0u8; CAPTURE_CHUNK];
        loop {
            let mut progressed = false;
            if let Some(s) = stdout.as_mut() {
                if let Ok(n) = s.read(&mut buf).await {
                    if n > 0 {
                        out.extend_from_slice(&buf[..n]);
                        progressed = true;
                    } else {
                        stdout = None;
                    }
                }
            }
            if let Some(s) = stderr.as_mut() {
                if let Ok(n) = s.read(&mut buf).await {
                    if n > 0 {
                        out.extend_from_slice(&buf[..n]);
                        progressed = true;
                    } else {
                        stderr = None;
                    }
                }
            }
            if stdout.is_none() && stderr.is_none() {
                break;
            }
            if !progressed {
                tokio::task::yield_now().await;
            }
        }
        out
    };

    match tokio::time::timeout(Duration::from_secs_f64(timeout_sec), async {
        let out = read_fut.await;
        let status = child.wait().await;
        (out, status)
    })
    .await
    {
        Ok((out, Ok(status))) => CaptureResult {
            rc: status_to_rc(status),
            out: String::from_utf8_lossy(&out).into_owned(),
        },
        Ok((out, Err(e))) => {
            warn!(error = %e, "Executor: wait failed");
            CaptureResult {
                rc: -1,
                out: String::from_utf8_lossy(&out).into_owned(),
            }
        }
        Err(_) => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            CaptureResult {
                rc: -1,
                out: format!("TIMEOUT after {timeout_sec}s\n"),
            }
        }
    }
}
