//! Child processes fed a payload on stdin, with a deadline and bounded capture.
//!
//! Command tools and the command proposer both speak the same shape: JSON in
//! on stdin, text out on stdout, a non-zero exit with stderr on failure. This
//! module owns that exchange and reports it as a [`ChildExit`].

use std::io::{self, Read, Write};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::thread::{self, ScopedJoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// How a child run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildExit {
    /// Exit status zero. Stdout is lossily decoded and ends with a
    /// `[truncated N bytes]` marker when the limit dropped bytes.
    Success(String),
    /// Non-zero exit, or killed by a signal (`code` is `None`).
    Failed { code: Option<i32>, stderr: String },
    /// Still running at the deadline, so it was killed.
    TimedOut,
}

impl ChildExit {
    /// `exit status 3: <stderr>` style summary for a failed run.
    pub fn failure_cause(code: Option<i32>, stderr: &str) -> String {
        let status = code.map_or_else(|| "killed by signal".to_string(), |code| format!("exit status {code}"));
        if stderr.is_empty() {
            status
        } else {
            format!("{status}: {stderr}")
        }
    }
}

/// Spawn `argv`, write `stdin`, and wait at most `timeout`.
///
/// Stdin is written and both output pipes are drained on scoped threads while
/// the child runs, so neither side can stall on a full pipe. At most
/// `output_limit_bytes` of each stream is kept; the rest is read and dropped.
#[instrument(skip_all, fields(program = argv.first().map(String::as_str), timeout_ms = timeout.as_millis() as u64))]
pub fn run_child(
    argv: &[String],
    stdin: &[u8],
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<ChildExit> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow!("command must be a non-empty array"))?;
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("spawn '{program}'"))?;
    debug!(pid = child.id(), "child spawned");

    let pipe_in = child.stdin.take().ok_or_else(|| anyhow!("stdin was not piped"))?;
    let pipe_out = child.stdout.take().ok_or_else(|| anyhow!("stdout was not piped"))?;
    let pipe_err = child.stderr.take().ok_or_else(|| anyhow!("stderr was not piped"))?;

    thread::scope(|scope| -> Result<ChildExit> {
        let writer = scope.spawn(move || feed(pipe_in, stdin));
        let out = scope.spawn(move || drain(pipe_out, output_limit_bytes));
        let err = scope.spawn(move || drain(pipe_err, output_limit_bytes));

        let status = wait_or_kill(&mut child, timeout)?;
        joined(writer, "stdin writer")?.context("write stdin")?;
        let (stdout, dropped) = joined(out, "stdout reader")?.context("read stdout")?;
        let (stderr, _) = joined(err, "stderr reader")?.context("read stderr")?;

        let Some(status) = status else {
            warn!(timeout_ms = timeout.as_millis() as u64, "child timed out, killed");
            return Ok(ChildExit::TimedOut);
        };
        debug!(code = ?status.code(), stdout_bytes = stdout.len(), dropped, "child finished");
        if !status.success() {
            return Ok(ChildExit::Failed {
                code: status.code(),
                stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
            });
        }
        let mut text = String::from_utf8_lossy(&stdout).into_owned();
        if dropped > 0 {
            warn!(dropped, "child output truncated");
            text.push_str(&format!("\n[truncated {dropped} bytes]"));
        }
        Ok(ChildExit::Success(text))
    })
}

/// `None` when the deadline passed and the child was killed.
fn wait_or_kill(child: &mut Child, timeout: Duration) -> Result<Option<ExitStatus>> {
    let waited = child.wait_timeout(timeout);
    match waited {
        Ok(Some(status)) => Ok(Some(status)),
        Ok(None) => {
            child.kill().context("kill child")?;
            child.wait().context("reap child")?;
            Ok(None)
        }
        Err(err) => {
            // Readers only finish once the child is gone.
            let _ = child.kill();
            Err(err).context("wait for child")
        }
    }
}

/// A child that exits without reading its input is not an error.
fn feed(mut pipe: ChildStdin, input: &[u8]) -> io::Result<()> {
    match pipe.write_all(input) {
        Err(err) if err.kind() == io::ErrorKind::BrokenPipe => Ok(()),
        other => other,
    }
}

/// Keep up to `limit` bytes and count what was dropped after that.
fn drain<R: Read>(mut pipe: R, limit: usize) -> io::Result<(Vec<u8>, u64)> {
    let mut kept = Vec::new();
    (&mut pipe).take(limit as u64).read_to_end(&mut kept)?;
    let dropped = io::copy(&mut pipe, &mut io::sink())?;
    Ok((kept, dropped))
}

fn joined<T>(handle: ScopedJoinHandle<'_, T>, name: &str) -> Result<T> {
    handle.join().map_err(|_| anyhow!("{name} thread panicked"))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[test]
    fn echoes_stdin() {
        let exit = run_child(&sh("cat"), b"hello", Duration::from_secs(5), 1024).expect("run");
        assert_eq!(exit, ChildExit::Success("hello".to_string()));
    }

    #[test]
    fn marks_truncated_output() {
        let exit =
            run_child(&sh("printf 0123456789"), b"", Duration::from_secs(5), 4).expect("run");
        assert_eq!(exit, ChildExit::Success("0123\n[truncated 6 bytes]".to_string()));
    }

    #[test]
    fn chatty_child_ignoring_stdin_does_not_stall() {
        let payload = vec![b'x'; 256 * 1024];
        let exit = run_child(
            &sh("head -c 262144 /dev/zero | tr '\\0' y"),
            &payload,
            Duration::from_secs(5),
            8,
        )
        .expect("run");
        assert_eq!(
            exit,
            ChildExit::Success(format!("yyyyyyyy\n[truncated {} bytes]", 262_144 - 8))
        );
    }

    #[test]
    fn failure_keeps_code_and_stderr() {
        let exit = run_child(&sh("echo nope >&2; exit 3"), b"", Duration::from_secs(5), 1024)
            .expect("run");
        assert_eq!(
            exit,
            ChildExit::Failed {
                code: Some(3),
                stderr: "nope".to_string()
            }
        );
        assert_eq!(ChildExit::failure_cause(Some(3), "nope"), "exit status 3: nope");
        assert_eq!(ChildExit::failure_cause(None, ""), "killed by signal");
    }

    #[test]
    fn kills_on_timeout() {
        let exit = run_child(&sh("sleep 5"), b"", Duration::from_millis(100), 1024).expect("run");
        assert_eq!(exit, ChildExit::TimedOut);
    }

    #[test]
    fn empty_argv_is_rejected() {
        assert!(run_child(&[], b"", Duration::from_secs(1), 1024).is_err());
    }
}
