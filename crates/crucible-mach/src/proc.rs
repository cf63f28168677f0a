//! Subprocess execution with capped capture and deadline polling.

use std::io::Read;
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::cancel::CancelToken;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Default capture cap per stream. Enough to keep a useful tail of compiler
/// or runtime diagnostics without letting a chatty subject exhaust memory.
pub const DEFAULT_CAPTURE_CAP: usize = 1 << 20;

#[derive(Debug)]
pub struct ExecOutput {
    pub exit_code: i32,
    /// Set when the child died on a signal; `exit_code` is then 128+signal.
    pub exit_signal: Option<i32>,
    pub timed_out: bool,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }
}

/// Reads at most `cap` bytes, then drains the rest so the writer does not
/// block on a full pipe. Returns the captured prefix and a truncation flag.
pub fn read_capped<R: Read>(mut reader: R, cap: usize) -> std::io::Result<(Vec<u8>, bool)> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    let mut truncated = false;
    loop {
        let n = reader.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        if buf.len() < cap {
            let take = n.min(cap - buf.len());
            buf.extend_from_slice(&chunk[..take]);
            if take < n {
                truncated = true;
            }
        } else {
            truncated = true;
        }
    }
    Ok((buf, truncated))
}

/// Puts the child in its own process group, so a kill can take the whole
/// tree down. Compilers and subjects fork freely; a forked grandchild keeps
/// the pipe write ends open and would otherwise stall the capture pumps
/// long after the direct child is dead.
pub fn isolate_group(cmd: &mut Command) {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt as _;
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 && libc::setpgid(0, 0) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }
    #[cfg(not(unix))]
    {
        let _ = cmd;
    }
}

/// Hard-kills `pid` and its process group. Best effort; the pid may have
/// already been reaped.
pub fn kill_group(pid: u32) {
    #[cfg(unix)]
    {
        let Ok(pid) = i32::try_from(pid) else {
            return;
        };
        unsafe {
            let _ = libc::kill(-pid, libc::SIGKILL);
            let _ = libc::kill(pid, libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
    }
}

fn exit_parts(status: std::process::ExitStatus) -> (i32, Option<i32>) {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return (128 + sig, Some(sig));
        }
    }
    (status.code().unwrap_or(1), None)
}

/// Runs `cmd` to completion under `token`, capturing stdout and stderr with
/// a per-stream byte cap.
///
/// Deadline expiry kills the child and reports `timed_out`; an explicit
/// cancel kills the child and returns an error, since the caller is tearing
/// the batch down and the output no longer matters.
pub fn run_capped(mut cmd: Command, token: &CancelToken, cap: usize) -> Result<ExecOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    isolate_group(&mut cmd);
    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawning {:?}", cmd.get_program()))?;

    let stdout = child.stdout.take().context("child stdout missing")?;
    let stderr = child.stderr.take().context("child stderr missing")?;
    let out_pump = std::thread::spawn(move || read_capped(stdout, cap));
    let err_pump = std::thread::spawn(move || read_capped(stderr, cap));

    let mut timed_out = false;
    let status = loop {
        if let Some(status) = child.try_wait().context("polling child")? {
            break status;
        }
        if token.is_cancelled() {
            kill_group(child.id());
            let _ = child.kill();
            let status = child.wait().context("reaping killed child")?;
            if token.deadline_exceeded() {
                timed_out = true;
                break status;
            }
            bail!("cancelled while child was running");
        }
        std::thread::sleep(POLL_INTERVAL);
    };

    let (stdout, stdout_truncated) = out_pump
        .join()
        .map_err(|_| anyhow::anyhow!("stdout pump panicked"))?
        .context("capturing child stdout")?;
    let (stderr, stderr_truncated) = err_pump
        .join()
        .map_err(|_| anyhow::anyhow!("stderr pump panicked"))?
        .context("capturing child stderr")?;

    let (exit_code, exit_signal) = exit_parts(status);
    Ok(ExecOutput {
        exit_code,
        exit_signal,
        timed_out,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_stdout_and_exit_code() {
        let token = CancelToken::new();
        let out = run_capped(sh("printf hello; exit 3"), &token, DEFAULT_CAPTURE_CAP).unwrap();
        assert_eq!(out.stdout, b"hello");
        assert_eq!(out.exit_code, 3);
        assert!(!out.timed_out);
        assert!(!out.stdout_truncated);
    }

    #[test]
    fn caps_runaway_output() {
        let token = CancelToken::new();
        let out = run_capped(sh("yes x | head -c 100000"), &token, 1024).unwrap();
        assert_eq!(out.stdout.len(), 1024);
        assert!(out.stdout_truncated);
    }

    #[test]
    fn deadline_expiry_kills_and_flags_timeout() {
        let token = CancelToken::new().child_with_timeout(Duration::from_millis(50));
        let out = run_capped(sh("sleep 5"), &token, DEFAULT_CAPTURE_CAP).unwrap();
        assert!(out.timed_out);
    }

    #[test]
    fn explicit_cancel_is_an_error() {
        let token = CancelToken::new();
        token.cancel();
        assert!(run_capped(sh("sleep 5"), &token, DEFAULT_CAPTURE_CAP).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn deadline_kill_reaches_forked_grandchildren() {
        // The backgrounded sleep is a separate process holding the pipe
        // write ends; only a group kill frees the capture pumps.
        let token = CancelToken::new().child_with_timeout(Duration::from_millis(100));
        let start = std::time::Instant::now();
        let out = run_capped(sh("sleep 30 & wait"), &token, DEFAULT_CAPTURE_CAP).unwrap();
        assert!(out.timed_out);
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[test]
    fn signal_death_maps_to_128_plus_signal() {
        let token = CancelToken::new();
        let out = run_capped(sh("kill -KILL $$"), &token, DEFAULT_CAPTURE_CAP).unwrap();
        assert_eq!(out.exit_signal, Some(9));
        assert_eq!(out.exit_code, 137);
    }
}
