//! Compiler driver backed by an external toolchain command.

use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Mutex;

use anyhow::{Context, Result};

use crucible_recipe::{CompileJob, CompileKind, Compiler};

use crate::cancel::CancelToken;
use crate::proc::{run_capped, DEFAULT_CAPTURE_CAP};

/// How a single toolchain invocation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecError {
    Timeout,
    Exit { code: i32 },
    Signal { signal: i32 },
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecError::Timeout => write!(f, "timed out"),
            ExecError::Exit { code } => write!(f, "exited with status {code}"),
            ExecError::Signal { signal } => write!(f, "killed by signal {signal}"),
        }
    }
}

impl std::error::Error for ExecError {}

/// Runs one compiler's argv for each compile job, appending diagnostics to a
/// per-compiler log file.
///
/// The recipe interpreter flattens driver errors into messages, so the
/// driver also keeps the last structured failure around for the caller to
/// classify after interpretation ends.
pub struct ExecCompiler {
    argv: Vec<String>,
    token: CancelToken,
    log_path: PathBuf,
    last_failure: Mutex<Option<ExecError>>,
}

impl ExecCompiler {
    pub fn new(argv: Vec<String>, token: CancelToken, log_path: PathBuf) -> Self {
        ExecCompiler {
            argv,
            token,
            log_path,
            last_failure: Mutex::new(None),
        }
    }

    /// Takes the failure recorded by the most recent invocation, if any.
    pub fn take_failure(&self) -> Option<ExecError> {
        self.last_failure.lock().ok().and_then(|mut slot| slot.take())
    }

    fn record_failure(&self, failure: ExecError) {
        if let Ok(mut slot) = self.last_failure.lock() {
            *slot = Some(failure);
        }
    }

    fn append_log(&self, cmd_line: &str, out: &[u8], err: &[u8]) -> Result<()> {
        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .with_context(|| format!("opening compile log {}", self.log_path.display()))?;
        writeln!(log, "$ {cmd_line}")?;
        log.write_all(out)?;
        log.write_all(err)?;
        Ok(())
    }
}

impl Compiler for ExecCompiler {
    fn run_compile(&self, job: &CompileJob<'_>) -> Result<()> {
        let (program, base_args) = self
            .argv
            .split_first()
            .context("compiler argv is empty")?;

        let mut cmd = Command::new(program);
        cmd.args(base_args);
        if job.kind == CompileKind::Obj {
            cmd.arg("-c");
        }
        cmd.arg("-o").arg(job.output);
        cmd.args(job.inputs);

        let cmd_line = format!("{cmd:?}");
        let out = run_capped(cmd, &self.token, DEFAULT_CAPTURE_CAP)
            .with_context(|| format!("running compiler {program}"))?;
        self.append_log(&cmd_line, &out.stdout, &out.stderr)?;

        if out.timed_out {
            self.record_failure(ExecError::Timeout);
            return Err(ExecError::Timeout.into());
        }
        if out.exit_code != 0 {
            let failure = match out.exit_signal {
                Some(signal) => ExecError::Signal { signal },
                None => ExecError::Exit { code: out.exit_code },
            };
            self.record_failure(failure);
            return Err(failure.into());
        }
        Ok(())
    }
}

/// Writes a stand-in compiler script that touches whatever `-o` names.
/// Shared by the stage tests.
#[cfg(test)]
pub(crate) fn fake_cc(dir: &std::path::Path) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("fake-cc.sh");
    let script = "#!/bin/sh\nwhile [ $# -gt 0 ]; do\n  if [ \"$1\" = -o ]; then shift; : > \"$1\"; fi\n  shift\ndone\n";
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}
