//! Local transport: run the machine phase as a child on this host.

use std::path::PathBuf;
use std::process::{Command, Stdio};

use anyhow::{Context, Result};

use crucible_mach::{CancelToken, Observer};
use crucible_plan::{Plan, QuantitySet};

use crate::merge::{merge_plans, record_digests};
use crate::{ChildSlot, Pipeset, Runner};

pub const MACH_BIN_NAME: &str = "crucible-mach";

/// Finds the machine-phase binary: a sibling of the current executable if
/// one exists, otherwise whatever `PATH` resolves.
pub fn resolve_mach_bin() -> PathBuf {
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let sibling = dir.join(MACH_BIN_NAME);
            if sibling.exists() {
                return sibling;
            }
        }
    }
    PathBuf::from(MACH_BIN_NAME)
}

/// Command-line quantity overrides, only the non-zero ones.
pub(crate) fn quantity_args(overrides: &QuantitySet) -> Vec<String> {
    let mut args = Vec::new();
    let mut push = |flag: &str, value: u64| {
        if value != 0 {
            args.push(format!("--{flag}"));
            args.push(value.to_string());
        }
    };
    push("compile-workers", overrides.compile.workers as u64);
    push("compile-timeout-ms", overrides.compile.timeout_ms);
    push("run-workers", overrides.run.workers as u64);
    push("run-timeout-ms", overrides.run.timeout_ms);
    args
}

/// Runs the machine phase on this host. Files are already where the plan
/// says they are, so `send` and retrieval are identity steps; only the
/// digests of the produced artifacts are filled in on `recv`.
pub struct LocalRunner {
    mach_bin: PathBuf,
    out_dir: PathBuf,
    child: ChildSlot,
}

impl LocalRunner {
    /// `out_dir` must live under the plan's run root, or the merge step
    /// will reject the artifact paths the machine phase records.
    pub fn new(out_dir: PathBuf) -> Self {
        Self::with_binary(resolve_mach_bin(), out_dir)
    }

    pub fn with_binary(mach_bin: PathBuf, out_dir: PathBuf) -> Self {
        LocalRunner {
            mach_bin,
            out_dir,
            child: ChildSlot::default(),
        }
    }
}

impl Runner for LocalRunner {
    fn send(&mut self, plan: Plan, _observer: &dyn Observer) -> Result<Plan> {
        Ok(plan)
    }

    fn start(&mut self, overrides: &QuantitySet) -> Result<Pipeset> {
        let mut cmd = Command::new(&self.mach_bin);
        cmd.arg("--out-dir")
            .arg(&self.out_dir)
            .args(quantity_args(overrides))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        crucible_mach::proc::isolate_group(&mut cmd);
        let child = cmd
            .spawn()
            .with_context(|| format!("spawning {}", self.mach_bin.display()))?;
        self.child.adopt(child)
    }

    fn child_slot(&self) -> ChildSlot {
        self.child.clone()
    }

    fn wait(&mut self, token: &CancelToken) -> Result<()> {
        self.child.wait(token)
    }

    fn recv(&mut self, local: Plan, remote: Plan, _observer: &dyn Observer) -> Result<Plan> {
        let mut merged = merge_plans(local, remote)?;
        record_digests(&mut merged)?;
        Ok(merged)
    }

    fn close(&mut self) -> Result<()> {
        self.child.kill();
        Ok(())
    }
}
