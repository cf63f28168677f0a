//! Invoking side of the machine phase: transports that deliver a plan to a
//! `crucible-mach` process (local or over SSH), coordinate its pipes, and
//! fold the results back into the local plan.

use std::process::Child;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crucible_mach::proc::kill_group;
use crucible_mach::{CancelToken, Observer};
use crucible_plan::{Plan, QuantitySet};

pub mod local;
pub mod merge;
pub mod pipes;
pub mod ssh;

pub use local::LocalRunner;
pub use ssh::{SshConfig, SshRunner};

const REAP_POLL: Duration = Duration::from_millis(10);

/// The three pipes of a started machine-phase process.
pub struct Pipeset {
    pub stdin: std::process::ChildStdin,
    pub stdout: std::process::ChildStdout,
    pub stderr: std::process::ChildStderr,
}

/// Shared handle to the machine-phase child, so the pipe coordinator can
/// kill it on cancellation while the owning runner waits on it.
#[derive(Clone, Default)]
pub struct ChildSlot(Arc<Mutex<Option<Child>>>);

impl ChildSlot {
    /// Stores a freshly spawned child and detaches its pipes. If any pipe
    /// is missing the child is killed, so a failed start leaves nothing
    /// running.
    pub fn adopt(&self, mut child: Child) -> Result<Pipeset> {
        let pipes = match take_pipes(&mut child) {
            Ok(pipes) => pipes,
            Err(err) => {
                kill_tree(&mut child);
                let _ = child.wait();
                return Err(err);
            }
        };
        let mut slot = self.lock()?;
        if slot.is_some() {
            kill_tree(&mut child);
            let _ = child.wait();
            bail!("a machine-phase process is already running");
        }
        *slot = Some(child);
        Ok(pipes)
    }

    /// Kills the child and its process group if one is running. Reaping
    /// stays with `wait`.
    pub fn kill(&self) {
        if let Ok(mut slot) = self.0.lock() {
            if let Some(child) = slot.as_mut() {
                kill_tree(child);
            }
        }
    }

    /// Waits for the child to exit, killing it if `token` is cancelled in
    /// the meantime. A nonzero exit is an error.
    pub fn wait(&self, token: &CancelToken) -> Result<()> {
        loop {
            {
                let mut slot = self.lock()?;
                let Some(child) = slot.as_mut() else {
                    bail!("no machine-phase process to wait for");
                };
                if let Some(status) = child.try_wait().context("polling machine phase")? {
                    *slot = None;
                    if !status.success() {
                        bail!("machine phase exited with {status}");
                    }
                    return Ok(());
                }
                if token.is_cancelled() {
                    kill_tree(child);
                    let status = child.wait().context("reaping machine phase")?;
                    *slot = None;
                    bail!("machine phase cancelled (exit {status})");
                }
            }
            std::thread::sleep(REAP_POLL);
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Option<Child>>> {
        self.0
            .lock()
            .map_err(|_| anyhow::anyhow!("child slot lock poisoned"))
    }
}

/// Kills the child's whole process group, not just the child: forked
/// grandchildren keep the pipe write ends open and would stall the pipe
/// coordinator until they exit on their own.
fn kill_tree(child: &mut Child) {
    kill_group(child.id());
    let _ = child.kill();
}

fn take_pipes(child: &mut Child) -> Result<Pipeset> {
    Ok(Pipeset {
        stdin: child.stdin.take().context("machine phase stdin missing")?,
        stdout: child.stdout.take().context("machine phase stdout missing")?,
        stderr: child.stderr.take().context("machine phase stderr missing")?,
    })
}

/// A transport for one machine-phase invocation.
///
/// Call order: `send`, `start`, pipe coordination, `wait`, `recv`, `close`.
/// [`invoke`] drives the full sequence.
pub trait Runner {
    /// Ships the plan's input files to the target and returns the plan as
    /// the target will see it (paths rebased for remote transports).
    fn send(&mut self, plan: Plan, observer: &dyn Observer) -> Result<Plan>;

    /// Starts the machine-phase process with the given quantity overrides
    /// and hands back its pipes.
    fn start(&mut self, overrides: &QuantitySet) -> Result<Pipeset>;

    /// Handle used to kill the started process on cancellation.
    fn child_slot(&self) -> ChildSlot;

    /// Reaps the started process; nonzero exit is an error.
    fn wait(&mut self, token: &CancelToken) -> Result<()>;

    /// Merges the remote result plan into the local one and retrieves the
    /// compile artifacts it names.
    fn recv(&mut self, local: Plan, remote: Plan, observer: &dyn Observer) -> Result<Plan>;

    /// Tears down any persistent connection. Safe to call when nothing was
    /// ever started.
    fn close(&mut self) -> Result<()>;
}

/// Runs one complete machine-phase invocation over `runner` and returns the
/// merged local plan. The connection is left open for reuse; callers close
/// the runner when done with it.
pub fn invoke(
    runner: &mut dyn Runner,
    plan: Plan,
    overrides: &QuantitySet,
    observer: &dyn Observer,
    token: &CancelToken,
) -> Result<Plan> {
    let local = plan.clone();
    let sent = runner.send(plan, observer)?;
    let pipes = runner.start(overrides)?;
    let slot = runner.child_slot();

    let coordinated = pipes::coordinate(pipes, &slot, &sent, &[observer], token);
    let waited = runner.wait(token);
    let remote = coordinated?;
    waited?;

    runner.recv(local, remote, observer)
}
