//! Pipe coordination for a running machine-phase process.
//!
//! Three jobs run concurrently: write the plan to the child's stdin, read
//! the result plan from its stdout, and replay progress events from its
//! stderr. The first failure cancels an invocation-scoped child of the
//! caller's token; a watchdog kills the child process so the blocked pipe
//! readers unwind instead of hanging.

use std::io::BufReader;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};

use crucible_mach::event::replay;
use crucible_mach::stdio::{read_plan, write_plan_gz};
use crucible_mach::{CancelToken, Observer};
use crucible_plan::Plan;

use crate::{ChildSlot, Pipeset};

const WATCHDOG_POLL: Duration = Duration::from_millis(20);

/// Drives all three pipes to completion and returns the result plan the
/// child wrote. Does not reap the child; callers `wait` afterwards.
pub fn coordinate(
    pipes: Pipeset,
    child: &ChildSlot,
    plan: &Plan,
    observers: &[&dyn Observer],
    token: &CancelToken,
) -> Result<Plan> {
    let Pipeset {
        mut stdin,
        stdout,
        stderr,
    } = pipes;

    // Failures cancel a token scoped to this invocation; the caller's token
    // may be shared with other invocations and still propagates down.
    let token = token.child_with_timeout(Duration::ZERO);
    let token = &token;

    let first_err: Mutex<Option<anyhow::Error>> = Mutex::new(None);
    let record = |err: anyhow::Error| {
        token.cancel();
        if let Ok(mut slot) = first_err.lock() {
            if slot.is_none() {
                *slot = Some(err);
            }
        }
    };

    let done = AtomicBool::new(false);
    let mut result = None;
    std::thread::scope(|scope| {
        scope.spawn(|| {
            while !done.load(Ordering::SeqCst) {
                if token.is_cancelled() {
                    child.kill();
                    return;
                }
                std::thread::sleep(WATCHDOG_POLL);
            }
        });

        let writer = scope.spawn(|| {
            // Dropping stdin closes the pipe; the child reads to EOF.
            if let Err(err) = write_plan_gz(&mut stdin, plan) {
                record(err.context("sending plan"));
            }
            drop(stdin);
        });
        let reader = scope.spawn(|| match read_plan(BufReader::new(stdout)) {
            Ok(plan) => Some(plan),
            Err(err) => {
                record(err.context("receiving result plan"));
                None
            }
        });
        let replayer = scope.spawn(|| {
            if let Err(err) = replay(BufReader::new(stderr), observers) {
                record(err.context("replaying events"));
            }
        });

        if writer.join().is_err() {
            record(anyhow::anyhow!("plan writer panicked"));
        }
        match reader.join() {
            Ok(plan) => result = plan,
            Err(_) => record(anyhow::anyhow!("plan reader panicked")),
        }
        if replayer.join().is_err() {
            record(anyhow::anyhow!("event replayer panicked"));
        }
        done.store(true, Ordering::SeqCst);
    });

    if let Ok(mut slot) = first_err.lock() {
        if let Some(err) = slot.take() {
            // A deadline expiry is the real story; the pipe errors it
            // provokes are noise.
            if token.deadline_exceeded() {
                return Err(err.context("deadline exceeded"));
            }
            return Err(err);
        }
    }
    result.context("machine phase produced no result plan")
}
