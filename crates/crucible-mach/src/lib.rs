//! Machine-dependent phase of the testing harness: compile every subject
//! with every configured compiler, run the binaries under the backend, and
//! record per-subject outcomes back into the plan.
//!
//! The `crucible-mach` binary speaks the pipe protocol: one plan document on
//! stdin, the result plan on stdout, progress events as JSON lines on
//! stderr. The invoking side (local or SSH) is in `crucible-runner`.

use std::path::PathBuf;

use anyhow::Result;

use crucible_plan::{Plan, QuantitySet, Stage};

pub mod cancel;
pub mod compile_stage;
pub mod compiler;
pub mod event;
pub mod executor;
pub mod proc;
pub mod run_stage;
pub mod stdio;

pub use cancel::CancelToken;
pub use event::{Event, EventWriter, NullObserver, Observer};

/// Everything the machine phase needs besides the plan itself.
pub struct MachConfig {
    /// Directory compile artifacts are created under.
    pub out_dir: PathBuf,
    /// Fully resolved worker counts and timeouts.
    pub quantities: QuantitySet,
}

/// Runs the compile and run stages over `plan` and returns the plan with
/// results folded in, stage history stamped, and the resolved quantities
/// recorded for the retrieving side.
pub fn run_phase(
    mut plan: Plan,
    config: &MachConfig,
    token: &CancelToken,
    observer: &dyn Observer,
) -> Result<Plan> {
    plan.quantities = config.quantities;

    plan.corpus = compile_stage::run_compile_stage(
        &plan,
        &config.out_dir,
        &config.quantities.compile,
        token,
        observer,
    )?;
    plan.stamp_stage(Stage::Compile);

    plan.corpus = run_stage::run_run_stage(&plan, &config.quantities.run, token, observer)?;
    plan.stamp_stage(Stage::Run);

    Ok(plan)
}
