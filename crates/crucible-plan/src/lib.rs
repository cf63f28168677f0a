//! Shared, version-pinned data model for the machine-invocation phase.
//!
//! These constants are the single source of truth for schema/version strings
//! that appear in machine-readable I/O. A plan or event stream carrying a
//! different major schema is rejected at the decode boundary.

pub const PLAN_SCHEMA_VERSION: &str = "crucible.plan@0.2.0";
pub const EVENT_SCHEMA_VERSION: &str = "crucible.event@0.1.0";
pub const OBSERVATION_SCHEMA_VERSION: &str = "crucible.observation@0.1.0";

mod corpus;
mod plan;
mod quantity;
mod result;
mod stage;

pub use corpus::{Compilation, Corpus, Subject};
pub use plan::{Backend, Compiler, Machine, Metadata, Plan, StageRecord};
pub use quantity::{BatchQuantities, QuantitySet};
pub use result::{
    now_unix_ms, CompileResult, FileOrigin, FileRecord, ObsState, Observation, RunResult, Status,
};
pub use stage::Stage;

/// Checks that `got` names the same schema at the same major version as
/// `want` (both shaped `name@major.minor.patch`).
pub fn schema_compatible(want: &str, got: &str) -> bool {
    let split = |s: &str| -> Option<(String, String)> {
        let (name, ver) = s.split_once('@')?;
        let major = ver.split('.').next()?;
        Some((name.to_string(), major.to_string()))
    };
    match (split(want), split(got)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}
