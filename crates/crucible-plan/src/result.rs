use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crucible_recipe::FileKind;

/// Final classification of one compile or run job. Expected domain
/// outcomes (compile failure, timeout) live here, never as batch errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Status {
    Ok,
    /// The observation flagged the subject (e.g. a witnessed bad state).
    Flagged,
    CompileFail,
    RunFail,
    Timeout,
    Unknown,
}

impl Status {
    pub fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }
}

/// Where a recorded file came from; retrieval only pulls compile products.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FileOrigin {
    Input,
    Compile,
}

/// One file the machine phase knows about, with enough metadata to decide
/// whether the orchestrator side needs to fetch it back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: PathBuf,
    pub kind: FileKind,
    pub origin: FileOrigin,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileResult {
    pub status: Status,
    pub start_unix_ms: u64,
    pub duration_ms: u64,
    #[serde(default)]
    pub files: Vec<FileRecord>,
    /// Tail of the combined compiler output, base64 as in every other
    /// byte-carrying field of the wire format.
    #[serde(default)]
    pub stderr_b64: String,
}

impl CompileResult {
    pub fn set_stderr(&mut self, bytes: &[u8]) {
        self.stderr_b64 = base64::engine::general_purpose::STANDARD.encode(bytes);
    }

    pub fn stderr_bytes(&self) -> Result<Vec<u8>> {
        base64::engine::general_purpose::STANDARD
            .decode(&self.stderr_b64)
            .context("decode stderr_b64")
    }

    /// The compiled binary, if this compile produced one.
    pub fn bin(&self) -> Option<&FileRecord> {
        self.files
            .iter()
            .find(|f| f.origin == FileOrigin::Compile && f.kind == FileKind::Binary)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    pub status: Status,
    pub start_unix_ms: u64,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observation: Option<Observation>,
    /// Human-readable failure cause when status is not ok.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    #[serde(default)]
    pub stderr_b64: String,
}

impl RunResult {
    pub fn set_stderr(&mut self, bytes: &[u8]) {
        self.stderr_b64 = base64::engine::general_purpose::STANDARD.encode(bytes);
    }
}

/// Structured description of a test binary's final program states, parsed
/// from the subject's stdout by the backend contract.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Observation {
    pub flags: Vec<String>,
    pub states: Vec<ObsState>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObsState {
    pub tag: String,
    pub occurrences: u64,
    pub values: BTreeMap<String, String>,
}

impl Observation {
    /// Whether the observation carries a state the harness must surface:
    /// either an explicit flag or a counter-example state.
    pub fn flagged(&self) -> bool {
        self.flags.iter().any(|f| f == "undef" || f == "flagged")
            || self.states.iter().any(|s| s.tag == "counter")
    }
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().try_into().unwrap_or(u64::MAX))
        .unwrap_or(0)
}
