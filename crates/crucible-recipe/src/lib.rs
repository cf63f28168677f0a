//! Build recipes and the stack machine that executes them.
//!
//! A recipe is the architecture-independent description of how one test
//! subject is built: an ordered instruction list over a pool of declared
//! input files. The interpreter in [`interp`] turns it into concrete
//! compiler invocations through the [`Compiler`] seam.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

mod interp;

pub use interp::{InterpError, InterpErrorKind, Interpreter};

/// Rough classification of a file by name, used by `PushInputs` filters and
/// by result-file retrieval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FileKind {
    CSource,
    Header,
    Object,
    Binary,
    Log,
    Other,
}

impl FileKind {
    pub fn guess(name: &str) -> FileKind {
        match Path::new(name).extension().and_then(|e| e.to_str()) {
            Some("c") => FileKind::CSource,
            Some("h") => FileKind::Header,
            Some("o") => FileKind::Object,
            Some("log") => FileKind::Log,
            Some(_) => FileKind::Other,
            None => FileKind::Binary,
        }
    }

    pub fn is_source(&self) -> bool {
        matches!(self, FileKind::CSource | FileKind::Header)
    }
}

/// One operation in a recipe.
///
/// `npop <= 0` on the compile instructions means "consume the whole stack".
/// The `Unknown` variant absorbs operations from a newer schema; the
/// interpreter rejects it with `BadOp` instead of failing the whole decode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum Instruction {
    Nop,
    PushInput { file: String },
    PushInputs { kind: FileKind },
    CompileObj { npop: i64 },
    CompileExe { npop: i64 },
    #[serde(other)]
    Unknown,
}

/// An ordered build recipe for one subject/architecture pair. Immutable
/// once produced by the lifting stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipe {
    /// Working directory holding the declared inputs; object files are
    /// allocated here unless the caller overrides the object directory.
    pub dir: PathBuf,
    /// Declared input file names, relative to `dir`.
    pub inputs: Vec<String>,
    /// Output binary name, relative to `dir` unless absolute.
    pub output: PathBuf,
    pub instructions: Vec<Instruction>,
}

impl Recipe {
    pub fn output_path(&self) -> PathBuf {
        if self.output.is_absolute() {
            self.output.clone()
        } else {
            self.dir.join(&self.output)
        }
    }

    pub fn input_paths(&self) -> impl Iterator<Item = PathBuf> + '_ {
        self.inputs.iter().map(|n| self.dir.join(n))
    }
}

/// Whether a single driver invocation produces an object or a binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileKind {
    Obj,
    Exe,
}

/// One fully resolved compile job handed to a driver.
#[derive(Debug)]
pub struct CompileJob<'a> {
    pub kind: CompileKind,
    pub inputs: &'a [PathBuf],
    pub output: &'a Path,
}

/// Capability: run one compile command against named inputs, producing one
/// output file. Implementations own their timeout/cancellation scoping.
pub trait Compiler {
    fn run_compile(&self, job: &CompileJob<'_>) -> anyhow::Result<()>;
}

/// Cooperative cancellation as seen by the interpreter. The concrete token
/// lives with the batch executor.
pub trait Cancellation {
    fn is_cancelled(&self) -> bool;
}

/// A no-op cancellation source for callers without one.
pub struct NeverCancelled;

impl Cancellation for NeverCancelled {
    fn is_cancelled(&self) -> bool {
        false
    }
}
