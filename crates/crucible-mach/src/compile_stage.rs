//! Compile stage: every subject against every configured compiler.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crucible_plan::{
    now_unix_ms, BatchQuantities, CompileResult, Corpus, FileOrigin, FileRecord, Plan, Stage,
    Status, Subject,
};
use crucible_recipe::{FileKind, InterpErrorKind, Interpreter, Recipe};

use crate::cancel::CancelToken;
use crate::compiler::{ExecCompiler, ExecError};
use crate::event::Observer;
use crate::executor::{run_batch, Request, Update};

const BINARY_NAME: &str = "a.out";
const LOG_NAME: &str = "compile.log";
const STDERR_TAIL_CAP: usize = 16 << 10;

/// Compiles `plan`'s whole corpus and returns a corpus with the compile
/// results recorded. Each (subject, compiler) pair gets its own output
/// directory under `out_dir`, so compilers never clobber each other's
/// artifacts.
pub fn run_compile_stage(
    plan: &Plan,
    out_dir: &Path,
    quantities: &BatchQuantities,
    token: &CancelToken,
    observer: &dyn Observer,
) -> Result<Corpus> {
    let timeout = Duration::from_millis(quantities.timeout_ms);
    run_batch(
        Stage::Compile,
        &plan.corpus,
        quantities.workers,
        token,
        observer,
        |name, subject| compile_subject(plan, out_dir, timeout, token, name, subject),
    )
}

fn compile_subject(
    plan: &Plan,
    out_dir: &Path,
    timeout: Duration,
    token: &CancelToken,
    name: &str,
    subject: &Subject,
) -> Result<Request> {
    let mut updates = Vec::with_capacity(plan.compilers.len());
    for (compiler_id, compiler) in &plan.compilers {
        let recipe = subject.recipes.get(&compiler.arch).with_context(|| {
            format!("subject {name} has no recipe for arch {}", compiler.arch)
        })?;
        let result = compile_one(
            out_dir,
            timeout,
            token,
            name,
            compiler_id,
            &compiler.argv,
            recipe,
        )?;
        updates.push(Update::Compile {
            compiler_id: compiler_id.clone(),
            result,
        });
    }
    Ok(Request {
        name: name.to_string(),
        updates,
    })
}

fn compile_one(
    out_dir: &Path,
    timeout: Duration,
    token: &CancelToken,
    name: &str,
    compiler_id: &str,
    argv: &[String],
    recipe: &Recipe,
) -> Result<CompileResult> {
    let dir = out_dir.join(name).join(compiler_id);
    fs::create_dir_all(&dir)
        .with_context(|| format!("creating compile dir {}", dir.display()))?;
    let bin_path = dir.join(BINARY_NAME);
    let log_path = dir.join(LOG_NAME);

    let mut recipe = recipe.clone();
    recipe.output = bin_path.clone();

    let job_token = token.child_with_timeout(timeout);
    let driver = ExecCompiler::new(argv.to_vec(), job_token.clone(), log_path.clone());
    let mut interp =
        Interpreter::new(Some(&driver), &recipe, None).with_object_dir(dir.clone());

    let start_unix_ms = now_unix_ms();
    let outcome = interp.interpret(&job_token);
    let duration_ms = now_unix_ms().saturating_sub(start_unix_ms);

    let status = match outcome {
        Ok(()) => Status::Ok,
        Err(err) => match err.kind {
            InterpErrorKind::Compiler => match driver.take_failure() {
                Some(ExecError::Timeout) => Status::Timeout,
                _ => Status::CompileFail,
            },
            InterpErrorKind::Cancelled if job_token.deadline_exceeded() && !token.is_cancelled() => {
                Status::Timeout
            }
            // Bad recipes and batch-level cancellation are not a property of
            // this compiler; they poison the whole batch.
            _ => bail!("compiling {name} with {compiler_id}: {err}"),
        },
    };

    let mut files = vec![FileRecord {
        path: log_path.clone(),
        kind: FileKind::Log,
        origin: FileOrigin::Compile,
        sha256: None,
    }];
    if status == Status::Ok {
        files.push(FileRecord {
            path: bin_path,
            kind: FileKind::Binary,
            origin: FileOrigin::Compile,
            sha256: None,
        });
    }

    let mut result = CompileResult {
        status,
        start_unix_ms,
        duration_ms,
        files,
        stderr_b64: String::new(),
    };
    if status != Status::Ok {
        result.set_stderr(&log_tail(&log_path));
    }
    Ok(result)
}

/// Last `STDERR_TAIL_CAP` bytes of the compile log, for inline reporting.
fn log_tail(path: &Path) -> Vec<u8> {
    let Ok(mut bytes) = fs::read(path) else {
        return Vec::new();
    };
    if bytes.len() > STDERR_TAIL_CAP {
        bytes.drain(..bytes.len() - STDERR_TAIL_CAP);
    }
    bytes
}
