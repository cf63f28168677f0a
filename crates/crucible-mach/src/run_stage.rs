//! Run stage: execute every compiled binary under the backend and parse
//! the observation it reports.

use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};

use crucible_plan::{
    now_unix_ms, BatchQuantities, Compilation, Corpus, Observation, Plan, RunResult, Stage,
    Status, Subject,
};

use crate::cancel::CancelToken;
use crate::event::Observer;
use crate::executor::{run_batch, Request, Update};
use crate::proc::{run_capped, DEFAULT_CAPTURE_CAP};

/// Runs every successfully compiled (subject, compiler) binary in `plan`'s
/// corpus. Subjects whose compile failed keep their compile status and get
/// no run record.
pub fn run_run_stage(
    plan: &Plan,
    quantities: &BatchQuantities,
    token: &CancelToken,
    observer: &dyn Observer,
) -> Result<Corpus> {
    let timeout = Duration::from_millis(quantities.timeout_ms);
    run_batch(
        Stage::Run,
        &plan.corpus,
        quantities.workers,
        token,
        observer,
        |name, subject| run_subject(plan, timeout, token, name, subject),
    )
}

fn run_subject(
    plan: &Plan,
    timeout: Duration,
    token: &CancelToken,
    name: &str,
    subject: &Subject,
) -> Result<Request> {
    let mut updates = Vec::new();
    for (compiler_id, compilation) in &subject.compilations {
        let Some(result) = run_one(plan, timeout, token, name, compilation)? else {
            continue;
        };
        updates.push(Update::Run {
            compiler_id: compiler_id.clone(),
            result,
        });
    }
    Ok(Request {
        name: name.to_string(),
        updates,
    })
}

fn run_one(
    plan: &Plan,
    timeout: Duration,
    token: &CancelToken,
    name: &str,
    compilation: &Compilation,
) -> Result<Option<RunResult>> {
    let Some(compile) = &compilation.compile else {
        return Ok(None);
    };
    if !compile.status.is_ok() {
        return Ok(None);
    }
    let bin = compile
        .bin()
        .with_context(|| format!("subject {name} compiled ok but recorded no binary"))?;

    let mut argv = plan.backend.argv.iter();
    let mut cmd = match argv.next() {
        Some(program) => {
            let mut cmd = Command::new(program);
            cmd.args(argv);
            cmd.arg(&bin.path);
            cmd
        }
        None => Command::new(&bin.path),
    };
    if let Some(dir) = bin.path.parent() {
        cmd.current_dir(dir);
    }

    let job_token = token.child_with_timeout(timeout);
    let start_unix_ms = now_unix_ms();
    let out = run_capped(cmd, &job_token, DEFAULT_CAPTURE_CAP)?;
    let duration_ms = now_unix_ms().saturating_sub(start_unix_ms);

    let mut result = RunResult {
        status: Status::Ok,
        start_unix_ms,
        duration_ms,
        observation: None,
        failure: None,
        stderr_b64: String::new(),
    };
    result.set_stderr(&out.stderr);

    // Classification priority: timeout beats a run error beats a parse
    // error. A timed-out run usually leaves both a bad exit and garbled
    // output behind; only the timeout is the story.
    if out.timed_out {
        result.status = Status::Timeout;
        return Ok(Some(result));
    }
    if out.exit_code != 0 {
        result.status = Status::RunFail;
        result.failure = Some(match out.exit_signal {
            Some(sig) => format!("killed by signal {sig}"),
            None => format!("exited with status {}", out.exit_code),
        });
        return Ok(Some(result));
    }
    if out.stdout_truncated {
        result.status = Status::Flagged;
        result.failure = Some("observation stream exceeded the capture cap".to_string());
        return Ok(Some(result));
    }
    match parse_observation(&out.stdout) {
        Ok(obs) => {
            result.status = if obs.flagged() {
                Status::Flagged
            } else {
                Status::Ok
            };
            result.observation = Some(obs);
        }
        Err(err) => {
            result.status = Status::Unknown;
            result.failure = Some(format!("parsing observation: {err:#}"));
        }
    }
    Ok(Some(result))
}

fn parse_observation(stdout: &[u8]) -> Result<Observation> {
    serde_json::from_slice(stdout).context("observation is not valid JSON")
}
