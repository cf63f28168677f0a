//! Parallel batch executor.
//!
//! Workers claim subjects through a shared atomic index and send completed
//! requests over a channel to a single aggregator, which owns the result
//! corpus. Only the aggregator mutates shared state, so per-subject results
//! land deterministically regardless of worker interleaving.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;

use anyhow::{Context, Result};

use crucible_plan::{CompileResult, Corpus, RunResult, Stage, Status, Subject};

use crate::cancel::CancelToken;
use crate::event::{Event, Observer};

/// One subject's finished work: a set of per-compiler result updates.
pub struct Request {
    pub name: String,
    pub updates: Vec<Update>,
}

pub enum Update {
    Compile { compiler_id: String, result: CompileResult },
    Run { compiler_id: String, result: RunResult },
}

impl Request {
    /// Representative status for progress reporting: the first non-ok
    /// update, or ok when everything passed.
    fn status(&self) -> Status {
        for update in &self.updates {
            let status = match update {
                Update::Compile { result, .. } => result.status,
                Update::Run { result, .. } => result.status,
            };
            if status != Status::Ok {
                return status;
            }
        }
        Status::Ok
    }
}

fn apply(corpus: &mut Corpus, req: Request) -> Result<()> {
    let subject = corpus
        .get_mut(&req.name)
        .with_context(|| format!("request for unknown subject {}", req.name))?;
    for update in req.updates {
        match update {
            Update::Compile { compiler_id, result } => {
                subject.compilations.entry(compiler_id).or_default().compile = Some(result);
            }
            Update::Run { compiler_id, result } => {
                subject.compilations.entry(compiler_id).or_default().run = Some(result);
            }
        }
    }
    Ok(())
}

/// Runs `job` over every subject of `corpus` on `workers` threads and
/// returns a new corpus with the results folded in.
///
/// The first job error cancels the remaining work and propagates; the
/// partial aggregate is discarded with it.
pub fn run_batch<F>(
    stage: Stage,
    corpus: &Corpus,
    workers: usize,
    token: &CancelToken,
    observer: &dyn Observer,
    job: F,
) -> Result<Corpus>
where
    F: Fn(&str, &Subject) -> Result<Request> + Sync,
{
    let names: Vec<&str> = corpus.names().collect();
    observer.on_event(&Event::BatchStart {
        stage,
        n_subjects: names.len(),
    });

    let workers = workers.max(1).min(names.len().max(1));
    let mut result = corpus.clone();
    let next = AtomicUsize::new(0);
    let (tx, rx) = mpsc::channel::<Result<Request>>();
    let job = &job;

    let mut first_err: Option<anyhow::Error> = None;
    std::thread::scope(|scope| {
        for _ in 0..workers {
            let tx = tx.clone();
            let names = &names;
            let next = &next;
            scope.spawn(move || loop {
                if token.is_cancelled() {
                    return;
                }
                let idx = next.fetch_add(1, Ordering::SeqCst);
                let Some(name) = names.get(idx) else {
                    return;
                };
                let Some(subject) = corpus.get(name) else {
                    return;
                };
                let outcome = job(name, subject);
                if outcome.is_err() {
                    // Stop the other workers now; routing the error through
                    // the aggregator first would let them claim more work.
                    token.cancel();
                }
                if tx.send(outcome).is_err() {
                    return;
                }
            });
        }
        drop(tx);

        let mut index = 0usize;
        for msg in rx {
            match msg {
                Ok(req) => {
                    observer.on_event(&Event::BatchStep {
                        stage,
                        index,
                        name: req.name.clone(),
                        status: req.status(),
                    });
                    index += 1;
                    if let Err(err) = apply(&mut result, req) {
                        token.cancel();
                        first_err = Some(err);
                        break;
                    }
                }
                Err(err) => {
                    token.cancel();
                    observer.on_event(&Event::Error {
                        message: format!("{err:#}"),
                    });
                    first_err = Some(err);
                    break;
                }
            }
        }
    });

    if let Some(err) = first_err {
        return Err(err);
    }
    // Cancellation with no recorded error: the workers drained out quietly,
    // leaving a partial aggregate that must not pass for a finished batch.
    if token.is_cancelled() {
        anyhow::bail!("{stage} batch cancelled before completion");
    }
    observer.on_event(&Event::BatchEnd { stage });
    Ok(result)
}
