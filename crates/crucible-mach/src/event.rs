//! Structured progress events.
//!
//! The machine binary reports progress as newline-delimited JSON objects on
//! stderr, one event per line. The invoking side replays the stream to its
//! own observers, so a batch running over SSH drives the same progress
//! reporting as a local one.

use std::io::{BufRead, Write};
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crucible_plan::{Stage, Status};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Event {
    BatchStart { stage: Stage, n_subjects: usize },
    BatchStep { stage: Stage, index: usize, name: String, status: Status },
    BatchEnd { stage: Stage },
    CopyStart { n_files: usize },
    CopyStep { index: usize, src: String, dst: String },
    CopyEnd,
    Error { message: String },
}

/// Sink for [`Event`]s. Batch workers report through a shared reference, so
/// implementations must be safe to call from several threads at once.
pub trait Observer: Send + Sync {
    fn on_event(&self, event: &Event);
}

/// Discards every event.
pub struct NullObserver;

impl Observer for NullObserver {
    fn on_event(&self, _event: &Event) {}
}

/// Writes one JSON line per event.
pub struct EventWriter<W: Write + Send> {
    out: Mutex<W>,
}

impl<W: Write + Send> EventWriter<W> {
    pub fn new(out: W) -> Self {
        EventWriter { out: Mutex::new(out) }
    }
}

impl<W: Write + Send> Observer for EventWriter<W> {
    fn on_event(&self, event: &Event) {
        let Ok(mut out) = self.out.lock() else {
            return;
        };
        // An unwritable event sink must not abort the batch.
        if let Ok(line) = serde_json::to_string(event) {
            let _ = writeln!(out, "{line}");
        }
    }
}

/// Forwards each decoded event line to `observers`. Lines that do not look
/// like JSON objects are skipped; subprocess noise on the same descriptor
/// must not kill the replay.
pub fn replay<R: BufRead>(reader: R, observers: &[&dyn Observer]) -> Result<Vec<Event>> {
    let mut seen = Vec::new();
    for line in reader.lines() {
        let line = line.context("reading event stream")?;
        let trimmed = line.trim();
        if !trimmed.starts_with('{') {
            continue;
        }
        let event: Event = serde_json::from_str(trimmed)
            .with_context(|| format!("bad event line: {trimmed}"))?;
        for obs in observers {
            obs.on_event(&event);
        }
        seen.push(event);
    }
    Ok(seen)
}
