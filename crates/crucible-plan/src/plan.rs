use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::corpus::Corpus;
use crate::quantity::QuantitySet;
use crate::result::now_unix_ms;
use crate::stage::Stage;
use crate::PLAN_SCHEMA_VERSION;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: Stage,
    pub completed_unix_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub created_unix_ms: u64,
    pub seed: i64,
    /// Completed-stage history, append-only.
    #[serde(default)]
    pub stages: Vec<StageRecord>,
}

/// Identity of the machine the machine-dependent phase targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    pub id: String,
}

/// One resolved compiler instance. The probing that produced `argv` is
/// outside this repository; the machine phase only executes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Compiler {
    pub arch: String,
    pub argv: Vec<String>,
}

/// The chosen backend: how compiled subjects are run and observed. `argv`
/// is prefixed to the binary path when executing a subject.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backend {
    pub id: String,
    #[serde(default)]
    pub argv: Vec<String>,
}

/// The complete description of one test campaign.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub schema_version: String,
    pub metadata: Metadata,
    pub machine: Machine,
    pub backend: Backend,
    #[serde(default)]
    pub quantities: QuantitySet,
    /// Root directory every subject path is relative to on this side.
    pub run_root: PathBuf,
    pub compilers: BTreeMap<String, Compiler>,
    pub corpus: Corpus,
}

impl Plan {
    pub fn new(machine: Machine, backend: Backend, seed: i64, run_root: PathBuf) -> Self {
        Self {
            schema_version: PLAN_SCHEMA_VERSION.to_string(),
            metadata: Metadata {
                created_unix_ms: now_unix_ms(),
                seed,
                stages: Vec::new(),
            },
            machine,
            backend,
            quantities: QuantitySet::default(),
            run_root,
            compilers: BTreeMap::new(),
            corpus: Corpus::new(),
        }
    }

    pub fn stamp_stage(&mut self, stage: Stage) {
        self.metadata.stages.push(StageRecord {
            stage,
            completed_unix_ms: now_unix_ms(),
        });
    }

    pub fn stage_completed(&self, stage: Stage) -> bool {
        self.metadata.stages.iter().any(|r| r.stage == stage)
    }

    /// Rewrites every subject path from the current `run_root` to
    /// `new_root`. Fails if any recorded path escapes the root; the two
    /// sides of the transport must agree on the rooted layout.
    pub fn rebase(&mut self, new_root: &Path) -> Result<()> {
        if new_root == self.run_root {
            return Ok(());
        }
        let old_root = self.run_root.clone();
        let rebase = |p: &Path| -> Result<PathBuf> {
            let rel = p.strip_prefix(&old_root).with_context(|| {
                format!(
                    "path {} is outside run root {}",
                    p.display(),
                    old_root.display()
                )
            })?;
            Ok(new_root.join(rel))
        };

        for (_, subject) in self.corpus.iter_mut() {
            for recipe in subject.recipes.values_mut() {
                recipe.dir = rebase(&recipe.dir)?;
                if recipe.output.is_absolute() {
                    recipe.output = rebase(&recipe.output)?;
                }
            }
            for compilation in subject.compilations.values_mut() {
                if let Some(compile) = compilation.compile.as_mut() {
                    for file in &mut compile.files {
                        file.path = rebase(&file.path)?;
                    }
                }
            }
        }
        self.run_root = new_root.to_path_buf();
        Ok(())
    }
}
