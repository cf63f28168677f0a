use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crucible_recipe::Recipe;

use crate::result::{CompileResult, RunResult};

/// Compile and run outcomes for one subject under one compiler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Compilation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compile: Option<CompileResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run: Option<RunResult>,
}

/// One test program: per-architecture recipes plus per-compiler results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Subject {
    /// Keyed by architecture identifier.
    pub recipes: BTreeMap<String, Recipe>,
    /// Keyed by compiler identifier.
    pub compilations: BTreeMap<String, Compilation>,
}

/// The set of subjects under a plan, keyed by unique subject name. Backed
/// by a BTreeMap so user-facing iteration is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Corpus(BTreeMap<String, Subject>);

impl Corpus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: String, subject: Subject) -> Option<Subject> {
        self.0.insert(name, subject)
    }

    pub fn get(&self, name: &str) -> Option<&Subject> {
        self.0.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Subject> {
        self.0.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(|s| s.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Subject)> {
        self.0.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut Subject)> {
        self.0.iter_mut()
    }
}

impl FromIterator<(String, Subject)> for Corpus {
    fn from_iter<T: IntoIterator<Item = (String, Subject)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}
