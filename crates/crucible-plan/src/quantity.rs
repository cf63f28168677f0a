use serde::{Deserialize, Serialize};

/// Worker count and per-job timeout for one batch (compile or run).
/// Zero means "inherit from the next lower-priority source".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchQuantities {
    pub workers: usize,
    pub timeout_ms: u64,
}

impl BatchQuantities {
    /// Overrides `self` with every non-zero field of `other`.
    pub fn override_with(&mut self, other: &BatchQuantities) {
        if other.workers != 0 {
            self.workers = other.workers;
        }
        if other.timeout_ms != 0 {
            self.timeout_ms = other.timeout_ms;
        }
    }
}

/// Quantities for both machine-phase batches. Override priority, lowest
/// first: built-in default, file config, plan-embedded, command line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuantitySet {
    pub compile: BatchQuantities,
    pub run: BatchQuantities,
}

impl QuantitySet {
    pub fn override_with(&mut self, other: &QuantitySet) {
        self.compile.override_with(&other.compile);
        self.run.override_with(&other.run);
    }

    /// Built-in defaults: one worker, one minute per job.
    pub fn builtin_default() -> Self {
        Self {
            compile: BatchQuantities {
                workers: 1,
                timeout_ms: 60_000,
            },
            run: BatchQuantities {
                workers: 1,
                timeout_ms: 60_000,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonzero_wins() {
        let mut base = QuantitySet::builtin_default();
        let over = QuantitySet {
            compile: BatchQuantities {
                workers: 8,
                timeout_ms: 0,
            },
            run: BatchQuantities {
                workers: 0,
                timeout_ms: 5_000,
            },
        };
        base.override_with(&over);
        assert_eq!(base.compile.workers, 8);
        assert_eq!(base.compile.timeout_ms, 60_000);
        assert_eq!(base.run.workers, 1);
        assert_eq!(base.run.timeout_ms, 5_000);
    }

    #[test]
    fn zero_set_is_identity() {
        let mut base = QuantitySet::builtin_default();
        let before = base;
        base.override_with(&QuantitySet::default());
        assert_eq!(base, before);
    }
}
