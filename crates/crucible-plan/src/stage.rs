use serde::{Deserialize, Serialize};

/// One phase of a test campaign. Only equality is relied upon; there is no
/// numeric ordering between stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Plan,
    Lift,
    Fuzz,
    Compile,
    Run,
    Analyze,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Plan => "plan",
            Stage::Lift => "lift",
            Stage::Fuzz => "fuzz",
            Stage::Compile => "compile",
            Stage::Run => "run",
            Stage::Analyze => "analyze",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
