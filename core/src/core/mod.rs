pub mod admission;
pub mod compare;
pub mod engine;
pub mod mutator;
pub mod pool;
pub mod result_store;
pub mod signature;
pub mod state;
pub mod strategies;
pub mod target_manager;
pub mod throttle;

use serde::{Deserialize, Serialize};

/// Detection technique that produced a finding.
///
/// Declaration order is the order markers are rendered in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StrategyTag {
    Error,
    String,
    Numeric,
    Order,
    Boolean,
    Diy,
}

impl StrategyTag {
    pub const ALL: [StrategyTag; 6] = [
        StrategyTag::Error,
        StrategyTag::String,
        StrategyTag::Numeric,
        StrategyTag::Order,
        StrategyTag::Boolean,
        StrategyTag::Diy,
    ];

    pub fn marker(&self) -> &'static str {
        match self {
            StrategyTag::Error => "-errsql",
            StrategyTag::String => "-stringsql",
            StrategyTag::Numeric => "-numsql",
            StrategyTag::Order => "-ordersql",
            StrategyTag::Boolean => "-boolsql",
            StrategyTag::Diy => "-diypoc",
        }
    }
}

impl std::fmt::Display for StrategyTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StrategyTag::Error => write!(f, "Error-based SQLi"),
            StrategyTag::String => write!(f, "String-based SQLi"),
            StrategyTag::Numeric => write!(f, "Numeric SQLi"),
            StrategyTag::Order => write!(f, "ORDER BY SQLi"),
            StrategyTag::Boolean => write!(f, "Boolean-based SQLi"),
            StrategyTag::Diy => write!(f, "Custom payload"),
        }
    }
}

/// Strategies that flagged one parameter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParamMarks {
    flagged: [bool; 6],
}

impl ParamMarks {
    pub fn flag(&mut self, tag: StrategyTag) {
        self.flagged[tag as usize] = true;
    }

    pub fn is_flagged(&self, tag: StrategyTag) -> bool {
        self.flagged[tag as usize]
    }

    pub fn is_empty(&self) -> bool {
        !self.flagged.iter().any(|f| *f)
    }

    /// Fixed-order concatenation of markers, e.g. `-errsql-boolsql`.
    pub fn encode(&self) -> String {
        StrategyTag::ALL
            .iter()
            .filter(|tag| self.is_flagged(**tag))
            .map(|tag| tag.marker())
            .collect()
    }
}

/// `true` when `value` is a plain signed 64-bit integer.
pub fn is_numeric(value: &str) -> bool {
    !value.contains(char::is_whitespace) && !value.contains('.') && value.parse::<i64>().is_ok()
}
