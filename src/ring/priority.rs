use std::fmt;

use serde::{Deserialize, Serialize};

/// Priority classes, highest first. Each class owns one lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventPriority {
    Critical,
    MarketData,
    Signals,
    Orders,
    Analytics,
    System,
}

impl EventPriority {
    /// Scan order for consumers.
    pub const ALL: [EventPriority; 6] = [
        EventPriority::Critical,
        EventPriority::MarketData,
        EventPriority::Signals,
        EventPriority::Orders,
        EventPriority::Analytics,
        EventPriority::System,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventPriority::Critical => "critical",
            EventPriority::MarketData => "market_data",
            EventPriority::Signals => "signals",
            EventPriority::Orders => "orders",
            EventPriority::Analytics => "analytics",
            EventPriority::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
    }
}

impl fmt::Display for EventPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
