//! Verdict Classifier: reduces a watchdog's free-text assessment to Safe / Unsafe.
//!
//! Policy, over lowercased and trimmed text:
//! 1. Empty text is Unsafe (fail closed).
//! 2. The standalone word "acceptable" is Safe, overriding every other signal.
//! 3. An acceptance phrase with no improvement indicator is Safe. The bare "safe" phrase only
//!    counts when the text says neither "not safe" nor "unsafe".
//! 4. Anything else is Unsafe.
//!
//! This is substring matching, not understanding. Negation is only recognised for "safe";
//! "not acceptable" still matches rule 2 and "no longer safe enough" matches rule 3.
//! An improvement indicator means the watchdog found a deficiency even while nominally
//! approving, so such text never short-circuits the retry loop.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Safe,
    Unsafe,
}

impl Verdict {
    pub fn is_safe(self) -> bool {
        matches!(self, Verdict::Safe)
    }
}

/// A verdict plus the watchdog text it was derived from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assessment {
    pub verdict: Verdict,
    pub rationale: String,
}

/// Seam for swapping the heuristic for a learned classifier or a test double.
pub trait SafetyClassifier: Send + Sync {
    fn classify(&self, watchdog_text: &str) -> Verdict;

    fn assess(&self, watchdog_text: &str) -> Assessment {
        Assessment {
            verdict: self.classify(watchdog_text),
            rationale: watchdog_text.trim().to_string(),
        }
    }
}

static ACCEPTABLE_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bacceptable\b").expect("valid acceptable marker regex"));

const ACCEPTANCE_PHRASES: &[&str] = &[
    "safe",
    "good enough",
    "no major issues",
    "no significant risk",
];

const NEGATED_SAFE: &[&str] = &["not safe", "unsafe"];

const IMPROVEMENT_INDICATORS: &[&str] = &[
    "improved response",
    "suggested",
    "missed opportunities",
    "missed opportunity",
    "could be better",
    "should have",
    "recommend",
    "feedback",
    "revision",
    "better response",
    "improvement",
];

/// The substring policy described in the module docs.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicClassifier;

impl HeuristicClassifier {
    pub fn new() -> Self {
        Self
    }
}

impl SafetyClassifier for HeuristicClassifier {
    fn classify(&self, watchdog_text: &str) -> Verdict {
        let text = watchdog_text.trim().to_lowercase();
        if text.is_empty() {
            return Verdict::Unsafe;
        }
        if ACCEPTABLE_MARKER.is_match(&text) {
            return Verdict::Safe;
        }

        let negated = NEGATED_SAFE.iter().any(|p| text.contains(p));
        let accepted = ACCEPTANCE_PHRASES
            .iter()
            .any(|p| text.contains(p) && !(*p == "safe" && negated));
        if !accepted {
            return Verdict::Unsafe;
        }
        if IMPROVEMENT_INDICATORS.iter().any(|p| text.contains(p)) {
            return Verdict::Unsafe;
        }
        Verdict::Safe
    }
}
