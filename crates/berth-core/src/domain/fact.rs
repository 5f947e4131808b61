//! Facts: named, probe-derived observations and what they should read.

use berth_remote::{Check, Script};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::credential::is_well_formed_secret;

/// Boolean fact value for "true".
pub const YES: &str = "yes";

/// How bad it is when a fact does not match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warn,
    Fail,
}

/// What a fact is expected to read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expectation {
    Equals(String),
    /// Any secret passing [`is_well_formed_secret`].
    WellFormedSecret,
}

impl Expectation {
    pub fn yes() -> Self {
        Expectation::Equals(YES.to_string())
    }

    pub fn accepts(&self, observed: Option<&str>) -> bool {
        match (self, observed) {
            (_, None) => false,
            (Expectation::Equals(expected), Some(value)) => value == expected,
            (Expectation::WellFormedSecret, Some(value)) => is_well_formed_secret(value),
        }
    }

    /// Printable form; never prints a secret.
    pub fn describe(&self) -> String {
        match self {
            Expectation::Equals(v) => v.clone(),
            Expectation::WellFormedSecret => "<well-formed secret>".to_string(),
        }
    }
}

/// One entry of the fact table shared by phases and the reconciler.
#[derive(Debug, Clone)]
pub struct FactSpec {
    pub name: &'static str,
    pub summary: String,
    pub check: Check,
    pub expected: Expectation,
    pub severity: Severity,
    /// Single-session idempotent repair, if one exists.
    pub remedy: Option<Script>,
    /// Whether the observed value may be printed (false for secrets).
    pub reveal_value: bool,
}

impl FactSpec {
    pub fn new(name: &'static str, summary: impl Into<String>, check: Check) -> Self {
        Self {
            name,
            summary: summary.into(),
            check,
            expected: Expectation::yes(),
            severity: Severity::Fail,
            remedy: None,
            reveal_value: true,
        }
    }

    pub fn expecting(mut self, expected: Expectation) -> Self {
        self.expected = expected;
        self
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn remedy(mut self, remedy: Script) -> Self {
        self.remedy = Some(remedy);
        self
    }

    pub fn secret(mut self) -> Self {
        self.reveal_value = false;
        self
    }
}

/// Fact values from one probe. Never cached across invocations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    values: BTreeMap<String, String>,
}

impl Snapshot {
    pub fn new(values: BTreeMap<String, String>) -> Self {
        Self { values }
    }

    pub fn get(&self, fact: &str) -> Option<&str> {
        self.values.get(fact).map(String::as_str)
    }

    /// Whether `spec` reads as expected in this snapshot.
    pub fn accepts(&self, spec: &FactSpec) -> bool {
        spec.expected.accepts(self.get(spec.name))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}
