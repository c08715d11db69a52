//! Expression construction for the remote interpreter.
//!
//! The service rejects whitespace, so every expression is built from bare
//! variable names and a single operator. Secret position `n` is exposed as a
//! variable whose name is the position letter repeated `n` times (`b`, `bb`,
//! `bbb`, ...); the shared variable holds the result of the last evaluation.

use crate::error::{ProbeError, Result};
use std::fmt;

/// A whitespace-free expression line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expression(String);

impl Expression {
    pub fn new(text: impl Into<String>) -> Result<Self> {
        let text = text.into();
        if text.is_empty() || text.chars().any(char::is_whitespace) {
            return Err(ProbeError::InvalidExpression { expression: text });
        }
        Ok(Self(text))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Naming scheme for the shared variable and the per-position variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableNames {
    shared: String,
    position: String,
}

impl Default for VariableNames {
    fn default() -> Self {
        Self {
            shared: "a".into(),
            position: "b".into(),
        }
    }
}

impl VariableNames {
    pub fn new(shared: impl Into<String>, position: impl Into<String>) -> Result<Self> {
        let shared = shared.into();
        let position = position.into();
        for (label, name) in [("shared", &shared), ("position", &position)] {
            if name.is_empty() || name.chars().any(|c| !c.is_ascii_alphabetic()) {
                return Err(ProbeError::config(format!(
                    "{label} variable name must be non-empty ASCII letters, got {name:?}"
                )));
            }
        }
        if position.contains(shared.as_str()) || shared.contains(position.as_str()) {
            return Err(ProbeError::config(format!(
                "shared variable {shared:?} and position variable {position:?} must not overlap"
            )));
        }
        Ok(Self { shared, position })
    }

    pub fn shared(&self) -> &str {
        &self.shared
    }

    /// Variable naming secret position `n`.
    pub fn position(&self, n: usize) -> String {
        self.position.repeat(n)
    }

    /// Loads the anchor's value into the shared variable.
    pub fn baseline(&self, anchor: usize) -> Result<Expression> {
        Expression::new(self.position(anchor))
    }

    /// `a-<target>`: leaves `value(anchor) - value(target)` in the shared variable.
    pub fn subtract(&self, target: usize) -> Result<Expression> {
        Expression::new(format!("{}-{}", self.shared, self.position(target)))
    }

    /// `<anchor>/a`: raises the distinguishing error iff the shared variable is zero.
    pub fn probe(&self, anchor: usize) -> Result<Expression> {
        Expression::new(format!("{}/{}", self.position(anchor), self.shared))
    }
}
