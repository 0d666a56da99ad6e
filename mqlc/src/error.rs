//! Error type produced by the translator and the executor.

use std::fmt::Display;

/// A translation or execution error.
///
/// Errors raised while walking an aggregation pipeline carry the index of
/// the stage they were raised in, so a caller can point at the offending
/// stage without re-parsing the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Error {
    pub reason: Reason,
    /// Zero-based index of the pipeline stage the error originated in.
    pub stage: Option<usize>,
    pub hints: Vec<String>,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq)]
pub enum Reason {
    Simple(String),
    /// A field path or identifier failed the safety checks.
    Validation {
        name: String,
    },
    MalformedExpression {
        context: String,
    },
    MalformedStage {
        stage: String,
        details: String,
    },
    UnsupportedOperator {
        name: String,
    },
    UnsupportedStage {
        name: String,
    },
    UnsupportedExpression {
        found: String,
    },
    /// The selected dialect or engine cannot express the feature.
    FeatureUnavailable {
        feature: String,
        engine: String,
    },
    NoEngineAvailable,
    SandboxUnavailable,
    /// Pass-through for failures reported by the backend handle.
    Execution {
        message: String,
    },
    Cancelled,
}

impl Error {
    pub fn new(reason: Reason) -> Self {
        Error {
            reason,
            stage: None,
            hints: Vec::new(),
        }
    }

    pub fn new_simple<S: ToString>(reason: S) -> Self {
        Error::new(Reason::Simple(reason.to_string()))
    }
}

impl Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reason::Simple(text) => f.write_str(text),
            Reason::Validation { name } => write!(f, "invalid identifier `{name}`"),
            Reason::MalformedExpression { context } => {
                write!(f, "malformed expression: {context}")
            }
            Reason::MalformedStage { stage, details } => {
                write!(f, "malformed {stage} stage: {details}")
            }
            Reason::UnsupportedOperator { name } => write!(f, "operator `{name}` is not supported"),
            Reason::UnsupportedStage { name } => write!(f, "stage `{name}` is not supported"),
            Reason::UnsupportedExpression { found } => {
                write!(f, "unsupported expression: {found}")
            }
            Reason::FeatureUnavailable { feature, engine } => {
                write!(f, "{feature} is not available on {engine}")
            }
            Reason::NoEngineAvailable => f.write_str("no analytical engine is available"),
            Reason::SandboxUnavailable => {
                f.write_str("$function requires a sandbox loader, but none is configured")
            }
            Reason::Execution { message } => f.write_str(message),
            Reason::Cancelled => f.write_str("operation cancelled"),
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(stage) = self.stage {
            write!(f, "stage {stage}: ")?;
        }
        write!(f, "{}", self.reason)?;
        for hint in &self.hints {
            write!(f, "\n  hint: {hint}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {}

pub trait WithErrorInfo: Sized {
    fn push_hint<S: Into<String>>(self, hint: S) -> Self;

    /// Attach the index of the pipeline stage currently being translated.
    /// An index set earlier (closer to the failure) wins.
    fn with_stage(self, stage: usize) -> Self;
}

impl WithErrorInfo for Error {
    fn push_hint<S: Into<String>>(mut self, hint: S) -> Self {
        self.hints.push(hint.into());
        self
    }

    fn with_stage(mut self, stage: usize) -> Self {
        self.stage.get_or_insert(stage);
        self
    }
}

impl<T, E: WithErrorInfo> WithErrorInfo for Result<T, E> {
    fn push_hint<S: Into<String>>(self, hint: S) -> Self {
        self.map_err(|e| e.push_hint(hint))
    }

    fn with_stage(self, stage: usize) -> Self {
        self.map_err(|e| e.with_stage(stage))
    }
}

#[cfg(test)]
mod tests {
    use insta::assert_snapshot;

    use super::*;

    #[test]
    fn display_names_the_stage() {
        let err: Result<()> = Err(Error::new(Reason::UnsupportedOperator {
            name: "$zip".to_string(),
        }))
        .with_stage(3);
        assert_snapshot!(err.unwrap_err(), @"stage 3: operator `$zip` is not supported");
    }

    #[test]
    fn inner_stage_wins() {
        let err = Error::new(Reason::Validation {
            name: "a b".to_string(),
        })
        .with_stage(1)
        .with_stage(7);
        assert_eq!(err.stage, Some(1));
    }

    #[test]
    fn hints_are_appended() {
        let err = Error::new(Reason::SandboxUnavailable).push_hint("configure a loader");
        assert_snapshot!(err, @r"
        $function requires a sandbox loader, but none is configured
          hint: configure a loader
        ");
    }
}
