//! Pipeline execution engine for strata.
//!
//! This crate ties the schema, store and runtime layers together: `Step`
//! runs one named stage or assembler inside a fresh `Sandbox`, and `Pipeline`
//! chains steps by identity, reuses the longest cached prefix from the
//! `TreeStore`, recurses into build pipelines, and short-circuits on the
//! first failing step.

pub mod pipeline;
pub mod step;

pub use pipeline::{load, HostRootSnapshot, Pipeline, PipelineResult, RunOptions};
pub use step::{RunContext, Step, StepKind, StepResult};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("description error: {0}")]
    Description(#[from] strata_schema::DescriptionError),
    #[error("store error: {0}")]
    Store(#[from] strata_store::StoreError),
    #[error("runtime error: {0}")]
    Runtime(#[from] strata_runtime::RuntimeError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("stage '{name}' failed with exit code {returncode}")]
    TransformFailed {
        name: String,
        returncode: i32,
        output: Option<String>,
    },
    #[error("assembler '{name}' failed with exit code {returncode}")]
    OutputFailed {
        name: String,
        returncode: i32,
        output: Option<String>,
    },
    #[error("pipeline has no stages to produce a tree from")]
    NoTree,
}

impl CoreError {
    /// Exit code of the failing step, for step failures.
    pub fn step_returncode(&self) -> Option<i32> {
        match self {
            Self::TransformFailed { returncode, .. } | Self::OutputFailed { returncode, .. } => {
                Some(*returncode)
            }
            _ => None,
        }
    }

    /// Captured diagnostic output of the failing step, if any was captured.
    pub fn step_output(&self) -> Option<&str> {
        match self {
            Self::TransformFailed { output, .. } | Self::OutputFailed { output, .. } => {
                output.as_deref()
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_failure_exposes_code_and_output() {
        let e = CoreError::TransformFailed {
            name: "org.strata.rpm".to_owned(),
            returncode: 3,
            output: Some("no such package".to_owned()),
        };
        assert_eq!(e.step_returncode(), Some(3));
        assert_eq!(e.step_output(), Some("no such package"));
        assert!(e.to_string().contains("org.strata.rpm"));
    }

    #[test]
    fn other_errors_have_no_step_code() {
        assert_eq!(CoreError::NoTree.step_returncode(), None);
        assert!(CoreError::NoTree.step_output().is_none());
    }
}
