// SPDX-License-Identifier: MIT

//! The policy engine.
//!
//! A policy is a flat buffer of opcodes built by [`OpcodeFactory`].  Rules
//! are runs of match opcodes closed by an action opcode, and
//! [`PolicyProcessor`] returns the action of the first rule that matches a
//! call's [`ParameterSet`]s.

pub mod opcodes;
pub mod params;
pub mod processor;

pub use opcodes::{
    EvalResult, MatchContext, Opcode, OpcodeFactory, OpcodeId, OpcodeOptions, PolicyAction, StringMatchOptions,
    NO_PARAMETER, SEEK_FORWARD, SEEK_TO_END,
};
pub use params::{CountedParameterSet, ParameterOrdinal, ParameterSet, ParameterType};
pub use processor::{EvaluationOptions, PolicyEvaluation, PolicyProcessor, PolicyResult};

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("policy buffer full: {needed} bytes needed, {available} available")]
    BufferFull { needed: usize, available: usize },

    #[error("malformed policy: {0}")]
    Malformed(String),
}

impl From<PolicyError> for std::io::Error {
    fn from(value: PolicyError) -> Self {
        let kind = match value {
            PolicyError::BufferFull { .. } => std::io::ErrorKind::OutOfMemory,
            PolicyError::Malformed(_) => std::io::ErrorKind::InvalidData,
        };
        std::io::Error::new(kind, value)
    }
}
