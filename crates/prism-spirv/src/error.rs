//! Error type for module parsing and editing.

use crate::module::Id;
use core::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpirvError {
    MalformedHeader {
        context: String,
    },
    MalformedInstruction {
        offset: usize,
        context: String,
    },
    /// An id lookup failed where the source module is assumed well-formed.
    ///
    /// This indicates an internal bug in a transform, not bad user input;
    /// callers abort the transform and surface a status string instead of
    /// crashing the replay session.
    UnknownId {
        id: Id,
        context: &'static str,
    },
    /// An array length or spec constant could not be evaluated to an integer.
    UnevaluatedConstant {
        id: Id,
    },
    UnsupportedLayoutType {
        id: Id,
        context: &'static str,
    },
    MissingEntryPoint {
        name: String,
    },
}

impl fmt::Display for SpirvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpirvError::MalformedHeader { context } => {
                write!(f, "malformed SPIR-V header: {context}")
            }
            SpirvError::MalformedInstruction { offset, context } => {
                write!(f, "malformed instruction at word {offset}: {context}")
            }
            SpirvError::UnknownId { id, context } => {
                write!(f, "unknown id {id} ({context}); module assumed well-formed")
            }
            SpirvError::UnevaluatedConstant { id } => {
                write!(f, "constant {id} is not an evaluable scalar integer")
            }
            SpirvError::UnsupportedLayoutType { id, context } => {
                write!(f, "type {id} cannot be laid out: {context}")
            }
            SpirvError::MissingEntryPoint { name } => {
                write!(f, "entry point \"{name}\" not found in module")
            }
        }
    }
}

impl std::error::Error for SpirvError {}
