//! Failure taxonomy for the membrane.
//!
//! Every failure is synchronous and surfaces to the immediate caller.  An
//! operation either fully succeeds with all invariants intact or fails
//! without mutating state observable to other graphs.  There is no retry
//! layer and no partial-success mode.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::descriptor::ObjectHandle;
use crate::mapping::GraphName;
use crate::object_model::ObjectError;

/// Membrane-level failure.
///
/// `InvariantViolation` is always a defect in the membrane itself; it is
/// logged with full context before being raised and is never expected to
/// be caught by calling code.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum MembraneError {
    /// A value had the wrong shape for the argument slot it was passed in.
    #[error("invalid argument: {what}")]
    InvalidArgumentShape { what: String },

    /// A property key failed validation (e.g. the empty key).
    #[error("invalid property key")]
    InvalidKey,

    /// No operation handler exists for this graph name.
    #[error("unknown graph {graph}")]
    UnknownGraph { graph: GraphName },

    /// Conversion between a graph and itself was requested.
    #[error("origin and target handlers must differ")]
    HandlerMismatch,

    /// A handler reference belongs to a different membrane instance.
    #[error("handler for {graph} is not owned by this membrane")]
    HandlerNotOwned { graph: GraphName },

    /// A structural operation was explicitly turned off for this value.
    #[error("operation {trap} disabled for this value on graph {graph}")]
    OperationDisabled { trap: String, graph: GraphName },

    /// The value is not a surrogate the named graph recognizes.
    #[error("value {handle} is not a recognized surrogate of graph {graph}")]
    SurrogateNotRecognized { handle: ObjectHandle, graph: GraphName },

    /// The handler has been revoked; every surrogate it issued is dead.
    #[error("handler for graph {graph} has been revoked")]
    HandlerIsDead { graph: GraphName },

    /// A deliberate exception injected by a notification listener.
    #[error("listener raised: {message}")]
    ListenerRaised { message: String },

    /// Internal consistency assertion failed.  Always a defect.
    #[error("invariant violation: {detail}")]
    InvariantViolation { detail: String },

    /// Substrate-level failure.
    #[error("object model: {0}")]
    Object(#[from] ObjectError),
}

impl MembraneError {
    /// Shortcut for invariant failures with formatted context.
    pub fn invariant(detail: impl Into<String>) -> Self {
        Self::InvariantViolation {
            detail: detail.into(),
        }
    }

    /// Shortcut for argument-shape failures.
    pub fn bad_argument(what: impl Into<String>) -> Self {
        Self::InvalidArgumentShape { what: what.into() }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formats() {
        let e = MembraneError::UnknownGraph {
            graph: GraphName::new("dry"),
        };
        assert_eq!(e.to_string(), "unknown graph dry");

        let e = MembraneError::invariant("field without surrogate");
        assert_eq!(e.to_string(), "invariant violation: field without surrogate");
    }

    #[test]
    fn object_error_converts() {
        let oe = ObjectError::ObjectNotFound(ObjectHandle(3));
        let me: MembraneError = oe.clone().into();
        assert_eq!(me, MembraneError::Object(oe));
    }

    #[test]
    fn serde_round_trip() {
        let e = MembraneError::OperationDisabled {
            trap: "getOwnPropertyDescriptor".into(),
            graph: GraphName::new("wet"),
        };
        let json = serde_json::to_string(&e).expect("serialize");
        let back: MembraneError = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(e, back);
    }
}
