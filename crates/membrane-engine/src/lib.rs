#![forbid(unsafe_code)]

//! Object-graph membrane over a deterministic single-realm object model.
//!
//! Two or more isolated object graphs exchange values through one
//! [`Membrane`]; every object crossing the boundary is replaced by a
//! surrogate that enforces the boundary's rules on every structural
//! operation.  No object from one graph is ever handed directly to
//! another graph.
//!
//! The crate splits along these seams:
//! - [`descriptor`]: values, property keys, structural descriptors
//! - [`object_model`]: the heap of ordinary objects and surrogates
//! - [`mapping`]: per-original-value bookkeeping across graphs
//! - [`notification`]: listener chains observing surrogate creation
//! - [`membrane`]: the central registry and conversion algorithms
//! - [`modify_rules`]: the rule-configuration facade and chain handlers
//! - [`distortions`]: declarative distortion bundles
//! - [`document_graph`]: a mock document graph for integration tests
//!
//! The per-graph operation handler itself has no public types of its own;
//! its thirteen interception points surface as structural methods on
//! [`Membrane`] (`get`, `set`, `has`, `own_keys`, `define_property`,
//! `delete_property`, `get_prototype_of`, `set_prototype_of`,
//! `is_extensible`, `prevent_extensions`, `call`, `construct`, plus
//! enumeration and freeze/seal helpers).

pub mod descriptor;
pub mod distortions;
pub mod document_graph;
pub mod error;
mod handler;
pub mod logging;
pub mod mapping;
pub mod membrane;
pub mod modify_rules;
pub mod notification;
pub mod object_model;

pub use descriptor::{ObjectHandle, PropertyDescriptor, PropertyKey, Value};
pub use distortions::{DistortionsConfig, DistortionsListener, TruncateSetting};
pub use error::MembraneError;
pub use logging::{LogLevel, LogRecord, MembraneLogger, MemoryLogger, NullLogger};
pub use mapping::{GraphName, KeyFilter, TrapName, Truncation};
pub use membrane::{
    CallContext, CallKind, CallPhase, FunctionEvent, FunctionListener, HandlerRef, Membrane,
    MembraneOptions, NativeFn, PassThroughFilter,
};
pub use notification::{ProxyListener, ProxyMessage, ShadowTargetMode};
pub use object_model::{ObjectHeap, ObjectKind};
