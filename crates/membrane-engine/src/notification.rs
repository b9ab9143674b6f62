//! Notification engine: listener chains observing and rewriting a
//! surrogate at creation time.
//!
//! When a value is wrapped for the first time, a mutable [`ProxyMessage`]
//! runs through the ordered listener list of the origin-side handler and
//! then the target-side handler.  A listener may rewrite the tentative
//! surrogate, request a shadow-target fast path, stop iteration, or
//! inject a deliberate exception.  Accidental listener failures are
//! logged and swallowed so a faulty policy listener cannot break
//! unrelated code; a deliberate exception stops iteration and propagates
//! to the caller of the conversion that triggered notification.

use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::descriptor::{ObjectHandle, Value};
use crate::error::MembraneError;
use crate::logging::LogLevel;
use crate::mapping::{GraphName, MappingId, TrapName};
use crate::membrane::Membrane;

// ---------------------------------------------------------------------------
// ShadowTargetMode
// ---------------------------------------------------------------------------

/// Fast-path request: close the surrogate's shape immediately and route
/// its operations straight to the shadow afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShadowTargetMode {
    Frozen,
    Sealed,
    Prepared,
}

// ---------------------------------------------------------------------------
// ProxyMessage
// ---------------------------------------------------------------------------

/// Mutable metadata record handed to each proxy listener.
pub struct ProxyMessage {
    mapping: MappingId,
    graph: GraphName,
    is_origin_graph: bool,
    /// The real underlying value being wrapped.
    target: ObjectHandle,
    /// The tentative surrogate about to be returned.
    proxy: Value,
    rewritten: bool,
    stopped: bool,
    exception: Option<MembraneError>,
    shadow_mode: Option<ShadowTargetMode>,
    /// Call-site context: which operation required the wrap, which
    /// argument slot the value occupied, and whether it was the receiver.
    trap: Option<TrapName>,
    argument_index: Option<usize>,
    is_this: bool,
}

impl ProxyMessage {
    pub fn new(
        mapping: MappingId,
        graph: GraphName,
        is_origin_graph: bool,
        target: ObjectHandle,
        proxy: Value,
    ) -> Self {
        Self {
            mapping,
            graph,
            is_origin_graph,
            target,
            proxy,
            rewritten: false,
            stopped: false,
            exception: None,
            shadow_mode: None,
            trap: None,
            argument_index: None,
            is_this: false,
        }
    }

    pub fn with_call_site(
        mut self,
        trap: TrapName,
        argument_index: Option<usize>,
        is_this: bool,
    ) -> Self {
        self.trap = Some(trap);
        self.argument_index = argument_index;
        self.is_this = is_this;
        self
    }

    pub fn mapping(&self) -> MappingId {
        self.mapping
    }

    pub fn graph(&self) -> &GraphName {
        &self.graph
    }

    pub fn is_origin_graph(&self) -> bool {
        self.is_origin_graph
    }

    pub fn target(&self) -> ObjectHandle {
        self.target
    }

    pub fn proxy(&self) -> &Value {
        &self.proxy
    }

    pub fn trap(&self) -> Option<TrapName> {
        self.trap
    }

    pub fn argument_index(&self) -> Option<usize> {
        self.argument_index
    }

    pub fn is_this(&self) -> bool {
        self.is_this
    }

    /// Replace the tentative surrogate outright.
    pub fn rewrite_surrogate(&mut self, replacement: Value) {
        self.proxy = replacement;
        self.rewritten = true;
    }

    pub fn was_rewritten(&self) -> bool {
        self.rewritten
    }

    /// Stop the listener chain after the current listener returns.
    pub fn stop_iteration(&mut self) {
        self.stopped = true;
    }

    pub fn stopped(&self) -> bool {
        self.stopped
    }

    /// Inject a deliberate exception.  It stops iteration and propagates
    /// out of the conversion call that triggered notification.
    pub fn throw_exception(&mut self, error: MembraneError) {
        self.stopped = true;
        self.exception = Some(error);
    }

    pub fn take_exception(&mut self) -> Option<MembraneError> {
        self.exception.take()
    }

    /// Request the shadow-target fast path.
    pub fn use_shadow_target(&mut self, mode: ShadowTargetMode) {
        self.shadow_mode = Some(mode);
    }

    pub fn shadow_mode(&self) -> Option<ShadowTargetMode> {
        self.shadow_mode
    }
}

impl fmt::Debug for ProxyMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyMessage")
            .field("mapping", &self.mapping)
            .field("graph", &self.graph)
            .field("is_origin_graph", &self.is_origin_graph)
            .field("target", &self.target)
            .field("proxy", &self.proxy)
            .field("stopped", &self.stopped)
            .field("shadow_mode", &self.shadow_mode)
            .field("trap", &self.trap)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Listener types
// ---------------------------------------------------------------------------

/// Proxy listener: observes or rewrites a surrogate at creation time.
/// Returning `Err` counts as an accidental failure; it is logged and
/// swallowed.  Use [`ProxyMessage::throw_exception`] to fail the
/// conversion deliberately.
pub type ProxyListener = Rc<dyn Fn(&mut Membrane, &mut ProxyMessage) -> Result<(), MembraneError>>;

/// Deferred finalize callback registered while a value is mid-construction.
pub type DeferredFinalize = Box<dyn FnOnce(&mut Membrane) -> Result<(), MembraneError>>;

/// Run `listeners` over `message` in order, honoring stop/throw controls.
pub(crate) fn notify_listeners(
    membrane: &mut Membrane,
    listeners: &[ProxyListener],
    message: &mut ProxyMessage,
) -> Result<(), MembraneError> {
    for listener in listeners {
        if let Err(accidental) = listener(membrane, message) {
            // Accidental failure: report, keep iterating.
            membrane
                .logger()
                .report_error(LogLevel::Error, "proxy_listener", &accidental);
        }
        if let Some(deliberate) = message.take_exception() {
            return Err(deliberate);
        }
        if message.stopped() {
            break;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// InConstructionRegistry
// ---------------------------------------------------------------------------

/// Registry of values whose wrapping is still on the call stack.
///
/// Sealing or enumerating a cyclic structure can require wrapping a value
/// mid-construction; instead of recursing, callers register a finalize
/// callback that runs once the enclosing construction finishes.  Entries
/// are drained and removed on every exit path.
#[derive(Default)]
pub struct InConstructionRegistry {
    entries: BTreeMap<ObjectHandle, Vec<DeferredFinalize>>,
}

impl InConstructionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `value` as under construction.  Nested begins for the same
    /// value are invariant violations surfaced by the caller.
    pub fn begin(&mut self, value: ObjectHandle) -> bool {
        if self.entries.contains_key(&value) {
            return false;
        }
        self.entries.insert(value, Vec::new());
        true
    }

    pub fn contains(&self, value: ObjectHandle) -> bool {
        self.entries.contains_key(&value)
    }

    /// Register a finalize callback for a value under construction.
    /// Returns `false` (callback dropped, caller resolves eagerly) when
    /// the value is not under construction.
    pub fn defer(&mut self, value: ObjectHandle, callback: DeferredFinalize) -> bool {
        match self.entries.get_mut(&value) {
            Some(callbacks) => {
                callbacks.push(callback);
                true
            }
            None => false,
        }
    }

    /// Finish construction: remove the entry and hand back the deferred
    /// callbacks for the caller to invoke.
    pub fn finish(&mut self, value: ObjectHandle) -> Vec<DeferredFinalize> {
        self.entries.remove(&value).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for InConstructionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<ObjectHandle> = self.entries.keys().copied().collect();
        f.debug_struct("InConstructionRegistry")
            .field("entries", &keys)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> ProxyMessage {
        ProxyMessage::new(
            MappingId(0),
            GraphName::new("dry"),
            false,
            ObjectHandle(1),
            Value::Object(ObjectHandle(2)),
        )
    }

    // -----------------------------------------------------------------------
    // 1. ProxyMessage controls
    // -----------------------------------------------------------------------

    #[test]
    fn rewrite_surrogate_replaces_proxy() {
        let mut msg = message();
        assert!(!msg.was_rewritten());
        msg.rewrite_surrogate(Value::Object(ObjectHandle(9)));
        assert!(msg.was_rewritten());
        assert_eq!(msg.proxy(), &Value::Object(ObjectHandle(9)));
    }

    #[test]
    fn stop_iteration_marks_stopped() {
        let mut msg = message();
        assert!(!msg.stopped());
        msg.stop_iteration();
        assert!(msg.stopped());
    }

    #[test]
    fn throw_exception_stops_and_carries_error() {
        let mut msg = message();
        msg.throw_exception(MembraneError::bad_argument("nope"));
        assert!(msg.stopped());
        let err = msg.take_exception().expect("exception");
        assert_eq!(err, MembraneError::bad_argument("nope"));
        assert!(msg.take_exception().is_none(), "exception is taken once");
    }

    #[test]
    fn call_site_context() {
        let msg = message().with_call_site(TrapName::Apply, Some(2), false);
        assert_eq!(msg.trap(), Some(TrapName::Apply));
        assert_eq!(msg.argument_index(), Some(2));
        assert!(!msg.is_this());
    }

    #[test]
    fn shadow_mode_request() {
        let mut msg = message();
        assert_eq!(msg.shadow_mode(), None);
        msg.use_shadow_target(ShadowTargetMode::Frozen);
        assert_eq!(msg.shadow_mode(), Some(ShadowTargetMode::Frozen));
    }

    // -----------------------------------------------------------------------
    // 2. InConstructionRegistry
    // -----------------------------------------------------------------------

    #[test]
    fn begin_finish_lifecycle() {
        let mut reg = InConstructionRegistry::new();
        assert!(reg.begin(ObjectHandle(1)));
        assert!(reg.contains(ObjectHandle(1)));
        assert!(!reg.begin(ObjectHandle(1)), "nested begin rejected");

        let callbacks = reg.finish(ObjectHandle(1));
        assert!(callbacks.is_empty());
        assert!(!reg.contains(ObjectHandle(1)));
        assert!(reg.is_empty());
    }

    #[test]
    fn defer_only_while_under_construction() {
        let mut reg = InConstructionRegistry::new();
        assert!(!reg.defer(ObjectHandle(1), Box::new(|_| Ok(()))));

        reg.begin(ObjectHandle(1));
        assert!(reg.defer(ObjectHandle(1), Box::new(|_| Ok(()))));
        assert!(reg.defer(ObjectHandle(1), Box::new(|_| Ok(()))));
        let callbacks = reg.finish(ObjectHandle(1));
        assert_eq!(callbacks.len(), 2);
    }

    #[test]
    fn finish_unknown_value_is_empty() {
        let mut reg = InConstructionRegistry::new();
        assert!(reg.finish(ObjectHandle(42)).is_empty());
    }
}
