//! Central registry: owns every graph's operation handler, the weak
//! value-to-mapping index, and the wrap/build/convert algorithms that
//! create new mappings and surrogates.
//!
//! One membrane instance is one boundary.  Graph code holds
//! [`HandlerRef`] tokens naming its graph; every registry operation
//! validates that a token belongs to this membrane before acting on it.
//! All failures are synchronous, logged when a logger is attached, and
//! leave no partially-built state observable to other graphs.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::descriptor::{ObjectHandle, PropertyDescriptor, PropertyKey, Value};
use crate::error::MembraneError;
use crate::handler::GraphHandlerState;
use crate::logging::{LogLevel, LoggerHandle, MembraneLogger};
use crate::mapping::{GraphName, Mapping, MappingField, MappingId, TrapName};
use crate::modify_rules::{ChainHandler, ModifyRulesApi};
use crate::notification::{ProxyMessage, ShadowTargetMode, notify_listeners};
use crate::object_model::{FunctionId, ObjectHeap, ObjectKind, SurrogateRouting};

static NEXT_MEMBRANE_ID: AtomicU64 = AtomicU64::new(1);

// ---------------------------------------------------------------------------
// HandlerRef — token naming one graph's operation handler
// ---------------------------------------------------------------------------

/// Reference to one graph's operation handler.  The token records which
/// membrane issued it; handing it to a different membrane fails with
/// `HandlerNotOwned`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerRef {
    membrane_id: u64,
    graph: GraphName,
}

impl HandlerRef {
    pub(crate) fn new(membrane_id: u64, graph: GraphName) -> Self {
        Self { membrane_id, graph }
    }

    pub fn graph_name(&self) -> &GraphName {
        &self.graph
    }

    pub(crate) fn membrane_id(&self) -> u64 {
        self.membrane_id
    }
}

impl fmt::Display for HandlerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler[{}]", self.graph)
    }
}

// ---------------------------------------------------------------------------
// Native functions
// ---------------------------------------------------------------------------

/// Invocation context handed to a native function.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub this: Value,
    pub args: Vec<Value>,
    /// Set on construct calls: the constructor the caller named.
    pub new_target: Option<ObjectHandle>,
    /// The callable object being invoked.
    pub callee: ObjectHandle,
}

/// Native function body.  Receives the membrane so graph code can perform
/// structural operations on its own values.
pub type NativeFn = Rc<dyn Fn(&mut Membrane, &CallContext) -> Result<Value, MembraneError>>;

// ---------------------------------------------------------------------------
// Function-call instrumentation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallPhase {
    Enter,
    Return,
    Throw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Apply,
    Construct,
}

/// One observed call through the membrane.  `this_value` and `args` are in
/// the acting graph's terms; `real_target` is the unwrapped callable.
#[derive(Debug, Clone)]
pub struct FunctionEvent {
    pub phase: CallPhase,
    pub kind: CallKind,
    pub real_target: ObjectHandle,
    pub proxy: ObjectHandle,
    pub this_value: Value,
    pub args: Vec<Value>,
    pub acting_graph: GraphName,
    pub origin_graph: GraphName,
    pub result: Option<Value>,
    pub error: Option<MembraneError>,
}

/// Function-call listener.  A returned error is an accidental listener
/// failure: it is logged and swallowed, never masking the call's own
/// outcome.
pub type FunctionListener = Rc<dyn Fn(&FunctionEvent) -> Result<(), MembraneError>>;

/// Pass-through predicate: values it admits cross graphs unwrapped.
pub type PassThroughFilter = Rc<dyn Fn(&Value) -> bool>;

pub(crate) fn same_rc_listener<T: ?Sized>(a: &Rc<T>, b: &Rc<T>) -> bool {
    std::ptr::addr_eq(Rc::as_ptr(a), Rc::as_ptr(b))
}

// ---------------------------------------------------------------------------
// MembraneOptions
// ---------------------------------------------------------------------------

/// Construction options.
#[derive(Default)]
pub struct MembraneOptions {
    /// Membrane-wide pass-through predicate; default never passes.
    pub pass_through: Option<PassThroughFilter>,
    /// Expose a synthetic readable `membraneGraphName` property on every
    /// surrogate.
    pub show_graph_name: bool,
    /// Diagnostic logger.  The membrane keeps only a weak handle.
    pub logger: Option<Rc<dyn MembraneLogger>>,
    /// Production configuration marker; internals stay crate-private
    /// either way, the flag is recorded for policy code to read.
    pub secured: bool,
}

// ---------------------------------------------------------------------------
// Membrane
// ---------------------------------------------------------------------------

/// The membrane: central registry of graphs, mappings, and surrogates.
pub struct Membrane {
    pub(crate) id: u64,
    pub(crate) heap: ObjectHeap,
    pub(crate) handlers: BTreeMap<GraphName, GraphHandlerState>,
    pub(crate) mappings: Vec<Option<Mapping>>,
    /// Weak index: original values, surrogates, and shadows all map back
    /// to their mapping record.  Entries are removed explicitly on
    /// revocation and self-destruct; nothing here retains heap objects
    /// beyond those events.
    pub(crate) map_index: BTreeMap<ObjectHandle, MappingId>,
    pub(crate) chains: Vec<ChainHandler>,
    pub(crate) function_listeners: Vec<FunctionListener>,
    pub(crate) functions: Vec<NativeFn>,
    pub(crate) pass_through: Option<PassThroughFilter>,
    pub(crate) logger: LoggerHandle,
    pub(crate) show_graph_name: bool,
    pub(crate) secured: bool,
    warned: BTreeSet<String>,
    primordials: Vec<ObjectHandle>,
    object_prototype: ObjectHandle,
    callable_prototype: ObjectHandle,
    indexable_prototype: ObjectHandle,
}

impl fmt::Debug for Membrane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Membrane")
            .field("id", &self.id)
            .field("graphs", &self.handlers.keys().collect::<Vec<_>>())
            .field("mappings", &self.mappings.len())
            .field("heap_len", &self.heap.len())
            .finish()
    }
}

impl Default for Membrane {
    fn default() -> Self {
        Self::new(MembraneOptions::default())
    }
}

impl Membrane {
    pub fn new(options: MembraneOptions) -> Self {
        let mut heap = ObjectHeap::new();
        let object_prototype = heap.alloc_plain();
        let callable_prototype = heap.alloc(ObjectKind::Plain, Some(object_prototype));
        let indexable_prototype = heap.alloc(ObjectKind::Plain, Some(object_prototype));
        let logger = match &options.logger {
            Some(rc) => LoggerHandle::new(rc),
            None => LoggerHandle::none(),
        };
        Self {
            id: NEXT_MEMBRANE_ID.fetch_add(1, Ordering::Relaxed),
            heap,
            handlers: BTreeMap::new(),
            mappings: Vec::new(),
            map_index: BTreeMap::new(),
            chains: Vec::new(),
            function_listeners: Vec::new(),
            functions: Vec::new(),
            pass_through: options.pass_through,
            logger,
            show_graph_name: options.show_graph_name,
            secured: options.secured,
            warned: BTreeSet::new(),
            primordials: vec![object_prototype, callable_prototype, indexable_prototype],
            object_prototype,
            callable_prototype,
            indexable_prototype,
        }
    }

    // -- diagnostics ---------------------------------------------------------

    pub(crate) fn logger(&self) -> &LoggerHandle {
        &self.logger
    }

    /// Log a warning at most once per distinct message.
    pub fn warn_once(&mut self, message: &str) {
        if self.warned.insert(message.to_string()) {
            self.logger.emit(LogLevel::Warn, "membrane", message);
        }
    }

    /// Log a failure, then hand it back for raising.
    pub(crate) fn fail(&self, location: &str, error: MembraneError) -> MembraneError {
        let level = match &error {
            MembraneError::InvariantViolation { .. } => LogLevel::Fatal,
            _ => LogLevel::Error,
        };
        self.logger.report_error(level, location, &error);
        error
    }

    // -- intrinsics ----------------------------------------------------------

    /// Host primordial objects: ready-made pass-through set.
    pub fn primordials(&self) -> &[ObjectHandle] {
        &self.primordials
    }

    pub fn object_prototype(&self) -> ObjectHandle {
        self.object_prototype
    }

    pub fn callable_prototype(&self) -> ObjectHandle {
        self.callable_prototype
    }

    pub fn indexable_prototype(&self) -> ObjectHandle {
        self.indexable_prototype
    }

    pub fn secured(&self) -> bool {
        self.secured
    }

    pub fn shows_graph_name(&self) -> bool {
        self.show_graph_name
    }

    pub fn heap(&self) -> &ObjectHeap {
        &self.heap
    }

    // -- allocation helpers for graph code -----------------------------------

    pub fn alloc_object(&mut self, kind: ObjectKind, proto: Option<ObjectHandle>) -> ObjectHandle {
        self.heap.alloc(kind, proto)
    }

    pub fn alloc_plain(&mut self) -> ObjectHandle {
        self.heap.alloc(ObjectKind::Plain, Some(self.object_prototype))
    }

    pub(crate) fn register_native(&mut self, body: NativeFn) -> FunctionId {
        let id = FunctionId(self.functions.len() as u32);
        self.functions.push(body);
        id
    }

    /// Allocate a callable object backed by a native function.
    pub fn alloc_function(&mut self, proto: Option<ObjectHandle>, body: NativeFn) -> ObjectHandle {
        let call = self.register_native(body);
        let proto = proto.or(Some(self.callable_prototype));
        self.heap.alloc_callable(proto, call, None)
    }

    /// Allocate a constructable callable.  `construct` runs with a fresh
    /// receiver allocated from the constructor's `prototype` property.
    pub fn alloc_constructor(
        &mut self,
        proto: Option<ObjectHandle>,
        call: NativeFn,
        construct: NativeFn,
    ) -> ObjectHandle {
        let call_id = self.register_native(call);
        let construct_id = self.register_native(construct);
        let proto = proto.or(Some(self.callable_prototype));
        self.heap.alloc_callable(proto, call_id, Some(construct_id))
    }

    pub(crate) fn native(&self, id: FunctionId) -> Result<NativeFn, MembraneError> {
        self.functions
            .get(id.0 as usize)
            .cloned()
            .ok_or_else(|| MembraneError::invariant(format!("function slot {} missing", id.0)))
    }

    // -- handler management --------------------------------------------------

    /// The operation handler for `graph`, creating it on first use when
    /// `must_create` is set.
    pub fn get_handler_by_name(
        &mut self,
        graph: impl Into<GraphName>,
        must_create: bool,
    ) -> Result<HandlerRef, MembraneError> {
        let graph = graph.into();
        if !graph.is_valid() {
            return Err(self.fail(
                "get_handler_by_name",
                MembraneError::bad_argument("graph name must be a non-empty string or a token"),
            ));
        }
        if !self.handlers.contains_key(&graph) {
            if !must_create {
                return Err(self.fail(
                    "get_handler_by_name",
                    MembraneError::UnknownGraph { graph },
                ));
            }
            self.handlers
                .insert(graph.clone(), GraphHandlerState::new(graph.clone()));
        }
        Ok(HandlerRef::new(self.id, graph))
    }

    pub fn has_handler_by_name(&self, graph: &GraphName) -> bool {
        self.handlers.contains_key(graph)
    }

    /// Validate a handler token: issued by this membrane, naming a graph
    /// this membrane still knows.
    pub(crate) fn check_handler(&self, handler: &HandlerRef) -> Result<(), MembraneError> {
        if handler.membrane_id() != self.id {
            return Err(MembraneError::HandlerNotOwned {
                graph: handler.graph_name().clone(),
            });
        }
        if !self.handlers.contains_key(handler.graph_name()) {
            return Err(MembraneError::UnknownGraph {
                graph: handler.graph_name().clone(),
            });
        }
        Ok(())
    }

    pub(crate) fn handler_state(
        &self,
        graph: &GraphName,
    ) -> Result<&GraphHandlerState, MembraneError> {
        self.handlers.get(graph).ok_or_else(|| MembraneError::UnknownGraph {
            graph: graph.clone(),
        })
    }

    pub(crate) fn handler_state_mut(
        &mut self,
        graph: &GraphName,
    ) -> Result<&mut GraphHandlerState, MembraneError> {
        self.handlers
            .get_mut(graph)
            .ok_or_else(|| MembraneError::UnknownGraph {
                graph: graph.clone(),
            })
    }

    pub(crate) fn make_ref(&self, graph: &GraphName) -> HandlerRef {
        HandlerRef::new(self.id, graph.clone())
    }

    /// Is this graph's handler revoked?
    pub fn is_revoked(&self, handler: &HandlerRef) -> Result<bool, MembraneError> {
        self.check_handler(handler)?;
        Ok(self.handler_state(handler.graph_name())?.revoked)
    }

    // -- mapping arena -------------------------------------------------------

    pub(crate) fn mapping(&self, id: MappingId) -> Result<&Mapping, MembraneError> {
        self.mappings
            .get(id.0 as usize)
            .and_then(|slot| slot.as_ref())
            .ok_or_else(|| MembraneError::invariant(format!("mapping {} missing", id.0)))
    }

    pub(crate) fn mapping_mut(&mut self, id: MappingId) -> Result<&mut Mapping, MembraneError> {
        self.mappings
            .get_mut(id.0 as usize)
            .and_then(|slot| slot.as_mut())
            .ok_or_else(|| MembraneError::invariant(format!("mapping {} missing", id.0)))
    }

    pub(crate) fn mapping_id_of(&self, handle: ObjectHandle) -> Option<MappingId> {
        self.map_index.get(&handle).copied()
    }

    fn insert_mapping(&mut self, mapping: Mapping) -> MappingId {
        let id = MappingId(self.mappings.len() as u32);
        self.mappings.push(Some(mapping));
        id
    }

    /// Self-destruct: remove every weak-index entry this mapping is known
    /// by and drop the record.  Used on failed builds and explicit
    /// teardown; surrogates are revoked so nothing half-alive survives.
    pub(crate) fn destroy_mapping(&mut self, id: MappingId) {
        let Some(slot) = self.mappings.get_mut(id.0 as usize) else {
            return;
        };
        let Some(mapping) = slot.take() else {
            return;
        };
        for handle in mapping.all_known_handles() {
            self.map_index.remove(&handle);
        }
        for graph in mapping.graphs() {
            if let Some(field) = mapping.field(&graph)
                && field.shadow.is_some()
            {
                let _ = self.heap.revoke_surrogate(field.surrogate);
            }
        }
    }

    // -- read-only lookups ---------------------------------------------------

    /// Does this graph already hold a view of `value`?
    pub fn has_proxy_for_value(&self, graph: &GraphName, value: Value) -> bool {
        let Some(handle) = value.as_object() else {
            return false;
        };
        self.mapping_id_of(handle)
            .and_then(|id| self.mapping(id).ok())
            .is_some_and(|m| m.field(graph).is_some_and(|f| !f.dead))
    }

    /// The unwrapped original behind `value`, when the membrane knows it.
    /// Returns `(found, value)` rather than failing on absence.
    pub fn get_membrane_value(&self, graph: &GraphName, value: Value) -> (bool, Value) {
        if !self.handlers.contains_key(graph) {
            return (false, value);
        }
        let Some(handle) = value.as_object() else {
            return (false, value);
        };
        let Some(mapping) = self
            .mapping_id_of(handle)
            .and_then(|id| self.mapping(id).ok())
        else {
            return (false, value);
        };
        match mapping.origin_field() {
            Some(field) => (true, Value::Object(field.value)),
            None => (false, value),
        }
    }

    /// The surrogate `graph` holds for `value`, when one exists.
    pub fn get_membrane_proxy(&self, graph: &GraphName, value: Value) -> (bool, Value) {
        if !self.handlers.contains_key(graph) {
            return (false, value);
        }
        let Some(handle) = value.as_object() else {
            return (false, value);
        };
        let Some(mapping) = self
            .mapping_id_of(handle)
            .and_then(|id| self.mapping(id).ok())
        else {
            return (false, value);
        };
        match mapping.field(graph) {
            Some(field) if !field.dead => (true, Value::Object(field.surrogate)),
            _ => (false, value),
        }
    }

    // -- pass-through --------------------------------------------------------

    pub(crate) fn passes_through(
        &self,
        origin: &GraphName,
        target: &GraphName,
        value: &Value,
    ) -> bool {
        if let Some(filter) = &self.pass_through
            && filter(value)
        {
            return true;
        }
        for graph in [origin, target] {
            if let Ok(state) = self.handler_state(graph)
                && let Some(filter) = &state.pass_through
                && filter(value)
            {
                return true;
            }
        }
        false
    }

    /// Claim a handler's pass-through predicate.  Each handler accepts
    /// exactly one claim.
    pub fn claim_handler_pass_through(
        &mut self,
        handler: &HandlerRef,
        filter: PassThroughFilter,
    ) -> Result<(), MembraneError> {
        self.check_handler(handler)
            .map_err(|e| self.fail("claim_handler_pass_through", e))?;
        let state = self.handler_state_mut(handler.graph_name())?;
        if state.pass_through_claimed {
            return Err(self.fail(
                "claim_handler_pass_through",
                MembraneError::bad_argument("pass-through already claimed for this handler"),
            ));
        }
        state.pass_through = Some(filter);
        state.pass_through_claimed = true;
        Ok(())
    }

    pub(crate) fn handler_claimed_pass_through(&self, graph: &GraphName) -> bool {
        self.handler_state(graph)
            .map(|s| s.pass_through_claimed)
            .unwrap_or(false)
    }

    // -- conversion ----------------------------------------------------------

    /// Convert `value` from the origin graph into the target graph:
    /// the idempotent cross-graph entry point.  Primitives pass through
    /// unchanged, existing surrogates are returned as-is, and new
    /// mappings are built origin-side first.
    pub fn convert_argument_to_proxy(
        &mut self,
        origin: &HandlerRef,
        target: &HandlerRef,
        value: Value,
    ) -> Result<Value, MembraneError> {
        self.convert_with_context(origin, target, value, None)
    }

    pub(crate) fn convert_with_context(
        &mut self,
        origin: &HandlerRef,
        target: &HandlerRef,
        value: Value,
        call_site: Option<(TrapName, Option<usize>, bool)>,
    ) -> Result<Value, MembraneError> {
        self.check_handler(origin)
            .and_then(|()| self.check_handler(target))
            .map_err(|e| self.fail("convert_argument_to_proxy", e))?;
        if origin.graph_name() == target.graph_name() {
            return Err(self.fail("convert_argument_to_proxy", MembraneError::HandlerMismatch));
        }
        for graph in [origin.graph_name(), target.graph_name()] {
            if self.handler_state(graph)?.revoked {
                return Err(self.fail(
                    "convert_argument_to_proxy",
                    MembraneError::HandlerIsDead {
                        graph: graph.clone(),
                    },
                ));
            }
        }

        let Some(handle) = value.as_object() else {
            return Ok(value);
        };
        if self.passes_through(origin.graph_name(), target.graph_name(), &value) {
            return Ok(value);
        }

        // Fast path: a live surrogate already exists for the target graph.
        if let Some(id) = self.mapping_id_of(handle) {
            let mapping = self.mapping(id)?;
            if let Some(field) = mapping.field(target.graph_name())
                && !field.dead
            {
                return Ok(Value::Object(field.surrogate));
            }
        }

        let id = match self.mapping_id_of(handle) {
            Some(id) => id,
            None => self.build_origin_field(origin.graph_name().clone(), handle, call_site)?,
        };
        self.build_target_field(id, target.graph_name().clone(), call_site)?;

        let mapping = self.mapping(id)?;
        match mapping.field(target.graph_name()) {
            Some(field) if !field.dead => Ok(Value::Object(field.surrogate)),
            _ => Err(self.fail(
                "convert_argument_to_proxy",
                MembraneError::invariant("target field missing after build"),
            )),
        }
    }

    /// Create the mapping record and origin-graph field for a value that
    /// has never crossed the membrane.
    pub(crate) fn build_origin_field(
        &mut self,
        graph: GraphName,
        handle: ObjectHandle,
        call_site: Option<(TrapName, Option<usize>, bool)>,
    ) -> Result<MappingId, MembraneError> {
        let mapping = Mapping::new(graph.clone());
        let id = self.insert_mapping(mapping);
        let installed = self
            .mapping_mut(id)?
            .set_field(graph.clone(), MappingField::origin(handle));
        if !installed {
            return Err(self.fail(
                "build_mapping",
                MembraneError::invariant("fresh mapping rejected origin field"),
            ));
        }
        self.map_index.insert(handle, id);

        let mut message =
            ProxyMessage::new(id, graph.clone(), true, handle, Value::Object(handle));
        if let Some((trap, index, is_this)) = call_site {
            message = message.with_call_site(trap, index, is_this);
        }
        let outcome = self.notify_for_graph(&graph, handle, message);
        match outcome {
            Ok(msg) => {
                if msg.was_rewritten() {
                    self.warn_once("origin-side listeners cannot rewrite the original value");
                }
                Ok(id)
            }
            Err(err) => {
                self.destroy_mapping(id);
                Err(err)
            }
        }
    }

    /// Create the surrogate-bearing field exposing `id`'s value to
    /// `graph`.  The field is fully populated (value, shadow, revoke hook)
    /// before anything is observable; a failed build self-destructs.
    pub(crate) fn build_target_field(
        &mut self,
        id: MappingId,
        graph: GraphName,
        call_site: Option<(TrapName, Option<usize>, bool)>,
    ) -> Result<(), MembraneError> {
        {
            let mapping = self.mapping(id)?;
            if let Some(field) = mapping.field(&graph)
                && !field.dead
            {
                return Ok(());
            }
        }
        let real = {
            let mapping = self.mapping(id)?;
            mapping
                .origin_field()
                .map(|f| f.value)
                .ok_or_else(|| MembraneError::invariant("mapping without origin field"))
                .map_err(|e| self.fail("build_mapping", e))?
        };

        let kind = self.heap.kind(real)?;
        let shadow = self.heap.alloc(kind, None);
        let surrogate = self
            .heap
            .alloc_surrogate(shadow, SurrogateRouting::Graph(graph.clone()));

        let mut field = MappingField::with_surrogate(real, surrogate, Some(shadow));
        if self.show_graph_name {
            field.set_local_descriptor(
                PropertyKey::new("membraneGraphName"),
                PropertyDescriptor::data_frozen(Value::Str(graph.to_string())),
            );
        }
        let installed = self.mapping_mut(id)?.set_field(graph.clone(), field);
        if !installed {
            return Err(self.fail(
                "build_mapping",
                MembraneError::invariant("live field overwrite attempted"),
            ));
        }
        self.map_index.insert(surrogate, id);
        self.map_index.insert(shadow, id);
        self.handler_state_mut(&graph)?.issued.push(surrogate);

        let mut message =
            ProxyMessage::new(id, graph.clone(), false, real, Value::Object(surrogate));
        if let Some((trap, index, is_this)) = call_site {
            message = message.with_call_site(trap, index, is_this);
        }
        match self.notify_for_graph(&graph, real, message) {
            Ok(msg) => {
                if msg.was_rewritten() {
                    match msg.proxy().as_object() {
                        Some(new_surrogate) => {
                            self.map_index.insert(new_surrogate, id);
                            if let Some(field) = self.mapping_mut(id)?.field_mut(&graph) {
                                field.surrogate = new_surrogate;
                            }
                        }
                        None => {
                            self.warn_once("listener rewrote a surrogate to a primitive; ignored");
                        }
                    }
                }
                if let Some(mode) = msg.shadow_mode() {
                    self.apply_shadow_fast_path(id, &graph, mode)?;
                }
                // A non-extensible original locks its surrogate up front.
                if !self.heap.is_extensible(real)? && msg.shadow_mode().is_none() {
                    self.lock_shadow(id, &graph)?;
                }
                Ok(())
            }
            Err(err) => {
                // Partial construction must not leak.
                if let Ok(mapping) = self.mapping_mut(id) {
                    mapping.remove_field(&graph);
                }
                self.map_index.remove(&surrogate);
                self.map_index.remove(&shadow);
                let _ = self.heap.revoke_surrogate(surrogate);
                if let Some(state) = self.handlers.get_mut(&graph) {
                    state.issued.retain(|h| *h != surrogate);
                }
                Err(err)
            }
        }
    }

    /// Run one graph's proxy listeners over `message`, maintaining the
    /// in-construction registry entry for `real` across all exits.
    fn notify_for_graph(
        &mut self,
        graph: &GraphName,
        real: ObjectHandle,
        mut message: ProxyMessage,
    ) -> Result<ProxyMessage, MembraneError> {
        let listeners = self.handler_state(graph)?.proxy_listeners.clone();
        let began = self.handler_state_mut(graph)?.in_construction.begin(real);
        let outcome = notify_listeners(self, &listeners, &mut message);
        if began {
            let callbacks = self
                .handler_state_mut(graph)?
                .in_construction
                .finish(real);
            for callback in callbacks {
                if let Err(err) = callback(self) {
                    self.logger
                        .report_error(LogLevel::Error, "deferred_finalize", &err);
                }
            }
        }
        outcome.map(|()| message)
    }

    /// Shadow-target fast path requested by a listener: close the shape
    /// now and route future operations straight at the shadow.
    fn apply_shadow_fast_path(
        &mut self,
        id: MappingId,
        graph: &GraphName,
        mode: ShadowTargetMode,
    ) -> Result<(), MembraneError> {
        self.populate_shadow_eagerly(id, graph)?;
        let (shadow, surrogate, kind) = {
            let mapping = self.mapping(id)?;
            let field = mapping
                .field(graph)
                .ok_or_else(|| MembraneError::invariant("fast path without field"))?;
            let shadow = field
                .shadow
                .ok_or_else(|| MembraneError::invariant("fast path without shadow"))?;
            (shadow, field.surrogate, self.heap.kind(shadow)?)
        };
        match mode {
            ShadowTargetMode::Frozen => self.heap.freeze(shadow)?,
            ShadowTargetMode::Sealed => self.heap.seal(shadow)?,
            ShadowTargetMode::Prepared => {}
        }
        let routing = if kind == ObjectKind::Callable {
            // Callables keep call/construct mediation, everything else
            // forwards to the shadow.
            SurrogateRouting::Forward(graph.clone())
        } else {
            SurrogateRouting::Base
        };
        if let Some(s) = self.heap.get_mut(surrogate)?.as_surrogate_mut() {
            s.set_routing(routing);
        }
        Ok(())
    }

    // -- binding -------------------------------------------------------------

    /// Forcibly unify two independently-created values as one mapping
    /// across two graphs.
    pub fn bind_values_by_handlers(
        &mut self,
        handler0: &HandlerRef,
        value0: Value,
        handler1: &HandlerRef,
        value1: Value,
    ) -> Result<(), MembraneError> {
        self.check_handler(handler0)
            .and_then(|()| self.check_handler(handler1))
            .map_err(|e| self.fail("bind_values_by_handlers", e))?;
        if handler0.graph_name() == handler1.graph_name() {
            return Err(self.fail("bind_values_by_handlers", MembraneError::HandlerMismatch));
        }
        let (Some(h0), Some(h1)) = (value0.as_object(), value1.as_object()) else {
            return Err(self.fail(
                "bind_values_by_handlers",
                MembraneError::bad_argument("bound values must be objects"),
            ));
        };

        let id0 = self.mapping_id_of(h0);
        let id1 = self.mapping_id_of(h1);
        match (id0, id1) {
            (Some(a), Some(b)) if a == b => Ok(()),
            (Some(_), Some(_)) => Err(self.fail(
                "bind_values_by_handlers",
                MembraneError::bad_argument("values already belong to conflicting mappings"),
            )),
            (Some(id), None) => self.bind_extra_field(id, handler1.graph_name().clone(), h1),
            (None, Some(id)) => self.bind_extra_field(id, handler0.graph_name().clone(), h0),
            (None, None) => {
                let id = self.build_origin_field(handler0.graph_name().clone(), h0, None)?;
                self.bind_extra_field(id, handler1.graph_name().clone(), h1)
            }
        }
    }

    fn bind_extra_field(
        &mut self,
        id: MappingId,
        graph: GraphName,
        handle: ObjectHandle,
    ) -> Result<(), MembraneError> {
        {
            let mapping = self.mapping(id)?;
            if let Some(existing) = mapping.field(&graph) {
                if existing.value == handle {
                    return Ok(());
                }
                return Err(self.fail(
                    "bind_values_by_handlers",
                    MembraneError::bad_argument(
                        "graph already holds a different value in this mapping",
                    ),
                ));
            }
        }
        // The bound value is its own surrogate in that graph: the two
        // sides constructed equivalent values out-of-band.
        let installed = self
            .mapping_mut(id)?
            .set_field(graph, MappingField::origin(handle));
        if !installed {
            return Err(self.fail(
                "bind_values_by_handlers",
                MembraneError::invariant("live field overwrite attempted"),
            ));
        }
        self.map_index.insert(handle, id);
        Ok(())
    }

    // -- descriptor wrapping -------------------------------------------------

    /// Rewrite a descriptor's value/get/set through cross-graph
    /// conversion.  Primitive data descriptors short-circuit.
    pub fn wrap_descriptor(
        &mut self,
        origin: &HandlerRef,
        target: &HandlerRef,
        desc: &PropertyDescriptor,
    ) -> Result<PropertyDescriptor, MembraneError> {
        if desc.is_primitive_data() {
            return Ok(desc.clone());
        }
        match desc {
            PropertyDescriptor::Data {
                value,
                writable,
                enumerable,
                configurable,
            } => {
                let wrapped = self.convert_argument_to_proxy(origin, target, value.clone())?;
                Ok(PropertyDescriptor::Data {
                    value: wrapped,
                    writable: *writable,
                    enumerable: *enumerable,
                    configurable: *configurable,
                })
            }
            PropertyDescriptor::Accessor {
                get,
                set,
                enumerable,
                configurable,
            } => {
                let wrap_fn = |m: &mut Self, h: Option<ObjectHandle>| -> Result<Option<ObjectHandle>, MembraneError> {
                    match h {
                        None => Ok(None),
                        Some(h) => {
                            let wrapped =
                                m.convert_argument_to_proxy(origin, target, Value::Object(h))?;
                            wrapped.as_object().map(Some).ok_or_else(|| {
                                MembraneError::invariant("accessor wrapped to a primitive")
                            })
                        }
                    }
                };
                let get = wrap_fn(self, *get)?;
                let set = wrap_fn(self, *set)?;
                Ok(PropertyDescriptor::Accessor {
                    get,
                    set,
                    enumerable: *enumerable,
                    configurable: *configurable,
                })
            }
        }
    }

    // -- function listeners --------------------------------------------------

    /// Membrane-wide call instrumentation: fires for every mediated call
    /// regardless of which graphs are involved.
    pub fn add_function_listener(&mut self, listener: FunctionListener) {
        self.function_listeners.push(listener);
    }

    /// Remove a membrane-wide listener.  `true` if it was present.
    pub fn remove_function_listener(&mut self, listener: &FunctionListener) -> bool {
        let before = self.function_listeners.len();
        self.function_listeners
            .retain(|l| !same_rc_listener(l, listener));
        self.function_listeners.len() != before
    }

    pub fn add_handler_function_listener(
        &mut self,
        handler: &HandlerRef,
        listener: FunctionListener,
    ) -> Result<(), MembraneError> {
        self.check_handler(handler)
            .map_err(|e| self.fail("add_function_listener", e))?;
        self.handler_state_mut(handler.graph_name())?
            .function_listeners
            .push(listener);
        Ok(())
    }

    pub fn remove_handler_function_listener(
        &mut self,
        handler: &HandlerRef,
        listener: &FunctionListener,
    ) -> Result<bool, MembraneError> {
        self.check_handler(handler)
            .map_err(|e| self.fail("remove_function_listener", e))?;
        let listeners = &mut self
            .handler_state_mut(handler.graph_name())?
            .function_listeners;
        let before = listeners.len();
        listeners.retain(|l| !same_rc_listener(l, listener));
        Ok(listeners.len() != before)
    }

    // -- proxy listeners -----------------------------------------------------

    pub fn add_proxy_listener(
        &mut self,
        handler: &HandlerRef,
        listener: crate::notification::ProxyListener,
    ) -> Result<(), MembraneError> {
        self.check_handler(handler)
            .map_err(|e| self.fail("add_proxy_listener", e))?;
        self.handler_state_mut(handler.graph_name())?
            .proxy_listeners
            .push(listener);
        Ok(())
    }

    pub fn remove_proxy_listener(
        &mut self,
        handler: &HandlerRef,
        listener: &crate::notification::ProxyListener,
    ) -> Result<bool, MembraneError> {
        self.check_handler(handler)
            .map_err(|e| self.fail("remove_proxy_listener", e))?;
        let listeners = &mut self
            .handler_state_mut(handler.graph_name())?
            .proxy_listeners;
        let before = listeners.len();
        listeners.retain(|l| !same_rc_listener(l, listener));
        Ok(listeners.len() != before)
    }

    // -- revocation ----------------------------------------------------------

    /// Irreversibly deactivate every surrogate this handler ever issued.
    /// The revocation-hook list is released so moribund values become
    /// collectible.
    pub fn revoke_everything(&mut self, handler: &HandlerRef) -> Result<(), MembraneError> {
        self.check_handler(handler)
            .map_err(|e| self.fail("revoke_everything", e))?;
        let graph = handler.graph_name().clone();
        let issued = {
            let state = self.handler_state_mut(&graph)?;
            state.revoked = true;
            std::mem::take(&mut state.issued)
        };
        for surrogate in issued {
            let _ = self.heap.revoke_surrogate(surrogate);
            if let Some(id) = self.mapping_id_of(surrogate) {
                let shadow = self
                    .mapping(id)
                    .ok()
                    .and_then(|m| m.field(&graph))
                    .and_then(|f| f.shadow);
                if let Ok(mapping) = self.mapping_mut(id)
                    && let Some(field) = mapping.field_mut(&graph)
                {
                    field.dead = true;
                }
                self.map_index.remove(&surrogate);
                if let Some(shadow) = shadow {
                    self.map_index.remove(&shadow);
                }
            }
        }
        self.logger.emit(
            LogLevel::Info,
            "revoke_everything",
            &format!("graph {graph} revoked"),
        );
        Ok(())
    }

    // -- rule configuration --------------------------------------------------

    /// The rule-configuration facade.
    pub fn modify_rules(&mut self) -> ModifyRulesApi<'_> {
        ModifyRulesApi::new(self)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::MemoryLogger;

    fn wet_dry(membrane: &mut Membrane) -> (HandlerRef, HandlerRef) {
        let wet = membrane.get_handler_by_name("wet", true).expect("wet");
        let dry = membrane.get_handler_by_name("dry", true).expect("dry");
        (wet, dry)
    }

    // -----------------------------------------------------------------------
    // 1. Handler management
    // -----------------------------------------------------------------------

    #[test]
    fn handler_created_on_demand() {
        let mut membrane = Membrane::default();
        assert!(!membrane.has_handler_by_name(&GraphName::new("wet")));
        let wet = membrane.get_handler_by_name("wet", true).expect("create");
        assert!(membrane.has_handler_by_name(&GraphName::new("wet")));
        assert_eq!(wet.graph_name(), &GraphName::new("wet"));
    }

    #[test]
    fn unknown_graph_without_must_create() {
        let mut membrane = Membrane::default();
        let err = membrane
            .get_handler_by_name("wet", false)
            .expect_err("unknown");
        assert_eq!(
            err,
            MembraneError::UnknownGraph {
                graph: GraphName::new("wet")
            }
        );
    }

    #[test]
    fn empty_graph_name_rejected() {
        let mut membrane = Membrane::default();
        let err = membrane.get_handler_by_name("", true).expect_err("empty");
        assert!(matches!(err, MembraneError::InvalidArgumentShape { .. }));
    }

    #[test]
    fn token_graph_names_work() {
        let mut membrane = Membrane::default();
        let t = membrane
            .get_handler_by_name(GraphName::token(7), true)
            .expect("token graph");
        assert_eq!(t.graph_name(), &GraphName::token(7));
    }

    #[test]
    fn foreign_handler_rejected() {
        let mut m0 = Membrane::default();
        let mut m1 = Membrane::default();
        let wet0 = m0.get_handler_by_name("wet", true).expect("wet0");
        let dry1 = m1.get_handler_by_name("dry", true).expect("dry1");
        let value = Value::Object(m1.alloc_plain());
        let err = m1
            .convert_argument_to_proxy(&wet0, &dry1, value)
            .expect_err("foreign");
        assert_eq!(
            err,
            MembraneError::HandlerNotOwned {
                graph: GraphName::new("wet")
            }
        );
    }

    #[test]
    fn same_graph_conversion_rejected() {
        let mut membrane = Membrane::default();
        let wet = membrane.get_handler_by_name("wet", true).expect("wet");
        let wet2 = membrane.get_handler_by_name("wet", false).expect("wet2");
        let value = Value::Object(membrane.alloc_plain());
        let err = membrane
            .convert_argument_to_proxy(&wet, &wet2, value)
            .expect_err("same graph");
        assert_eq!(err, MembraneError::HandlerMismatch);
    }

    // -----------------------------------------------------------------------
    // 2. Conversion basics
    // -----------------------------------------------------------------------

    #[test]
    fn primitives_pass_unchanged() {
        let mut membrane = Membrane::default();
        let (wet, dry) = wet_dry(&mut membrane);
        for v in [Value::Undefined, Value::Null, Value::Int(3), Value::Str("x".into())] {
            let out = membrane
                .convert_argument_to_proxy(&wet, &dry, v.clone())
                .expect("convert");
            assert_eq!(out, v);
        }
    }

    #[test]
    fn conversion_is_idempotent() {
        let mut membrane = Membrane::default();
        let (wet, dry) = wet_dry(&mut membrane);
        let value = Value::Object(membrane.alloc_plain());
        let first = membrane
            .convert_argument_to_proxy(&wet, &dry, value.clone())
            .expect("first");
        let second = membrane
            .convert_argument_to_proxy(&wet, &dry, value.clone())
            .expect("second");
        assert_eq!(first, second);
        assert_ne!(first, value, "a surrogate is a distinct object");
    }

    #[test]
    fn round_trip_restores_original() {
        let mut membrane = Membrane::default();
        let (wet, dry) = wet_dry(&mut membrane);
        let value = Value::Object(membrane.alloc_plain());
        let proxy = membrane
            .convert_argument_to_proxy(&wet, &dry, value.clone())
            .expect("wrap");
        let back = membrane
            .convert_argument_to_proxy(&dry, &wet, proxy)
            .expect("unwrap");
        assert_eq!(back, value);
    }

    #[test]
    fn membrane_lookups_report_found_pairs() {
        let mut membrane = Membrane::default();
        let (wet, dry) = wet_dry(&mut membrane);
        let value = Value::Object(membrane.alloc_plain());
        let dry_name = GraphName::new("dry");

        assert!(!membrane.has_proxy_for_value(&dry_name, value.clone()));
        let (found, echoed) = membrane.get_membrane_proxy(&dry_name, value.clone());
        assert!(!found);
        assert_eq!(echoed, value);

        let proxy = membrane
            .convert_argument_to_proxy(&wet, &dry, value.clone())
            .expect("wrap");
        assert!(membrane.has_proxy_for_value(&dry_name, value.clone()));
        let (found, reported) = membrane.get_membrane_proxy(&dry_name, value.clone());
        assert!(found);
        assert_eq!(reported, proxy);
        let (found, original) = membrane.get_membrane_value(&dry_name, proxy);
        assert!(found);
        assert_eq!(original, value);
    }

    // -----------------------------------------------------------------------
    // 3. Pass-through
    // -----------------------------------------------------------------------

    #[test]
    fn membrane_wide_pass_through() {
        let mut membrane = Membrane::default();
        let intrinsic = membrane.object_prototype();
        membrane.pass_through = Some(Rc::new(move |v: &Value| {
            v.as_object() == Some(intrinsic)
        }));
        let (wet, dry) = wet_dry(&mut membrane);
        let out = membrane
            .convert_argument_to_proxy(&wet, &dry, Value::Object(intrinsic))
            .expect("convert");
        assert_eq!(out, Value::Object(intrinsic), "primordial crosses unwrapped");
    }

    #[test]
    fn handler_pass_through_claimed_once() {
        let mut membrane = Membrane::default();
        let (wet, _dry) = wet_dry(&mut membrane);
        membrane
            .claim_handler_pass_through(&wet, Rc::new(|_| false))
            .expect("first claim");
        let err = membrane
            .claim_handler_pass_through(&wet, Rc::new(|_| false))
            .expect_err("second claim");
        assert!(matches!(err, MembraneError::InvalidArgumentShape { .. }));
    }

    // -----------------------------------------------------------------------
    // 4. Binding
    // -----------------------------------------------------------------------

    #[test]
    fn bind_unifies_two_fresh_values() {
        let mut membrane = Membrane::default();
        let (wet, dry) = wet_dry(&mut membrane);
        let wet_value = Value::Object(membrane.alloc_plain());
        let dry_value = Value::Object(membrane.alloc_plain());
        membrane
            .bind_values_by_handlers(&wet, wet_value.clone(), &dry, dry_value.clone())
            .expect("bind");

        // Converting the wet value now yields the bound dry value.
        let out = membrane
            .convert_argument_to_proxy(&wet, &dry, wet_value.clone())
            .expect("convert");
        assert_eq!(out, dry_value);
        let back = membrane
            .convert_argument_to_proxy(&dry, &wet, dry_value)
            .expect("convert back");
        assert_eq!(back, wet_value);
    }

    #[test]
    fn bind_rejects_conflicting_mappings() {
        let mut membrane = Membrane::default();
        let (wet, dry) = wet_dry(&mut membrane);
        let a = Value::Object(membrane.alloc_plain());
        let b = Value::Object(membrane.alloc_plain());
        // Give both values independent mappings first.
        membrane
            .convert_argument_to_proxy(&wet, &dry, a.clone())
            .expect("wrap a");
        membrane
            .convert_argument_to_proxy(&wet, &dry, b.clone())
            .expect("wrap b");
        let err = membrane
            .bind_values_by_handlers(&wet, a, &dry, b)
            .expect_err("conflict");
        assert!(matches!(err, MembraneError::InvalidArgumentShape { .. }));
    }

    #[test]
    fn bind_rejects_primitives() {
        let mut membrane = Membrane::default();
        let (wet, dry) = wet_dry(&mut membrane);
        let err = membrane
            .bind_values_by_handlers(&wet, Value::Int(1), &dry, Value::Int(2))
            .expect_err("primitive");
        assert!(matches!(err, MembraneError::InvalidArgumentShape { .. }));
    }

    // -----------------------------------------------------------------------
    // 5. Failure logging
    // -----------------------------------------------------------------------

    #[test]
    fn failures_are_logged_before_raising() {
        let logger = Rc::new(MemoryLogger::new());
        let as_dyn: Rc<dyn MembraneLogger> = logger.clone();
        let mut membrane = Membrane::new(MembraneOptions {
            logger: Some(as_dyn),
            ..MembraneOptions::default()
        });
        let _ = membrane.get_handler_by_name("wet", false);
        let records = logger.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].level, LogLevel::Error);
        assert_eq!(records[0].location.as_deref(), Some("get_handler_by_name"));
    }

    #[test]
    fn warn_once_deduplicates() {
        let logger = Rc::new(MemoryLogger::new());
        let as_dyn: Rc<dyn MembraneLogger> = logger.clone();
        let mut membrane = Membrane::new(MembraneOptions {
            logger: Some(as_dyn),
            ..MembraneOptions::default()
        });
        membrane.warn_once("same thing");
        membrane.warn_once("same thing");
        membrane.warn_once("other thing");
        assert_eq!(logger.at_level(LogLevel::Warn).len(), 2);
    }

    // -----------------------------------------------------------------------
    // 6. Primordials
    // -----------------------------------------------------------------------

    #[test]
    fn primordials_cover_intrinsic_prototypes() {
        let membrane = Membrane::default();
        let p = membrane.primordials();
        assert!(p.contains(&membrane.object_prototype()));
        assert!(p.contains(&membrane.callable_prototype()));
        assert!(p.contains(&membrane.indexable_prototype()));
    }
}
