//! Per-graph operation handler: every structural interception point.
//!
//! Each graph owns one handler.  A structural operation on a surrogate
//! resolves the shadow back to the real value through the weak index,
//! then re-implements the single-realm algorithm for ordinary objects
//! rather than forwarding, because every non-primitive value flowing
//! through must be re-wrapped for the correct graph: inputs (receiver,
//! arguments, prototypes, descriptor fields) are converted before the
//! real value is touched, outputs are converted before returning.
//!
//! Per-value distortions consulted here: local descriptors, deletion
//! masks, key-admission filters, argument truncation, disabled
//! operations.  The extensibility state machine per value is
//! `extensible -> locked`; `locked` is terminal and is the one moment the
//! handler pre-populates the shadow in bulk.

use std::collections::BTreeSet;
use std::fmt;

use crate::descriptor::{ObjectHandle, PropertyDescriptor, PropertyKey, Value};
use crate::error::MembraneError;
use crate::logging::LogLevel;
use crate::mapping::{GraphName, MappingField, MappingId, TrapName, Truncation};
use crate::membrane::{
    CallContext, CallKind, CallPhase, FunctionEvent, FunctionListener, Membrane, PassThroughFilter,
};
use crate::modify_rules::{ChainLink, ChainResolution, TrapCall, TrapOverride};
use crate::notification::{InConstructionRegistry, ProxyListener};
use crate::object_model::{
    HeapObject, MAX_PROTOTYPE_CHAIN_DEPTH, ObjectError, ObjectKind, SurrogateRouting,
};

// ---------------------------------------------------------------------------
// GraphHandlerState
// ---------------------------------------------------------------------------

/// Mutable state of one graph's operation handler.
pub(crate) struct GraphHandlerState {
    pub(crate) graph: GraphName,
    pub(crate) proxy_listeners: Vec<ProxyListener>,
    pub(crate) function_listeners: Vec<FunctionListener>,
    pub(crate) pass_through: Option<PassThroughFilter>,
    pub(crate) pass_through_claimed: bool,
    pub(crate) revoked: bool,
    /// Revocation hooks: every surrogate this handler issued.  Released
    /// wholesale on revocation so moribund values become collectible.
    pub(crate) issued: Vec<ObjectHandle>,
    pub(crate) in_construction: InConstructionRegistry,
}

impl GraphHandlerState {
    pub(crate) fn new(graph: GraphName) -> Self {
        Self {
            graph,
            proxy_listeners: Vec::new(),
            function_listeners: Vec::new(),
            pass_through: None,
            pass_through_claimed: false,
            revoked: false,
            issued: Vec::new(),
            in_construction: InConstructionRegistry::new(),
        }
    }
}

impl fmt::Debug for GraphHandlerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphHandlerState")
            .field("graph", &self.graph)
            .field("proxy_listeners", &self.proxy_listeners.len())
            .field("function_listeners", &self.function_listeners.len())
            .field("pass_through_claimed", &self.pass_through_claimed)
            .field("revoked", &self.revoked)
            .field("issued", &self.issued.len())
            .field("in_construction", &self.in_construction)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// TrapCtx — resolved context of one trap invocation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct TrapCtx {
    mapping: MappingId,
    graph: GraphName,
    origin_graph: GraphName,
    real: ObjectHandle,
    shadow: ObjectHandle,
    proxy: ObjectHandle,
}

/// Per-node routing decision for one operation.
enum NodeRoute {
    Ordinary,
    Graph(GraphName, ObjectHandle),
    Shadow(ObjectHandle),
    Override(TrapOverride, ObjectHandle),
}

impl Membrane {
    // -- routing -------------------------------------------------------------

    fn surrogate_route(
        &self,
        handle: ObjectHandle,
    ) -> Result<Option<(ObjectHandle, SurrogateRouting)>, MembraneError> {
        match self.heap.get(handle)? {
            HeapObject::Ordinary(_) => Ok(None),
            HeapObject::Surrogate(s) => match s.shadow() {
                Some(shadow) => Ok(Some((shadow, s.routing().clone()))),
                None => {
                    let graph = match s.routing() {
                        SurrogateRouting::Graph(g) | SurrogateRouting::Forward(g) => {
                            Some(g.clone())
                        }
                        SurrogateRouting::Chain(cid) => match self.chain_root(*cid)? {
                            ChainLink::Graph(g) => Some(g),
                            ChainLink::Base | ChainLink::Chain(_) => None,
                        },
                        SurrogateRouting::Base => None,
                    };
                    match graph {
                        Some(graph) => Err(MembraneError::HandlerIsDead { graph }),
                        None => Err(MembraneError::invariant(format!(
                            "revoked surrogate {handle} without graph routing"
                        ))),
                    }
                }
            },
        }
    }

    fn node_route(&self, handle: ObjectHandle, trap: TrapName) -> Result<NodeRoute, MembraneError> {
        match self.surrogate_route(handle)? {
            None => Ok(NodeRoute::Ordinary),
            Some((shadow, SurrogateRouting::Graph(g))) => Ok(NodeRoute::Graph(g, shadow)),
            Some((shadow, SurrogateRouting::Forward(g))) => {
                if matches!(trap, TrapName::Apply | TrapName::Construct) {
                    Ok(NodeRoute::Graph(g, shadow))
                } else {
                    Ok(NodeRoute::Shadow(shadow))
                }
            }
            Some((shadow, SurrogateRouting::Base)) => Ok(NodeRoute::Shadow(shadow)),
            Some((shadow, SurrogateRouting::Chain(id))) => {
                match self.resolve_chain(id, trap)? {
                    ChainResolution::Override(f) => Ok(NodeRoute::Override(f, shadow)),
                    ChainResolution::Graph(g) => Ok(NodeRoute::Graph(g, shadow)),
                    ChainResolution::Base => Ok(NodeRoute::Shadow(shadow)),
                }
            }
        }
    }

    /// Validate a trap invocation and resolve its context: the acting
    /// graph must be live, the shadow must map back to a mapping this
    /// membrane owns, the field must recognize the surrogate, and the
    /// operation must not be disabled on either the acting graph or the
    /// value's origin graph.
    fn trap_enter(
        &self,
        proxy: ObjectHandle,
        shadow: ObjectHandle,
        graph: &GraphName,
        trap: TrapName,
    ) -> Result<TrapCtx, MembraneError> {
        let state = self.handler_state(graph)?;
        if state.revoked {
            return Err(self.fail(
                trap.as_str(),
                MembraneError::HandlerIsDead {
                    graph: graph.clone(),
                },
            ));
        }
        let Some(id) = self.mapping_id_of(shadow) else {
            return Err(self.fail(
                trap.as_str(),
                MembraneError::invariant(format!("shadow {shadow} not in the weak index")),
            ));
        };
        let mapping = self.mapping(id)?;
        let origin_graph = mapping.origin_graph().clone();
        let Some(field) = mapping.field(graph) else {
            return Err(self.fail(
                trap.as_str(),
                MembraneError::SurrogateNotRecognized {
                    handle: proxy,
                    graph: graph.clone(),
                },
            ));
        };
        if field.dead {
            return Err(self.fail(
                trap.as_str(),
                MembraneError::HandlerIsDead {
                    graph: graph.clone(),
                },
            ));
        }
        if field.surrogate != proxy {
            return Err(self.fail(
                trap.as_str(),
                MembraneError::SurrogateNotRecognized {
                    handle: proxy,
                    graph: graph.clone(),
                },
            ));
        }
        let real = mapping
            .origin_field()
            .map(|f| f.value)
            .ok_or_else(|| MembraneError::invariant("mapping without origin field"))?;
        let disabled = field.is_trap_disabled(trap)
            || mapping
                .field(&origin_graph)
                .is_some_and(|f| f.is_trap_disabled(trap));
        if disabled {
            return Err(self.fail(
                trap.as_str(),
                MembraneError::OperationDisabled {
                    trap: trap.as_str().to_string(),
                    graph: graph.clone(),
                },
            ));
        }
        Ok(TrapCtx {
            mapping: id,
            graph: graph.clone(),
            origin_graph,
            real,
            shadow,
            proxy,
        })
    }

    fn check_key(&self, key: &PropertyKey) -> Result<(), MembraneError> {
        if key.is_empty() {
            return Err(MembraneError::InvalidKey);
        }
        Ok(())
    }

    fn acting_and_origin_fields(
        &self,
        ctx: &TrapCtx,
    ) -> Result<(MappingField, Option<MappingField>), MembraneError> {
        let mapping = self.mapping(ctx.mapping)?;
        let acting = mapping
            .field(&ctx.graph)
            .cloned()
            .ok_or_else(|| MembraneError::invariant("acting field vanished mid-trap"))?;
        let origin = if ctx.origin_graph == ctx.graph {
            None
        } else {
            mapping.field(&ctx.origin_graph).cloned()
        };
        Ok((acting, origin))
    }

    // -- public structural operations ---------------------------------------

    /// `get` with the receiver defaulting to the target itself.
    pub fn get(&mut self, target: ObjectHandle, key: &PropertyKey) -> Result<Value, MembraneError> {
        self.get_with_receiver(target, key, Value::Object(target))
    }

    /// Property lookup: consult local overrides first, then the own
    /// descriptor, then walk the prototype chain; accessor descriptors
    /// run their getter against the original receiver.
    pub fn get_with_receiver(
        &mut self,
        target: ObjectHandle,
        key: &PropertyKey,
        receiver: Value,
    ) -> Result<Value, MembraneError> {
        self.check_key(key)?;
        let mut current = target;
        let mut visited: BTreeSet<ObjectHandle> = BTreeSet::new();
        let mut depth: u32 = 0;
        loop {
            self.chain_guard(&mut visited, &mut depth, current)?;
            let proto = match self.node_route(current, TrapName::Get)? {
                NodeRoute::Ordinary => {
                    if let Some(desc) = self.heap.get_own_property_descriptor(current, key)? {
                        return self.finish_get(desc, receiver);
                    }
                    self.heap.get_prototype_of(current)?
                }
                NodeRoute::Graph(graph, shadow) => {
                    let ctx = self.trap_enter(current, shadow, &graph, TrapName::Get)?;
                    if let Some(desc) = self.trap_own_descriptor(&ctx, key)? {
                        return self.finish_get(desc, receiver);
                    }
                    self.trap_get_prototype_of(&ctx)?
                }
                NodeRoute::Shadow(shadow) => {
                    current = shadow;
                    continue;
                }
                NodeRoute::Override(f, _) => {
                    let reply = f(
                        self,
                        &TrapCall::Get {
                            proxy: current,
                            key: key.clone(),
                            receiver,
                        },
                    )?;
                    return reply.into_value();
                }
            };
            match proto {
                Some(p) => current = p,
                None => return Ok(Value::Undefined),
            }
        }
    }

    fn finish_get(
        &mut self,
        desc: PropertyDescriptor,
        receiver: Value,
    ) -> Result<Value, MembraneError> {
        match desc {
            PropertyDescriptor::Data { value, .. } => Ok(value),
            PropertyDescriptor::Accessor { get: Some(g), .. } => self.call(g, receiver, Vec::new()),
            PropertyDescriptor::Accessor { get: None, .. } => Ok(Value::Undefined),
        }
    }

    /// `has`: own-or-inherited visibility through the chain.
    pub fn has(&mut self, target: ObjectHandle, key: &PropertyKey) -> Result<bool, MembraneError> {
        self.check_key(key)?;
        let mut current = target;
        let mut visited: BTreeSet<ObjectHandle> = BTreeSet::new();
        let mut depth: u32 = 0;
        loop {
            self.chain_guard(&mut visited, &mut depth, current)?;
            let proto = match self.node_route(current, TrapName::Has)? {
                NodeRoute::Ordinary => {
                    if self.heap.ordinary(current)?.has_own_property(key) {
                        return Ok(true);
                    }
                    self.heap.get_prototype_of(current)?
                }
                NodeRoute::Graph(graph, shadow) => {
                    let ctx = self.trap_enter(current, shadow, &graph, TrapName::Has)?;
                    if self.trap_own_descriptor(&ctx, key)?.is_some() {
                        return Ok(true);
                    }
                    self.trap_get_prototype_of(&ctx)?
                }
                NodeRoute::Shadow(shadow) => {
                    current = shadow;
                    continue;
                }
                NodeRoute::Override(f, _) => {
                    let reply = f(
                        self,
                        &TrapCall::Has {
                            proxy: current,
                            key: key.clone(),
                        },
                    )?;
                    return reply.into_bool();
                }
            };
            match proto {
                Some(p) => current = p,
                None => return Ok(false),
            }
        }
    }

    /// `set` with the receiver defaulting to the target itself.
    pub fn set(
        &mut self,
        target: ObjectHandle,
        key: &PropertyKey,
        value: Value,
    ) -> Result<bool, MembraneError> {
        self.set_with_receiver(target, key, value, Value::Object(target))
    }

    /// Assignment: locate the owning descriptor by walking the chain
    /// exactly as `get` does, then apply data or accessor semantics
    /// against the receiver.
    pub fn set_with_receiver(
        &mut self,
        target: ObjectHandle,
        key: &PropertyKey,
        value: Value,
        receiver: Value,
    ) -> Result<bool, MembraneError> {
        self.check_key(key)?;
        let mut current = target;
        let mut visited: BTreeSet<ObjectHandle> = BTreeSet::new();
        let mut depth: u32 = 0;
        let owning: Option<PropertyDescriptor> = loop {
            self.chain_guard(&mut visited, &mut depth, current)?;
            let proto = match self.node_route(current, TrapName::Set)? {
                NodeRoute::Ordinary => {
                    if let Some(desc) = self.heap.get_own_property_descriptor(current, key)? {
                        break Some(desc);
                    }
                    self.heap.get_prototype_of(current)?
                }
                NodeRoute::Graph(graph, shadow) => {
                    let ctx = self.trap_enter(current, shadow, &graph, TrapName::Set)?;
                    if let Some(desc) = self.trap_own_descriptor(&ctx, key)? {
                        break Some(desc);
                    }
                    self.trap_get_prototype_of(&ctx)?
                }
                NodeRoute::Shadow(shadow) => {
                    current = shadow;
                    continue;
                }
                NodeRoute::Override(f, _) => {
                    let reply = f(
                        self,
                        &TrapCall::Set {
                            proxy: current,
                            key: key.clone(),
                            value,
                            receiver,
                        },
                    )?;
                    return reply.into_bool();
                }
            };
            match proto {
                Some(p) => current = p,
                None => break None,
            }
        };

        self.apply_owning_descriptor(owning, key, value, receiver)
    }

    /// Tail of the assignment algorithm: apply data or accessor semantics
    /// for the owning descriptor against the receiver.
    fn apply_owning_descriptor(
        &mut self,
        owning: Option<PropertyDescriptor>,
        key: &PropertyKey,
        value: Value,
        receiver: Value,
    ) -> Result<bool, MembraneError> {
        match owning {
            None => {
                let Some(receiver_handle) = receiver.as_object() else {
                    return Ok(false);
                };
                self.define_property(receiver_handle, key.clone(), PropertyDescriptor::data(value))
            }
            Some(PropertyDescriptor::Data { writable, .. }) => {
                if !writable {
                    return Ok(false);
                }
                let Some(receiver_handle) = receiver.as_object() else {
                    return Ok(false);
                };
                match self.get_own_property_descriptor(receiver_handle, key)? {
                    Some(PropertyDescriptor::Accessor { .. }) => Ok(false),
                    Some(PropertyDescriptor::Data {
                        writable: false, ..
                    }) => Ok(false),
                    Some(PropertyDescriptor::Data {
                        writable: true,
                        enumerable,
                        configurable,
                        ..
                    }) => self.define_property(
                        receiver_handle,
                        key.clone(),
                        PropertyDescriptor::Data {
                            value,
                            writable: true,
                            enumerable,
                            configurable,
                        },
                    ),
                    None => self.define_property(
                        receiver_handle,
                        key.clone(),
                        PropertyDescriptor::data(value),
                    ),
                }
            }
            Some(PropertyDescriptor::Accessor { set: Some(s), .. }) => {
                self.call(s, receiver, vec![value])?;
                Ok(true)
            }
            Some(PropertyDescriptor::Accessor { set: None, .. }) => Ok(false),
        }
    }

    fn chain_guard(
        &self,
        visited: &mut BTreeSet<ObjectHandle>,
        depth: &mut u32,
        current: ObjectHandle,
    ) -> Result<(), MembraneError> {
        if !visited.insert(current) {
            return Err(ObjectError::PrototypeCycleDetected.into());
        }
        *depth += 1;
        if *depth > MAX_PROTOTYPE_CHAIN_DEPTH {
            return Err(ObjectError::PrototypeChainTooDeep {
                depth: *depth,
                max: MAX_PROTOTYPE_CHAIN_DEPTH,
            }
            .into());
        }
        Ok(())
    }

    /// Own property descriptor for this graph's view.
    pub fn get_own_property_descriptor(
        &mut self,
        target: ObjectHandle,
        key: &PropertyKey,
    ) -> Result<Option<PropertyDescriptor>, MembraneError> {
        self.check_key(key)?;
        match self.node_route(target, TrapName::GetOwnPropertyDescriptor)? {
            NodeRoute::Ordinary => Ok(self.heap.get_own_property_descriptor(target, key)?),
            NodeRoute::Graph(graph, shadow) => {
                let ctx =
                    self.trap_enter(target, shadow, &graph, TrapName::GetOwnPropertyDescriptor)?;
                self.trap_own_descriptor(&ctx, key)
            }
            NodeRoute::Shadow(shadow) => self.get_own_property_descriptor(shadow, key),
            NodeRoute::Override(f, _) => {
                let reply = f(
                    self,
                    &TrapCall::GetOwnPropertyDescriptor {
                        proxy: target,
                        key: key.clone(),
                    },
                )?;
                reply.into_maybe_descriptor()
            }
        }
    }

    /// Define or update a property in this graph's view.
    pub fn define_property(
        &mut self,
        target: ObjectHandle,
        key: PropertyKey,
        desc: PropertyDescriptor,
    ) -> Result<bool, MembraneError> {
        self.check_key(&key)?;
        match self.node_route(target, TrapName::DefineProperty)? {
            NodeRoute::Ordinary => Ok(self.heap.define_property(target, key, desc)?),
            NodeRoute::Graph(graph, shadow) => {
                let ctx = self.trap_enter(target, shadow, &graph, TrapName::DefineProperty)?;
                self.trap_define_property(&ctx, key, desc)
            }
            NodeRoute::Shadow(shadow) => self.define_property(shadow, key, desc),
            NodeRoute::Override(f, _) => {
                let reply = f(
                    self,
                    &TrapCall::DefineProperty {
                        proxy: target,
                        key,
                        desc,
                    },
                )?;
                reply.into_bool()
            }
        }
    }

    /// Delete a property from this graph's view.
    pub fn delete_property(
        &mut self,
        target: ObjectHandle,
        key: &PropertyKey,
    ) -> Result<bool, MembraneError> {
        self.check_key(key)?;
        match self.node_route(target, TrapName::DeleteProperty)? {
            NodeRoute::Ordinary => Ok(self.heap.delete_property(target, key)?),
            NodeRoute::Graph(graph, shadow) => {
                let ctx = self.trap_enter(target, shadow, &graph, TrapName::DeleteProperty)?;
                self.trap_delete_property(&ctx, key)
            }
            NodeRoute::Shadow(shadow) => self.delete_property(shadow, key),
            NodeRoute::Override(f, _) => {
                let reply = f(
                    self,
                    &TrapCall::DeleteProperty {
                        proxy: target,
                        key: key.clone(),
                    },
                )?;
                reply.into_bool()
            }
        }
    }

    /// Own keys of this graph's view.
    pub fn own_keys(&mut self, target: ObjectHandle) -> Result<Vec<PropertyKey>, MembraneError> {
        match self.node_route(target, TrapName::OwnKeys)? {
            NodeRoute::Ordinary => Ok(self.heap.own_property_keys(target)?),
            NodeRoute::Graph(graph, shadow) => {
                let ctx = self.trap_enter(target, shadow, &graph, TrapName::OwnKeys)?;
                self.trap_own_keys(&ctx)
            }
            NodeRoute::Shadow(shadow) => self.own_keys(shadow),
            NodeRoute::Override(f, _) => {
                let reply = f(self, &TrapCall::OwnKeys { proxy: target })?;
                reply.into_keys()
            }
        }
    }

    pub fn get_prototype_of(
        &mut self,
        target: ObjectHandle,
    ) -> Result<Option<ObjectHandle>, MembraneError> {
        match self.node_route(target, TrapName::GetPrototypeOf)? {
            NodeRoute::Ordinary => Ok(self.heap.get_prototype_of(target)?),
            NodeRoute::Graph(graph, shadow) => {
                let ctx = self.trap_enter(target, shadow, &graph, TrapName::GetPrototypeOf)?;
                self.trap_get_prototype_of(&ctx)
            }
            NodeRoute::Shadow(shadow) => self.get_prototype_of(shadow),
            NodeRoute::Override(f, _) => {
                let reply = f(self, &TrapCall::GetPrototypeOf { proxy: target })?;
                reply.into_maybe_handle()
            }
        }
    }

    pub fn set_prototype_of(
        &mut self,
        target: ObjectHandle,
        proto: Option<ObjectHandle>,
    ) -> Result<bool, MembraneError> {
        match self.node_route(target, TrapName::SetPrototypeOf)? {
            NodeRoute::Ordinary => Ok(self.heap.set_prototype_of(target, proto)?),
            NodeRoute::Graph(graph, shadow) => {
                let ctx = self.trap_enter(target, shadow, &graph, TrapName::SetPrototypeOf)?;
                self.trap_set_prototype_of(&ctx, proto)
            }
            NodeRoute::Shadow(shadow) => self.set_prototype_of(shadow, proto),
            NodeRoute::Override(f, _) => {
                let reply = f(
                    self,
                    &TrapCall::SetPrototypeOf {
                        proxy: target,
                        proto,
                    },
                )?;
                reply.into_bool()
            }
        }
    }

    pub fn is_extensible(&mut self, target: ObjectHandle) -> Result<bool, MembraneError> {
        match self.node_route(target, TrapName::IsExtensible)? {
            NodeRoute::Ordinary => Ok(self.heap.is_extensible(target)?),
            NodeRoute::Graph(graph, shadow) => {
                let ctx = self.trap_enter(target, shadow, &graph, TrapName::IsExtensible)?;
                self.trap_is_extensible(&ctx)
            }
            NodeRoute::Shadow(shadow) => self.is_extensible(shadow),
            NodeRoute::Override(f, _) => {
                let reply = f(self, &TrapCall::IsExtensible { proxy: target })?;
                reply.into_bool()
            }
        }
    }

    pub fn prevent_extensions(&mut self, target: ObjectHandle) -> Result<bool, MembraneError> {
        match self.node_route(target, TrapName::PreventExtensions)? {
            NodeRoute::Ordinary => Ok(self.heap.prevent_extensions(target)?),
            NodeRoute::Graph(graph, shadow) => {
                let ctx = self.trap_enter(target, shadow, &graph, TrapName::PreventExtensions)?;
                self.trap_prevent_extensions(&ctx)
            }
            NodeRoute::Shadow(shadow) => self.prevent_extensions(shadow),
            NodeRoute::Override(f, _) => {
                let reply = f(self, &TrapCall::PreventExtensions { proxy: target })?;
                reply.into_bool()
            }
        }
    }

    /// Invoke a callable.
    pub fn call(
        &mut self,
        callee: ObjectHandle,
        this: Value,
        args: Vec<Value>,
    ) -> Result<Value, MembraneError> {
        match self.node_route(callee, TrapName::Apply)? {
            NodeRoute::Ordinary => {
                let o = self.heap.ordinary(callee)?;
                let Some(fid) = o.call else {
                    return Err(ObjectError::NotCallable(callee).into());
                };
                let body = self.native(fid)?;
                body(
                    self,
                    &CallContext {
                        this,
                        args,
                        new_target: None,
                        callee,
                    },
                )
            }
            NodeRoute::Graph(graph, shadow) => {
                let ctx = self.trap_enter(callee, shadow, &graph, TrapName::Apply)?;
                self.trap_call(&ctx, this, args)
            }
            NodeRoute::Shadow(shadow) => self.call(shadow, this, args),
            NodeRoute::Override(f, _) => {
                let reply = f(
                    self,
                    &TrapCall::Apply {
                        proxy: callee,
                        this,
                        args,
                    },
                )?;
                reply.into_value()
            }
        }
    }

    /// Invoke a constructor.  The fresh receiver's prototype comes from
    /// the constructor's `prototype` property.
    pub fn construct(
        &mut self,
        callee: ObjectHandle,
        args: Vec<Value>,
        new_target: Option<ObjectHandle>,
    ) -> Result<Value, MembraneError> {
        match self.node_route(callee, TrapName::Construct)? {
            NodeRoute::Ordinary => {
                let o = self.heap.ordinary(callee)?;
                let Some(fid) = o.construct else {
                    return Err(ObjectError::TypeError(format!(
                        "{callee} is not a constructor"
                    ))
                    .into());
                };
                let proto_key = PropertyKey::new("prototype");
                let proto = self
                    .heap
                    .get_own_property_descriptor(callee, &proto_key)?
                    .and_then(|d| d.value().and_then(Value::as_object))
                    .unwrap_or(self.object_prototype());
                let receiver = self.heap.alloc(ObjectKind::Plain, Some(proto));
                let body = self.native(fid)?;
                let result = body(
                    self,
                    &CallContext {
                        this: Value::Object(receiver),
                        args,
                        new_target: new_target.or(Some(callee)),
                        callee,
                    },
                )?;
                Ok(if result.is_object() {
                    result
                } else {
                    Value::Object(receiver)
                })
            }
            NodeRoute::Graph(graph, shadow) => {
                let ctx = self.trap_enter(callee, shadow, &graph, TrapName::Construct)?;
                self.trap_construct(&ctx, args, new_target)
            }
            NodeRoute::Shadow(shadow) => self.construct(shadow, args, new_target),
            NodeRoute::Override(f, _) => {
                let reply = f(
                    self,
                    &TrapCall::Construct {
                        proxy: callee,
                        args,
                        new_target,
                    },
                )?;
                reply.into_value()
            }
        }
    }

    /// `for-in` style enumeration: enumerable keys through the prototype
    /// chain, shadowed keys skipped.
    pub fn for_in_keys(&mut self, target: ObjectHandle) -> Result<Vec<PropertyKey>, MembraneError> {
        let mut result = Vec::new();
        let mut seen: BTreeSet<PropertyKey> = BTreeSet::new();
        let mut visited: BTreeSet<ObjectHandle> = BTreeSet::new();
        let mut depth: u32 = 0;
        let mut current = Some(target);
        while let Some(h) = current {
            self.chain_guard(&mut visited, &mut depth, h)?;
            for key in self.own_keys(h)? {
                if !seen.insert(key.clone()) {
                    continue;
                }
                if let Some(desc) = self.get_own_property_descriptor(h, &key)?
                    && desc.is_enumerable()
                {
                    result.push(key);
                }
            }
            current = self.get_prototype_of(h)?;
        }
        Ok(result)
    }

    // -- freeze / seal through the membrane ----------------------------------

    pub fn freeze_object(&mut self, target: ObjectHandle) -> Result<bool, MembraneError> {
        if !self.heap.is_surrogate(target)? {
            self.heap.freeze(target)?;
            return Ok(true);
        }
        self.prevent_extensions(target)?;
        for key in self.own_keys(target)? {
            if let Some(mut desc) = self.get_own_property_descriptor(target, &key)? {
                desc.set_non_configurable();
                desc.set_non_writable();
                self.define_property(target, key, desc)?;
            }
        }
        Ok(true)
    }

    pub fn seal_object(&mut self, target: ObjectHandle) -> Result<bool, MembraneError> {
        if !self.heap.is_surrogate(target)? {
            self.heap.seal(target)?;
            return Ok(true);
        }
        self.prevent_extensions(target)?;
        for key in self.own_keys(target)? {
            if let Some(mut desc) = self.get_own_property_descriptor(target, &key)? {
                desc.set_non_configurable();
                self.define_property(target, key, desc)?;
            }
        }
        Ok(true)
    }

    pub fn is_frozen_object(&mut self, target: ObjectHandle) -> Result<bool, MembraneError> {
        if !self.heap.is_surrogate(target)? {
            return Ok(self.heap.is_frozen(target)?);
        }
        if self.is_extensible(target)? {
            return Ok(false);
        }
        for key in self.own_keys(target)? {
            if let Some(desc) = self.get_own_property_descriptor(target, &key)?
                && (desc.is_configurable() || desc.is_writable())
            {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn is_sealed_object(&mut self, target: ObjectHandle) -> Result<bool, MembraneError> {
        if !self.heap.is_surrogate(target)? {
            return Ok(self.heap.is_sealed(target)?);
        }
        if self.is_extensible(target)? {
            return Ok(false);
        }
        for key in self.own_keys(target)? {
            if let Some(desc) = self.get_own_property_descriptor(target, &key)?
                && desc.is_configurable()
            {
                return Ok(false);
            }
        }
        Ok(true)
    }

    // -- trap implementations ------------------------------------------------

    /// Own-descriptor resolution for one graph's view: local override
    /// first, then deletion masks and key filters from both graphs, then
    /// the real descriptor wrapped into the acting graph.
    fn trap_own_descriptor(
        &mut self,
        ctx: &TrapCtx,
        key: &PropertyKey,
    ) -> Result<Option<PropertyDescriptor>, MembraneError> {
        let (acting, origin) = self.acting_and_origin_fields(ctx)?;
        if let Some(local) = acting.local_descriptor(key) {
            return Ok(Some(local.clone()));
        }
        let deleted = acting.is_locally_deleted(key)
            || origin.as_ref().is_some_and(|f| f.is_locally_deleted(key));
        let admitted =
            acting.admits_key(key) && origin.as_ref().is_none_or(|f| f.admits_key(key));
        if deleted || !admitted {
            return Ok(None);
        }
        let Some(desc) = self.heap.get_own_property_descriptor(ctx.real, key)? else {
            return Ok(None);
        };
        let origin_ref = self.make_ref(&ctx.origin_graph);
        let acting_ref = self.make_ref(&ctx.graph);
        let wrapped = self.wrap_descriptor(&origin_ref, &acting_ref, &desc)?;
        self.resolve_pending_key(ctx, key, &wrapped)?;
        Ok(Some(wrapped))
    }

    /// Replace a lazily-resolving placeholder on a locked shadow with the
    /// real wrapped descriptor.
    fn resolve_pending_key(
        &mut self,
        ctx: &TrapCtx,
        key: &PropertyKey,
        wrapped: &PropertyDescriptor,
    ) -> Result<(), MembraneError> {
        let pending = self
            .mapping_mut(ctx.mapping)?
            .field_mut(&ctx.graph)
            .is_some_and(|f| f.take_pending_shadow_key(key));
        if pending {
            let _ = self
                .heap
                .define_property(ctx.shadow, key.clone(), wrapped.clone())?;
        }
        Ok(())
    }

    fn trap_own_keys(&mut self, ctx: &TrapCtx) -> Result<Vec<PropertyKey>, MembraneError> {
        let source = self.heap.own_property_keys(ctx.real)?;
        {
            let mapping = self.mapping(ctx.mapping)?;
            if let Some(field) = mapping.field(&ctx.graph)
                && let Some(cached) = field.cached_keys_for(&source)
            {
                return Ok(cached.to_vec());
            }
        }
        let (acting, origin) = self.acting_and_origin_fields(ctx)?;
        let mut keys: Vec<PropertyKey> = source
            .iter()
            .filter(|k| {
                !acting.is_locally_deleted(k)
                    && !origin.as_ref().is_some_and(|f| f.is_locally_deleted(k))
            })
            .filter(|k| acting.admits_key(k) && origin.as_ref().is_none_or(|f| f.admits_key(k)))
            .cloned()
            .collect();
        // Local-only keys from both graphs, deduplicated.
        for key in origin
            .as_ref()
            .map(|f| f.local_keys())
            .unwrap_or_default()
            .into_iter()
            .chain(acting.local_keys())
        {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        // A locked view's reported keys stay a superset of the shadow's
        // non-configurable own keys.
        if !self.heap.is_extensible(ctx.shadow)? {
            let shadow_locked: Vec<PropertyKey> = self
                .heap
                .ordinary(ctx.shadow)?
                .properties
                .iter()
                .filter(|(_, d)| !d.is_configurable())
                .map(|(k, _)| k.clone())
                .collect();
            for key in shadow_locked {
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
        }
        if let Some(field) = self.mapping_mut(ctx.mapping)?.field_mut(&ctx.graph) {
            field.store_cached_keys(source, keys.clone());
        }
        Ok(keys)
    }

    fn trap_define_property(
        &mut self,
        ctx: &TrapCtx,
        key: PropertyKey,
        desc: PropertyDescriptor,
    ) -> Result<bool, MembraneError> {
        let (acting, origin) = self.acting_and_origin_fields(ctx)?;
        let admitted =
            acting.admits_key(&key) && origin.as_ref().is_none_or(|f| f.admits_key(&key));
        let real_has = self.heap.ordinary(ctx.real)?.has_own_property(&key);
        let shadow_locked = !self.heap.is_extensible(ctx.shadow)?;
        // A key that already lives locally stays local on redefinition.
        let should_be_local =
            acting.store_unknown_as_local || acting.local_descriptor(&key).is_some();

        if should_be_local && (!admitted || !real_has) {
            // Unknown or filtered keys are stored locally and never
            // propagate to the original.
            if shadow_locked && !self.heap.ordinary(ctx.shadow)?.has_own_property(&key) {
                return Ok(false);
            }
            if let Some(field) = self.mapping_mut(ctx.mapping)?.field_mut(&ctx.graph) {
                field.set_local_descriptor(key, desc);
                field.invalidate_cached_keys();
            }
            return Ok(true);
        }
        if !admitted {
            return Ok(false);
        }

        let acting_ref = self.make_ref(&ctx.graph);
        let origin_ref = self.make_ref(&ctx.origin_graph);
        let wrapped = self.wrap_descriptor(&acting_ref, &origin_ref, &desc)?;
        let ok = self.heap.define_property(ctx.real, key.clone(), wrapped)?;
        if ok {
            if let Some(field) = self.mapping_mut(ctx.mapping)?.field_mut(&ctx.graph) {
                field.unmask_deletion(&key);
                field.invalidate_cached_keys();
            }
            if shadow_locked {
                let pending = self
                    .mapping_mut(ctx.mapping)?
                    .field_mut(&ctx.graph)
                    .is_some_and(|f| f.take_pending_shadow_key(&key));
                if pending {
                    let _ = self.heap.define_property(ctx.shadow, key, desc)?;
                }
            }
        }
        Ok(ok)
    }

    fn trap_delete_property(
        &mut self,
        ctx: &TrapCtx,
        key: &PropertyKey,
    ) -> Result<bool, MembraneError> {
        let (acting, _) = self.acting_and_origin_fields(ctx)?;
        let shadow_locked = !self.heap.is_extensible(ctx.shadow)?;

        if acting.require_local_delete {
            if shadow_locked
                && self
                    .heap
                    .ordinary(ctx.shadow)?
                    .get_own_property(key)
                    .is_some_and(|d| !d.is_configurable())
            {
                return Ok(false);
            }
            if let Some(field) = self.mapping_mut(ctx.mapping)?.field_mut(&ctx.graph) {
                field.mask_deletion(key.clone());
                field.invalidate_cached_keys();
            }
            return Ok(true);
        }

        let Some(desc) = self.heap.get_own_property_descriptor(ctx.real, key)? else {
            if let Some(field) = self.mapping_mut(ctx.mapping)?.field_mut(&ctx.graph) {
                field.delete_local_descriptor(key);
                field.invalidate_cached_keys();
            }
            return Ok(true);
        };
        if !desc.is_configurable() {
            return Ok(false);
        }
        let ok = self.heap.delete_property(ctx.real, key)?;
        if ok {
            if let Some(field) = self.mapping_mut(ctx.mapping)?.field_mut(&ctx.graph) {
                field.delete_local_descriptor(key);
                field.take_pending_shadow_key(key);
                field.invalidate_cached_keys();
            }
            if shadow_locked {
                let _ = self.heap.delete_property(ctx.shadow, key)?;
            }
        }
        Ok(ok)
    }

    fn trap_get_prototype_of(
        &mut self,
        ctx: &TrapCtx,
    ) -> Result<Option<ObjectHandle>, MembraneError> {
        let Some(real_proto) = self.heap.get_prototype_of(ctx.real)? else {
            return Ok(None);
        };
        let origin_ref = self.make_ref(&ctx.origin_graph);
        let acting_ref = self.make_ref(&ctx.graph);
        let wrapped =
            self.convert_argument_to_proxy(&origin_ref, &acting_ref, Value::Object(real_proto))?;
        wrapped
            .as_object()
            .map(Some)
            .ok_or_else(|| MembraneError::invariant("prototype wrapped to a primitive"))
    }

    fn trap_set_prototype_of(
        &mut self,
        ctx: &TrapCtx,
        proto: Option<ObjectHandle>,
    ) -> Result<bool, MembraneError> {
        let wrapped = match proto {
            None => None,
            Some(p) => {
                let acting_ref = self.make_ref(&ctx.graph);
                let origin_ref = self.make_ref(&ctx.origin_graph);
                let w =
                    self.convert_argument_to_proxy(&acting_ref, &origin_ref, Value::Object(p))?;
                Some(w.as_object().ok_or_else(|| {
                    MembraneError::invariant("prototype wrapped to a primitive")
                })?)
            }
        };
        Ok(self.heap.set_prototype_of(ctx.real, wrapped)?)
    }

    fn trap_is_extensible(&mut self, ctx: &TrapCtx) -> Result<bool, MembraneError> {
        if self.heap.is_extensible(ctx.real)? {
            return Ok(true);
        }
        // First observation of a non-extensible original locks the shadow.
        if self.heap.is_extensible(ctx.shadow)? {
            self.lock_shadow(ctx.mapping, &ctx.graph)?;
        }
        Ok(false)
    }

    fn trap_prevent_extensions(&mut self, ctx: &TrapCtx) -> Result<bool, MembraneError> {
        if !self.heap.is_extensible(ctx.shadow)? {
            return Ok(true);
        }
        self.lock_shadow(ctx.mapping, &ctx.graph)?;
        self.heap.prevent_extensions(ctx.real)?;
        Ok(true)
    }

    // -- call / construct ----------------------------------------------------

    fn trap_call(
        &mut self,
        ctx: &TrapCtx,
        this: Value,
        mut args: Vec<Value>,
    ) -> Result<Value, MembraneError> {
        if let Some(limit) = self.resolve_truncation(ctx)?
            && args.len() > limit
        {
            args.truncate(limit);
        }
        let acting_ref = self.make_ref(&ctx.graph);
        let origin_ref = self.make_ref(&ctx.origin_graph);
        let wrapped_this = self.convert_with_context(
            &acting_ref,
            &origin_ref,
            this.clone(),
            Some((TrapName::Apply, None, true)),
        )?;
        let mut wrapped_args = Vec::with_capacity(args.len());
        for (i, arg) in args.iter().enumerate() {
            wrapped_args.push(self.convert_with_context(
                &acting_ref,
                &origin_ref,
                arg.clone(),
                Some((TrapName::Apply, Some(i), false)),
            )?);
        }

        let mut event = FunctionEvent {
            phase: CallPhase::Enter,
            kind: CallKind::Apply,
            real_target: ctx.real,
            proxy: ctx.proxy,
            this_value: this,
            args,
            acting_graph: ctx.graph.clone(),
            origin_graph: ctx.origin_graph.clone(),
            result: None,
            error: None,
        };
        self.fire_function_event(ctx, &event);

        match self.call(ctx.real, wrapped_this, wrapped_args) {
            Ok(result) => {
                event.phase = CallPhase::Return;
                event.result = Some(result.clone());
                self.fire_function_event(ctx, &event);
                self.convert_argument_to_proxy(&origin_ref, &acting_ref, result)
            }
            Err(error) => {
                event.phase = CallPhase::Throw;
                event.error = Some(error.clone());
                self.fire_function_event(ctx, &event);
                Err(error)
            }
        }
    }

    fn trap_construct(
        &mut self,
        ctx: &TrapCtx,
        mut args: Vec<Value>,
        new_target: Option<ObjectHandle>,
    ) -> Result<Value, MembraneError> {
        if let Some(limit) = self.resolve_truncation(ctx)?
            && args.len() > limit
        {
            args.truncate(limit);
        }
        let acting_ref = self.make_ref(&ctx.graph);
        let origin_ref = self.make_ref(&ctx.origin_graph);
        let mut wrapped_args = Vec::with_capacity(args.len());
        for (i, arg) in args.iter().enumerate() {
            wrapped_args.push(self.convert_with_context(
                &acting_ref,
                &origin_ref,
                arg.clone(),
                Some((TrapName::Construct, Some(i), false)),
            )?);
        }
        let wrapped_new_target = match new_target {
            None => None,
            Some(nt) => self
                .convert_with_context(
                    &acting_ref,
                    &origin_ref,
                    Value::Object(nt),
                    Some((TrapName::Construct, None, false)),
                )?
                .as_object(),
        };

        let mut event = FunctionEvent {
            phase: CallPhase::Enter,
            kind: CallKind::Construct,
            real_target: ctx.real,
            proxy: ctx.proxy,
            this_value: Value::Undefined,
            args,
            acting_graph: ctx.graph.clone(),
            origin_graph: ctx.origin_graph.clone(),
            result: None,
            error: None,
        };
        self.fire_function_event(ctx, &event);

        match self.construct(ctx.real, wrapped_args, wrapped_new_target) {
            Ok(result) => {
                event.phase = CallPhase::Return;
                event.result = Some(result.clone());
                self.fire_function_event(ctx, &event);
                self.convert_argument_to_proxy(&origin_ref, &acting_ref, result)
            }
            Err(error) => {
                event.phase = CallPhase::Throw;
                event.error = Some(error.clone());
                self.fire_function_event(ctx, &event);
                Err(error)
            }
        }
    }

    /// Effective argument ceiling: the minimum of the two graphs'
    /// configured limits, when either is configured.
    fn resolve_truncation(&self, ctx: &TrapCtx) -> Result<Option<usize>, MembraneError> {
        let mapping = self.mapping(ctx.mapping)?;
        let acting = mapping.field(&ctx.graph).and_then(|f| f.truncation);
        let origin = mapping.field(&ctx.origin_graph).and_then(|f| f.truncation);
        let declared = || -> Result<Option<usize>, MembraneError> {
            let key = PropertyKey::new("length");
            Ok(self
                .heap
                .get_own_property_descriptor(ctx.real, &key)?
                .and_then(|d| match d.value() {
                    Some(Value::Int(n)) if *n >= 0 => Some(*n as usize),
                    _ => None,
                }))
        };
        let mut limit: Option<usize> = None;
        for setting in [acting, origin].into_iter().flatten() {
            let n = match setting {
                Truncation::Count(n) => Some(n as usize),
                Truncation::ToDeclared => declared()?,
            };
            if let Some(n) = n {
                limit = Some(limit.map_or(n, |l| l.min(n)));
            }
        }
        Ok(limit)
    }

    /// Fire one call event across the three listener pools: acting
    /// handler, opposite handler, membrane-wide.  Listener failures are
    /// logged and never mask the call's outcome.
    fn fire_function_event(&mut self, ctx: &TrapCtx, event: &FunctionEvent) {
        let mut pool: Vec<FunctionListener> = Vec::new();
        if let Ok(state) = self.handler_state(&ctx.graph) {
            pool.extend(state.function_listeners.iter().cloned());
        }
        if ctx.origin_graph != ctx.graph
            && let Ok(state) = self.handler_state(&ctx.origin_graph)
        {
            pool.extend(state.function_listeners.iter().cloned());
        }
        pool.extend(self.function_listeners.iter().cloned());
        for listener in pool {
            if let Err(err) = listener(event) {
                self.logger
                    .report_error(LogLevel::Error, "function_listener", &err);
            }
        }
    }

    // -- shadow locking ------------------------------------------------------

    /// Lock one graph's shadow: install a lazily-resolving placeholder
    /// for every visible key, mirror the wrapped prototype, and make the
    /// shadow non-extensible.  Terminal; never re-extended.
    pub(crate) fn lock_shadow(
        &mut self,
        id: MappingId,
        graph: &GraphName,
    ) -> Result<(), MembraneError> {
        let (real, shadow) = {
            let mapping = self.mapping(id)?;
            let Some(field) = mapping.field(graph) else {
                return Ok(());
            };
            let Some(shadow) = field.shadow else {
                // Origin fields have no shadow to lock.
                return Ok(());
            };
            let real = mapping
                .origin_field()
                .map(|f| f.value)
                .ok_or_else(|| MembraneError::invariant("mapping without origin field"))?;
            (real, shadow)
        };
        if !self.heap.is_extensible(shadow)? {
            return Ok(());
        }
        for key in self.visible_real_keys(id, graph)? {
            let installed = self.heap.define_property(
                shadow,
                key.clone(),
                PropertyDescriptor::data(Value::Undefined),
            )?;
            if installed
                && let Some(field) = self.mapping_mut(id)?.field_mut(graph)
            {
                field.add_pending_shadow_key(key);
            }
        }
        let origin_graph = self.mapping(id)?.origin_graph().clone();
        let wrapped_proto = match self.heap.get_prototype_of(real)? {
            None => None,
            Some(p) => {
                let origin_ref = self.make_ref(&origin_graph);
                let acting_ref = self.make_ref(graph);
                self.convert_argument_to_proxy(&origin_ref, &acting_ref, Value::Object(p))?
                    .as_object()
            }
        };
        let _ = self.heap.set_prototype_of(shadow, wrapped_proto)?;
        self.heap.prevent_extensions(shadow)?;
        Ok(())
    }

    /// Keys of the real object that this graph's view admits.
    fn visible_real_keys(
        &mut self,
        id: MappingId,
        graph: &GraphName,
    ) -> Result<Vec<PropertyKey>, MembraneError> {
        let (real, origin_graph) = {
            let mapping = self.mapping(id)?;
            let real = mapping
                .origin_field()
                .map(|f| f.value)
                .ok_or_else(|| MembraneError::invariant("mapping without origin field"))?;
            (real, mapping.origin_graph().clone())
        };
        let source = self.heap.own_property_keys(real)?;
        let mapping = self.mapping(id)?;
        let acting = mapping.field(graph).cloned();
        let origin = if &origin_graph == graph {
            None
        } else {
            mapping.field(&origin_graph).cloned()
        };
        Ok(source
            .into_iter()
            .filter(|k| {
                !acting.as_ref().is_some_and(|f| f.is_locally_deleted(k))
                    && !origin.as_ref().is_some_and(|f| f.is_locally_deleted(k))
            })
            .filter(|k| {
                acting.as_ref().is_none_or(|f| f.admits_key(k))
                    && origin.as_ref().is_none_or(|f| f.admits_key(k))
            })
            .collect())
    }

    /// Eagerly resolve every placeholder on a shadow (fast-path setup).
    /// A value still mid-construction defers through the in-construction
    /// registry instead of recursing.
    pub(crate) fn populate_shadow_eagerly(
        &mut self,
        id: MappingId,
        graph: &GraphName,
    ) -> Result<(), MembraneError> {
        let shadow = {
            let mapping = self.mapping(id)?;
            match mapping.field(graph).and_then(|f| f.shadow) {
                Some(shadow) => shadow,
                None => return Ok(()),
            }
        };
        if self.heap.is_extensible(shadow)? {
            // Install placeholders and the mirrored prototype without
            // closing the real side.
            for key in self.visible_real_keys(id, graph)? {
                let installed = self.heap.define_property(
                    shadow,
                    key.clone(),
                    PropertyDescriptor::data(Value::Undefined),
                )?;
                if installed
                    && let Some(field) = self.mapping_mut(id)?.field_mut(graph)
                {
                    field.add_pending_shadow_key(key);
                }
            }
            let (real, origin_graph) = {
                let mapping = self.mapping(id)?;
                let real = mapping
                    .origin_field()
                    .map(|f| f.value)
                    .ok_or_else(|| MembraneError::invariant("mapping without origin field"))?;
                (real, mapping.origin_graph().clone())
            };
            let wrapped_proto = match self.heap.get_prototype_of(real)? {
                None => None,
                Some(p) => {
                    let origin_ref = self.make_ref(&origin_graph);
                    let acting_ref = self.make_ref(graph);
                    self.convert_argument_to_proxy(&origin_ref, &acting_ref, Value::Object(p))?
                        .as_object()
                }
            };
            let _ = self.heap.set_prototype_of(shadow, wrapped_proto)?;
        }
        let pending = {
            let mapping = self.mapping(id)?;
            mapping
                .field(graph)
                .map(|f| f.pending_shadow_keys())
                .unwrap_or_default()
        };
        for key in pending {
            self.resolve_or_defer(id, graph.clone(), key)?;
        }
        Ok(())
    }

    fn resolve_or_defer(
        &mut self,
        id: MappingId,
        graph: GraphName,
        key: PropertyKey,
    ) -> Result<(), MembraneError> {
        let (real, shadow, origin_graph) = {
            let mapping = self.mapping(id)?;
            let Some(field) = mapping.field(&graph) else {
                return Ok(());
            };
            let Some(shadow) = field.shadow else {
                return Ok(());
            };
            let real = mapping
                .origin_field()
                .map(|f| f.value)
                .ok_or_else(|| MembraneError::invariant("mapping without origin field"))?;
            (real, shadow, mapping.origin_graph().clone())
        };
        let Some(desc) = self.heap.get_own_property_descriptor(real, &key)? else {
            return Ok(());
        };
        if let Some(value_handle) = desc.value().and_then(Value::as_object)
            && self
                .handler_state(&graph)?
                .in_construction
                .contains(value_handle)
        {
            let graph_clone = graph.clone();
            let key_clone = key.clone();
            self.handler_state_mut(&graph)?.in_construction.defer(
                value_handle,
                Box::new(move |membrane| membrane.resolve_or_defer(id, graph_clone, key_clone)),
            );
            return Ok(());
        }
        let origin_ref = self.make_ref(&origin_graph);
        let acting_ref = self.make_ref(&graph);
        let wrapped = self.wrap_descriptor(&origin_ref, &acting_ref, &desc)?;
        let _ = self.heap.define_property(shadow, key.clone(), wrapped)?;
        if let Some(field) = self.mapping_mut(id)?.field_mut(&graph) {
            field.take_pending_shadow_key(&key);
        }
        Ok(())
    }

    // -- reified trap execution (chain delegation) ---------------------------

    /// Run one reified operation with the full graph-handler semantics.
    /// This is the target a chain override delegates to when its chain is
    /// rooted in a graph handler.
    pub(crate) fn execute_trap_as_graph(
        &mut self,
        graph: &GraphName,
        call: &TrapCall,
    ) -> Result<crate::modify_rules::TrapReply, MembraneError> {
        use crate::modify_rules::TrapReply;
        let proxy = call.proxy();
        let (shadow, _) = self.heap.surrogate_parts(proxy)?;
        match call {
            TrapCall::OwnKeys { .. } => {
                let ctx = self.trap_enter(proxy, shadow, graph, TrapName::OwnKeys)?;
                Ok(TrapReply::Keys(self.trap_own_keys(&ctx)?))
            }
            TrapCall::Has { key, .. } => {
                let ctx = self.trap_enter(proxy, shadow, graph, TrapName::Has)?;
                if self.trap_own_descriptor(&ctx, key)?.is_some() {
                    return Ok(TrapReply::Bool(true));
                }
                match self.trap_get_prototype_of(&ctx)? {
                    Some(p) => Ok(TrapReply::Bool(self.has(p, key)?)),
                    None => Ok(TrapReply::Bool(false)),
                }
            }
            TrapCall::Get { key, receiver, .. } => {
                let ctx = self.trap_enter(proxy, shadow, graph, TrapName::Get)?;
                if let Some(desc) = self.trap_own_descriptor(&ctx, key)? {
                    return Ok(TrapReply::Value(self.finish_get(desc, receiver.clone())?));
                }
                match self.trap_get_prototype_of(&ctx)? {
                    Some(p) => Ok(TrapReply::Value(self.get_with_receiver(
                        p,
                        key,
                        receiver.clone(),
                    )?)),
                    None => Ok(TrapReply::Value(Value::Undefined)),
                }
            }
            TrapCall::GetOwnPropertyDescriptor { key, .. } => {
                let ctx =
                    self.trap_enter(proxy, shadow, graph, TrapName::GetOwnPropertyDescriptor)?;
                Ok(TrapReply::MaybeDescriptor(
                    self.trap_own_descriptor(&ctx, key)?,
                ))
            }
            TrapCall::GetPrototypeOf { .. } => {
                let ctx = self.trap_enter(proxy, shadow, graph, TrapName::GetPrototypeOf)?;
                Ok(TrapReply::MaybeHandle(self.trap_get_prototype_of(&ctx)?))
            }
            TrapCall::IsExtensible { .. } => {
                let ctx = self.trap_enter(proxy, shadow, graph, TrapName::IsExtensible)?;
                Ok(TrapReply::Bool(self.trap_is_extensible(&ctx)?))
            }
            TrapCall::PreventExtensions { .. } => {
                let ctx = self.trap_enter(proxy, shadow, graph, TrapName::PreventExtensions)?;
                Ok(TrapReply::Bool(self.trap_prevent_extensions(&ctx)?))
            }
            TrapCall::DeleteProperty { key, .. } => {
                let ctx = self.trap_enter(proxy, shadow, graph, TrapName::DeleteProperty)?;
                Ok(TrapReply::Bool(self.trap_delete_property(&ctx, key)?))
            }
            TrapCall::DefineProperty { key, desc, .. } => {
                let ctx = self.trap_enter(proxy, shadow, graph, TrapName::DefineProperty)?;
                Ok(TrapReply::Bool(self.trap_define_property(
                    &ctx,
                    key.clone(),
                    desc.clone(),
                )?))
            }
            TrapCall::Set {
                key,
                value,
                receiver,
                ..
            } => {
                let ctx = self.trap_enter(proxy, shadow, graph, TrapName::Set)?;
                let owning = match self.trap_own_descriptor(&ctx, key)? {
                    Some(desc) => Some(desc),
                    None => match self.trap_get_prototype_of(&ctx)? {
                        Some(p) => {
                            return Ok(TrapReply::Bool(self.set_with_receiver(
                                p,
                                key,
                                value.clone(),
                                receiver.clone(),
                            )?));
                        }
                        None => None,
                    },
                };
                Ok(TrapReply::Bool(self.apply_owning_descriptor(
                    owning,
                    key,
                    value.clone(),
                    receiver.clone(),
                )?))
            }
            TrapCall::SetPrototypeOf { proto, .. } => {
                let ctx = self.trap_enter(proxy, shadow, graph, TrapName::SetPrototypeOf)?;
                Ok(TrapReply::Bool(self.trap_set_prototype_of(&ctx, *proto)?))
            }
            TrapCall::Apply { this, args, .. } => {
                let ctx = self.trap_enter(proxy, shadow, graph, TrapName::Apply)?;
                Ok(TrapReply::Value(
                    self.trap_call(&ctx, this.clone(), args.clone())?,
                ))
            }
            TrapCall::Construct {
                args, new_target, ..
            } => {
                let ctx = self.trap_enter(proxy, shadow, graph, TrapName::Construct)?;
                Ok(TrapReply::Value(self.trap_construct(
                    &ctx,
                    args.clone(),
                    *new_target,
                )?))
            }
        }
    }

    /// Run one reified operation directly against a shadow: the unwrapped
    /// baseline a chain rooted in `Base` delegates to.
    pub(crate) fn execute_trap_on_shadow(
        &mut self,
        shadow: ObjectHandle,
        call: &TrapCall,
    ) -> Result<crate::modify_rules::TrapReply, MembraneError> {
        use crate::modify_rules::TrapReply;
        match call {
            TrapCall::OwnKeys { .. } => Ok(TrapReply::Keys(self.own_keys(shadow)?)),
            TrapCall::Has { key, .. } => Ok(TrapReply::Bool(self.has(shadow, key)?)),
            TrapCall::Get { key, receiver, .. } => Ok(TrapReply::Value(
                self.get_with_receiver(shadow, key, receiver.clone())?,
            )),
            TrapCall::GetOwnPropertyDescriptor { key, .. } => Ok(TrapReply::MaybeDescriptor(
                self.get_own_property_descriptor(shadow, key)?,
            )),
            TrapCall::GetPrototypeOf { .. } => {
                Ok(TrapReply::MaybeHandle(self.get_prototype_of(shadow)?))
            }
            TrapCall::IsExtensible { .. } => Ok(TrapReply::Bool(self.is_extensible(shadow)?)),
            TrapCall::PreventExtensions { .. } => {
                Ok(TrapReply::Bool(self.prevent_extensions(shadow)?))
            }
            TrapCall::DeleteProperty { key, .. } => {
                Ok(TrapReply::Bool(self.delete_property(shadow, key)?))
            }
            TrapCall::DefineProperty { key, desc, .. } => Ok(TrapReply::Bool(
                self.define_property(shadow, key.clone(), desc.clone())?,
            )),
            TrapCall::Set {
                key,
                value,
                receiver,
                ..
            } => Ok(TrapReply::Bool(self.set_with_receiver(
                shadow,
                key,
                value.clone(),
                receiver.clone(),
            )?)),
            TrapCall::SetPrototypeOf { proto, .. } => {
                Ok(TrapReply::Bool(self.set_prototype_of(shadow, *proto)?))
            }
            TrapCall::Apply { this, args, .. } => Ok(TrapReply::Value(self.call(
                shadow,
                this.clone(),
                args.clone(),
            )?)),
            TrapCall::Construct {
                args, new_target, ..
            } => Ok(TrapReply::Value(self.construct(
                shadow,
                args.clone(),
                *new_target,
            )?)),
        }
    }
}
