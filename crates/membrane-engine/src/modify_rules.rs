//! Rule configuration: the capability-checked facade over mapping-record
//! mutation, plus chain handlers for layering single-operation overrides
//! over an existing graph handler.
//!
//! Every operation first proves that the value it was handed really is a
//! known, live surrogate of the named graph; nothing here mutates state
//! for values the membrane does not recognize.

use std::collections::BTreeMap;
use std::rc::Rc;

use crate::descriptor::{ObjectHandle, PropertyDescriptor, PropertyKey, Value};
use crate::distortions::DistortionsListener;
use crate::error::MembraneError;
use crate::mapping::{GraphName, KeyFilter, MappingId, TrapName, Truncation};
use crate::membrane::{HandlerRef, Membrane};
use crate::object_model::{ChainHandlerId, ObjectKind, SurrogateRouting};

// ---------------------------------------------------------------------------
// TrapCall / TrapReply — the chain-override calling convention
// ---------------------------------------------------------------------------

/// One structural operation, reified for a chain override.
#[derive(Debug, Clone)]
pub enum TrapCall {
    OwnKeys {
        proxy: ObjectHandle,
    },
    Has {
        proxy: ObjectHandle,
        key: PropertyKey,
    },
    Get {
        proxy: ObjectHandle,
        key: PropertyKey,
        receiver: Value,
    },
    GetOwnPropertyDescriptor {
        proxy: ObjectHandle,
        key: PropertyKey,
    },
    GetPrototypeOf {
        proxy: ObjectHandle,
    },
    IsExtensible {
        proxy: ObjectHandle,
    },
    PreventExtensions {
        proxy: ObjectHandle,
    },
    DeleteProperty {
        proxy: ObjectHandle,
        key: PropertyKey,
    },
    DefineProperty {
        proxy: ObjectHandle,
        key: PropertyKey,
        desc: PropertyDescriptor,
    },
    Set {
        proxy: ObjectHandle,
        key: PropertyKey,
        value: Value,
        receiver: Value,
    },
    SetPrototypeOf {
        proxy: ObjectHandle,
        proto: Option<ObjectHandle>,
    },
    Apply {
        proxy: ObjectHandle,
        this: Value,
        args: Vec<Value>,
    },
    Construct {
        proxy: ObjectHandle,
        args: Vec<Value>,
        new_target: Option<ObjectHandle>,
    },
}

impl TrapCall {
    pub fn trap_name(&self) -> TrapName {
        match self {
            Self::OwnKeys { .. } => TrapName::OwnKeys,
            Self::Has { .. } => TrapName::Has,
            Self::Get { .. } => TrapName::Get,
            Self::GetOwnPropertyDescriptor { .. } => TrapName::GetOwnPropertyDescriptor,
            Self::GetPrototypeOf { .. } => TrapName::GetPrototypeOf,
            Self::IsExtensible { .. } => TrapName::IsExtensible,
            Self::PreventExtensions { .. } => TrapName::PreventExtensions,
            Self::DeleteProperty { .. } => TrapName::DeleteProperty,
            Self::DefineProperty { .. } => TrapName::DefineProperty,
            Self::Set { .. } => TrapName::Set,
            Self::SetPrototypeOf { .. } => TrapName::SetPrototypeOf,
            Self::Apply { .. } => TrapName::Apply,
            Self::Construct { .. } => TrapName::Construct,
        }
    }

    /// The surrogate the operation was invoked on.
    pub fn proxy(&self) -> ObjectHandle {
        match self {
            Self::OwnKeys { proxy }
            | Self::Has { proxy, .. }
            | Self::Get { proxy, .. }
            | Self::GetOwnPropertyDescriptor { proxy, .. }
            | Self::GetPrototypeOf { proxy }
            | Self::IsExtensible { proxy }
            | Self::PreventExtensions { proxy }
            | Self::DeleteProperty { proxy, .. }
            | Self::DefineProperty { proxy, .. }
            | Self::Set { proxy, .. }
            | Self::SetPrototypeOf { proxy, .. }
            | Self::Apply { proxy, .. }
            | Self::Construct { proxy, .. } => *proxy,
        }
    }
}

/// Result of a chain override, shaped per operation.
#[derive(Debug, Clone, PartialEq)]
pub enum TrapReply {
    Value(Value),
    Bool(bool),
    Keys(Vec<PropertyKey>),
    MaybeDescriptor(Option<PropertyDescriptor>),
    MaybeHandle(Option<ObjectHandle>),
}

impl TrapReply {
    pub fn into_value(self) -> Result<Value, MembraneError> {
        match self {
            Self::Value(v) => Ok(v),
            other => Err(Self::mismatch("value", &other)),
        }
    }

    pub fn into_bool(self) -> Result<bool, MembraneError> {
        match self {
            Self::Bool(b) => Ok(b),
            other => Err(Self::mismatch("bool", &other)),
        }
    }

    pub fn into_keys(self) -> Result<Vec<PropertyKey>, MembraneError> {
        match self {
            Self::Keys(k) => Ok(k),
            other => Err(Self::mismatch("keys", &other)),
        }
    }

    pub fn into_maybe_descriptor(self) -> Result<Option<PropertyDescriptor>, MembraneError> {
        match self {
            Self::MaybeDescriptor(d) => Ok(d),
            other => Err(Self::mismatch("descriptor", &other)),
        }
    }

    pub fn into_maybe_handle(self) -> Result<Option<ObjectHandle>, MembraneError> {
        match self {
            Self::MaybeHandle(h) => Ok(h),
            other => Err(Self::mismatch("handle", &other)),
        }
    }

    fn mismatch(expected: &str, got: &Self) -> MembraneError {
        MembraneError::invariant(format!(
            "chain override replied with the wrong shape: expected {expected}, got {got:?}"
        ))
    }
}

/// A per-operation override installed on a chain handler.
pub type TrapOverride = Rc<dyn Fn(&mut Membrane, &TrapCall) -> Result<TrapReply, MembraneError>>;

// ---------------------------------------------------------------------------
// ChainHandler
// ---------------------------------------------------------------------------

/// Where a chain handler forwards operations it does not override.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ChainLink {
    Graph(GraphName),
    Chain(ChainHandlerId),
    Base,
}

/// Layered handler: per-operation overrides over an existing handler (or
/// the unwrapped baseline).  `next` is fixed at creation and cannot be
/// redirected afterwards.
pub struct ChainHandler {
    pub(crate) next: ChainLink,
    overrides: BTreeMap<TrapName, TrapOverride>,
}

impl ChainHandler {
    fn new(next: ChainLink) -> Self {
        Self {
            next,
            overrides: BTreeMap::new(),
        }
    }
}

/// Resolution of one operation against a chain.
pub(crate) enum ChainResolution {
    Override(TrapOverride),
    Graph(GraphName),
    Base,
}

impl Membrane {
    fn chain(&self, id: ChainHandlerId) -> Result<&ChainHandler, MembraneError> {
        self.chains
            .get(id.0 as usize)
            .ok_or_else(|| MembraneError::invariant(format!("chain handler {} missing", id.0)))
    }

    /// Walk the chain from `id` for `trap`: the first override wins,
    /// otherwise the chain's root decides.
    pub(crate) fn resolve_chain(
        &self,
        id: ChainHandlerId,
        trap: TrapName,
    ) -> Result<ChainResolution, MembraneError> {
        let mut current = id;
        loop {
            let chain = self.chain(current)?;
            if let Some(f) = chain.overrides.get(&trap) {
                return Ok(ChainResolution::Override(f.clone()));
            }
            match &chain.next {
                ChainLink::Chain(parent) => current = *parent,
                ChainLink::Graph(g) => return Ok(ChainResolution::Graph(g.clone())),
                ChainLink::Base => return Ok(ChainResolution::Base),
            }
        }
    }

    /// The graph a chain is ultimately rooted in, if any.
    pub(crate) fn chain_root(&self, id: ChainHandlerId) -> Result<ChainLink, MembraneError> {
        let mut current = id;
        loop {
            match &self.chain(current)?.next {
                ChainLink::Chain(parent) => current = *parent,
                root => return Ok(root.clone()),
            }
        }
    }

    /// Delegate a reified operation to the handler below `chain`: the
    /// graph handler, the unwrapped baseline, or the next chain link's
    /// own override.  Overrides call this to wrap, rather than replace,
    /// the underlying behavior.
    pub fn chain_next(
        &mut self,
        chain: ChainHandlerId,
        call: &TrapCall,
    ) -> Result<TrapReply, MembraneError> {
        let next = self.chain(chain)?.next.clone();
        let resolution = match next {
            ChainLink::Graph(g) => ChainResolution::Graph(g),
            ChainLink::Base => ChainResolution::Base,
            ChainLink::Chain(parent) => self.resolve_chain(parent, call.trap_name())?,
        };
        match resolution {
            ChainResolution::Override(f) => f(self, call),
            ChainResolution::Graph(g) => self.execute_trap_as_graph(&g, call),
            ChainResolution::Base => {
                let (shadow, _) = self.heap.surrogate_parts(call.proxy())?;
                self.execute_trap_on_shadow(shadow, call)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ModifyRulesApi
// ---------------------------------------------------------------------------

/// The rule-configuration facade.  Obtained from
/// [`Membrane::modify_rules`]; borrows the membrane exclusively for the
/// duration of the configuration calls.
pub struct ModifyRulesApi<'m> {
    membrane: &'m mut Membrane,
}

impl<'m> ModifyRulesApi<'m> {
    pub(crate) fn new(membrane: &'m mut Membrane) -> Self {
        Self { membrane }
    }

    /// Prove `surrogate` is a live surrogate of `graph` and return its
    /// mapping.
    fn known_surrogate(
        &self,
        graph: &HandlerRef,
        surrogate: ObjectHandle,
    ) -> Result<MappingId, MembraneError> {
        self.membrane.check_handler(graph)?;
        let not_recognized = || MembraneError::SurrogateNotRecognized {
            handle: surrogate,
            graph: graph.graph_name().clone(),
        };
        let id = self
            .membrane
            .mapping_id_of(surrogate)
            .ok_or_else(not_recognized)?;
        let mapping = self.membrane.mapping(id)?;
        let field = mapping.field(graph.graph_name()).ok_or_else(not_recognized)?;
        if field.dead || field.surrogate != surrogate {
            return Err(not_recognized());
        }
        Ok(id)
    }

    /// Install a key-admission filter on one graph's view of a value.
    /// Rejected once the shadow is non-extensible: the reported key set
    /// is already pinned and filtering it would create an unfixable
    /// inconsistency.
    pub fn filter_own_keys(
        &mut self,
        graph: &HandlerRef,
        surrogate: ObjectHandle,
        filter: KeyFilter,
    ) -> Result<(), MembraneError> {
        let id = self.known_surrogate(graph, surrogate)?;
        let shadow = self
            .membrane
            .mapping(id)?
            .field(graph.graph_name())
            .and_then(|f| f.shadow);
        if let Some(shadow) = shadow
            && !self.membrane.heap.is_extensible(shadow)?
        {
            return Err(self.membrane.fail(
                "filter_own_keys",
                MembraneError::bad_argument("cannot filter keys of a non-extensible view"),
            ));
        }
        if let Some(field) = self
            .membrane
            .mapping_mut(id)?
            .field_mut(graph.graph_name())
        {
            field.set_own_keys_filter(filter);
        }
        Ok(())
    }

    /// New properties defined through this graph's view stay local to it.
    pub fn store_unknown_as_local(
        &mut self,
        graph: &HandlerRef,
        surrogate: ObjectHandle,
    ) -> Result<(), MembraneError> {
        let id = self.known_surrogate(graph, surrogate)?;
        if let Some(field) = self
            .membrane
            .mapping_mut(id)?
            .field_mut(graph.graph_name())
        {
            field.store_unknown_as_local = true;
        }
        Ok(())
    }

    /// Deletions through this graph's view mask the key locally instead
    /// of deleting from the original.
    pub fn require_local_delete(
        &mut self,
        graph: &HandlerRef,
        surrogate: ObjectHandle,
    ) -> Result<(), MembraneError> {
        let id = self.known_surrogate(graph, surrogate)?;
        if let Some(field) = self
            .membrane
            .mapping_mut(id)?
            .field_mut(graph.graph_name())
        {
            field.require_local_delete = true;
        }
        Ok(())
    }

    /// Configure an argument-count ceiling for call/construct through
    /// this graph's view of a callable.
    pub fn truncate_arg_list(
        &mut self,
        graph: &HandlerRef,
        surrogate: ObjectHandle,
        setting: Option<Truncation>,
    ) -> Result<(), MembraneError> {
        let id = self.known_surrogate(graph, surrogate)?;
        if self.membrane.heap.kind(surrogate)? != ObjectKind::Callable {
            return Err(self.membrane.fail(
                "truncate_arg_list",
                MembraneError::bad_argument("argument truncation requires a callable"),
            ));
        }
        if let Some(field) = self
            .membrane
            .mapping_mut(id)?
            .field_mut(graph.graph_name())
        {
            field.truncation = setting;
        }
        Ok(())
    }

    /// Mark named operations dead for this value on this graph.
    pub fn disable_traps(
        &mut self,
        graph: &HandlerRef,
        surrogate: ObjectHandle,
        traps: &[TrapName],
    ) -> Result<(), MembraneError> {
        if traps.is_empty() {
            return Err(self.membrane.fail(
                "disable_traps",
                MembraneError::bad_argument("trap list must not be empty"),
            ));
        }
        let id = self.known_surrogate(graph, surrogate)?;
        if let Some(field) = self
            .membrane
            .mapping_mut(id)?
            .field_mut(graph.graph_name())
        {
            field.disable_traps(traps);
        }
        Ok(())
    }

    // -- chain handlers ------------------------------------------------------

    /// Chain handler layered over a graph handler.
    pub fn create_chain_handler(
        &mut self,
        base: &HandlerRef,
    ) -> Result<ChainHandlerId, MembraneError> {
        self.membrane
            .check_handler(base)
            .map_err(|e| self.membrane.fail("create_chain_handler", e))?;
        Ok(self.push_chain(ChainLink::Graph(base.graph_name().clone())))
    }

    /// Chain handler rooted in the unwrapped baseline: unhandled
    /// operations apply directly to the shadow.
    pub fn create_base_chain_handler(&mut self) -> ChainHandlerId {
        self.push_chain(ChainLink::Base)
    }

    /// Chain handler layered over another chain handler.
    pub fn extend_chain_handler(
        &mut self,
        parent: ChainHandlerId,
    ) -> Result<ChainHandlerId, MembraneError> {
        self.membrane.chain(parent)?;
        Ok(self.push_chain(ChainLink::Chain(parent)))
    }

    fn push_chain(&mut self, next: ChainLink) -> ChainHandlerId {
        let id = ChainHandlerId(self.membrane.chains.len() as u32);
        self.membrane.chains.push(ChainHandler::new(next));
        id
    }

    /// Install a single-operation override on a chain handler.
    pub fn set_chain_override(
        &mut self,
        chain: ChainHandlerId,
        trap: TrapName,
        body: TrapOverride,
    ) -> Result<(), MembraneError> {
        self.membrane.chain(chain)?;
        let slot = self
            .membrane
            .chains
            .get_mut(chain.0 as usize)
            .ok_or_else(|| MembraneError::invariant("chain vanished"))?;
        slot.overrides.insert(trap, body);
        Ok(())
    }

    /// Swap a live surrogate for a freshly built one under a chain
    /// handler.  The chain must be rooted in the surrogate's own graph or
    /// in the unwrapped baseline.
    pub fn replace_proxy(
        &mut self,
        old_surrogate: ObjectHandle,
        chain: ChainHandlerId,
    ) -> Result<ObjectHandle, MembraneError> {
        let (shadow, routing) = self
            .membrane
            .heap
            .surrogate_parts(old_surrogate)
            .map_err(MembraneError::from)?;
        let graph = match &routing {
            SurrogateRouting::Graph(g) | SurrogateRouting::Forward(g) => Some(g.clone()),
            SurrogateRouting::Chain(old_chain) => match self.membrane.chain_root(*old_chain)? {
                ChainLink::Graph(g) => Some(g),
                ChainLink::Base | ChainLink::Chain(_) => None,
            },
            SurrogateRouting::Base => None,
        }
        .ok_or_else(|| {
            self.membrane.fail(
                "replace_proxy",
                MembraneError::bad_argument("only graph-rooted surrogates can be replaced"),
            )
        })?;
        match self.membrane.chain_root(chain)? {
            ChainLink::Graph(root) if root == graph => {}
            ChainLink::Base => {}
            _ => {
                return Err(self.membrane.fail(
                    "replace_proxy",
                    MembraneError::bad_argument(
                        "replacement handler is not rooted in the surrogate's graph",
                    ),
                ));
            }
        }
        let handler_ref = self.membrane.make_ref(&graph);
        let id = self.known_surrogate(&handler_ref, old_surrogate)?;

        let new_surrogate = self
            .membrane
            .heap
            .alloc_surrogate(shadow, SurrogateRouting::Chain(chain));
        let _ = self.membrane.heap.revoke_surrogate(old_surrogate);
        self.membrane.map_index.remove(&old_surrogate);
        self.membrane.map_index.insert(new_surrogate, id);
        if let Some(field) = self
            .membrane
            .mapping_mut(id)?
            .field_mut(&graph)
        {
            field.surrogate = new_surrogate;
        }
        let state = self.membrane.handler_state_mut(&graph)?;
        state.issued.retain(|h| *h != old_surrogate);
        state.issued.push(new_surrogate);
        Ok(new_surrogate)
    }

    /// Factory for the declarative distortion layer.
    pub fn create_distortions_listener(&self) -> DistortionsListener {
        DistortionsListener::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Value;
    use crate::membrane::{Membrane, MembraneOptions};

    fn setup() -> (Membrane, HandlerRef, HandlerRef, ObjectHandle, ObjectHandle) {
        let mut membrane = Membrane::new(MembraneOptions::default());
        let wet = membrane.get_handler_by_name("wet", true).expect("wet");
        let dry = membrane.get_handler_by_name("dry", true).expect("dry");
        let value = membrane.alloc_plain();
        let proxy = membrane
            .convert_argument_to_proxy(&wet, &dry, Value::Object(value))
            .expect("wrap")
            .as_object()
            .expect("object");
        (membrane, wet, dry, value, proxy)
    }

    // -----------------------------------------------------------------------
    // 1. Surrogate recognition
    // -----------------------------------------------------------------------

    #[test]
    fn rules_reject_unknown_surrogate() {
        let (mut membrane, _wet, dry, value, _proxy) = setup();
        // The original value is not a dry surrogate.
        let err = membrane
            .modify_rules()
            .store_unknown_as_local(&dry, value)
            .expect_err("not a surrogate");
        assert!(matches!(err, MembraneError::SurrogateNotRecognized { .. }));
    }

    #[test]
    fn rules_reject_wrong_graph() {
        let (mut membrane, wet, _dry, _value, proxy) = setup();
        let err = membrane
            .modify_rules()
            .require_local_delete(&wet, proxy)
            .expect_err("dry proxy on wet handler");
        assert!(matches!(err, MembraneError::SurrogateNotRecognized { .. }));
    }

    // -----------------------------------------------------------------------
    // 2. Key filters
    // -----------------------------------------------------------------------

    #[test]
    fn filter_rejected_on_locked_view() {
        let (mut membrane, _wet, dry, _value, proxy) = setup();
        membrane.prevent_extensions(proxy).expect("lock");
        let err = membrane
            .modify_rules()
            .filter_own_keys(&dry, proxy, KeyFilter::from_keys(["a"]))
            .expect_err("locked");
        assert!(matches!(err, MembraneError::InvalidArgumentShape { .. }));
    }

    // -----------------------------------------------------------------------
    // 3. Truncation validation
    // -----------------------------------------------------------------------

    #[test]
    fn truncation_requires_callable() {
        let (mut membrane, _wet, dry, _value, proxy) = setup();
        let err = membrane
            .modify_rules()
            .truncate_arg_list(&dry, proxy, Some(Truncation::Count(1)))
            .expect_err("plain object");
        assert!(matches!(err, MembraneError::InvalidArgumentShape { .. }));
    }

    // -----------------------------------------------------------------------
    // 4. Disable traps validation
    // -----------------------------------------------------------------------

    #[test]
    fn disable_traps_rejects_empty_list() {
        let (mut membrane, _wet, dry, _value, proxy) = setup();
        let err = membrane
            .modify_rules()
            .disable_traps(&dry, proxy, &[])
            .expect_err("empty");
        assert!(matches!(err, MembraneError::InvalidArgumentShape { .. }));
    }

    // -----------------------------------------------------------------------
    // 5. Chain handlers
    // -----------------------------------------------------------------------

    #[test]
    fn chain_resolution_prefers_nearest_override() {
        let (mut membrane, _wet, dry, _value, _proxy) = setup();
        let mut rules = membrane.modify_rules();
        let parent = rules.create_chain_handler(&dry).expect("parent");
        let child = rules.extend_chain_handler(parent).expect("child");
        rules
            .set_chain_override(
                parent,
                TrapName::Get,
                Rc::new(|_, _| Ok(TrapReply::Value(Value::Int(1)))),
            )
            .expect("parent override");
        rules
            .set_chain_override(
                child,
                TrapName::Get,
                Rc::new(|_, _| Ok(TrapReply::Value(Value::Int(2)))),
            )
            .expect("child override");

        match membrane.resolve_chain(child, TrapName::Get).expect("resolve") {
            ChainResolution::Override(f) => {
                let reply = f(
                    &mut Membrane::default(),
                    &TrapCall::OwnKeys {
                        proxy: ObjectHandle(0),
                    },
                )
                .expect("call");
                assert_eq!(reply, TrapReply::Value(Value::Int(2)));
            }
            _ => panic!("expected an override"),
        }
    }

    #[test]
    fn chain_resolution_falls_back_to_root() {
        let (mut membrane, _wet, dry, _value, _proxy) = setup();
        let chain = membrane
            .modify_rules()
            .create_chain_handler(&dry)
            .expect("chain");
        match membrane.resolve_chain(chain, TrapName::Has).expect("resolve") {
            ChainResolution::Graph(g) => assert_eq!(g, GraphName::new("dry")),
            _ => panic!("expected graph root"),
        }
    }

    #[test]
    fn replace_proxy_requires_matching_root() {
        let (mut membrane, wet, _dry, _value, proxy) = setup();
        let foreign_chain = membrane
            .modify_rules()
            .create_chain_handler(&wet)
            .expect("wet chain");
        let err = membrane
            .modify_rules()
            .replace_proxy(proxy, foreign_chain)
            .expect_err("wrong root");
        assert!(matches!(err, MembraneError::InvalidArgumentShape { .. }));
    }

    #[test]
    fn replace_proxy_swaps_surrogate() {
        let (mut membrane, wet, dry, value, proxy) = setup();
        let chain = membrane
            .modify_rules()
            .create_chain_handler(&dry)
            .expect("chain");
        let replacement = membrane
            .modify_rules()
            .replace_proxy(proxy, chain)
            .expect("replace");
        assert_ne!(replacement, proxy);

        // The mapping now reports the replacement surrogate.
        let (found, reported) =
            membrane.get_membrane_proxy(&GraphName::new("dry"), Value::Object(value));
        assert!(found);
        assert_eq!(reported, Value::Object(replacement));

        // Conversion returns the replacement too.
        let out = membrane
            .convert_argument_to_proxy(&wet, &dry, Value::Object(value))
            .expect("convert");
        assert_eq!(out, Value::Object(replacement));
    }

    #[test]
    fn trap_reply_shape_mismatch_is_invariant() {
        let reply = TrapReply::Bool(true);
        let err = reply.into_value().expect_err("mismatch");
        assert!(matches!(err, MembraneError::InvariantViolation { .. }));
    }
}
