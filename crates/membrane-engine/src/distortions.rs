//! Declarative distortions: map a value, a prototype, or a predicate to a
//! bundle of distortion settings, applied automatically whenever a
//! matching value is first wrapped.
//!
//! Configuration bundles are plain serializable data, so policy can be
//! kept as JSON and loaded at startup.  Associations are checked in
//! priority order: exact value, then prototype, then predicate.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::descriptor::{ObjectHandle, PropertyKey, Value};
use crate::error::MembraneError;
use crate::mapping::{GraphName, KeyFilter, TrapName, Truncation};
use crate::membrane::{HandlerRef, Membrane};
use crate::notification::{ProxyListener, ProxyMessage, ShadowTargetMode};
use crate::object_model::ObjectKind;

// ---------------------------------------------------------------------------
// TruncateSetting — boolean-or-count, as it appears in config files
// ---------------------------------------------------------------------------

/// Argument-truncation setting as written in configuration: `false` for
/// none, `true` for the callable's declared parameter count, or a fixed
/// count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TruncateSetting {
    Flag(bool),
    Count(u32),
}

impl TruncateSetting {
    pub fn to_truncation(self) -> Option<Truncation> {
        match self {
            Self::Flag(false) => None,
            Self::Flag(true) => Some(Truncation::ToDeclared),
            Self::Count(n) => Some(Truncation::Count(n)),
        }
    }
}

impl Default for TruncateSetting {
    fn default() -> Self {
        Self::Flag(false)
    }
}

// ---------------------------------------------------------------------------
// DistortionsConfig
// ---------------------------------------------------------------------------

/// One bundle of distortion settings.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DistortionsConfig {
    /// Keys this graph's view admits; everything else is hidden.
    pub filter_own_keys: Option<Vec<String>>,
    pub store_unknown_as_local: bool,
    pub require_local_delete: bool,
    /// Close the shape immediately and route operations at the shadow.
    pub use_shadow_target: bool,
    pub truncate_arg_list: TruncateSetting,
    pub disable_traps: Vec<TrapName>,
}

impl DistortionsConfig {
    pub fn from_json_str(json: &str) -> Result<Self, MembraneError> {
        serde_json::from_str(json)
            .map_err(|e| MembraneError::bad_argument(format!("bad distortions config: {e}")))
    }

    pub fn to_json_string(&self) -> Result<String, MembraneError> {
        serde_json::to_string(self)
            .map_err(|e| MembraneError::bad_argument(format!("unserializable config: {e}")))
    }
}

// ---------------------------------------------------------------------------
// DistortionsListener
// ---------------------------------------------------------------------------

type MessagePredicate = Rc<dyn Fn(&ProxyMessage) -> bool>;

#[derive(Default)]
struct DistortionsState {
    by_value: BTreeMap<ObjectHandle, DistortionsConfig>,
    by_prototype: BTreeMap<ObjectHandle, DistortionsConfig>,
    by_filter: Vec<(MessagePredicate, DistortionsConfig)>,
    /// Values allowed to cross graphs unwrapped.
    ignorable: BTreeSet<ObjectHandle>,
}

/// The declarative distortion layer.  Cheap to clone; clones share the
/// same association tables.
#[derive(Clone, Default)]
pub struct DistortionsListener {
    state: Rc<RefCell<DistortionsState>>,
}

impl fmt::Debug for DistortionsListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("DistortionsListener")
            .field("values", &state.by_value.len())
            .field("prototypes", &state.by_prototype.len())
            .field("filters", &state.by_filter.len())
            .field("ignorable", &state.ignorable.len())
            .finish()
    }
}

impl DistortionsListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate a config with one exact value.
    pub fn add_value(&self, value: ObjectHandle, config: DistortionsConfig) {
        self.state.borrow_mut().by_value.insert(value, config);
    }

    /// Associate a config with every element of an iterable of values.
    pub fn add_values<I>(&self, values: I, config: DistortionsConfig)
    where
        I: IntoIterator<Item = ObjectHandle>,
    {
        let mut state = self.state.borrow_mut();
        for value in values {
            state.by_value.insert(value, config.clone());
        }
    }

    /// Associate a config with every instance sharing `prototype`.
    pub fn add_prototype(&self, prototype: ObjectHandle, config: DistortionsConfig) {
        self.state
            .borrow_mut()
            .by_prototype
            .insert(prototype, config);
    }

    /// Associate a config with instances of a constructor: reads the
    /// constructor's `prototype` property and registers it.
    pub fn add_instances_of(
        &self,
        membrane: &mut Membrane,
        constructor: ObjectHandle,
        config: DistortionsConfig,
    ) -> Result<(), MembraneError> {
        let proto_key = PropertyKey::new("prototype");
        let proto = membrane
            .get_own_property_descriptor(constructor, &proto_key)?
            .and_then(|d| d.value().and_then(Value::as_object))
            .ok_or_else(|| {
                MembraneError::bad_argument("constructor has no prototype property")
            })?;
        self.add_prototype(proto, config);
        Ok(())
    }

    /// Associate a config with a predicate over notification metadata.
    pub fn add_filter(&self, predicate: MessagePredicate, config: DistortionsConfig) {
        self.state.borrow_mut().by_filter.push((predicate, config));
    }

    /// Let `value` cross graphs unwrapped.
    pub fn ignore(&self, value: ObjectHandle) {
        self.state.borrow_mut().ignorable.insert(value);
    }

    /// Ignore the membrane's primordial objects, so host intrinsics cross
    /// graphs unwrapped.
    pub fn ignore_primordials(&self, membrane: &Membrane) {
        let mut state = self.state.borrow_mut();
        for handle in membrane.primordials() {
            state.ignorable.insert(*handle);
        }
    }

    fn find_config(
        &self,
        membrane: &Membrane,
        message: &ProxyMessage,
    ) -> Option<DistortionsConfig> {
        let state = self.state.borrow();
        if let Some(config) = state.by_value.get(&message.target()) {
            return Some(config.clone());
        }
        let proto = membrane
            .heap()
            .get_prototype_of(message.target())
            .ok()
            .flatten();
        if let Some(proto) = proto
            && let Some(config) = state.by_prototype.get(&proto)
        {
            return Some(config.clone());
        }
        state
            .by_filter
            .iter()
            .find(|(predicate, _)| predicate(message))
            .map(|(_, config)| config.clone())
    }

    /// Apply a config bundle to one notification, manually.  This is the
    /// one-shot path; the automatic path goes through
    /// [`DistortionsListener::bind_to_handler`].
    pub fn listen_once(
        &self,
        membrane: &mut Membrane,
        message: &mut ProxyMessage,
        config: &DistortionsConfig,
    ) -> Result<(), MembraneError> {
        apply_config(membrane, message, config)
    }

    /// Wire this listener's dispatch into a handler's notification list.
    /// If the handler has not yet claimed its pass-through predicate, an
    /// ignore-set-driven one is installed.
    pub fn bind_to_handler(
        &self,
        membrane: &mut Membrane,
        handler: &HandlerRef,
    ) -> Result<(), MembraneError> {
        let this = self.clone();
        let listener: ProxyListener = Rc::new(move |membrane, message| {
            match this.find_config(membrane, message) {
                Some(config) => apply_config(membrane, message, &config),
                None => Ok(()),
            }
        });
        membrane.add_proxy_listener(handler, listener)?;

        if !membrane.handler_claimed_pass_through(handler.graph_name()) {
            let state = Rc::clone(&self.state);
            membrane.claim_handler_pass_through(
                handler,
                Rc::new(move |value: &Value| match value.as_object() {
                    Some(handle) => state.borrow().ignorable.contains(&handle),
                    None => false,
                }),
            )?;
        }
        Ok(())
    }
}

/// Apply one bundle to a freshly wrapped value.
fn apply_config(
    membrane: &mut Membrane,
    message: &mut ProxyMessage,
    config: &DistortionsConfig,
) -> Result<(), MembraneError> {
    let graph: GraphName = message.graph().clone();
    let Some(proxy) = message.proxy().as_object() else {
        return Ok(());
    };
    let handler = membrane.make_ref(&graph);
    let is_callable = membrane.heap().kind(proxy)? == ObjectKind::Callable;

    let mut rules = membrane.modify_rules();
    if let Some(keys) = &config.filter_own_keys {
        rules.filter_own_keys(
            &handler,
            proxy,
            KeyFilter::from_keys(keys.iter().map(String::as_str)),
        )?;
    }
    if config.store_unknown_as_local {
        rules.store_unknown_as_local(&handler, proxy)?;
    }
    if config.require_local_delete {
        rules.require_local_delete(&handler, proxy)?;
    }
    if let Some(truncation) = config.truncate_arg_list.to_truncation()
        && is_callable
    {
        rules.truncate_arg_list(&handler, proxy, Some(truncation))?;
    }
    if !config.disable_traps.is_empty() {
        rules.disable_traps(&handler, proxy, &config.disable_traps)?;
    }
    if config.use_shadow_target {
        message.use_shadow_target(ShadowTargetMode::Prepared);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // 1. Config serialization
    // -----------------------------------------------------------------------

    #[test]
    fn config_json_round_trip() {
        let config = DistortionsConfig {
            filter_own_keys: Some(vec!["a".into(), "b".into()]),
            store_unknown_as_local: true,
            require_local_delete: false,
            use_shadow_target: false,
            truncate_arg_list: TruncateSetting::Count(2),
            disable_traps: vec![TrapName::SetPrototypeOf],
        };
        let json = config.to_json_string().expect("serialize");
        let back = DistortionsConfig::from_json_str(&json).expect("deserialize");
        assert_eq!(config, back);
    }

    #[test]
    fn config_accepts_boolean_truncation() {
        let config =
            DistortionsConfig::from_json_str(r#"{"truncateArgList": true}"#).expect("parse");
        assert_eq!(config.truncate_arg_list, TruncateSetting::Flag(true));
        assert_eq!(
            config.truncate_arg_list.to_truncation(),
            Some(Truncation::ToDeclared)
        );

        let config =
            DistortionsConfig::from_json_str(r#"{"truncateArgList": 3}"#).expect("parse");
        assert_eq!(
            config.truncate_arg_list.to_truncation(),
            Some(Truncation::Count(3))
        );
    }

    #[test]
    fn config_defaults_are_neutral() {
        let config = DistortionsConfig::from_json_str("{}").expect("parse");
        assert_eq!(config, DistortionsConfig::default());
        assert_eq!(config.truncate_arg_list.to_truncation(), None);
    }

    #[test]
    fn bad_config_is_an_argument_error() {
        let err = DistortionsConfig::from_json_str("{").expect_err("bad json");
        assert!(matches!(err, MembraneError::InvalidArgumentShape { .. }));
    }

    // -----------------------------------------------------------------------
    // 2. Association bookkeeping
    // -----------------------------------------------------------------------

    #[test]
    fn ignore_primordials_fills_ignore_set() {
        let membrane = Membrane::default();
        let listener = DistortionsListener::new();
        listener.ignore_primordials(&membrane);
        let state = listener.state.borrow();
        for handle in membrane.primordials() {
            assert!(state.ignorable.contains(handle));
        }
    }

    #[test]
    fn clones_share_state() {
        let listener = DistortionsListener::new();
        let clone = listener.clone();
        clone.add_value(ObjectHandle(7), DistortionsConfig::default());
        assert!(listener.state.borrow().by_value.contains_key(&ObjectHandle(7)));
    }
}
