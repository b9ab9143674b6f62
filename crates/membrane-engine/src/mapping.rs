//! Mapping records: the per-original-value bookkeeping tracking every
//! graph's view of one value.
//!
//! A mapping is created lazily the first time a value crosses into a
//! second graph, extended as the value reaches further graphs, and torn
//! down either individually or en masse when a graph's handler is
//! revoked.  The entry for the origin graph holds the true original; every
//! other entry holds a surrogate plus the shadow it is built on.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::descriptor::{ObjectHandle, PropertyDescriptor, PropertyKey};

// ---------------------------------------------------------------------------
// GraphName
// ---------------------------------------------------------------------------

/// Name of one object graph: a human-readable string or an opaque token.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum GraphName {
    Str(String),
    Token(u64),
}

impl GraphName {
    pub fn new(name: impl Into<String>) -> Self {
        Self::Str(name.into())
    }

    pub fn token(id: u64) -> Self {
        Self::Token(id)
    }

    /// A string graph name must be non-empty; tokens are always valid.
    pub fn is_valid(&self) -> bool {
        match self {
            Self::Str(s) => !s.is_empty(),
            Self::Token(_) => true,
        }
    }
}

impl fmt::Display for GraphName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => write!(f, "{s}"),
            Self::Token(id) => write!(f, "graph-token-{id}"),
        }
    }
}

impl From<&str> for GraphName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

// ---------------------------------------------------------------------------
// TrapName — the thirteen structural interception points
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TrapName {
    OwnKeys,
    Has,
    Get,
    GetOwnPropertyDescriptor,
    GetPrototypeOf,
    IsExtensible,
    PreventExtensions,
    DeleteProperty,
    DefineProperty,
    Set,
    SetPrototypeOf,
    Apply,
    Construct,
}

impl TrapName {
    pub const ALL: [TrapName; 13] = [
        TrapName::OwnKeys,
        TrapName::Has,
        TrapName::Get,
        TrapName::GetOwnPropertyDescriptor,
        TrapName::GetPrototypeOf,
        TrapName::IsExtensible,
        TrapName::PreventExtensions,
        TrapName::DeleteProperty,
        TrapName::DefineProperty,
        TrapName::Set,
        TrapName::SetPrototypeOf,
        TrapName::Apply,
        TrapName::Construct,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::OwnKeys => "ownKeys",
            Self::Has => "has",
            Self::Get => "get",
            Self::GetOwnPropertyDescriptor => "getOwnPropertyDescriptor",
            Self::GetPrototypeOf => "getPrototypeOf",
            Self::IsExtensible => "isExtensible",
            Self::PreventExtensions => "preventExtensions",
            Self::DeleteProperty => "deleteProperty",
            Self::DefineProperty => "defineProperty",
            Self::Set => "set",
            Self::SetPrototypeOf => "setPrototypeOf",
            Self::Apply => "apply",
            Self::Construct => "construct",
        }
    }

    /// Parse the camelCase operation name.
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == name)
    }
}

impl fmt::Display for TrapName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Truncation — argument-count ceiling for call/construct
// ---------------------------------------------------------------------------

/// Argument-truncation setting for one graph's view of a callable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Truncation {
    /// Truncate to the callable's declared parameter count.
    ToDeclared,
    /// Truncate to a fixed count.
    Count(u32),
}

// ---------------------------------------------------------------------------
// KeyFilter — own-keys admission
// ---------------------------------------------------------------------------

/// Key-admission filter: an explicit allow set or an arbitrary predicate.
#[derive(Clone)]
pub enum KeyFilter {
    Allowed(BTreeSet<PropertyKey>),
    Predicate(Rc<dyn Fn(&PropertyKey) -> bool>),
}

impl KeyFilter {
    pub fn from_keys<I, K>(keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<PropertyKey>,
    {
        Self::Allowed(keys.into_iter().map(Into::into).collect())
    }

    pub fn admits(&self, key: &PropertyKey) -> bool {
        match self {
            Self::Allowed(set) => set.contains(key),
            Self::Predicate(f) => f(key),
        }
    }
}

impl fmt::Debug for KeyFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allowed(set) => f.debug_tuple("Allowed").field(set).finish(),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

// ---------------------------------------------------------------------------
// CachedKeys
// ---------------------------------------------------------------------------

/// Key-list cache for one graph's view.  `source` is the unfiltered own
/// key list of the real object at computation time; any change to it
/// invalidates the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedKeys {
    pub source: Vec<PropertyKey>,
    pub computed: Vec<PropertyKey>,
}

// ---------------------------------------------------------------------------
// MappingField — one graph's view of a value
// ---------------------------------------------------------------------------

/// Per-graph state of one mapped value.
///
/// For the origin graph `surrogate == value` and `shadow` is `None`.  For
/// every other graph all three are populated before the field becomes
/// observable.
#[derive(Debug, Clone)]
pub struct MappingField {
    pub value: ObjectHandle,
    pub surrogate: ObjectHandle,
    pub shadow: Option<ObjectHandle>,
    /// Properties that exist only in this graph's view.
    local_descriptors: BTreeMap<PropertyKey, PropertyDescriptor>,
    /// Keys deleted in this graph's view without touching the original.
    deleted_locals: BTreeSet<PropertyKey>,
    /// Key-admission filter for this graph's view.
    own_keys_filter: Option<KeyFilter>,
    /// Cached computed key list.
    cached_keys: Option<CachedKeys>,
    /// Shadow keys installed as placeholders, not yet resolved.
    pending_shadow_keys: BTreeSet<PropertyKey>,
    pub store_unknown_as_local: bool,
    pub require_local_delete: bool,
    pub truncation: Option<Truncation>,
    disabled_traps: BTreeSet<TrapName>,
    /// Set on revocation; a dead field never serves another operation.
    pub dead: bool,
}

impl MappingField {
    /// Origin-graph field: the value stands for itself.
    pub fn origin(value: ObjectHandle) -> Self {
        Self::with_surrogate(value, value, None)
    }

    /// Non-origin field.  Caller guarantees surrogate and shadow are fully
    /// built before the field is inserted.
    pub fn with_surrogate(
        value: ObjectHandle,
        surrogate: ObjectHandle,
        shadow: Option<ObjectHandle>,
    ) -> Self {
        Self {
            value,
            surrogate,
            shadow,
            local_descriptors: BTreeMap::new(),
            deleted_locals: BTreeSet::new(),
            own_keys_filter: None,
            cached_keys: None,
            pending_shadow_keys: BTreeSet::new(),
            store_unknown_as_local: false,
            require_local_delete: false,
            truncation: None,
            disabled_traps: BTreeSet::new(),
            dead: false,
        }
    }

    // -- local descriptors ---------------------------------------------------

    pub fn local_descriptor(&self, key: &PropertyKey) -> Option<&PropertyDescriptor> {
        self.local_descriptors.get(key)
    }

    pub fn set_local_descriptor(&mut self, key: PropertyKey, desc: PropertyDescriptor) {
        self.deleted_locals.remove(&key);
        self.local_descriptors.insert(key, desc);
    }

    /// Delete a local descriptor.  `true` if something was removed.
    pub fn delete_local_descriptor(&mut self, key: &PropertyKey) -> bool {
        self.local_descriptors.remove(key).is_some()
    }

    pub fn local_keys(&self) -> Vec<PropertyKey> {
        self.local_descriptors.keys().cloned().collect()
    }

    // -- deletion masks ------------------------------------------------------

    pub fn mask_deletion(&mut self, key: PropertyKey) {
        self.local_descriptors.remove(&key);
        self.deleted_locals.insert(key);
    }

    pub fn unmask_deletion(&mut self, key: &PropertyKey) {
        self.deleted_locals.remove(key);
    }

    pub fn is_locally_deleted(&self, key: &PropertyKey) -> bool {
        self.deleted_locals.contains(key)
    }

    // -- key filter ----------------------------------------------------------

    pub fn own_keys_filter(&self) -> Option<&KeyFilter> {
        self.own_keys_filter.as_ref()
    }

    pub fn set_own_keys_filter(&mut self, filter: KeyFilter) {
        self.cached_keys = None;
        self.own_keys_filter = Some(filter);
    }

    /// Does this field's filter admit `key`?  A missing filter admits
    /// everything.
    pub fn admits_key(&self, key: &PropertyKey) -> bool {
        self.own_keys_filter.as_ref().is_none_or(|f| f.admits(key))
    }

    // -- key cache -----------------------------------------------------------

    pub fn cached_keys_for(&self, source: &[PropertyKey]) -> Option<&[PropertyKey]> {
        match &self.cached_keys {
            Some(cache) if cache.source == source => Some(&cache.computed),
            _ => None,
        }
    }

    pub fn store_cached_keys(&mut self, source: Vec<PropertyKey>, computed: Vec<PropertyKey>) {
        self.cached_keys = Some(CachedKeys { source, computed });
    }

    pub fn invalidate_cached_keys(&mut self) {
        self.cached_keys = None;
    }

    // -- pending shadow keys -------------------------------------------------

    pub fn add_pending_shadow_key(&mut self, key: PropertyKey) {
        self.pending_shadow_keys.insert(key);
    }

    pub fn take_pending_shadow_key(&mut self, key: &PropertyKey) -> bool {
        self.pending_shadow_keys.remove(key)
    }

    pub fn pending_shadow_keys(&self) -> Vec<PropertyKey> {
        self.pending_shadow_keys.iter().cloned().collect()
    }

    pub fn has_pending_shadow_keys(&self) -> bool {
        !self.pending_shadow_keys.is_empty()
    }

    // -- trap disabling ------------------------------------------------------

    pub fn disable_traps(&mut self, traps: &[TrapName]) {
        self.disabled_traps.extend(traps.iter().copied());
    }

    pub fn is_trap_disabled(&self, trap: TrapName) -> bool {
        self.disabled_traps.contains(&trap)
    }
}

// ---------------------------------------------------------------------------
// Mapping — all graphs' views of one value
// ---------------------------------------------------------------------------

/// Arena id of a mapping record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MappingId(pub u32);

/// The unit of identity for one original value across graphs.
#[derive(Debug, Clone)]
pub struct Mapping {
    origin_graph: GraphName,
    fields: BTreeMap<GraphName, MappingField>,
}

impl Mapping {
    pub fn new(origin_graph: GraphName) -> Self {
        Self {
            origin_graph,
            fields: BTreeMap::new(),
        }
    }

    pub fn origin_graph(&self) -> &GraphName {
        &self.origin_graph
    }

    pub fn is_origin(&self, graph: &GraphName) -> bool {
        &self.origin_graph == graph
    }

    pub fn has_field(&self, graph: &GraphName) -> bool {
        self.fields.contains_key(graph)
    }

    pub fn field(&self, graph: &GraphName) -> Option<&MappingField> {
        self.fields.get(graph)
    }

    pub fn field_mut(&mut self, graph: &GraphName) -> Option<&mut MappingField> {
        self.fields.get_mut(graph)
    }

    pub fn origin_field(&self) -> Option<&MappingField> {
        self.fields.get(&self.origin_graph)
    }

    /// Install a field.  A live field is never overwritten; returns
    /// `false` on conflict so the caller can raise the invariant failure
    /// with context.
    pub fn set_field(&mut self, graph: GraphName, field: MappingField) -> bool {
        match self.fields.get(&graph) {
            Some(existing) if !existing.dead => false,
            _ => {
                self.fields.insert(graph, field);
                true
            }
        }
    }

    pub fn remove_field(&mut self, graph: &GraphName) -> Option<MappingField> {
        self.fields.remove(graph)
    }

    pub fn graphs(&self) -> Vec<GraphName> {
        self.fields.keys().cloned().collect()
    }

    /// Every handle the weak index may know this mapping by: original
    /// values, surrogates, and shadows of all fields.
    pub fn all_known_handles(&self) -> Vec<ObjectHandle> {
        let mut handles = Vec::new();
        for field in self.fields.values() {
            handles.push(field.value);
            handles.push(field.surrogate);
            if let Some(shadow) = field.shadow {
                handles.push(shadow);
            }
        }
        handles.sort_unstable();
        handles.dedup();
        handles
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Value;

    fn str_key(s: &str) -> PropertyKey {
        PropertyKey::new(s)
    }

    // -----------------------------------------------------------------------
    // 1. GraphName
    // -----------------------------------------------------------------------

    #[test]
    fn graph_name_validity() {
        assert!(GraphName::new("wet").is_valid());
        assert!(!GraphName::new("").is_valid());
        assert!(GraphName::token(0).is_valid());
    }

    #[test]
    fn graph_name_display() {
        assert_eq!(GraphName::new("dry").to_string(), "dry");
        assert_eq!(GraphName::token(3).to_string(), "graph-token-3");
    }

    // -----------------------------------------------------------------------
    // 2. TrapName
    // -----------------------------------------------------------------------

    #[test]
    fn trap_name_round_trip() {
        for trap in TrapName::ALL {
            assert_eq!(TrapName::parse(trap.as_str()), Some(trap));
        }
        assert_eq!(TrapName::parse("nope"), None);
    }

    // -----------------------------------------------------------------------
    // 3. KeyFilter
    // -----------------------------------------------------------------------

    #[test]
    fn key_filter_allow_list() {
        let filter = KeyFilter::from_keys(["a", "b"]);
        assert!(filter.admits(&str_key("a")));
        assert!(!filter.admits(&str_key("c")));
    }

    #[test]
    fn key_filter_predicate() {
        let filter = KeyFilter::Predicate(Rc::new(|k: &PropertyKey| !k.as_str().starts_with('_')));
        assert!(filter.admits(&str_key("visible")));
        assert!(!filter.admits(&str_key("_hidden")));
    }

    // -----------------------------------------------------------------------
    // 4. MappingField locals and masks
    // -----------------------------------------------------------------------

    #[test]
    fn local_descriptor_unmasks_deletion() {
        let mut field = MappingField::origin(ObjectHandle(0));
        field.mask_deletion(str_key("a"));
        assert!(field.is_locally_deleted(&str_key("a")));

        field.set_local_descriptor(str_key("a"), PropertyDescriptor::data(Value::Int(1)));
        assert!(!field.is_locally_deleted(&str_key("a")));
        assert!(field.local_descriptor(&str_key("a")).is_some());
    }

    #[test]
    fn mask_deletion_drops_local_descriptor() {
        let mut field = MappingField::origin(ObjectHandle(0));
        field.set_local_descriptor(str_key("a"), PropertyDescriptor::data(Value::Int(1)));
        field.mask_deletion(str_key("a"));
        assert!(field.local_descriptor(&str_key("a")).is_none());
        assert!(field.is_locally_deleted(&str_key("a")));
    }

    #[test]
    fn admits_key_defaults_open() {
        let mut field = MappingField::origin(ObjectHandle(0));
        assert!(field.admits_key(&str_key("anything")));
        field.set_own_keys_filter(KeyFilter::from_keys(["a"]));
        assert!(field.admits_key(&str_key("a")));
        assert!(!field.admits_key(&str_key("anything")));
    }

    // -----------------------------------------------------------------------
    // 5. Key cache
    // -----------------------------------------------------------------------

    #[test]
    fn cached_keys_hit_and_invalidation() {
        let mut field = MappingField::origin(ObjectHandle(0));
        let source = vec![str_key("a"), str_key("b")];
        field.store_cached_keys(source.clone(), vec![str_key("a")]);
        assert_eq!(
            field.cached_keys_for(&source),
            Some(&[str_key("a")][..])
        );

        // A changed source key list misses the cache.
        let grown = vec![str_key("a"), str_key("b"), str_key("c")];
        assert_eq!(field.cached_keys_for(&grown), None);

        field.invalidate_cached_keys();
        assert_eq!(field.cached_keys_for(&source), None);
    }

    // -----------------------------------------------------------------------
    // 6. Mapping fields
    // -----------------------------------------------------------------------

    #[test]
    fn set_field_rejects_live_overwrite() {
        let wet = GraphName::new("wet");
        let dry = GraphName::new("dry");
        let mut mapping = Mapping::new(wet.clone());
        assert!(mapping.set_field(wet.clone(), MappingField::origin(ObjectHandle(0))));
        assert!(mapping.set_field(
            dry.clone(),
            MappingField::with_surrogate(ObjectHandle(0), ObjectHandle(2), Some(ObjectHandle(1)))
        ));
        assert!(
            !mapping.set_field(dry.clone(), MappingField::origin(ObjectHandle(9))),
            "live field must not be replaced"
        );

        // A dead field may be replaced.
        mapping.field_mut(&dry).expect("field").dead = true;
        assert!(mapping.set_field(dry, MappingField::origin(ObjectHandle(9))));
    }

    #[test]
    fn all_known_handles_deduplicated() {
        let wet = GraphName::new("wet");
        let dry = GraphName::new("dry");
        let mut mapping = Mapping::new(wet.clone());
        mapping.set_field(wet, MappingField::origin(ObjectHandle(0)));
        mapping.set_field(
            dry,
            MappingField::with_surrogate(ObjectHandle(0), ObjectHandle(2), Some(ObjectHandle(1))),
        );
        assert_eq!(
            mapping.all_known_handles(),
            vec![ObjectHandle(0), ObjectHandle(1), ObjectHandle(2)]
        );
    }

    #[test]
    fn origin_field_identity() {
        let wet = GraphName::new("wet");
        let mut mapping = Mapping::new(wet.clone());
        mapping.set_field(wet.clone(), MappingField::origin(ObjectHandle(4)));
        let field = mapping.origin_field().expect("origin");
        assert_eq!(field.value, field.surrogate);
        assert_eq!(field.shadow, None);
        assert!(mapping.is_origin(&wet));
    }

    // -----------------------------------------------------------------------
    // 7. Trap disabling
    // -----------------------------------------------------------------------

    #[test]
    fn disable_traps_per_field() {
        let mut field = MappingField::origin(ObjectHandle(0));
        assert!(!field.is_trap_disabled(TrapName::Get));
        field.disable_traps(&[TrapName::Get, TrapName::Set]);
        assert!(field.is_trap_disabled(TrapName::Get));
        assert!(field.is_trap_disabled(TrapName::Set));
        assert!(!field.is_trap_disabled(TrapName::Has));
    }
}
