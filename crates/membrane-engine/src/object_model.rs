//! Single-realm object model: the structured values the membrane mediates.
//!
//! The heap is an arena of managed objects.  An object is either
//! **ordinary** (prototype slot, extensibility flag, own property table,
//! optional call/construct slots) or a **surrogate** (the stand-in handed
//! to a foreign graph; it carries a shadow object and a routing record
//! telling the membrane which operation handler owns it).
//!
//! Key properties:
//! - `BTreeMap`/`BTreeSet` everywhere for deterministic iteration.
//! - Arena handles, no interior mutability, no reference counting of
//!   objects.  Lifetimes are managed explicitly by revocation.
//! - The ordinary-object algorithms (define, delete, key enumeration,
//!   freeze/seal) live here; everything surrogate-related is routed by the
//!   membrane's operation handlers, never resolved inside the heap.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::descriptor::{ObjectHandle, PropertyDescriptor, PropertyKey, Value};
use crate::mapping::GraphName;

/// Maximum prototype chain depth tolerated by chain walks.
pub const MAX_PROTOTYPE_CHAIN_DEPTH: u32 = 1024;

// ---------------------------------------------------------------------------
// ObjectError
// ---------------------------------------------------------------------------

/// Errors from heap-level object operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectError {
    /// Structural-operation rejection with a message.
    TypeError(String),
    /// Object not found in the heap.
    ObjectNotFound(ObjectHandle),
    /// The surrogate has been revoked.
    SurrogateRevoked(ObjectHandle),
    /// An ordinary-object operation reached a surrogate.
    UnexpectedSurrogate(ObjectHandle),
    /// Prototype chain cycle detected.
    PrototypeCycleDetected,
    /// Maximum prototype chain depth exceeded.
    PrototypeChainTooDeep { depth: u32, max: u32 },
    /// The object is not callable.
    NotCallable(ObjectHandle),
    /// Unknown function slot.
    FunctionNotFound(FunctionId),
}

impl fmt::Display for ObjectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TypeError(msg) => write!(f, "type error: {msg}"),
            Self::ObjectNotFound(h) => write!(f, "{h} not found"),
            Self::SurrogateRevoked(h) => write!(f, "surrogate {h} has been revoked"),
            Self::UnexpectedSurrogate(h) => {
                write!(f, "{h} is a surrogate; operation must be routed by its handler")
            }
            Self::PrototypeCycleDetected => write!(f, "prototype chain cycle detected"),
            Self::PrototypeChainTooDeep { depth, max } => {
                write!(f, "prototype chain depth {depth} exceeds max {max}")
            }
            Self::NotCallable(h) => write!(f, "{h} is not callable"),
            Self::FunctionNotFound(id) => write!(f, "function slot {} not found", id.0),
        }
    }
}

impl std::error::Error for ObjectError {}

// ---------------------------------------------------------------------------
// ObjectKind — closed shape tag
// ---------------------------------------------------------------------------

/// Shape of an object, chosen once at allocation.  A shadow always copies
/// the kind of its original so a surrogate presents the same callable or
/// indexable surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Plain,
    Indexable,
    Callable,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain => write!(f, "plain"),
            Self::Indexable => write!(f, "indexable"),
            Self::Callable => write!(f, "callable"),
        }
    }
}

// ---------------------------------------------------------------------------
// Function and chain-handler ids
// ---------------------------------------------------------------------------

/// Slot id into the membrane's native function table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FunctionId(pub u32);

/// Arena id of a chain handler registered with the membrane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChainHandlerId(pub u32);

// ---------------------------------------------------------------------------
// SurrogateRouting — which handler resolves a surrogate's operations
// ---------------------------------------------------------------------------

/// Routing record stored on a surrogate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SurrogateRouting {
    /// Full per-graph operation handler.
    Graph(GraphName),
    /// Layered handler with per-operation overrides.
    Chain(ChainHandlerId),
    /// Lightweight forwarding surrogate for callables: call/construct stay
    /// mediated by the graph handler, everything else hits the shadow.
    Forward(GraphName),
    /// Unwrapped baseline: operations apply directly to the shadow.
    Base,
}

impl SurrogateRouting {
    /// The graph this routing is ultimately rooted in, when it is rooted
    /// in one at all.  Chain roots are resolved by the membrane, which
    /// owns the chain table.
    pub fn graph(&self) -> Option<&GraphName> {
        match self {
            Self::Graph(g) | Self::Forward(g) => Some(g),
            Self::Chain(_) | Self::Base => None,
        }
    }
}

// ---------------------------------------------------------------------------
// OrdinaryObject
// ---------------------------------------------------------------------------

/// An ordinary object with internal slots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrdinaryObject {
    /// Prototype slot (`None` ends the chain).
    pub prototype: Option<ObjectHandle>,
    /// Extensibility flag.  Once cleared it never comes back.
    pub extensible: bool,
    /// Own properties.
    pub properties: BTreeMap<PropertyKey, PropertyDescriptor>,
    /// Shape tag.
    pub kind: ObjectKind,
    /// Call slot, for callable objects.
    pub call: Option<FunctionId>,
    /// Construct slot, for constructable objects.
    pub construct: Option<FunctionId>,
}

impl OrdinaryObject {
    pub fn new(kind: ObjectKind, prototype: Option<ObjectHandle>) -> Self {
        Self {
            prototype,
            extensible: true,
            properties: BTreeMap::new(),
            kind,
            call: None,
            construct: None,
        }
    }

    pub fn get_own_property(&self, key: &PropertyKey) -> Option<&PropertyDescriptor> {
        self.properties.get(key)
    }

    pub fn has_own_property(&self, key: &PropertyKey) -> bool {
        self.properties.contains_key(key)
    }

    /// Define or update an own property.  Returns `Ok(true)` on success,
    /// `Ok(false)` when rejected by a non-configurable conflict or by
    /// non-extensibility.
    pub fn define_own_property(
        &mut self,
        key: PropertyKey,
        desc: PropertyDescriptor,
    ) -> Result<bool, ObjectError> {
        match self.properties.get(&key) {
            Some(current) => {
                if !current.is_configurable() && !Self::compatible_with_locked(current, &desc) {
                    return Ok(false);
                }
                self.properties.insert(key, desc);
                Ok(true)
            }
            None => {
                if !self.extensible {
                    return Ok(false);
                }
                self.properties.insert(key, desc);
                Ok(true)
            }
        }
    }

    /// May `desc` replace a non-configurable `current`?
    fn compatible_with_locked(current: &PropertyDescriptor, desc: &PropertyDescriptor) -> bool {
        if desc.is_configurable() {
            return false;
        }
        if desc.is_enumerable() != current.is_enumerable() {
            return false;
        }
        if current.is_data() != desc.is_data() {
            return false;
        }
        match (current, desc) {
            (
                PropertyDescriptor::Data {
                    writable: cur_w,
                    value: cur_v,
                    ..
                },
                PropertyDescriptor::Data {
                    writable: new_w,
                    value: new_v,
                    ..
                },
            ) => {
                if *cur_w {
                    true
                } else {
                    // Non-writable non-configurable: value and writability
                    // are both pinned.
                    !*new_w && cur_v.same_value(new_v)
                }
            }
            (
                PropertyDescriptor::Accessor {
                    get: cur_get,
                    set: cur_set,
                    ..
                },
                PropertyDescriptor::Accessor {
                    get: new_get,
                    set: new_set,
                    ..
                },
            ) => cur_get == new_get && cur_set == new_set,
            _ => false,
        }
    }

    /// Delete an own property.  `false` if it exists and is
    /// non-configurable; vacuously `true` if absent.
    pub fn delete(&mut self, key: &PropertyKey) -> bool {
        match self.properties.get(key) {
            Some(desc) if !desc.is_configurable() => false,
            Some(_) => {
                self.properties.remove(key);
                true
            }
            None => true,
        }
    }

    /// Own keys in enumeration order: integer-like keys numerically first,
    /// then the remaining string keys in lexicographic order.
    pub fn own_property_keys(&self) -> Vec<PropertyKey> {
        let mut index_keys: Vec<(u64, PropertyKey)> = Vec::new();
        let mut str_keys: Vec<PropertyKey> = Vec::new();
        for key in self.properties.keys() {
            match key.as_index() {
                Some(n) => index_keys.push((n, key.clone())),
                None => str_keys.push(key.clone()),
            }
        }
        index_keys.sort_by_key(|(n, _)| *n);
        let mut result: Vec<PropertyKey> = index_keys.into_iter().map(|(_, k)| k).collect();
        result.extend(str_keys);
        result
    }

    pub fn prevent_extensions(&mut self) {
        self.extensible = false;
    }

    /// Freeze: non-extensible, all own properties non-configurable, data
    /// properties non-writable.
    pub fn freeze(&mut self) {
        self.extensible = false;
        for desc in self.properties.values_mut() {
            desc.set_non_configurable();
            desc.set_non_writable();
        }
    }

    /// Seal: non-extensible, all own properties non-configurable,
    /// writability untouched.
    pub fn seal(&mut self) {
        self.extensible = false;
        for desc in self.properties.values_mut() {
            desc.set_non_configurable();
        }
    }

    pub fn is_frozen(&self) -> bool {
        !self.extensible
            && self.properties.values().all(|d| {
                !d.is_configurable()
                    && match d {
                        PropertyDescriptor::Data { writable, .. } => !writable,
                        PropertyDescriptor::Accessor { .. } => true,
                    }
            })
    }

    pub fn is_sealed(&self) -> bool {
        !self.extensible && self.properties.values().all(|d| !d.is_configurable())
    }

    pub fn is_callable(&self) -> bool {
        self.kind == ObjectKind::Callable
    }
}

// ---------------------------------------------------------------------------
// SurrogateObject
// ---------------------------------------------------------------------------

/// Surrogate internal state.  Revocation clears the shadow link, which is
/// what makes every operation fail permanently; the routing record is kept
/// so diagnostics can still name the graph that issued the surrogate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurrogateObject {
    shadow: Option<ObjectHandle>,
    routing: SurrogateRouting,
}

impl SurrogateObject {
    pub fn new(shadow: ObjectHandle, routing: SurrogateRouting) -> Self {
        Self {
            shadow: Some(shadow),
            routing,
        }
    }

    pub fn revoke(&mut self) {
        self.shadow = None;
    }

    pub fn is_revoked(&self) -> bool {
        self.shadow.is_none()
    }

    pub fn shadow(&self) -> Option<ObjectHandle> {
        self.shadow
    }

    pub fn routing(&self) -> &SurrogateRouting {
        &self.routing
    }

    /// Swap the routing record in place.  Used when a surrogate's handler
    /// is replaced by a chain handler.
    pub fn set_routing(&mut self, routing: SurrogateRouting) {
        if self.shadow.is_some() {
            self.routing = routing;
        }
    }
}

// ---------------------------------------------------------------------------
// HeapObject — union of ordinary and surrogate
// ---------------------------------------------------------------------------

/// A managed object: ordinary or surrogate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum HeapObject {
    Ordinary(OrdinaryObject),
    Surrogate(SurrogateObject),
}

impl HeapObject {
    pub fn as_ordinary(&self) -> Option<&OrdinaryObject> {
        match self {
            Self::Ordinary(o) => Some(o),
            Self::Surrogate(_) => None,
        }
    }

    pub fn as_ordinary_mut(&mut self) -> Option<&mut OrdinaryObject> {
        match self {
            Self::Ordinary(o) => Some(o),
            Self::Surrogate(_) => None,
        }
    }

    pub fn as_surrogate(&self) -> Option<&SurrogateObject> {
        match self {
            Self::Surrogate(s) => Some(s),
            Self::Ordinary(_) => None,
        }
    }

    pub fn as_surrogate_mut(&mut self) -> Option<&mut SurrogateObject> {
        match self {
            Self::Surrogate(s) => Some(s),
            Self::Ordinary(_) => None,
        }
    }

    pub fn is_surrogate(&self) -> bool {
        matches!(self, Self::Surrogate(_))
    }
}

// ---------------------------------------------------------------------------
// ObjectHeap
// ---------------------------------------------------------------------------

/// The object heap: arena of managed objects.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObjectHeap {
    objects: Vec<HeapObject>,
}

impl ObjectHeap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an ordinary object.
    pub fn alloc(&mut self, kind: ObjectKind, proto: Option<ObjectHandle>) -> ObjectHandle {
        let handle = ObjectHandle(self.objects.len() as u32);
        self.objects
            .push(HeapObject::Ordinary(OrdinaryObject::new(kind, proto)));
        handle
    }

    /// Allocate a plain ordinary object with no prototype.
    pub fn alloc_plain(&mut self) -> ObjectHandle {
        self.alloc(ObjectKind::Plain, None)
    }

    /// Allocate a callable object with the given call/construct slots.
    pub fn alloc_callable(
        &mut self,
        proto: Option<ObjectHandle>,
        call: FunctionId,
        construct: Option<FunctionId>,
    ) -> ObjectHandle {
        let handle = self.alloc(ObjectKind::Callable, proto);
        if let Some(HeapObject::Ordinary(o)) = self.objects.get_mut(handle.0 as usize) {
            o.call = Some(call);
            o.construct = construct;
        }
        handle
    }

    /// Allocate a surrogate wrapping `shadow` under `routing`.
    pub fn alloc_surrogate(
        &mut self,
        shadow: ObjectHandle,
        routing: SurrogateRouting,
    ) -> ObjectHandle {
        let handle = ObjectHandle(self.objects.len() as u32);
        self.objects
            .push(HeapObject::Surrogate(SurrogateObject::new(shadow, routing)));
        handle
    }

    pub fn get(&self, handle: ObjectHandle) -> Result<&HeapObject, ObjectError> {
        self.objects
            .get(handle.0 as usize)
            .ok_or(ObjectError::ObjectNotFound(handle))
    }

    pub fn get_mut(&mut self, handle: ObjectHandle) -> Result<&mut HeapObject, ObjectError> {
        self.objects
            .get_mut(handle.0 as usize)
            .ok_or(ObjectError::ObjectNotFound(handle))
    }

    /// The object as ordinary, or `UnexpectedSurrogate`.
    pub fn ordinary(&self, handle: ObjectHandle) -> Result<&OrdinaryObject, ObjectError> {
        self.get(handle)?
            .as_ordinary()
            .ok_or(ObjectError::UnexpectedSurrogate(handle))
    }

    pub fn ordinary_mut(&mut self, handle: ObjectHandle) -> Result<&mut OrdinaryObject, ObjectError> {
        self.get_mut(handle)?
            .as_ordinary_mut()
            .ok_or(ObjectError::UnexpectedSurrogate(handle))
    }

    pub fn is_surrogate(&self, handle: ObjectHandle) -> Result<bool, ObjectError> {
        Ok(self.get(handle)?.is_surrogate())
    }

    /// Shape of an object.  A surrogate reports its shadow's kind.
    pub fn kind(&self, handle: ObjectHandle) -> Result<ObjectKind, ObjectError> {
        match self.get(handle)? {
            HeapObject::Ordinary(o) => Ok(o.kind),
            HeapObject::Surrogate(s) => {
                let shadow = s.shadow().ok_or(ObjectError::SurrogateRevoked(handle))?;
                self.kind(shadow)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    // -- Ordinary-object operations addressed by handle ---------------------

    pub fn get_own_property_descriptor(
        &self,
        handle: ObjectHandle,
        key: &PropertyKey,
    ) -> Result<Option<PropertyDescriptor>, ObjectError> {
        Ok(self.ordinary(handle)?.get_own_property(key).cloned())
    }

    pub fn define_property(
        &mut self,
        handle: ObjectHandle,
        key: PropertyKey,
        desc: PropertyDescriptor,
    ) -> Result<bool, ObjectError> {
        self.ordinary_mut(handle)?.define_own_property(key, desc)
    }

    pub fn delete_property(
        &mut self,
        handle: ObjectHandle,
        key: &PropertyKey,
    ) -> Result<bool, ObjectError> {
        Ok(self.ordinary_mut(handle)?.delete(key))
    }

    pub fn own_property_keys(&self, handle: ObjectHandle) -> Result<Vec<PropertyKey>, ObjectError> {
        Ok(self.ordinary(handle)?.own_property_keys())
    }

    pub fn get_prototype_of(
        &self,
        handle: ObjectHandle,
    ) -> Result<Option<ObjectHandle>, ObjectError> {
        Ok(self.ordinary(handle)?.prototype)
    }

    /// Set the prototype slot, rejecting cycles through ordinary objects.
    /// A non-extensible object only accepts its current prototype.
    pub fn set_prototype_of(
        &mut self,
        handle: ObjectHandle,
        proto: Option<ObjectHandle>,
    ) -> Result<bool, ObjectError> {
        if let Some(p) = proto {
            let mut current = Some(p);
            let mut depth: u32 = 0;
            while let Some(h) = current {
                if h == handle {
                    return Err(ObjectError::PrototypeCycleDetected);
                }
                if depth > MAX_PROTOTYPE_CHAIN_DEPTH {
                    return Err(ObjectError::PrototypeChainTooDeep {
                        depth,
                        max: MAX_PROTOTYPE_CHAIN_DEPTH,
                    });
                }
                current = match self.get(h)? {
                    HeapObject::Ordinary(o) => o.prototype,
                    // A surrogate prototype ends the local walk; its own
                    // chain lives behind the membrane.
                    HeapObject::Surrogate(_) => None,
                };
                depth += 1;
            }
        }
        let o = self.ordinary_mut(handle)?;
        if !o.extensible {
            return Ok(o.prototype == proto);
        }
        o.prototype = proto;
        Ok(true)
    }

    pub fn is_extensible(&self, handle: ObjectHandle) -> Result<bool, ObjectError> {
        Ok(self.ordinary(handle)?.extensible)
    }

    pub fn prevent_extensions(&mut self, handle: ObjectHandle) -> Result<bool, ObjectError> {
        self.ordinary_mut(handle)?.prevent_extensions();
        Ok(true)
    }

    pub fn freeze(&mut self, handle: ObjectHandle) -> Result<(), ObjectError> {
        self.ordinary_mut(handle)?.freeze();
        Ok(())
    }

    pub fn seal(&mut self, handle: ObjectHandle) -> Result<(), ObjectError> {
        self.ordinary_mut(handle)?.seal();
        Ok(())
    }

    pub fn is_frozen(&self, handle: ObjectHandle) -> Result<bool, ObjectError> {
        match self.get(handle)? {
            HeapObject::Ordinary(o) => Ok(o.is_frozen()),
            HeapObject::Surrogate(_) => Ok(false),
        }
    }

    pub fn is_sealed(&self, handle: ObjectHandle) -> Result<bool, ObjectError> {
        match self.get(handle)? {
            HeapObject::Ordinary(o) => Ok(o.is_sealed()),
            HeapObject::Surrogate(_) => Ok(false),
        }
    }

    // -- Surrogate plumbing --------------------------------------------------

    /// Shadow and routing of a live surrogate.
    pub fn surrogate_parts(
        &self,
        handle: ObjectHandle,
    ) -> Result<(ObjectHandle, SurrogateRouting), ObjectError> {
        let s = self
            .get(handle)?
            .as_surrogate()
            .ok_or_else(|| ObjectError::TypeError(format!("{handle} is not a surrogate")))?;
        match s.shadow() {
            Some(shadow) => Ok((shadow, s.routing().clone())),
            None => Err(ObjectError::SurrogateRevoked(handle)),
        }
    }

    pub fn revoke_surrogate(&mut self, handle: ObjectHandle) -> Result<(), ObjectError> {
        match self.get_mut(handle)? {
            HeapObject::Surrogate(s) => {
                s.revoke();
                Ok(())
            }
            HeapObject::Ordinary(_) => Err(ObjectError::TypeError(format!(
                "cannot revoke ordinary object {handle}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
