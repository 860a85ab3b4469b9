//! Lockable object layout and type descriptors

use crate::mark_word::{MarkWord, MarkWordCell};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Instant;

/// Per-type descriptor: prototype lock word and bias heuristics.
///
/// The prototype header is the lock word new instances start with. While a
/// type allows biasing it is an anonymously biased word carrying the type's
/// current bias epoch; after a bulk revoke it is a plain unlocked word.
pub struct TypeDescriptor {
    id: u32,
    name: String,
    prototype: MarkWordCell,
    revocation_count: AtomicU32,
    last_bulk_revocation: Mutex<Option<Instant>>,
}

impl TypeDescriptor {
    fn new(id: u32, name: String, biased: bool) -> Self {
        let prototype = if biased {
            MarkWord::biased_prototype(0)
        } else {
            MarkWord::unlocked()
        };
        Self {
            id,
            name,
            prototype: MarkWordCell::new(prototype),
            revocation_count: AtomicU32::new(0),
            last_bulk_revocation: Mutex::new(None),
        }
    }

    /// Registry id
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Type name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lock word new instances start with
    pub fn prototype_header(&self) -> MarkWord {
        self.prototype.load()
    }

    /// Replace the prototype. Only called with every mutator stopped.
    pub(crate) fn set_prototype_header(&self, mark: MarkWord) {
        self.prototype.store(mark);
    }

    /// Instances of this type may be biased
    pub fn allows_biasing(&self) -> bool {
        self.prototype_header().has_bias_pattern()
    }

    /// Current bias epoch
    pub fn bias_epoch(&self) -> u8 {
        self.prototype_header().bias_epoch()
    }

    /// Revocations since the last heuristic reset
    pub fn revocation_count(&self) -> u32 {
        self.revocation_count.load(Ordering::Relaxed)
    }

    pub(crate) fn record_revocation(&self) -> u32 {
        self.revocation_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn reset_revocation_count(&self) {
        self.revocation_count.store(0, Ordering::Relaxed);
    }

    /// Time of the last bulk rebias or revoke of this type
    pub fn last_bulk_revocation(&self) -> Option<Instant> {
        *self.last_bulk_revocation.lock()
    }

    pub(crate) fn set_last_bulk_revocation(&self, at: Instant) {
        *self.last_bulk_revocation.lock() = Some(at);
    }
}

impl fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("prototype", &self.prototype_header())
            .field("revocations", &self.revocation_count())
            .finish()
    }
}

/// Registered types, keyed by name
pub struct TypeRegistry {
    types: RwLock<FxHashMap<String, Arc<TypeDescriptor>>>,
    next_id: AtomicU32,
    biased_by_default: AtomicBool,
}

impl TypeRegistry {
    /// Create an empty registry. New types start biasable iff `biased_by_default`.
    pub fn new(biased_by_default: bool) -> Self {
        Self {
            types: RwLock::new(FxHashMap::default()),
            next_id: AtomicU32::new(1),
            biased_by_default: AtomicBool::new(biased_by_default),
        }
    }

    /// Look up or create the type called `name`
    pub fn register(&self, name: &str) -> Arc<TypeDescriptor> {
        if let Some(ty) = self.types.read().get(name) {
            return ty.clone();
        }
        let mut types = self.types.write();
        types
            .entry(name.to_string())
            .or_insert_with(|| {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let biased = self.biased_by_default.load(Ordering::Acquire);
                Arc::new(TypeDescriptor::new(id, name.to_string(), biased))
            })
            .clone()
    }

    /// Look up a type by name
    pub fn get(&self, name: &str) -> Option<Arc<TypeDescriptor>> {
        self.types.read().get(name).cloned()
    }

    /// Snapshot of all types
    pub fn all(&self) -> Vec<Arc<TypeDescriptor>> {
        self.types.read().values().cloned().collect()
    }

    /// Number of registered types
    pub fn len(&self) -> usize {
        self.types.read().len()
    }

    /// No types registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn set_biased_by_default(&self, biased: bool) {
        self.biased_by_default.store(biased, Ordering::Release);
    }
}

/// A lockable managed object
pub struct Object {
    header: MarkWordCell,
    ty: Arc<TypeDescriptor>,
}

impl Object {
    /// Lock word cell
    #[inline]
    pub fn header(&self) -> &MarkWordCell {
        &self.header
    }

    /// Current lock word
    #[inline]
    pub fn mark(&self) -> MarkWord {
        self.header.load()
    }

    /// Type descriptor
    #[inline]
    pub fn type_descriptor(&self) -> &Arc<TypeDescriptor> {
        &self.ty
    }
}

/// Shared reference to an [`Object`], compared by identity
#[derive(Clone)]
pub struct ObjectRef(Arc<Object>);

impl ObjectRef {
    /// Allocate an instance of `ty`, starting from its prototype header
    pub fn new(ty: &Arc<TypeDescriptor>) -> Self {
        Self(Arc::new(Object {
            header: MarkWordCell::new(ty.prototype_header()),
            ty: ty.clone(),
        }))
    }

    /// Address-based identity, stable for the object's lifetime
    pub fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    /// Same object
    pub fn ptr_eq(&self, other: &ObjectRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl std::ops::Deref for ObjectRef {
    type Target = Object;

    fn deref(&self) -> &Object {
        &self.0
    }
}

impl PartialEq for ObjectRef {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for ObjectRef {}

impl Hash for ObjectRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{:#x}", self.ty.name(), self.addr())
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?}", self, self.mark())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_is_idempotent() {
        let registry = TypeRegistry::new(true);
        let a = registry.register("Point");
        let b = registry.register("Point");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
        assert!(registry.get("Line").is_none());
    }

    #[test]
    fn test_instances_start_from_prototype() {
        let registry = TypeRegistry::new(true);
        let ty = registry.register("Point");
        let obj = ObjectRef::new(&ty);
        assert!(obj.mark().is_biased_anonymously());
        assert!(ty.allows_biasing());

        registry.set_biased_by_default(false);
        let plain = registry.register("Plain");
        let obj = ObjectRef::new(&plain);
        assert!(obj.mark().is_neutral());
    }

    #[test]
    fn test_identity_equality() {
        let registry = TypeRegistry::new(false);
        let ty = registry.register("Point");
        let a = ObjectRef::new(&ty);
        let b = ObjectRef::new(&ty);
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
        assert!(a.to_string().starts_with("Point@0x"));
    }
}
