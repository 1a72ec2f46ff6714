//! Object registry: dense, insertion-ordered arena of scene objects.
//!
//! An object's position in the arena is its BLAS slot, its instance record
//! slot, and the custom index shaders use to fetch per-instance data, so
//! positions never change once assigned.

use std::collections::{HashMap, HashSet};

use crate::error::{AccelError, Result};

/// Largest custom index an instance record can hold (24 bits).
pub const MAX_CUSTOM_INDEX: u32 = 0x00FF_FFFF;

/// Caller-side identity of a renderable object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub u64);

/// Fixed position of an object within its acceleration structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectIndex(u32);

impl ObjectIndex {
    pub(crate) fn from_raw(index: u32) -> Self {
        Self(index)
    }

    pub fn get(self) -> u32 {
        self.0
    }

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// Insertion-ordered objects with a reverse lookup.
#[derive(Debug, Default, Clone)]
pub struct ObjectRegistry {
    objects: Vec<ObjectId>,
    index: HashMap<ObjectId, ObjectIndex>,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an object and return its permanent index.
    pub fn register(&mut self, id: ObjectId) -> Result<ObjectIndex> {
        if self.index.contains_key(&id) {
            return Err(AccelError::DuplicateObject(id));
        }
        if self.objects.len() > MAX_CUSTOM_INDEX as usize {
            return Err(AccelError::Unsupported(format!(
                "more than {} objects per acceleration structure",
                MAX_CUSTOM_INDEX as u64 + 1
            )));
        }

        let index = ObjectIndex(self.objects.len() as u32);
        self.objects.push(id);
        self.index.insert(id, index);
        Ok(index)
    }

    pub fn get(&self, id: ObjectId) -> Option<ObjectIndex> {
        self.index.get(&id).copied()
    }

    pub fn id(&self, index: ObjectIndex) -> Option<ObjectId> {
        self.objects.get(index.as_usize()).copied()
    }

    pub fn ids(&self) -> &[ObjectId] {
        &self.objects
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Objects in build order with their indices.
    pub fn iter(&self) -> impl Iterator<Item = (ObjectIndex, ObjectId)> + '_ {
        self.objects
            .iter()
            .enumerate()
            .map(|(i, &id)| (ObjectIndex(i as u32), id))
    }

    /// Resolve a batch of ids to indices.
    ///
    /// Unknown ids and repeats within the batch are recorded in `report`
    /// and dropped; the rest keep their batch order.
    pub fn resolve(&self, ids: &[ObjectId], report: &mut BatchReport) -> Vec<(ObjectIndex, ObjectId)> {
        let mut seen = HashSet::with_capacity(ids.len());
        let mut resolved = Vec::with_capacity(ids.len());

        for &id in ids {
            match self.get(id) {
                None => report.skip(id, AccelError::UnknownObject(id)),
                Some(_) if !seen.insert(id) => report.skip(id, AccelError::DuplicateObject(id)),
                Some(index) => resolved.push((index, id)),
            }
        }

        resolved
    }
}

/// Object whose operation was skipped in a batch.
#[derive(Debug)]
pub struct SkippedObject {
    pub id: ObjectId,
    pub error: AccelError,
}

/// Outcome of a batch operation that tolerates per-object integrity errors.
#[derive(Debug, Default)]
pub struct BatchReport {
    /// Objects the batch acted on, in submission order
    pub processed: Vec<ObjectIndex>,
    /// Objects skipped because of integrity errors
    pub skipped: Vec<SkippedObject>,
}

impl BatchReport {
    /// Record and log a skipped object.
    pub fn skip(&mut self, id: ObjectId, error: AccelError) {
        tracing::warn!(object = id.0, "skipping object: {error}");
        self.skipped.push(SkippedObject { id, error });
    }

    pub fn is_clean(&self) -> bool {
        self.skipped.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ============================================================
    // register / get
    // ============================================================

    #[test]
    fn test_register_assigns_positional_indices() {
        let mut registry = ObjectRegistry::new();
        for i in 0..5u64 {
            let index = registry.register(ObjectId(100 + i)).unwrap();
            assert_eq!(index.get(), i as u32);
        }
        assert_eq!(registry.len(), 5);
        assert_eq!(registry.get(ObjectId(103)).unwrap().get(), 3);
        assert_eq!(registry.id(ObjectIndex(4)), Some(ObjectId(104)));
    }

    #[test]
    fn test_register_duplicate_is_error() {
        let mut registry = ObjectRegistry::new();
        registry.register(ObjectId(7)).unwrap();
        let err = registry.register(ObjectId(7)).unwrap_err();
        assert!(matches!(err, AccelError::DuplicateObject(ObjectId(7))));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_indices_stable_after_more_registrations() {
        let mut registry = ObjectRegistry::new();
        let first = registry.register(ObjectId(1)).unwrap();
        for i in 2..50 {
            registry.register(ObjectId(i)).unwrap();
        }
        assert_eq!(registry.get(ObjectId(1)), Some(first));
        assert_eq!(first.get(), 0);
    }

    #[test]
    fn test_index_bijective() {
        let mut registry = ObjectRegistry::new();
        for id in [9u64, 3, 27, 1] {
            registry.register(ObjectId(id)).unwrap();
        }
        for (index, id) in registry.iter() {
            assert_eq!(registry.get(id), Some(index));
            assert_eq!(registry.id(index), Some(id));
        }
        assert_eq!(registry.ids(), &[ObjectId(9), ObjectId(3), ObjectId(27), ObjectId(1)]);
    }

    #[test]
    fn test_empty_registry() {
        let registry = ObjectRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(registry.get(ObjectId(0)), None);
        assert_eq!(registry.iter().count(), 0);
    }

    // ============================================================
    // resolve
    // ============================================================

    #[test]
    fn test_resolve_skips_unknown_and_repeats() {
        let mut registry = ObjectRegistry::new();
        registry.register(ObjectId(1)).unwrap();
        registry.register(ObjectId(2)).unwrap();

        let mut report = BatchReport::default();
        let resolved = registry.resolve(&[ObjectId(2), ObjectId(99), ObjectId(1), ObjectId(2)], &mut report);

        assert_eq!(
            resolved,
            vec![(ObjectIndex(1), ObjectId(2)), (ObjectIndex(0), ObjectId(1))]
        );
        assert_eq!(report.skipped.len(), 2);
        assert!(matches!(report.skipped[0].error, AccelError::UnknownObject(ObjectId(99))));
        assert!(matches!(report.skipped[1].error, AccelError::DuplicateObject(ObjectId(2))));
        assert!(!report.is_clean());
    }

    #[test]
    fn test_resolve_clean_batch() {
        let mut registry = ObjectRegistry::new();
        registry.register(ObjectId(5)).unwrap();
        let mut report = BatchReport::default();
        let resolved = registry.resolve(&[ObjectId(5)], &mut report);
        assert_eq!(resolved.len(), 1);
        assert!(report.is_clean());
    }
}
