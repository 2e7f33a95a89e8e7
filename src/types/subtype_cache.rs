//! Per-call-site memoization of type test results

use super::TypeArgsId;
use crate::runtime::ClassId;

/// One memoized type test
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubtypeTestEntry {
    /// Class of the tested instance
    pub class: ClassId,
    /// Canonical type arguments of the tested instance
    pub instance_type_arguments: Option<TypeArgsId>,
    /// Canonical type arguments of the instantiator
    pub instantiator_type_arguments: Option<TypeArgsId>,
    pub result: bool,
}

impl SubtypeTestEntry {
    fn matches(
        &self,
        class: ClassId,
        instance_type_arguments: Option<TypeArgsId>,
        instantiator_type_arguments: Option<TypeArgsId>,
    ) -> bool {
        self.class == class
            && self.instance_type_arguments == instance_type_arguments
            && self.instantiator_type_arguments == instantiator_type_arguments
    }
}

/// Bounded list of type test results keyed by identity. Once full, new
/// results are not recorded; existing entries are never evicted.
#[derive(Debug, Clone)]
pub struct SubtypeTestCache {
    entries: Vec<SubtypeTestEntry>,
    capacity: usize,
}

impl SubtypeTestCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            capacity,
        }
    }

    /// Cached result for the given key
    #[inline]
    pub fn lookup(
        &self,
        class: ClassId,
        instance_type_arguments: Option<TypeArgsId>,
        instantiator_type_arguments: Option<TypeArgsId>,
    ) -> Option<bool> {
        self.entries
            .iter()
            .find(|e| e.matches(class, instance_type_arguments, instantiator_type_arguments))
            .map(|e| e.result)
    }

    /// Record `entry`. Returns `false` if the cache is full or the key is
    /// already present.
    pub fn add_check(&mut self, entry: SubtypeTestEntry) -> bool {
        if self.is_full() {
            return false;
        }
        let duplicate = self.entries.iter().any(|e| {
            e.matches(
                entry.class,
                entry.instance_type_arguments,
                entry.instantiator_type_arguments,
            )
        });
        if duplicate {
            return false;
        }
        self.entries.push(entry);
        true
    }

    pub fn number_of_checks(&self) -> usize {
        self.entries.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    pub fn entries(&self) -> &[SubtypeTestEntry] {
        &self.entries
    }
}
