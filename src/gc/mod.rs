//! Managed heap for jitrt
//!
//! Objects live in a slot arena and are referenced through [`ObjectId`]
//! handles. A handle stays valid across collections as long as the object is
//! reachable from a root, so runtime entries hold handles, never references,
//! across any operation that can allocate.
//!
//! ## Design
//!
//! The collector is a plain mark-and-sweep over the arena:
//! - **Mark phase**: trace from the roots supplied by the isolate
//! - **Sweep phase**: free every unmarked, unpinned slot and put it on the free list

use crate::diagnostics::targets;
use crate::runtime::{ClassId, FunctionId, Symbol, Value};
use crate::types::TypeArgsId;
use rustc_hash::FxHashSet;
use thiserror::Error;

/// Handle to a heap object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub u32);

/// Returned when the heap refuses an allocation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("heap exhausted allocating {what} ({live} live objects, limit {limit})")]
pub struct HeapExhausted {
    pub what: &'static str,
    pub live: usize,
    pub limit: usize,
}

/// GC configuration
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Maximum number of live objects before allocation fails
    pub max_live_objects: usize,
    /// Emit `jitrt::gc` events for every collection
    pub verbose: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            max_live_objects: 1 << 20,
            verbose: false,
        }
    }
}

/// GC statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcStats {
    /// Total objects allocated
    pub total_allocations: usize,
    /// Current live objects
    pub live_objects: usize,
    /// Objects freed in last collection
    pub last_freed: usize,
    /// Total objects freed
    pub total_freed: usize,
    /// Number of collections
    pub collections: u64,
}

/// Shape of a heap object
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectKind {
    /// Ordinary instance with field slots
    Instance { fields: Vec<Value> },
    /// Fixed-length array
    Array { elements: Vec<Value> },
    /// Closure over `function` with its captured values
    Closure {
        function: FunctionId,
        context: Vec<Value>,
    },
    /// Captured variables of one scope, chained to the enclosing scope
    Context {
        parent: Option<ObjectId>,
        variables: Vec<Value>,
    },
    /// Boxed integer outside the small-integer range, or materialized from an
    /// unboxed optimized value
    Mint(i64),
    /// Boxed double
    Double(f64),
    /// Reified call handed to a `noSuchMethod` handler
    Invocation {
        selector: Symbol,
        positional: usize,
        named: Vec<Symbol>,
        values: Vec<Value>,
    },
    /// Exception object
    Exception { message: String },
}

/// A heap-allocated object
#[derive(Debug, Clone, PartialEq)]
pub struct HeapObject {
    /// Runtime class id
    pub class: ClassId,
    /// Type argument vector, possibly deferred
    pub type_arguments: Option<TypeArgsId>,
    pub kind: ObjectKind,
}

impl HeapObject {
    pub fn new(class: ClassId, kind: ObjectKind) -> Self {
        Self {
            class,
            type_arguments: None,
            kind,
        }
    }

    pub fn with_type_arguments(mut self, type_arguments: Option<TypeArgsId>) -> Self {
        self.type_arguments = type_arguments;
        self
    }

    fn trace(&self, mut visit: impl FnMut(ObjectId)) {
        let mut values = |slice: &[Value]| {
            slice.iter().filter_map(Value::as_object).for_each(&mut visit);
        };
        match &self.kind {
            ObjectKind::Instance { fields } => values(fields),
            ObjectKind::Array { elements } => values(elements),
            ObjectKind::Invocation { values: args, .. } => values(args),
            ObjectKind::Closure { context, .. } => values(context),
            ObjectKind::Context { parent, variables } => {
                values(variables);
                if let Some(parent) = parent {
                    visit(*parent);
                }
            }
            ObjectKind::Mint(_)
            | ObjectKind::Double(_)
            | ObjectKind::Exception { .. } => {}
        }
    }
}

/// Mark-and-sweep heap
pub struct Heap {
    config: GcConfig,
    stats: GcStats,
    slots: Vec<Option<HeapObject>>,
    free: Vec<u32>,
    pinned: FxHashSet<ObjectId>,
}

impl Heap {
    /// Create a heap with default configuration
    pub fn new() -> Self {
        Self::with_config(GcConfig::default())
    }

    /// Create a heap with custom configuration
    pub fn with_config(config: GcConfig) -> Self {
        Self {
            config,
            stats: GcStats::default(),
            slots: Vec::new(),
            free: Vec::new(),
            pinned: FxHashSet::default(),
        }
    }

    /// Get GC statistics
    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: GcConfig) {
        self.config = config;
    }

    /// Number of live objects
    pub fn live_count(&self) -> usize {
        self.stats.live_objects
    }

    /// Allocate an object, failing once the live-object limit is reached
    pub fn allocate(&mut self, object: HeapObject) -> Result<ObjectId, HeapExhausted> {
        if self.stats.live_objects >= self.config.max_live_objects {
            return Err(HeapExhausted {
                what: kind_name(&object.kind),
                live: self.stats.live_objects,
                limit: self.config.max_live_objects,
            });
        }
        Ok(self.insert(object))
    }

    /// Allocate an object that is never collected and ignores the limit.
    /// Used for objects the runtime must have even when the heap is full.
    pub fn allocate_permanent(&mut self, object: HeapObject) -> ObjectId {
        let id = self.insert(object);
        self.pinned.insert(id);
        id
    }

    fn insert(&mut self, object: HeapObject) -> ObjectId {
        self.stats.total_allocations += 1;
        self.stats.live_objects += 1;
        match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(object);
                ObjectId(index)
            }
            None => {
                self.slots.push(Some(object));
                ObjectId((self.slots.len() - 1) as u32)
            }
        }
    }

    pub fn get(&self, id: ObjectId) -> Option<&HeapObject> {
        self.slots.get(id.0 as usize).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut HeapObject> {
        self.slots.get_mut(id.0 as usize).and_then(Option::as_mut)
    }

    /// Whether `id` refers to a live object
    pub fn contains(&self, id: ObjectId) -> bool {
        self.get(id).is_some()
    }

    /// Perform a collection, returning the number of freed objects
    pub fn collect(&mut self, roots: impl IntoIterator<Item = ObjectId>) -> usize {
        let mut marked: FxHashSet<ObjectId> = FxHashSet::default();
        let mut worklist: Vec<ObjectId> = roots.into_iter().collect();
        worklist.extend(self.pinned.iter().copied());

        while let Some(id) = worklist.pop() {
            if !marked.insert(id) {
                continue;
            }
            if let Some(object) = self.get(id) {
                object.trace(|child| {
                    if !marked.contains(&child) {
                        worklist.push(child);
                    }
                });
            }
        }

        let mut freed = 0;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            let id = ObjectId(index as u32);
            if slot.is_some() && !marked.contains(&id) {
                *slot = None;
                self.free.push(index as u32);
                freed += 1;
            }
        }

        self.stats.last_freed = freed;
        self.stats.total_freed += freed;
        self.stats.live_objects -= freed;
        self.stats.collections += 1;

        if self.config.verbose {
            tracing::debug!(
                target: targets::GC,
                freed,
                live = self.stats.live_objects,
                collections = self.stats.collections,
                "collection complete"
            );
        }
        freed
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

fn kind_name(kind: &ObjectKind) -> &'static str {
    match kind {
        ObjectKind::Instance { .. } => "instance",
        ObjectKind::Array { .. } => "array",
        ObjectKind::Closure { .. } => "closure",
        ObjectKind::Context { .. } => "context",
        ObjectKind::Mint(_) => "mint",
        ObjectKind::Double(_) => "double",
        ObjectKind::Invocation { .. } => "invocation",
        ObjectKind::Exception { .. } => "exception",
    }
}
