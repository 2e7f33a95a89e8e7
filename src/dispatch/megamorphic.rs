//! Megamorphic dispatch cache
//!
//! Call sites that have seen too many receiver classes share one cache per
//! selector and argument shape. The table lives on the isolate and is dropped
//! with it.

use super::{resolve_dynamic_for_receiver_class, ArgumentsDescriptor, ICData};
use crate::diagnostics::targets;
use crate::error::Result;
use crate::jit;
use crate::runtime::{ClassId, FunctionId, Isolate, Symbol, Value};
use rustc_hash::FxHashMap as HashMap;

/// Receiver class to target map for one selector and argument shape
#[derive(Debug, Clone, Default)]
pub struct MegamorphicCache {
    targets: HashMap<ClassId, FunctionId>,
}

impl MegamorphicCache {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn lookup(&self, class: ClassId) -> Option<FunctionId> {
        self.targets.get(&class).copied()
    }

    pub fn insert(&mut self, class: ClassId, target: FunctionId) {
        self.targets.insert(class, target);
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// Per-isolate table of megamorphic caches
#[derive(Debug, Default)]
pub struct MegamorphicCacheTable {
    caches: HashMap<(Symbol, ArgumentsDescriptor), MegamorphicCache>,
}

impl MegamorphicCacheTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, name: Symbol, descriptor: &ArgumentsDescriptor) -> Option<&MegamorphicCache> {
        self.caches.get(&(name, descriptor.clone()))
    }

    /// Cache for `name` and `descriptor`, created if missing
    pub fn lookup_or_create(&mut self, name: Symbol, descriptor: &ArgumentsDescriptor) -> &mut MegamorphicCache {
        self.caches.entry((name, descriptor.clone())).or_default()
    }

    /// Number of selector/shape pairs with a cache
    pub fn len(&self) -> usize {
        self.caches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.caches.is_empty()
    }
}

/// Resolve the selector of `ic` for the receiver's class and insert the
/// result into the shared cache. Returns `None` without caching anything when
/// the call does not resolve; such calls go through the no-such-method path.
pub fn megamorphic_cache_miss_handler(isolate: &mut Isolate, receiver: Value, ic: &ICData) -> Result<Option<FunctionId>> {
    isolate.check_alive()?;
    let name = ic.target_name();
    let descriptor = ic.arguments_descriptor();
    let class = isolate.class_id_of(receiver)?;
    let trace = &isolate.flags().trace;
    if trace.ic || trace.ic_miss_in_optimized {
        tracing::debug!(
            target: targets::IC,
            class = isolate.class_name(class),
            function = isolate.symbols.resolve(name),
            "megamorphic cache miss"
        );
    }

    let Some(target) = resolve_dynamic_for_receiver_class(isolate, class, name, descriptor)? else {
        return Ok(None);
    };
    jit::compile_function(isolate, target)?;
    isolate.megamorphic.lookup_or_create(name, descriptor).insert(class, target);
    Ok(Some(target))
}
