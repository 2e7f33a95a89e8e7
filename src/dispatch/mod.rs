//! Dynamic dispatch
//!
//! Instance calls are resolved through a chain of strategies. A call site
//! starts with an empty inline cache and records one check per observed class
//! tuple. Once it has seen more distinct shapes than the configured
//! polymorphic limit it switches to the isolate-wide megamorphic cache. Calls
//! that no strategy resolves fall back to getter invocation and finally to
//! `noSuchMethod`.

mod fallback;
mod ic;
mod megamorphic;
mod resolver;
mod static_call;

pub use fallback::{instance_function_lookup, invoke_no_such_method_function, invoke_non_closure};
pub use ic::{
    inline_cache_miss_handler, inline_cache_miss_handler_one_arg, inline_cache_miss_handler_three_args,
    inline_cache_miss_handler_two_args, static_call_miss_handler_two_args, trace_ic_call, update_ic_data_two_args, EvictionPolicy,
    ICCheck, ICData, UnboundedGrowth,
};
pub use megamorphic::{megamorphic_cache_miss_handler, MegamorphicCache, MegamorphicCacheTable};
pub use resolver::{get_invocation_dispatcher, resolve_dynamic_for_receiver_class};
pub use static_call::{fix_callers_target, patch_static_call};

use crate::diagnostics::targets;
use crate::error::{Error, Result};
use crate::runtime::{invoke_function, FunctionId, Isolate, Symbol, Value};

/// Shape of the arguments at a call site. The count includes the receiver;
/// named arguments follow the positional ones.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArgumentsDescriptor {
    count: usize,
    named: Vec<Symbol>,
}

impl ArgumentsDescriptor {
    pub fn new(count: usize, named: Vec<Symbol>) -> Self {
        Self { count, named }
    }

    /// `count` positional arguments, receiver included
    pub fn positional(count: usize) -> Self {
        Self::new(count, Vec::new())
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn positional_count(&self) -> usize {
        self.count.saturating_sub(self.named.len())
    }

    pub fn named(&self) -> &[Symbol] {
        &self.named
    }
}

/// How an instance call was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionStrategy {
    /// The site's inline cache has a single check
    Monomorphic(FunctionId),
    /// The site's inline cache has several checks
    Polymorphic(FunctionId),
    /// Found through the shared megamorphic cache
    Megamorphic(FunctionId),
    /// No target; use the getter / `noSuchMethod` fallback
    NoSuchMethod,
}

impl ResolutionStrategy {
    pub fn target(&self) -> Option<FunctionId> {
        match self {
            ResolutionStrategy::Monomorphic(target)
            | ResolutionStrategy::Polymorphic(target)
            | ResolutionStrategy::Megamorphic(target) => Some(*target),
            ResolutionStrategy::NoSuchMethod => None,
        }
    }
}

/// An instance call site: its inline cache and whether it went megamorphic
#[derive(Debug)]
pub struct InstanceCallSite {
    pub ic: ICData,
    megamorphic: bool,
}

impl InstanceCallSite {
    pub fn new(target_name: Symbol, descriptor: ArgumentsDescriptor, num_args_tested: usize) -> Self {
        Self {
            ic: ICData::new(target_name, descriptor, num_args_tested),
            megamorphic: false,
        }
    }

    pub fn is_megamorphic(&self) -> bool {
        self.megamorphic
    }
}

fn strategy_for(site: &InstanceCallSite, target: FunctionId) -> ResolutionStrategy {
    if site.ic.number_of_checks() <= 1 {
        ResolutionStrategy::Monomorphic(target)
    } else {
        ResolutionStrategy::Polymorphic(target)
    }
}

/// Resolve an instance call with `args` at `site`, updating the site's caches
pub fn resolve_instance_call(
    isolate: &mut Isolate,
    site: &mut InstanceCallSite,
    args: &[Value],
) -> Result<ResolutionStrategy> {
    isolate.check_alive()?;
    if !site.megamorphic {
        let class_ids = ic::tested_class_ids(isolate, args, site.ic.num_args_tested())?;
        if let Some(target) = site.ic.find_and_count(&class_ids) {
            return Ok(strategy_for(site, target));
        }
        if site.ic.number_of_checks() < isolate.flags().max_polymorphic_checks {
            return Ok(match inline_cache_miss_handler(isolate, args, &mut site.ic)? {
                Some(target) => strategy_for(site, target),
                None => ResolutionStrategy::NoSuchMethod,
            });
        }
        site.megamorphic = true;
        if isolate.flags().trace.ic {
            tracing::debug!(
                target: targets::IC,
                selector = isolate.symbols.resolve(site.ic.target_name()),
                checks = site.ic.number_of_checks(),
                "call site went megamorphic"
            );
        }
    }

    let receiver = args
        .first()
        .copied()
        .ok_or_else(|| Error::internal("instance call without a receiver"))?;
    let class = isolate.class_id_of(receiver)?;
    let cached = isolate
        .megamorphic
        .lookup(site.ic.target_name(), site.ic.arguments_descriptor())
        .and_then(|cache| cache.lookup(class));
    if let Some(target) = cached {
        return Ok(ResolutionStrategy::Megamorphic(target));
    }
    let target = megamorphic_cache_miss_handler(isolate, receiver, &site.ic)?;
    Ok(target.map_or(ResolutionStrategy::NoSuchMethod, ResolutionStrategy::Megamorphic))
}

/// Perform an instance call at `site`
pub fn invoke_instance_call(isolate: &mut Isolate, site: &mut InstanceCallSite, args: &[Value]) -> Result<Value> {
    if isolate.flags().trace.ic {
        ic::trace_ic_call(isolate, &site.ic);
    }
    match resolve_instance_call(isolate, site, args)?.target() {
        Some(target) => invoke_function(isolate, target, args),
        None => instance_function_lookup(isolate, args, &mut site.ic),
    }
}
