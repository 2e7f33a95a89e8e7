//! Per-call-site inline caches and their miss handlers

use super::{resolve_dynamic_for_receiver_class, ArgumentsDescriptor};
use crate::diagnostics::targets;
use crate::error::{Error, Result};
use crate::jit;
use crate::runtime::{ClassId, Code, FunctionId, Isolate, Symbol, Value};
use std::fmt;

/// One cached mapping from argument classes to a target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ICCheck {
    /// Classes of the tested arguments, receiver first
    pub class_ids: Vec<ClassId>,
    pub target: FunctionId,
    /// Number of hits recorded by [`ICData::find_and_count`]
    pub count: u64,
}

/// Decides which check, if any, to drop before a new one is added
pub trait EvictionPolicy: fmt::Debug {
    /// Index of the check to evict from `checks`, or `None` to keep all
    fn evict(&self, checks: &[ICCheck]) -> Option<usize>;
}

/// Never evict. Inline caches grow with every distinct argument shape.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnboundedGrowth;

impl EvictionPolicy for UnboundedGrowth {
    fn evict(&self, _checks: &[ICCheck]) -> Option<usize> {
        None
    }
}

/// Inline cache of one call site
#[derive(Debug)]
pub struct ICData {
    target_name: Symbol,
    arguments_descriptor: ArgumentsDescriptor,
    num_args_tested: usize,
    checks: Vec<ICCheck>,
    policy: Box<dyn EvictionPolicy>,
}

impl ICData {
    /// Empty cache testing the classes of the first `num_args_tested` arguments
    pub fn new(target_name: Symbol, arguments_descriptor: ArgumentsDescriptor, num_args_tested: usize) -> Self {
        Self {
            target_name,
            arguments_descriptor,
            num_args_tested: num_args_tested.max(1),
            checks: Vec::new(),
            policy: Box::new(UnboundedGrowth),
        }
    }

    /// Cache of a static call, pre-populated with its known target
    pub fn for_static_call(
        target_name: Symbol,
        arguments_descriptor: ArgumentsDescriptor,
        num_args_tested: usize,
        target: FunctionId,
    ) -> Self {
        let mut ic = Self::new(target_name, arguments_descriptor, num_args_tested);
        let class_ids = vec![ClassId::ILLEGAL; ic.num_args_tested];
        ic.add_check(class_ids, target);
        ic
    }

    pub fn with_policy(mut self, policy: impl EvictionPolicy + 'static) -> Self {
        self.policy = Box::new(policy);
        self
    }

    pub fn target_name(&self) -> Symbol {
        self.target_name
    }

    pub fn arguments_descriptor(&self) -> &ArgumentsDescriptor {
        &self.arguments_descriptor
    }

    pub fn num_args_tested(&self) -> usize {
        self.num_args_tested
    }

    /// Record `class_ids -> target`. Returns `false` if an entry for the
    /// same classes already exists.
    pub fn add_check(&mut self, class_ids: Vec<ClassId>, target: FunctionId) -> bool {
        if self.checks.iter().any(|check| check.class_ids == class_ids) {
            return false;
        }
        if let Some(victim) = self.policy.evict(&self.checks) {
            if victim < self.checks.len() {
                self.checks.remove(victim);
            }
        }
        self.checks.push(ICCheck {
            class_ids,
            target,
            count: 0,
        });
        true
    }

    /// Record a check on the receiver class alone
    pub fn add_receiver_check(&mut self, class: ClassId, target: FunctionId) -> bool {
        self.add_check(vec![class], target)
    }

    /// Target cached for exactly `class_ids`
    pub fn lookup(&self, class_ids: &[ClassId]) -> Option<FunctionId> {
        self.checks
            .iter()
            .find(|check| check.class_ids == class_ids)
            .map(|check| check.target)
    }

    /// Like [`ICData::lookup`], counting the hit
    pub fn find_and_count(&mut self, class_ids: &[ClassId]) -> Option<FunctionId> {
        let check = self.checks.iter_mut().find(|check| check.class_ids == class_ids)?;
        check.count += 1;
        Some(check.target)
    }

    /// Target of the first check whose receiver class is `class`
    pub fn target_for_receiver_class_id(&self, class: ClassId) -> Option<FunctionId> {
        self.checks
            .iter()
            .find(|check| check.class_ids.first() == Some(&class))
            .map(|check| check.target)
    }

    pub fn target_at(&self, index: usize) -> Option<FunctionId> {
        self.checks.get(index).map(|check| check.target)
    }

    pub fn number_of_checks(&self) -> usize {
        self.checks.len()
    }

    pub fn checks(&self) -> &[ICCheck] {
        &self.checks
    }
}

/// Classes of the first `count` arguments
pub(super) fn tested_class_ids(isolate: &Isolate, args: &[Value], count: usize) -> Result<Vec<ClassId>> {
    let tested = args.get(..count).ok_or_else(|| {
        Error::internal(format!("call site tests {} arguments but {} were passed", count, args.len()))
    })?;
    tested.iter().map(|&arg| isolate.class_id_of(arg)).collect()
}

fn caller_is_optimized(isolate: &Isolate) -> bool {
    isolate
        .stack
        .top_index()
        .and_then(|index| isolate.frame_code(index).ok())
        .is_some_and(Code::is_optimized)
}

/// Report an instance call about to be made through `ic` from the frame on
/// top of the stack
pub fn trace_ic_call(isolate: &Isolate, ic: &ICData) {
    let (pc, caller) = match isolate.stack.top_index() {
        Some(index) => (
            isolate.stack.frame(index).map_or(0, |frame| frame.pc),
            isolate.frame_code(index).ok().map(|code| code.function),
        ),
        None => (0, None),
    };
    let usage_counter = caller
        .and_then(|f| isolate.function(f).ok())
        .map_or(0, |f| f.usage_counter);
    tracing::debug!(
        target: targets::IC,
        pc = format_args!("{:#x}", pc),
        usage_counter,
        checks = ic.number_of_checks(),
        caller = %caller.map_or_else(String::new, |f| isolate.qualified_function_name(f)),
        selector = isolate.symbols.resolve(ic.target_name()),
        "IC call"
    );
}

/// Resolve and compile the target for the classes of `args`, then record it
/// in `ic`. Returns `None` when resolution fails so the caller can fall back
/// to the megamorphic or no-such-method path.
pub fn inline_cache_miss_handler(isolate: &mut Isolate, args: &[Value], ic: &mut ICData) -> Result<Option<FunctionId>> {
    isolate.check_alive()?;
    let class_ids = tested_class_ids(isolate, args, ic.num_args_tested())?;
    let receiver_class = class_ids[0];
    let descriptor = ic.arguments_descriptor().clone();
    let Some(target) = resolve_dynamic_for_receiver_class(isolate, receiver_class, ic.target_name(), &descriptor)?
    else {
        if isolate.flags().trace.ic {
            tracing::debug!(
                target: targets::IC,
                selector = isolate.symbols.resolve(ic.target_name()),
                receiver = isolate.class_name(receiver_class),
                "inline cache miss without target"
            );
        }
        return Ok(None);
    };
    jit::compile_function(isolate, target)?;

    if class_ids.len() == 1 {
        ic.add_receiver_check(receiver_class, target);
    } else {
        ic.add_check(class_ids.clone(), target);
    }

    let trace = &isolate.flags().trace;
    if trace.ic_miss_in_optimized && caller_is_optimized(isolate) {
        tracing::debug!(
            target: targets::IC,
            target_function = %isolate.qualified_function_name(target),
            "inline cache miss in optimized code"
        );
    }
    if trace.ic {
        tracing::debug!(
            target: targets::IC,
            args = class_ids.len(),
            receiver = isolate.class_name(receiver_class),
            cid = receiver_class.0,
            target_function = %isolate.qualified_function_name(target),
            "inline cache miss: adding check"
        );
    }
    Ok(Some(target))
}

fn expect_tested(ic: &ICData, count: usize) -> Result<()> {
    if ic.num_args_tested() != count {
        return Err(Error::internal(format!(
            "inline cache tests {} arguments, handler expects {}",
            ic.num_args_tested(),
            count
        )));
    }
    Ok(())
}

/// Miss handler for call sites testing the receiver class only
pub fn inline_cache_miss_handler_one_arg(
    isolate: &mut Isolate,
    receiver: Value,
    ic: &mut ICData,
) -> Result<Option<FunctionId>> {
    expect_tested(ic, 1)?;
    inline_cache_miss_handler(isolate, &[receiver], ic)
}

/// Miss handler for call sites testing the receiver and one argument
pub fn inline_cache_miss_handler_two_args(
    isolate: &mut Isolate,
    receiver: Value,
    other: Value,
    ic: &mut ICData,
) -> Result<Option<FunctionId>> {
    expect_tested(ic, 2)?;
    inline_cache_miss_handler(isolate, &[receiver, other], ic)
}

/// Miss handler for call sites testing the receiver and two arguments
pub fn inline_cache_miss_handler_three_args(
    isolate: &mut Isolate,
    receiver: Value,
    arg1: Value,
    arg2: Value,
    ic: &mut ICData,
) -> Result<Option<FunctionId>> {
    expect_tested(ic, 3)?;
    inline_cache_miss_handler(isolate, &[receiver, arg1, arg2], ic)
}

/// A static call in baseline code saw a new pair of argument classes.
/// Compiles the statically known target if needed and records the pair.
pub fn static_call_miss_handler_two_args(
    isolate: &mut Isolate,
    arg0: Value,
    arg1: Value,
    ic: &mut ICData,
) -> Result<FunctionId> {
    isolate.check_alive()?;
    let target = ic
        .target_at(0)
        .ok_or_else(|| Error::internal("static call inline cache has no target"))?;
    jit::compile_function(isolate, target)?;
    let class_ids = vec![isolate.class_id_of(arg0)?, isolate.class_id_of(arg1)?];
    ic.add_check(class_ids.clone(), target);
    if isolate.flags().trace.ic {
        tracing::debug!(
            target: targets::IC,
            pc = isolate.stack.top_frame().map_or(0, |frame| frame.pc),
            target_function = %isolate.qualified_function_name(target),
            cids = ?class_ids,
            "static call miss"
        );
    }
    Ok(target)
}

/// Record the two-argument check for a call whose inline fast path was
/// bypassed, such as an equality test against null
pub fn update_ic_data_two_args(
    isolate: &mut Isolate,
    receiver: Value,
    arg1: Value,
    target_name: Symbol,
    ic: &mut ICData,
) -> Result<()> {
    isolate.check_alive()?;
    expect_tested(ic, 2)?;
    let receiver_class = isolate.class_id_of(receiver)?;
    let target =
        resolve_dynamic_for_receiver_class(isolate, receiver_class, target_name, &ArgumentsDescriptor::positional(2))?
            .ok_or_else(|| {
                Error::internal(format!(
                    "'{}' does not resolve on '{}'",
                    isolate.symbols.resolve(target_name),
                    isolate.class_name(receiver_class)
                ))
            })?;
    let class_ids = vec![receiver_class, isolate.class_id_of(arg1)?];
    ic.add_check(class_ids, target);
    Ok(())
}
