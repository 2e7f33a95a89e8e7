//! Usage-counter driven optimization

use super::compile_optimized_function;
use crate::diagnostics::targets;
use crate::error::{Error, FatalError, Result};
use crate::runtime::{CodeId, FunctionId, Isolate, LOW_INVOCATION_COUNT};

fn suppress_optimization(isolate: &mut Isolate, function: FunctionId) -> Result<bool> {
    isolate.function_mut(function)?.usage_counter = LOW_INVOCATION_COUNT;
    Ok(false)
}

/// Whether `function` may be optimized now. A refusal pushes the usage
/// counter far below any threshold so the function is not considered again.
pub fn can_optimize_function(isolate: &mut Isolate, function: FunctionId) -> Result<bool> {
    if isolate.debugger.is_stepping() || isolate.debugger.has_breakpoint(function) {
        return suppress_optimization(isolate, function);
    }

    let name = isolate.qualified_function_name(function);
    let (deoptimizations, optimizable) = {
        let f = isolate.function(function)?;
        (f.deoptimization_counter, f.is_optimizable)
    };
    let flags = isolate.flags();
    if deoptimizations >= flags.deoptimization_counter_threshold {
        if flags.trace.failed_optimization_attempts || flags.stop_on_excessive_deoptimization {
            tracing::warn!(target: targets::OPTIMIZATION, function = %name, deoptimizations, "too many deoptimizations");
        }
        if flags.stop_on_excessive_deoptimization {
            return Err(isolate.terminate(FatalError::ExcessiveDeoptimization { function: name }));
        }
        return suppress_optimization(isolate, function);
    }
    if !flags.passes_optimization_filter(&name) {
        return suppress_optimization(isolate, function);
    }
    if !optimizable {
        if flags.trace.failed_optimization_attempts {
            tracing::debug!(target: targets::OPTIMIZATION, function = %name, "not optimizable");
        }
        return suppress_optimization(isolate, function);
    }
    Ok(true)
}

/// Optimize `function`, which may already run optimized code. Returns the
/// code execution continues in.
pub fn optimize_invoked_function(isolate: &mut Isolate, function: FunctionId) -> Result<CodeId> {
    isolate.check_alive()?;
    if !isolate.function(function)?.has_code() {
        return Err(Error::internal(format!(
            "'{}' must have code before it is optimized",
            isolate.qualified_function_name(function)
        )));
    }
    if can_optimize_function(isolate, function)? {
        compile_optimized_function(isolate, function, None)?;
        isolate.function_mut(function)?.usage_counter = 0;
    }
    isolate
        .function(function)?
        .current_code
        .ok_or_else(|| Error::internal("optimization left the function without code"))
}

/// Count one invocation of `function` and optimize it once the counter
/// reaches the threshold for its current tier
pub fn increment_usage_counter(isolate: &mut Isolate, function: FunctionId) -> Result<()> {
    let flags = isolate.flags();
    let (optimize_at, reoptimize_at) = (
        flags.optimization_counter_threshold,
        flags.reoptimization_counter_threshold,
    );
    let f = isolate.function_mut(function)?;
    let threshold = if f.has_optimized_code() { reoptimize_at } else { optimize_at };
    f.usage_counter = f.usage_counter.saturating_add(1);
    if threshold >= 0 && f.usage_counter >= threshold {
        optimize_invoked_function(isolate, function)?;
    }
    Ok(())
}
