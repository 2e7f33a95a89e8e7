//! Tiered compilation support
//!
//! Functions start without code. The first call compiles baseline code
//! through the isolate's [`Compiler`]; usage counters then decide when a
//! function is recompiled with optimizations (see [`trigger`]), and interrupt
//! checks may switch a running loop into optimized code (see [`interrupt`]).
//!
//! The compiler, debugger and embedder are collaborators supplied when the
//! isolate is created. This module only defines the contracts it relies on.

mod interrupt;
mod trigger;

pub use interrupt::{schedule_interrupt, stack_overflow, InterruptBits, InterruptOutcome};
pub use trigger::{can_optimize_function, increment_usage_counter, optimize_invoked_function};

use crate::diagnostics::targets;
use crate::error::{Error, Result};
use crate::runtime::{CodeId, CodeKind, CodeSpec, DeoptId, Function, FunctionId, Isolate};

// ==================== Collaborators ====================

/// Produces code for functions on demand
pub trait Compiler {
    /// Baseline code for `function`
    fn compile_unoptimized(&self, function: &Function) -> Result<CodeSpec>;

    /// Optimized code for `function`, entered at `osr_id` when compiling for
    /// on-stack replacement. `Ok(None)` means the optimizer bailed out.
    fn compile_optimized(&self, function: &Function, osr_id: Option<DeoptId>) -> Result<Option<CodeSpec>>;
}

/// Debugger queries consulted before optimizing
pub trait Debugger {
    fn is_stepping(&self) -> bool;
    fn has_breakpoint(&self, function: FunctionId) -> bool;
    /// Called when an API interrupt is serviced
    fn signal_isolate_interrupted(&self) {}
}

/// No debugger attached
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDebugger;

impl Debugger for NoDebugger {
    fn is_stepping(&self) -> bool {
        false
    }

    fn has_breakpoint(&self, _function: FunctionId) -> bool {
        false
    }
}

/// Callbacks installed by the embedding application
pub trait Embedder {
    /// Interrupt callback result, `None` when no callback is installed.
    /// `Some(false)` asks the isolate to stop running managed code.
    fn interrupt_callback(&self) -> Option<bool> {
        None
    }

    fn vm_stats_callback(&self) {}

    /// Handle out-of-band messages queued for the isolate
    fn handle_oob_messages(&self) -> Result<()> {
        Ok(())
    }
}

/// Embedder without callbacks
#[derive(Debug, Clone, Copy, Default)]
pub struct NoEmbedder;

impl Embedder for NoEmbedder {}

/// Compiler that emits minimal baseline code and never optimizes
#[derive(Debug, Clone, Copy, Default)]
pub struct BaselineCompiler;

/// Instruction bytes reserved per baseline code object
const BASELINE_CODE_SIZE: usize = 16;

impl Compiler for BaselineCompiler {
    fn compile_unoptimized(&self, function: &Function) -> Result<CodeSpec> {
        let signature = &function.signature;
        let frame_size =
            signature.num_fixed_parameters + signature.num_optional_parameters + signature.named_parameters.len();
        Ok(CodeSpec::unoptimized(BASELINE_CODE_SIZE, frame_size))
    }

    fn compile_optimized(&self, _function: &Function, _osr_id: Option<DeoptId>) -> Result<Option<CodeSpec>> {
        Ok(None)
    }
}

// ==================== Compilation ====================

/// Ensure `function` has code, compiling baseline code if it has none.
/// Returns the current code.
pub fn compile_function(isolate: &mut Isolate, function: FunctionId) -> Result<CodeId> {
    let descriptor = isolate.function(function)?;
    if let Some(code) = descriptor.current_code {
        return Ok(code);
    }
    let spec = isolate.compiler.compile_unoptimized(descriptor)?;
    if spec.kind != CodeKind::Unoptimized {
        return Err(Error::compilation(
            isolate.qualified_function_name(function),
            "baseline compilation produced optimized code",
        ));
    }
    let code = isolate.codes.install(function, spec, None);
    isolate.function_mut(function)?.reattach_code(code);
    if isolate.flags().trace.runtime_calls {
        tracing::trace!(
            target: targets::RUNTIME_CALLS,
            function = %isolate.qualified_function_name(function),
            code = code.0,
            "compiled baseline code"
        );
    }
    Ok(code)
}

/// Compile optimized code for `function` and install it as current code.
///
/// A bailout leaves the current code unchanged and marks the function as not
/// optimizable. Returns the new code, or `None` after a bailout.
pub fn compile_optimized_function(
    isolate: &mut Isolate,
    function: FunctionId,
    osr_id: Option<DeoptId>,
) -> Result<Option<CodeId>> {
    compile_function(isolate, function)?;
    let spec = isolate.compiler.compile_optimized(isolate.function(function)?, osr_id)?;
    let Some(spec) = spec else {
        isolate.function_mut(function)?.is_optimizable = false;
        if isolate.flags().trace.failed_optimization_attempts {
            tracing::debug!(
                target: targets::OPTIMIZATION,
                function = %isolate.qualified_function_name(function),
                ?osr_id,
                "optimizer bailed out"
            );
        }
        return Ok(None);
    };
    if spec.kind != CodeKind::Optimized {
        return Err(Error::compilation(
            isolate.qualified_function_name(function),
            "optimizing compilation produced baseline code",
        ));
    }
    let code = isolate.codes.install(function, spec, osr_id);
    isolate.function_mut(function)?.current_code = Some(code);
    Ok(Some(code))
}
