//! Static call patching in optimized code

use crate::diagnostics::targets;
use crate::error::{messages, Error, Result};
use crate::jit;
use crate::runtime::{CodeId, FunctionId, Isolate};

/// Caller frame's code and the static call at its pc
fn caller_static_call(isolate: &Isolate) -> Result<(CodeId, usize, FunctionId, Option<CodeId>)> {
    let index = isolate
        .stack
        .top_index()
        .ok_or_else(|| Error::internal(messages::NO_DART_FRAME))?;
    let caller = isolate.frame_code(index)?;
    if !caller.is_optimized() {
        return Err(Error::internal(messages::expected_optimized(
            &isolate.qualified_function_name(caller.function),
        )));
    }
    let pc = isolate.stack.frame(index).map_or(0, |frame| frame.pc);
    let call = caller
        .static_call_at(pc)
        .ok_or_else(|| Error::internal(format!("no static call at {:#x}", pc)))?;
    Ok((caller.id, pc, call.target_function, call.target_code))
}

fn set_static_call_target(isolate: &mut Isolate, caller: CodeId, pc: usize, target: CodeId) -> Result<()> {
    let call = isolate
        .code_mut(caller)?
        .static_call_at_mut(pc)
        .ok_or_else(|| Error::internal(format!("no static call at {:#x}", pc)))?;
    call.target_code = Some(target);
    Ok(())
}

fn trace_patching(isolate: &Isolate, entry: &str, pc: usize, target: CodeId) {
    if !isolate.flags().trace.patching {
        return;
    }
    let Ok(code) = isolate.code(target) else {
        return;
    };
    tracing::debug!(
        target: targets::PATCHING,
        pc = format_args!("{:#x}", pc),
        target_function = %isolate.qualified_function_name(code.function),
        entry_point = format_args!("{:#x}", code.entry_point),
        "{}: patching static call",
        entry
    );
}

/// Point the static call the optimized caller is executing at the target's
/// current code, compiling the target first if needed
pub fn patch_static_call(isolate: &mut Isolate) -> Result<CodeId> {
    isolate.check_alive()?;
    let (caller, pc, target_function, patched) = caller_static_call(isolate)?;
    let target_code = jit::compile_function(isolate, target_function)?;
    if patched == Some(target_code) {
        return Err(Error::internal(format!(
            "static call at {:#x} is already patched to '{}'",
            pc,
            isolate.qualified_function_name(target_function)
        )));
    }
    set_static_call_target(isolate, caller, pc, target_code)?;
    trace_patching(isolate, "PatchStaticCall", pc, target_code);
    Ok(target_code)
}

/// Repair the static call the optimized caller is executing. A target that
/// still has code is re-patched to it; a target whose code was detached gets
/// back the baseline code the call was patched to.
pub fn fix_callers_target(isolate: &mut Isolate) -> Result<CodeId> {
    isolate.check_alive()?;
    let (caller, pc, target_function, patched) = caller_static_call(isolate)?;
    let current = isolate.function(target_function)?.current_code;
    let target_code = match current {
        Some(current) => {
            set_static_call_target(isolate, caller, pc, current)?;
            current
        }
        None => {
            let detached = patched.ok_or_else(|| {
                Error::internal(format!(
                    "static call at {:#x} has no code to reattach to '{}'",
                    pc,
                    isolate.qualified_function_name(target_function)
                ))
            })?;
            if isolate.code(detached)?.is_optimized() {
                return Err(Error::internal("cannot reattach optimized code"));
            }
            isolate.function_mut(target_function)?.reattach_code(detached);
            detached
        }
    };
    trace_patching(isolate, "FixCallersTarget", pc, target_code);
    Ok(target_code)
}
