//! Interrupt checks and on-stack replacement
//!
//! Generated code polls at function entries and loop back edges. The poll
//! fails when the stack is exhausted, services pending interrupts, and with
//! nothing pending may move a hot loop into optimized code.

use super::{can_optimize_function, compile_optimized_function};
use crate::diagnostics::targets;
use crate::error::{Error, FatalError, Result};
use crate::runtime::{CodeId, Isolate};
use bitflags::bitflags;

bitflags! {
    /// Pending interrupt requests of an isolate
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct InterruptBits: u32 {
        /// The store buffer overflowed; collect garbage
        const STORE_BUFFER = 1 << 0;
        /// Out-of-band messages are waiting
        const MESSAGE = 1 << 1;
        /// The embedder requested an interrupt
        const API = 1 << 2;
        /// The embedder asked for VM statistics
        const VM_STATUS = 1 << 3;
    }
}

/// How execution continues after an interrupt check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptOutcome {
    /// Keep running the current code
    Continue,
    /// The checking frame now resumes in optimized code at `entry`
    OsrEntered { code: CodeId, entry: usize },
}

/// Request `bits` to be serviced at the next interrupt check
pub fn schedule_interrupt(isolate: &mut Isolate, bits: InterruptBits) {
    isolate.interrupts.insert(bits);
}

/// The interrupt check. A stack overflow takes priority over every pending
/// interrupt and throws the preallocated exception.
pub fn stack_overflow(isolate: &mut Isolate) -> Result<InterruptOutcome> {
    isolate.check_alive()?;
    if isolate.stack.is_overflowed() {
        return Err(Error::StackOverflow {
            exception: isolate.object_store().stack_overflow,
        });
    }

    let bits = std::mem::take(&mut isolate.interrupts);
    if bits.contains(InterruptBits::STORE_BUFFER) {
        if isolate.heap.config().verbose {
            tracing::debug!(target: targets::GC, "collection scheduled by store buffer overflow");
        }
        isolate.collect_garbage();
    }
    if bits.contains(InterruptBits::MESSAGE) {
        isolate.embedder.handle_oob_messages()?;
    }
    if bits.contains(InterruptBits::API) {
        isolate.debugger.signal_isolate_interrupted();
        match isolate.embedder.interrupt_callback() {
            Some(true) => return Ok(InterruptOutcome::Continue),
            // Unwinding the managed stack from here is not supported.
            Some(false) => return Err(isolate.terminate(FatalError::InterruptUnwindUnimplemented)),
            None => {}
        }
    }
    if bits.contains(InterruptBits::VM_STATUS) {
        isolate.embedder.vm_stats_callback();
    }

    if isolate.flags().use_osr && bits.is_empty() {
        return attempt_osr(isolate);
    }
    Ok(InterruptOutcome::Continue)
}

fn attempt_osr(isolate: &mut Isolate) -> Result<InterruptOutcome> {
    let Some(index) = isolate.stack.top_index() else {
        return Ok(InterruptOutcome::Continue);
    };
    let pc = isolate.stack.frame(index).map_or(0, |frame| frame.pc);
    let (function, running_optimized) = {
        let code = isolate.frame_code(index)?;
        (code.function, code.is_optimized())
    };
    if running_optimized {
        return Ok(InterruptOutcome::Continue);
    }
    if !can_optimize_function(isolate, function)? {
        return Ok(InterruptOutcome::Continue);
    }
    let Some(unoptimized) = isolate.function(function)?.unoptimized_code else {
        return Ok(InterruptOutcome::Continue);
    };
    let Some(osr_id) = isolate.code(unoptimized)?.deopt_id_for_osr(pc) else {
        return Ok(InterruptOutcome::Continue);
    };
    if isolate.flags().trace.osr {
        tracing::debug!(
            target: targets::OSR,
            function = %isolate.qualified_function_name(function),
            osr_id,
            count = isolate.function(function)?.usage_counter,
            "attempting OSR"
        );
    }

    let original = isolate.function(function)?.current_code;
    compile_optimized_function(isolate, function, Some(osr_id))?;
    let optimized = isolate.function(function)?.current_code;
    match optimized {
        Some(code) if optimized != original => {
            // OSR code cannot be called; fresh calls keep using the original.
            isolate.function_mut(function)?.current_code = original;
            let entry = isolate.code(code)?.entry_point;
            if let Some(frame) = isolate.stack.frame_mut(index) {
                frame.pc = entry;
            }
            Ok(InterruptOutcome::OsrEntered { code, entry })
        }
        _ => Ok(InterruptOutcome::Continue),
    }
}
