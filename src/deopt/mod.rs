//! Deoptimization
//!
//! Rebuilds baseline frames from an optimized frame whose speculation
//! failed. The work is split the way the deoptimization stub drives it:
//!
//! 1. [`deoptimize_copy_frame`] captures the optimized frame and the saved
//!    registers into a [`DeoptContext`] and reports how many slots the
//!    baseline frames need.
//! 2. [`deoptimize_fill_frame`] replaces the optimized frame with the
//!    baseline frames, leaving values that need an allocation as
//!    placeholders.
//! 3. [`deoptimize_materialize`] performs those allocations and drops the
//!    context.
//!
//! Eager deoptimization runs all three at once from the faulting frame
//! ([`deoptimize_frame`]). Lazy deoptimization marks a frame
//! ([`deoptimize_at`]) and runs the steps when control returns to it.

mod context;
mod info;

pub use context::{DeoptContext, SavedRegisters};
pub use info::{DeoptFrameDesc, DeoptInfo, DeoptInstr, ObjectDesc};

use context::{DeferredSlot, SlotValue};

use crate::diagnostics::targets;
use crate::error::{messages, Error, FatalError, Result};
use crate::gc::{HeapObject, ObjectId, ObjectKind};
use crate::jit;
use crate::runtime::{ClassId, Code, Isolate, Value, Word};
use std::rc::Rc;

/// Why optimized code gave up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeoptReason {
    Unknown,
    InstanceGetter,
    InstanceSetter,
    PolymorphicInstanceCallSmiOnly,
    PolymorphicInstanceCallTestFail,
    InstanceCallNoICData,
    StoreIndexed,
    BinarySmiOp,
    BinaryMintOp,
    ShiftMintOp,
    BinaryDoubleOp,
    UnaryOp,
    Equality,
    RelationalOp,
    NoTypeFeedback,
    UnboxInteger,
    CheckClass,
    HoistedCheckClass,
    CheckSmi,
    CheckArrayBound,
    TypeGuard,
    GuardField,
    DoubleToSmi,
    Int32Load,
    Uint32Load,
    AtCall,
}

pub fn deopt_reason_text(reason: DeoptReason) -> &'static str {
    match reason {
        DeoptReason::Unknown => "Unknown",
        DeoptReason::InstanceGetter => "InstanceGetter",
        DeoptReason::InstanceSetter => "InstanceSetter",
        DeoptReason::PolymorphicInstanceCallSmiOnly => "PolymorphicInstanceCallSmiOnly",
        DeoptReason::PolymorphicInstanceCallTestFail => "PolymorphicInstanceCallTestFail",
        DeoptReason::InstanceCallNoICData => "InstanceCallNoICData",
        DeoptReason::StoreIndexed => "StoreIndexed",
        DeoptReason::BinarySmiOp => "BinarySmiOp",
        DeoptReason::BinaryMintOp => "BinaryMintOp",
        DeoptReason::ShiftMintOp => "ShiftMintOp",
        DeoptReason::BinaryDoubleOp => "BinaryDoubleOp",
        DeoptReason::UnaryOp => "UnaryOp",
        DeoptReason::Equality => "Equality",
        DeoptReason::RelationalOp => "RelationalOp",
        DeoptReason::NoTypeFeedback => "NoTypeFeedback",
        DeoptReason::UnboxInteger => "UnboxInteger",
        DeoptReason::CheckClass => "CheckClass",
        DeoptReason::HoistedCheckClass => "HoistedCheckClass",
        DeoptReason::CheckSmi => "CheckSmi",
        DeoptReason::CheckArrayBound => "CheckArrayBound",
        DeoptReason::TypeGuard => "TypeGuard",
        DeoptReason::GuardField => "GuardField",
        DeoptReason::DoubleToSmi => "DoubleToSmi",
        DeoptReason::Int32Load => "Int32Load",
        DeoptReason::Uint32Load => "Uint32Load",
        DeoptReason::AtCall => "AtCall",
    }
}

/// Where execution continues after a deoptimization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeoptOutcome {
    /// Baseline address the innermost rebuilt frame resumes at
    pub resume_pc: usize,
    /// Number of baseline frames that replaced the optimized one
    pub frames: usize,
}

fn failed(isolate: &mut Isolate, message: impl Into<String>) -> Error {
    isolate.terminate(FatalError::DeoptimizationFailed(message.into()))
}

fn no_context() -> Error {
    Error::internal("no deoptimization in progress")
}

// ==================== Capture ====================

fn copy_frame(isolate: &mut Isolate, frame_index: usize, registers: SavedRegisters, eager: bool) -> Result<usize> {
    isolate.check_alive()?;
    if isolate.deopt_context.is_some() {
        return Err(Error::internal("a deoptimization is already in progress"));
    }
    let pc = isolate
        .stack
        .frame(frame_index)
        .map(|frame| frame.pc)
        .ok_or_else(|| Error::internal(messages::NO_DART_FRAME))?;
    let code = isolate.frame_code(frame_index)?;
    let (code_id, function) = (code.id, code.function);
    if !code.is_optimized() {
        return Err(Error::internal(messages::expected_optimized(
            &isolate.qualified_function_name(function),
        )));
    }
    let lookup = code.deopt_info_at(pc);
    let constants = code.object_pool().to_vec();
    let Some((reason, info)) = lookup else {
        let message = format!("no deopt info at {:#x} in '{}'", pc, isolate.qualified_function_name(function));
        return Err(failed(isolate, message));
    };

    let scratch = isolate.stack.slots(frame_index).map(<[Word]>::to_vec).unwrap_or_default();
    if eager {
        let f = isolate.function_mut(function)?;
        f.deoptimization_counter = f.deoptimization_counter.saturating_add(1);
    }
    if isolate.flags().trace.deoptimization {
        tracing::debug!(
            target: targets::DEOPT,
            function = %isolate.qualified_function_name(function),
            reason = deopt_reason_text(reason),
            pc = format_args!("{:#x}", pc),
            frame = frame_index,
            eager,
            deoptimizations = isolate.function(function)?.deoptimization_counter,
            "deoptimizing"
        );
    }

    let context = DeoptContext::new(code_id, function, frame_index, pc, reason, info, scratch, registers, constants);
    let dest_size = context.dest_size();
    isolate.deopt_context = Some(context);
    Ok(dest_size)
}

/// Capture the optimized frame at `frame_index` and the registers the stub
/// saved. Counts a deoptimization of the frame's function. Returns the
/// number of slots the baseline frames need.
pub fn deoptimize_copy_frame(isolate: &mut Isolate, frame_index: usize, registers: SavedRegisters) -> Result<usize> {
    copy_frame(isolate, frame_index, registers, true)
}

// ==================== Fill ====================

fn resume_pc_for(isolate: &mut Isolate, desc: &DeoptFrameDesc) -> Result<usize> {
    if isolate.function(desc.function)?.unoptimized_code.is_none() {
        // Inlined callees may never have run on their own.
        if let Err(err) = jit::compile_function(isolate, desc.function) {
            return Err(failed(isolate, err.to_string()));
        }
    }
    let baseline = isolate.function(desc.function)?.unoptimized_code;
    let resume = match baseline {
        Some(code) => isolate.code(code)?.pc_for_deopt_id(desc.deopt_id),
        None => None,
    };
    match resume {
        Some(pc) => Ok(pc),
        None => {
            let message = format!(
                "'{}' has no baseline resume point for deopt id {}",
                isolate.qualified_function_name(desc.function),
                desc.deopt_id
            );
            Err(failed(isolate, message))
        }
    }
}

/// Replace the captured optimized frame with its baseline frames. Values
/// that need an allocation are left as placeholders for
/// [`deoptimize_materialize`].
pub fn deoptimize_fill_frame(isolate: &mut Isolate) -> Result<()> {
    let (frame_index, info, code, function) = {
        let context = isolate.deopt_context.as_ref().ok_or_else(no_context)?;
        (context.frame_index, Rc::clone(&context.info), context.code, context.function)
    };
    let verbose = isolate.flags().trace.deoptimization_verbose;

    let mut frames = Vec::with_capacity(info.frames.len());
    let mut deferred = Vec::new();
    for (frame_no, desc) in info.frames.iter().enumerate() {
        let resume = resume_pc_for(isolate, desc)?;
        let mut slots = Vec::with_capacity(desc.slots.len());
        for (slot_no, instr) in desc.slots.iter().copied().enumerate() {
            let read = isolate.deopt_context.as_ref().ok_or_else(no_context)?.read(instr);
            let value = match read {
                Ok(value) => value,
                Err(message) => return Err(failed(isolate, message)),
            };
            if verbose {
                tracing::trace!(target: targets::DEOPT, frame = frame_no, slot = slot_no, ?instr, ?value, "fill");
            }
            match value {
                SlotValue::Ready(word) => slots.push(word),
                SlotValue::Mint(_) | SlotValue::Double(_) | SlotValue::Object(_) => {
                    deferred.push(DeferredSlot {
                        frame: frame_no,
                        slot: slot_no,
                        instr,
                    });
                    slots.push(Word::default());
                }
            }
        }
        frames.push((resume, slots));
    }
    let Some(resume_pc) = frames.last().map(|(pc, _)| *pc) else {
        return Err(failed(isolate, "deopt info describes no frames"));
    };

    if !isolate.stack.replace_frame(frame_index, frames) {
        return Err(Error::internal(messages::NO_DART_FRAME));
    }
    let f = isolate.function_mut(function)?;
    if f.current_code == Some(code) {
        f.switch_to_unoptimized_code();
    }
    isolate.code_mut(code)?.alive = false;

    let context = isolate.deopt_context.as_mut().ok_or_else(no_context)?;
    context.deferred = deferred;
    context.resume_pc = Some(resume_pc);
    Ok(())
}

// ==================== Materialize ====================

fn allocate(isolate: &mut Isolate, object: HeapObject) -> Result<Value> {
    match isolate.allocate(object) {
        Ok(id) => Ok(Value::Object(id)),
        Err(err) => Err(isolate.terminate(FatalError::MaterializationFailed(err.to_string()))),
    }
}

fn materialize_value(
    isolate: &mut Isolate,
    info: &DeoptInfo,
    instr: DeoptInstr,
    objects: &mut [Option<ObjectId>],
    depth: usize,
) -> Result<Value> {
    let read = isolate.deopt_context.as_ref().ok_or_else(no_context)?.read(instr);
    let value = match read {
        Ok(value) => value,
        Err(message) => return Err(failed(isolate, message)),
    };
    match value {
        SlotValue::Ready(Word::Tagged(value)) => Ok(value),
        SlotValue::Ready(Word::Int(n)) | SlotValue::Mint(n) => {
            if Value::is_smi_value(n) {
                Ok(Value::Smi(n))
            } else {
                allocate(isolate, HeapObject::new(ClassId::MINT, ObjectKind::Mint(n)))
            }
        }
        SlotValue::Ready(Word::Float(d)) | SlotValue::Double(d) => {
            allocate(isolate, HeapObject::new(ClassId::DOUBLE, ObjectKind::Double(d)))
        }
        SlotValue::Object(index) => {
            if let Some(id) = objects.get(index).copied().flatten() {
                return Ok(Value::Object(id));
            }
            if depth > info.objects.len() {
                return Err(failed(isolate, format!("materialized object {} refers to itself", index)));
            }
            let Some(desc) = info.objects.get(index) else {
                return Err(failed(isolate, format!("no materialized object {}", index)));
            };
            let mut fields = Vec::with_capacity(desc.fields.len());
            for field in desc.fields.iter().copied() {
                fields.push(materialize_value(isolate, info, field, objects, depth + 1)?);
            }
            let value = allocate(isolate, HeapObject::new(desc.class, ObjectKind::Instance { fields }))?;
            if let (Some(slot), Some(id)) = (objects.get_mut(index), value.as_object()) {
                *slot = Some(id);
            }
            Ok(value)
        }
    }
}

/// Allocate the deferred values into the rebuilt frames and finish the
/// deoptimization. An allocation failure terminates the isolate.
pub fn deoptimize_materialize(isolate: &mut Isolate) -> Result<DeoptOutcome> {
    let (frame_index, info, deferred, resume_pc, function) = {
        let context = isolate.deopt_context.as_ref().ok_or_else(no_context)?;
        let resume_pc = context
            .resume_pc
            .ok_or_else(|| Error::internal("materialization before the frame was filled"))?;
        (
            context.frame_index,
            Rc::clone(&context.info),
            context.deferred.clone(),
            resume_pc,
            context.function,
        )
    };

    let mut objects = vec![None; info.objects.len()];
    for slot in &deferred {
        let value = materialize_value(isolate, &info, slot.instr, &mut objects, 0)?;
        let target = isolate
            .stack
            .slots_mut(frame_index + slot.frame)
            .and_then(|slots| slots.get_mut(slot.slot));
        match target {
            Some(word) => *word = Word::Tagged(value),
            None => {
                let message = format!("rebuilt frame {} has no slot {}", slot.frame, slot.slot);
                return Err(failed(isolate, message));
            }
        }
        if isolate.flags().trace.deoptimization_verbose {
            tracing::trace!(target: targets::DEOPT, frame = slot.frame, slot = slot.slot, ?value, "materialized");
        }
    }

    isolate.deopt_context = None;
    if isolate.flags().trace.deoptimization {
        tracing::debug!(
            target: targets::DEOPT,
            function = %isolate.qualified_function_name(function),
            resume_pc = format_args!("{:#x}", resume_pc),
            frames = info.frames.len(),
            materialized = deferred.len(),
            "deoptimized"
        );
    }
    Ok(DeoptOutcome {
        resume_pc,
        frames: info.frames.len(),
    })
}

// ==================== Entry points ====================

fn run(isolate: &mut Isolate, frame_index: usize, registers: SavedRegisters, eager: bool) -> Result<DeoptOutcome> {
    copy_frame(isolate, frame_index, registers, eager)?;
    let result = deoptimize_fill_frame(isolate).and_then(|()| deoptimize_materialize(isolate));
    if result.is_err() {
        isolate.deopt_context = None;
    }
    result
}

/// Deoptimize the optimized frame at `frame_index` immediately, as when a
/// guard in its code fails
pub fn deoptimize_frame(isolate: &mut Isolate, frame_index: usize, registers: SavedRegisters) -> Result<DeoptOutcome> {
    run(isolate, frame_index, registers, true)
}

/// Deoptimize a frame marked by [`deoptimize_at`] now that control returned
/// to it. Invalidation is not the function's fault, so its deoptimization
/// counter is left alone.
pub fn deoptimize_lazy(isolate: &mut Isolate, frame_index: usize) -> Result<DeoptOutcome> {
    if let Some(frame) = isolate.stack.frame_mut(frame_index) {
        frame.lazy_deopt = false;
    }
    run(isolate, frame_index, SavedRegisters::default(), false)
}

/// Mark the optimized frame at `frame_index` for deoptimization when control
/// returns to it. The function goes back to baseline code for fresh calls
/// and the optimized code is marked dead.
pub fn deoptimize_at(isolate: &mut Isolate, frame_index: usize) -> Result<()> {
    let pc = isolate
        .stack
        .frame(frame_index)
        .map(|frame| frame.pc)
        .ok_or_else(|| Error::internal(messages::NO_DART_FRAME))?;
    let code = isolate.frame_code(frame_index)?;
    let (code_id, function) = (code.id, code.function);
    if !code.is_optimized() {
        return Err(Error::internal(messages::expected_optimized(
            &isolate.qualified_function_name(function),
        )));
    }
    if code.deopt_info_at(pc).is_none() {
        return Err(Error::internal(format!(
            "no deopt info at {:#x} in '{}'",
            pc,
            isolate.qualified_function_name(function)
        )));
    }

    let f = isolate.function_mut(function)?;
    if f.has_optimized_code() {
        f.switch_to_unoptimized_code();
    }
    isolate.code_mut(code_id)?.alive = false;
    if let Some(frame) = isolate.stack.frame_mut(frame_index) {
        frame.lazy_deopt = true;
    }
    if isolate.flags().trace.deoptimization {
        tracing::debug!(
            target: targets::DEOPT,
            function = %isolate.qualified_function_name(function),
            pc = format_args!("{:#x}", pc),
            frame = frame_index,
            "lazy deoptimization scheduled"
        );
    }
    Ok(())
}

fn deoptimize_matching(
    isolate: &mut Isolate,
    mut affected: impl FnMut(&Code, ClassId) -> bool,
) -> Result<usize> {
    let mut marked = 0;
    for index in 0..isolate.stack.depth() {
        let Some(frame) = isolate.stack.frame(index).copied() else {
            continue;
        };
        if frame.lazy_deopt {
            continue;
        }
        let hit = match isolate.codes.lookup_by_pc(frame.pc) {
            Some(code) if code.is_optimized() => affected(code, isolate.function(code.function)?.owner),
            _ => continue,
        };
        if hit {
            deoptimize_at(isolate, index)?;
            marked += 1;
        }
    }
    Ok(marked)
}

/// Mark every optimized frame on the stack for lazy deoptimization.
/// Returns the number of frames marked.
pub fn deoptimize_all(isolate: &mut Isolate) -> Result<usize> {
    deoptimize_matching(isolate, |_, _| true)
}

/// Mark the optimized frames whose function is owned by one of `classes`,
/// as after a class hierarchy change
pub fn deoptimize_if_owner(isolate: &mut Isolate, classes: &[ClassId]) -> Result<usize> {
    deoptimize_matching(isolate, |_, owner| classes.contains(&owner))
}

/// Invalidate optimized code compiled against the guard of `class`'s field
/// `slot` after the guard widened. Frames running it are marked for lazy
/// deoptimization and functions whose current code relies on it go back to
/// baseline code. Returns the number of frames marked.
pub fn deoptimize_field_dependents(isolate: &mut Isolate, class: ClassId, slot: usize) -> Result<usize> {
    let marked = deoptimize_matching(isolate, |code, _| code.guards_field(class, slot))?;

    let dependents: Vec<_> = isolate
        .functions
        .iter()
        .filter(|function| function.has_optimized_code())
        .filter_map(|function| {
            let code = isolate.codes.get(function.current_code?)?;
            code.guards_field(class, slot).then_some((function.id, code.id))
        })
        .collect();
    for (function, code) in dependents {
        isolate.function_mut(function)?.switch_to_unoptimized_code();
        isolate.code_mut(code)?.alive = false;
        if isolate.flags().trace.deoptimization {
            tracing::debug!(
                target: targets::DEOPT,
                function = %isolate.qualified_function_name(function),
                slot,
                "optimized code dropped after field guard change"
            );
        }
    }
    Ok(marked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeFlags;
    use crate::jit::BaselineCompiler;
    use crate::runtime::{CodeSpec, FunctionDecl, FunctionId};
    use pretty_assertions::assert_eq;

    /// A function with baseline code resuming deopt id 7 at offset 4 and
    /// optimized code deoptimizing at offset 2
    fn optimized_function(isolate: &mut Isolate, info: impl FnOnce(FunctionId) -> DeoptInfo) -> (FunctionId, usize) {
        let f = isolate
            .define_function(FunctionDecl::method(ClassId::OBJECT, "hot", 1, |_, _| Ok(Value::Null)))
            .unwrap();
        let baseline = isolate
            .codes
            .install(f, CodeSpec::unoptimized(16, 2).with_resume_point(7, 4), None);
        isolate.function_mut(f).unwrap().reattach_code(baseline);
        let optimized = isolate.codes.install(
            f,
            CodeSpec::optimized(16, 2)
                .with_constant(Value::Bool(true))
                .with_deopt_point(2, DeoptReason::CheckSmi, info(f)),
            None,
        );
        isolate.function_mut(f).unwrap().current_code = Some(optimized);
        let pc = isolate.code(optimized).unwrap().entry_point + 2;
        (f, pc)
    }

    #[test]
    fn test_reason_text() {
        assert_eq!(deopt_reason_text(DeoptReason::CheckClass), "CheckClass");
        assert_eq!(deopt_reason_text(DeoptReason::PolymorphicInstanceCallTestFail), "PolymorphicInstanceCallTestFail");
    }

    #[test]
    fn test_three_steps_rebuild_frame() {
        let mut isolate = Isolate::new(RuntimeFlags::default(), BaselineCompiler);
        let (f, pc) = optimized_function(&mut isolate, |f| {
            DeoptInfo::new().with_frame(
                f,
                7,
                vec![DeoptInstr::Constant(0), DeoptInstr::Int64Register(0), DeoptInstr::StackSlot(0)],
            )
        });
        let index = isolate.stack.push_frame(pc, vec![Word::Tagged(Value::Smi(5)), Word::Int(9)]);

        let size = deoptimize_copy_frame(&mut isolate, index, SavedRegisters::new(vec![Word::Int(i64::MAX)], Vec::new()))
            .unwrap();
        assert_eq!(size, 3);
        assert!(isolate.deopt_context.is_some());

        deoptimize_fill_frame(&mut isolate).unwrap();
        assert_eq!(isolate.stack.slots(index).unwrap()[1], Word::Tagged(Value::Null));
        let outcome = deoptimize_materialize(&mut isolate).unwrap();

        let function = isolate.function(f).unwrap();
        let baseline = function.unoptimized_code.unwrap();
        assert_eq!(function.current_code, Some(baseline));
        assert_eq!(function.deoptimization_counter, 1);
        assert_eq!(outcome.resume_pc, isolate.code(baseline).unwrap().entry_point + 4);
        assert_eq!(isolate.stack.frame(index).unwrap().pc, outcome.resume_pc);

        let slots = isolate.stack.slots(index).unwrap().to_vec();
        assert_eq!(slots[0], Word::Tagged(Value::Bool(true)));
        assert_eq!(slots[2], Word::Tagged(Value::Smi(5)));
        let boxed = slots[1].as_object().unwrap();
        assert_eq!(isolate.object(boxed).unwrap().kind, ObjectKind::Mint(i64::MAX));
        assert!(isolate.deopt_context.is_none());
    }

    #[test]
    fn test_lazy_deopt_keeps_counter() {
        let mut isolate = Isolate::new(RuntimeFlags::default(), BaselineCompiler);
        let (f, pc) =
            optimized_function(&mut isolate, |f| DeoptInfo::new().with_frame(f, 7, vec![DeoptInstr::StackSlot(0)]));
        let index = isolate.stack.push_frame(pc, vec![Word::Tagged(Value::Smi(1))]);

        assert_eq!(deoptimize_all(&mut isolate).unwrap(), 1);
        assert!(isolate.stack.frame(index).unwrap().lazy_deopt);
        assert!(!isolate.function(f).unwrap().has_optimized_code());
        // Already marked frames are not marked twice.
        assert_eq!(deoptimize_all(&mut isolate).unwrap(), 0);

        deoptimize_lazy(&mut isolate, index).unwrap();
        let frame = *isolate.stack.frame(index).unwrap();
        assert!(!frame.lazy_deopt);
        assert_eq!(isolate.function(f).unwrap().deoptimization_counter, 0);
    }

    #[test]
    fn test_pool_constant_survives_collection_before_lazy_deopt() {
        let mut isolate = Isolate::new(RuntimeFlags::default(), BaselineCompiler);
        let f = isolate
            .define_function(FunctionDecl::method(ClassId::OBJECT, "pooled", 0, |_, _| Ok(Value::Null)))
            .unwrap();
        let baseline = isolate
            .codes
            .install(f, CodeSpec::unoptimized(16, 1).with_resume_point(7, 4), None);
        isolate.function_mut(f).unwrap().reattach_code(baseline);
        let mint = isolate.new_integer(1 << 62).unwrap();
        let optimized = isolate.codes.install(
            f,
            CodeSpec::optimized(16, 1).with_constant(mint).with_deopt_point(
                2,
                DeoptReason::AtCall,
                DeoptInfo::new().with_frame(f, 7, vec![DeoptInstr::Constant(0)]),
            ),
            None,
        );
        isolate.function_mut(f).unwrap().current_code = Some(optimized);
        let pc = isolate.code(optimized).unwrap().entry_point + 2;
        let index = isolate.stack.push_frame(pc, vec![Word::default()]);

        assert_eq!(deoptimize_all(&mut isolate).unwrap(), 1);
        assert!(!isolate.code(optimized).unwrap().alive);
        isolate.collect_garbage();
        let boxed = mint.as_object().unwrap();
        assert!(isolate.heap.contains(boxed));
        isolate
            .allocate(HeapObject::new(ClassId::DOUBLE, ObjectKind::Double(2.5)))
            .unwrap();

        deoptimize_lazy(&mut isolate, index).unwrap();
        assert_eq!(isolate.stack.slots(index).unwrap()[0], Word::Tagged(mint));
        assert_eq!(isolate.object(boxed).unwrap().kind, ObjectKind::Mint(1 << 62));
    }

    #[test]
    fn test_field_dependents_only_marks_guarded_frames() {
        let mut isolate = Isolate::new(RuntimeFlags::default(), BaselineCompiler);
        let (plain, plain_pc) =
            optimized_function(&mut isolate, |f| DeoptInfo::new().with_frame(f, 7, vec![DeoptInstr::StackSlot(0)]));
        let guarded = isolate
            .define_function(FunctionDecl::method(ClassId::OBJECT, "guarded", 1, |_, _| Ok(Value::Null)))
            .unwrap();
        let baseline = isolate
            .codes
            .install(guarded, CodeSpec::unoptimized(16, 1).with_resume_point(7, 4), None);
        isolate.function_mut(guarded).unwrap().reattach_code(baseline);
        let optimized = isolate.codes.install(
            guarded,
            CodeSpec::optimized(16, 1).with_field_guard(ClassId::OBJECT, 0).with_deopt_point(
                2,
                DeoptReason::AtCall,
                DeoptInfo::new().with_frame(guarded, 7, vec![DeoptInstr::StackSlot(0)]),
            ),
            None,
        );
        isolate.function_mut(guarded).unwrap().current_code = Some(optimized);
        let guarded_pc = isolate.code(optimized).unwrap().entry_point + 2;

        let plain_frame = isolate.stack.push_frame(plain_pc, vec![Word::default()]);
        let guarded_frame = isolate.stack.push_frame(guarded_pc, vec![Word::default()]);

        assert_eq!(deoptimize_field_dependents(&mut isolate, ClassId::OBJECT, 1).unwrap(), 0);
        assert_eq!(deoptimize_field_dependents(&mut isolate, ClassId::OBJECT, 0).unwrap(), 1);
        assert!(!isolate.stack.frame(plain_frame).unwrap().lazy_deopt);
        assert!(isolate.stack.frame(guarded_frame).unwrap().lazy_deopt);
        assert!(isolate.function(plain).unwrap().has_optimized_code());
        assert!(!isolate.function(guarded).unwrap().has_optimized_code());
    }

    #[test]
    fn test_missing_deopt_info_is_fatal() {
        let mut isolate = Isolate::new(RuntimeFlags::default(), BaselineCompiler);
        let (_, pc) = optimized_function(&mut isolate, |_| DeoptInfo::new());
        let index = isolate.stack.push_frame(pc + 1, Vec::new());
        let err = deoptimize_copy_frame(&mut isolate, index, SavedRegisters::default()).unwrap_err();
        assert!(err.is_fatal());
        assert!(isolate.is_terminated());
    }
}
