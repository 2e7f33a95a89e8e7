//! Integration tests for eager and lazy deoptimization

mod common;
use common::{instance, scripted_isolate, Script};
use jitrt::deopt::{
    deoptimize_copy_frame, deoptimize_fill_frame, deoptimize_frame, deoptimize_if_owner, deoptimize_materialize,
    DeoptInfo, DeoptInstr, DeoptReason, SavedRegisters,
};
use jitrt::gc::{GcConfig, ObjectKind};
use jitrt::jit::{compile_function, optimize_invoked_function};
use jitrt::runtime::{
    invoke_function, ClassDecl, ClassId, CodeId, CodeSpec, FunctionDecl, FunctionId, Isolate, Word,
    LOW_INVOCATION_COUNT, SMI_MAX,
};
use jitrt::{Error, FatalError, RuntimeFlags, Value};
use pretty_assertions::assert_eq;
use std::cell::RefCell;
use std::rc::Rc;

/// A method running optimized code with a type guard at offset 6. Its
/// baseline code resumes deopt id 7 at offset 4.
struct Hot {
    function: FunctionId,
    optimized: CodeId,
    /// Address of the type guard
    guard_pc: usize,
}

fn optimized_method(
    isolate: &mut Isolate,
    script: &Rc<RefCell<Script>>,
    owner: ClassId,
    name: &str,
    info: impl FnOnce(FunctionId) -> DeoptInfo,
) -> Hot {
    let function = isolate
        .define_function(FunctionDecl::method(owner, name, 0, |_, _| Ok(Value::Null)))
        .unwrap();
    {
        let mut script = script.borrow_mut();
        script
            .baseline
            .insert(function, CodeSpec::unoptimized(32, 2).with_resume_point(7, 4));
        script.optimized.insert(
            function,
            CodeSpec::optimized(32, 2).with_deopt_point(6, DeoptReason::TypeGuard, info(function)),
        );
    }
    compile_function(isolate, function).unwrap();
    let optimized = optimize_invoked_function(isolate, function).unwrap();
    let guard_pc = isolate.code(optimized).unwrap().entry_point + 6;
    Hot {
        function,
        optimized,
        guard_pc,
    }
}

fn baseline_pc(isolate: &Isolate, function: FunctionId, offset: usize) -> usize {
    let code = isolate.function(function).unwrap().unoptimized_code.unwrap();
    isolate.code(code).unwrap().entry_point + offset
}

mod eager {
    use super::*;
    #[allow(unused_imports)]
    use pretty_assertions::assert_eq;

    #[test]
    fn test_failed_guard_returns_to_baseline_and_counts() {
        let flags = RuntimeFlags::default()
            .with_optimization_threshold(2)
            .with_deoptimization_threshold(1);
        let (mut isolate, script) = scripted_isolate(flags);
        let hot = optimized_method(&mut isolate, &script, ClassId::OBJECT, "hot", |f| {
            DeoptInfo::new().with_frame(f, 7, vec![DeoptInstr::StackSlot(0), DeoptInstr::StackSlot(1)])
        });
        let index = isolate
            .stack
            .push_frame(hot.guard_pc, vec![Word::Tagged(Value::Smi(1)), Word::Tagged(Value::Smi(2))]);

        let outcome = deoptimize_frame(&mut isolate, index, SavedRegisters::default()).unwrap();
        assert_eq!(outcome.frames, 1);
        assert_eq!(outcome.resume_pc, baseline_pc(&isolate, hot.function, 4));
        let function = isolate.function(hot.function).unwrap();
        assert_eq!(function.current_code, function.unoptimized_code);
        assert_eq!(function.deoptimization_counter, 1);
        assert!(!isolate.code(hot.optimized).unwrap().alive);
        assert_eq!(
            isolate.stack.slots(index).unwrap(),
            &[Word::Tagged(Value::Smi(1)), Word::Tagged(Value::Smi(2))][..]
        );

        // The ceiling is reached, so crossing the threshold again is refused.
        for _ in 0..2 {
            invoke_function(&mut isolate, hot.function, &[Value::Null]).unwrap();
        }
        let function = isolate.function(hot.function).unwrap();
        assert!(!function.has_optimized_code());
        assert_eq!(function.usage_counter, LOW_INVOCATION_COUNT);
        assert_eq!(script.borrow().optimizations.len(), 1);
    }

    #[test]
    fn test_elided_allocation_and_unboxed_values_are_materialized() {
        let (mut isolate, script) = scripted_isolate(RuntimeFlags::default());
        let point = isolate
            .define_class(ClassDecl::new("Point").field("x").field("y"))
            .unwrap();
        let hot = optimized_method(&mut isolate, &script, point, "scale", |f| {
            DeoptInfo::new()
                .with_frame(
                    f,
                    7,
                    vec![
                        DeoptInstr::MaterializedObject(0),
                        DeoptInstr::MaterializedObject(0),
                        DeoptInstr::Int64StackSlot(1),
                    ],
                )
                .with_object(point, vec![DeoptInstr::Int64Register(0), DeoptInstr::DoubleStackSlot(0)])
        });
        let index = isolate
            .stack
            .push_frame(hot.guard_pc, vec![Word::Float(1.5), Word::Int(SMI_MAX + 1)]);

        let registers = SavedRegisters::new(vec![Word::Int(42)], Vec::new());
        deoptimize_frame(&mut isolate, index, registers).unwrap();

        let slots = isolate.stack.slots(index).unwrap().to_vec();
        let object = slots[0].as_object().unwrap();
        // One elided allocation referenced twice is materialized once.
        assert_eq!(slots[1].as_object(), Some(object));
        let fields = match &isolate.object(object).unwrap().kind {
            ObjectKind::Instance { fields } => fields.clone(),
            other => panic!("unexpected object: {:?}", other),
        };
        assert_eq!(isolate.object(object).unwrap().class, point);
        assert_eq!(fields[0], Value::Smi(42));
        let y = fields[1].as_object().unwrap();
        assert_eq!(isolate.object(y).unwrap().kind, ObjectKind::Double(1.5));
        let mint = slots[2].as_object().unwrap();
        assert_eq!(isolate.object(mint).unwrap().kind, ObjectKind::Mint(SMI_MAX + 1));
    }

    #[test]
    fn test_inlined_callee_gets_its_own_frame() {
        let (mut isolate, script) = scripted_isolate(RuntimeFlags::default());
        let inner = isolate
            .define_function(FunctionDecl::static_function(ClassId::OBJECT, "inner", 1, |_, _| Ok(Value::Null)))
            .unwrap();
        script
            .borrow_mut()
            .baseline
            .insert(inner, CodeSpec::unoptimized(32, 1).with_resume_point(3, 10));
        let hot = optimized_method(&mut isolate, &script, ClassId::OBJECT, "outer", |f| {
            DeoptInfo::new()
                .with_frame(f, 7, vec![DeoptInstr::StackSlot(0)])
                .with_frame(inner, 3, vec![DeoptInstr::CpuRegister(0)])
        });
        let below = isolate.stack.push_frame(0, vec![Word::Tagged(Value::Smi(-1))]);
        let index = isolate.stack.push_frame(hot.guard_pc, vec![Word::Tagged(Value::Smi(8)), Word::Int(0)]);

        let registers = SavedRegisters::new(vec![Word::Tagged(Value::Smi(3))], Vec::new());
        let outcome = deoptimize_frame(&mut isolate, index, registers).unwrap();

        assert_eq!(outcome.frames, 2);
        assert_eq!(isolate.stack.depth(), 3);
        assert!(isolate.function(inner).unwrap().has_code());
        assert_eq!(isolate.stack.frame(index).unwrap().pc, baseline_pc(&isolate, hot.function, 4));
        assert_eq!(isolate.stack.frame(index + 1).unwrap().pc, baseline_pc(&isolate, inner, 10));
        assert_eq!(outcome.resume_pc, baseline_pc(&isolate, inner, 10));
        assert_eq!(isolate.stack.slots(below).unwrap(), &[Word::Tagged(Value::Smi(-1))][..]);
        assert_eq!(isolate.stack.slots(index).unwrap(), &[Word::Tagged(Value::Smi(8))][..]);
        assert_eq!(isolate.stack.slots(index + 1).unwrap(), &[Word::Tagged(Value::Smi(3))][..]);
    }

    #[test]
    fn test_context_keeps_register_values_alive() {
        let (mut isolate, script) = scripted_isolate(RuntimeFlags::default());
        let hot = optimized_method(&mut isolate, &script, ClassId::OBJECT, "hot", |f| {
            DeoptInfo::new().with_frame(f, 7, vec![DeoptInstr::CpuRegister(0)])
        });
        let boxed = instance(&mut isolate, ClassId::OBJECT);
        let id = boxed.as_object().unwrap();
        let index = isolate.stack.push_frame(hot.guard_pc, vec![Word::default(); 2]);

        let registers = SavedRegisters::new(vec![Word::Tagged(boxed)], Vec::new());
        assert_eq!(deoptimize_copy_frame(&mut isolate, index, registers).unwrap(), 1);
        let context = isolate.deopt_context().unwrap();
        assert_eq!(context.reason(), DeoptReason::TypeGuard);
        assert_eq!(context.source_size(), 2);

        // Only the context refers to the object now.
        isolate.collect_garbage();
        assert!(isolate.heap.contains(id));

        deoptimize_fill_frame(&mut isolate).unwrap();
        deoptimize_materialize(&mut isolate).unwrap();
        assert!(isolate.deopt_context().is_none());
        assert_eq!(isolate.stack.slots(index).unwrap(), &[Word::Tagged(boxed)][..]);
    }

    #[test]
    fn test_allocation_failure_terminates_isolate() {
        let (mut isolate, script) = scripted_isolate(RuntimeFlags::default());
        let hot = optimized_method(&mut isolate, &script, ClassId::OBJECT, "hot", |f| {
            DeoptInfo::new().with_frame(f, 7, vec![DeoptInstr::Int64StackSlot(0)])
        });
        let index = isolate.stack.push_frame(hot.guard_pc, vec![Word::Int(SMI_MAX + 1), Word::Int(0)]);
        let full = isolate.heap.live_count();
        isolate.heap.set_config(GcConfig {
            max_live_objects: full,
            ..GcConfig::default()
        });

        let err = deoptimize_frame(&mut isolate, index, SavedRegisters::default()).unwrap_err();
        assert!(matches!(err, Error::Fatal(FatalError::MaterializationFailed(_))));
        assert!(isolate.is_terminated());
        assert!(isolate.deopt_context().is_none());
        let err = invoke_function(&mut isolate, hot.function, &[Value::Null]).unwrap_err();
        assert!(err.is_fatal());
    }
}

mod lazy {
    use super::*;
    #[allow(unused_imports)]
    use pretty_assertions::assert_eq;

    #[test]
    fn test_owner_change_deoptimizes_caller_on_return() {
        let (mut isolate, script) = scripted_isolate(RuntimeFlags::default());
        let shape = isolate.define_class(ClassDecl::new("Shape")).unwrap();
        let other = isolate.define_class(ClassDecl::new("Other")).unwrap();
        let stable = optimized_method(&mut isolate, &script, other, "stable", |f| {
            DeoptInfo::new().with_frame(f, 7, vec![DeoptInstr::StackSlot(0)])
        });
        let area = optimized_method(&mut isolate, &script, shape, "area", |f| {
            DeoptInfo::new().with_frame(f, 7, vec![DeoptInstr::StackSlot(1), DeoptInstr::StackSlot(0)])
        });
        let invalidate = isolate
            .define_function(FunctionDecl::static_function(ClassId::OBJECT, "invalidate", 0, move |isolate, _| {
                let marked = deoptimize_if_owner(isolate, &[shape])?;
                Ok(Value::Smi(marked as i64))
            }))
            .unwrap();

        let outer = isolate.stack.push_frame(stable.guard_pc, vec![Word::Tagged(Value::Smi(0))]);
        let caller = isolate
            .stack
            .push_frame(area.guard_pc, vec![Word::Tagged(Value::Smi(1)), Word::Tagged(Value::Smi(2))]);

        let marked = invoke_function(&mut isolate, invalidate, &[]).unwrap();
        assert_eq!(marked, Value::Smi(1));

        let frame = *isolate.stack.frame(caller).unwrap();
        assert!(!frame.lazy_deopt);
        assert_eq!(frame.pc, baseline_pc(&isolate, area.function, 4));
        assert_eq!(
            isolate.stack.slots(caller).unwrap(),
            &[Word::Tagged(Value::Smi(2)), Word::Tagged(Value::Smi(1))][..]
        );
        let function = isolate.function(area.function).unwrap();
        assert!(!function.has_optimized_code());
        assert_eq!(function.deoptimization_counter, 0);
        assert!(!isolate.code(area.optimized).unwrap().alive);

        // Frames of unaffected classes keep running optimized code.
        assert_eq!(isolate.stack.frame(outer).unwrap().pc, stable.guard_pc);
        assert!(isolate.function(stable.function).unwrap().has_optimized_code());
        assert!(isolate.code(stable.optimized).unwrap().alive);
    }

    #[test]
    fn test_deoptimize_alot_rebuilds_every_return_target() {
        let mut flags = RuntimeFlags::default();
        flags.deoptimize_alot = true;
        let (mut isolate, script) = scripted_isolate(flags);
        let hot = optimized_method(&mut isolate, &script, ClassId::OBJECT, "hot", |f| {
            DeoptInfo::new().with_frame(f, 7, vec![DeoptInstr::StackSlot(0)])
        });
        let leaf = isolate
            .define_function(FunctionDecl::static_function(ClassId::OBJECT, "leaf", 0, |_, _| Ok(Value::Null)))
            .unwrap();
        let caller = isolate.stack.push_frame(hot.guard_pc, vec![Word::Tagged(Value::Smi(4)), Word::Int(0)]);

        invoke_function(&mut isolate, leaf, &[]).unwrap();
        assert_eq!(isolate.stack.frame(caller).unwrap().pc, baseline_pc(&isolate, hot.function, 4));
        assert_eq!(isolate.stack.slots(caller).unwrap(), &[Word::Tagged(Value::Smi(4))][..]);
        assert_eq!(isolate.function(hot.function).unwrap().deoptimization_counter, 0);
    }
}
