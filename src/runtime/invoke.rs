//! Invoking functions the way generated code calls them
//!
//! Each invocation pushes a frame running the function's current code, runs
//! the body, pops the frame and then honors a pending lazy deoptimization of
//! the frame control returns to.

use super::{allocate_implicit_instance_closure, ClassId, FunctionId, FunctionKind, Isolate, Symbol, Value, Word};
use crate::deopt;
use crate::diagnostics::targets;
use crate::dispatch::{resolve_dynamic_for_receiver_class, ArgumentsDescriptor};
use crate::error::{Error, Result};
use crate::gc::{HeapObject, ObjectKind};
use crate::jit;

/// Call `function` with `args` (receiver or closure first)
pub fn invoke_function(isolate: &mut Isolate, function: FunctionId, args: &[Value]) -> Result<Value> {
    isolate.check_alive()?;
    jit::compile_function(isolate, function)?;
    jit::increment_usage_counter(isolate, function)?;
    let code_id = isolate
        .function(function)?
        .current_code
        .ok_or_else(|| Error::internal(format!("'{}' has no code", isolate.qualified_function_name(function))))?;
    let code = isolate.code(code_id)?;
    let (entry_point, frame_size) = (code.entry_point, code.frame_size);

    let mut slots: Vec<Word> = args.iter().copied().map(Word::from).collect();
    if slots.len() < frame_size {
        slots.resize(frame_size, Word::default());
    }
    let depth = isolate.stack.depth();
    isolate.stack.push_frame(entry_point, slots);
    if isolate.flags().trace.runtime_calls {
        tracing::trace!(
            target: targets::RUNTIME_CALLS,
            function = %isolate.qualified_function_name(function),
            depth,
            "invoke"
        );
    }

    let tracing_functions = isolate.flags().trace.functions;
    if tracing_functions {
        tracing::debug!(
            target: targets::FUNCTIONS,
            "> Entering '{}'",
            isolate.qualified_function_name(function)
        );
    }

    let result = enter(isolate, function, args);
    isolate.stack.truncate_frames(depth);
    let result = result?;
    if tracing_functions {
        tracing::debug!(
            target: targets::FUNCTIONS,
            "< Exiting '{}'",
            isolate.qualified_function_name(function)
        );
    }

    if isolate.flags().deoptimize_alot {
        deopt::deoptimize_all(isolate)?;
    }
    if let Some(caller) = isolate.stack.top_index() {
        if isolate.stack.frame(caller).is_some_and(|frame| frame.lazy_deopt) {
            deopt::deoptimize_lazy(isolate, caller)?;
        }
    }
    Ok(result)
}

fn enter(isolate: &mut Isolate, function: FunctionId, args: &[Value]) -> Result<Value> {
    if isolate.stack.is_overflowed() || !isolate.interrupts.is_empty() {
        jit::stack_overflow(isolate)?;
    }
    let kind = isolate.function(function)?.kind.clone();
    match kind {
        FunctionKind::Regular(body) | FunctionKind::Closure(body) => body(isolate, args),
        FunctionKind::ImplicitGetter { field } => read_field(isolate, receiver(args)?, field),
        FunctionKind::MethodExtractor { method } => {
            let closure_function = implicit_closure_function(isolate, method)?;
            allocate_implicit_instance_closure(isolate, closure_function, receiver(args)?, None)
        }
        FunctionKind::ImplicitClosure { target } => {
            let bound = closure_context(isolate, receiver(args)?)?
                .first()
                .copied()
                .ok_or_else(|| Error::internal("implicit closure without a receiver"))?;
            let mut forwarded = Vec::with_capacity(args.len());
            forwarded.push(bound);
            forwarded.extend_from_slice(&args[1..]);
            invoke_function(isolate, target, &forwarded)
        }
        FunctionKind::InvokeFieldDispatcher {
            target_name,
            descriptor,
        } => invoke_field(isolate, target_name, &descriptor, args),
        FunctionKind::NoSuchMethodDispatcher {
            target_name,
            descriptor,
        } => invoke_no_such_method(isolate, receiver(args)?, target_name, args, &descriptor),
    }
}

fn receiver(args: &[Value]) -> Result<Value> {
    args.first()
        .copied()
        .ok_or_else(|| Error::internal("call without a receiver"))
}

fn read_field(isolate: &Isolate, receiver: Value, field: usize) -> Result<Value> {
    let object = receiver
        .as_object()
        .ok_or_else(|| Error::internal("field read on a non-object"))?;
    match &isolate.object(object)?.kind {
        ObjectKind::Instance { fields } => fields
            .get(field)
            .copied()
            .ok_or_else(|| Error::internal(format!("field index {} out of range", field))),
        _ => Err(Error::internal("field read on a non-instance")),
    }
}

fn closure_context(isolate: &Isolate, closure: Value) -> Result<&[Value]> {
    let object = closure
        .as_object()
        .ok_or_else(|| Error::internal("closure expected"))?;
    match &isolate.object(object)?.kind {
        ObjectKind::Closure { context, .. } => Ok(context),
        _ => Err(Error::internal("closure expected")),
    }
}

/// Closure function tearing off `method`, created on first use
fn implicit_closure_function(isolate: &mut Isolate, method: FunctionId) -> Result<FunctionId> {
    let (owner, name, signature) = {
        let function = isolate.function(method)?;
        (function.owner, function.name, function.signature.clone())
    };
    if let Some(&existing) = isolate.class(owner)?.implicit_closures.get(&method) {
        return Ok(existing);
    }
    let id = isolate.functions.add(
        name,
        owner,
        FunctionKind::ImplicitClosure { target: method },
        signature,
        false,
        true,
    );
    if let Some(class) = isolate.classes.get_mut(owner) {
        class.implicit_closures.insert(method, id);
    }
    Ok(id)
}

/// Read `get:target_name` from the receiver and call the result
fn invoke_field(
    isolate: &mut Isolate,
    target_name: Symbol,
    descriptor: &ArgumentsDescriptor,
    args: &[Value],
) -> Result<Value> {
    let receiver = receiver(args)?;
    let class = isolate.class_id_of(receiver)?;
    let getter_name = isolate.symbols.getter_name(target_name);
    let getter = resolve_dynamic_for_receiver_class(
        isolate,
        class,
        getter_name,
        &ArgumentsDescriptor::positional(1),
    )?;
    let Some(getter) = getter else {
        return invoke_no_such_method(isolate, receiver, target_name, args, descriptor);
    };
    let callee = invoke_function(isolate, getter, &[receiver])?;
    let mut forwarded = args.to_vec();
    forwarded[0] = callee;
    invoke_closure(isolate, &forwarded, descriptor)
}

/// Call `args[0]` with the remaining arguments. Closures run their
/// function; other objects are sent `call`.
pub fn invoke_closure(isolate: &mut Isolate, args: &[Value], descriptor: &ArgumentsDescriptor) -> Result<Value> {
    let callee = receiver(args)?;
    let call = isolate.symbols.call;
    let closure_function = callee
        .as_object()
        .map(|object| isolate.object(object))
        .transpose()?
        .and_then(|object| match object.kind {
            ObjectKind::Closure { function, .. } => Some(function),
            _ => None,
        });
    if let Some(function) = closure_function {
        if isolate.function(function)?.signature.accepts(descriptor) {
            return invoke_function(isolate, function, args);
        }
        return invoke_no_such_method(isolate, callee, call, args, descriptor);
    }
    let class = isolate.class_id_of(callee)?;
    match resolve_dynamic_for_receiver_class(isolate, class, call, descriptor)? {
        Some(target) => invoke_function(isolate, target, args),
        None => invoke_no_such_method(isolate, callee, call, args, descriptor),
    }
}

/// Reify the call as an invocation object and send it to the receiver's
/// `noSuchMethod`. Errors raised by the handler propagate unchanged.
pub fn invoke_no_such_method(
    isolate: &mut Isolate,
    receiver: Value,
    selector: Symbol,
    args: &[Value],
    descriptor: &ArgumentsDescriptor,
) -> Result<Value> {
    let invocation = isolate.allocate(HeapObject::new(
        ClassId::INVOCATION,
        ObjectKind::Invocation {
            selector,
            positional: descriptor.positional_count().saturating_sub(1),
            named: descriptor.named().to_vec(),
            values: args.get(1..).unwrap_or_default().to_vec(),
        },
    ))?;
    let class = isolate.class_id_of(receiver)?;
    let no_such_method = isolate.symbols.no_such_method;
    let handler = resolve_dynamic_for_receiver_class(
        isolate,
        class,
        no_such_method,
        &ArgumentsDescriptor::positional(2),
    )?
    .ok_or_else(|| Error::internal(format!("'{}' has no noSuchMethod", isolate.class_name(class))))?;
    invoke_function(isolate, handler, &[receiver, Value::Object(invocation)])
}
