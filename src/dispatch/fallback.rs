//! Getter and `noSuchMethod` fallback for unresolved instance calls

use super::ic::tested_class_ids;
use super::{get_invocation_dispatcher, resolve_dynamic_for_receiver_class, ArgumentsDescriptor, ICData};
use crate::diagnostics::targets;
use crate::error::{Error, Result};
use crate::gc::ObjectKind;
use crate::runtime::{
    invoke_closure, invoke_function, invoke_no_such_method, ClassId, DispatcherKind, FunctionId, Isolate, Value,
};

fn trace_fallback(isolate: &Isolate, kind: &str, class: ClassId, target: FunctionId) {
    if isolate.flags().trace.ic {
        tracing::debug!(
            target: targets::IC,
            receiver = isolate.class_name(class),
            cid = class.0,
            target_function = %isolate.qualified_function_name(target),
            "{} IC miss: adding check",
            kind
        );
    }
}

/// Record `dispatcher` for the tested classes of `args`. Megamorphic misses
/// land here repeatedly for the same classes, so existing checks are kept.
fn record_dispatcher(
    isolate: &Isolate,
    class: ClassId,
    args: &[Value],
    ic: &mut ICData,
    dispatcher: FunctionId,
) -> Result<()> {
    if ic.num_args_tested() == 1 {
        if ic.target_for_receiver_class_id(class).is_none() {
            ic.add_receiver_check(class, dispatcher);
        }
        return Ok(());
    }
    let class_ids = tested_class_ids(isolate, args, ic.num_args_tested())?;
    if ic.lookup(&class_ids).is_none() {
        ic.add_check(class_ids, dispatcher);
    }
    Ok(())
}

/// Call through a getter named like the selector. Returns `None` when there
/// is no such getter or the getter would only tear off a method.
fn resolve_call_through_getter(
    isolate: &mut Isolate,
    class: ClassId,
    args: &[Value],
    ic: &mut ICData,
) -> Result<Option<Value>> {
    let target_name = ic.target_name();
    let getter_name = isolate.symbols.getter_name(target_name);
    let getter =
        resolve_dynamic_for_receiver_class(isolate, class, getter_name, &ArgumentsDescriptor::positional(1))?;
    let Some(getter) = getter else {
        return Ok(None);
    };
    if isolate.function(getter)?.is_method_extractor() {
        return Ok(None);
    }

    let descriptor = ic.arguments_descriptor().clone();
    let dispatcher = get_invocation_dispatcher(isolate, class, target_name, &descriptor, DispatcherKind::InvokeField)?;
    record_dispatcher(isolate, class, args, ic, dispatcher)?;
    trace_fallback(isolate, "InvokeField", class, dispatcher);
    invoke_function(isolate, dispatcher, args).map(Some)
}

/// The inline cache miss handler found no target. Tries, in order, a getter
/// whose value is called with the arguments, then the receiver's
/// `noSuchMethod`. The dispatcher used is recorded in `ic`.
pub fn instance_function_lookup(isolate: &mut Isolate, args: &[Value], ic: &mut ICData) -> Result<Value> {
    isolate.check_alive()?;
    let receiver = args
        .first()
        .copied()
        .ok_or_else(|| Error::internal("instance call without a receiver"))?;
    let class = isolate.class_id_of(receiver)?;
    if let Some(result) = resolve_call_through_getter(isolate, class, args, ic)? {
        return Ok(result);
    }

    let target_name = ic.target_name();
    let descriptor = ic.arguments_descriptor().clone();
    let dispatcher = get_invocation_dispatcher(isolate, class, target_name, &descriptor, DispatcherKind::NoSuchMethod)?;
    record_dispatcher(isolate, class, args, ic, dispatcher)?;
    trace_fallback(isolate, "NoSuchMethod", class, dispatcher);
    invoke_function(isolate, dispatcher, args)
}

/// Send the call recorded in `ic` to the receiver's `noSuchMethod`. Closure
/// receivers are reported under their function's qualified name instead of
/// `call`.
pub fn invoke_no_such_method_function(
    isolate: &mut Isolate,
    receiver: Value,
    ic: &ICData,
    descriptor: &ArgumentsDescriptor,
    args: &[Value],
) -> Result<Value> {
    isolate.check_alive()?;
    let closure_function = match receiver.as_object() {
        Some(object) => match isolate.object(object)?.kind {
            ObjectKind::Closure { function, .. } => Some(function),
            _ => None,
        },
        None => None,
    };
    let selector = match closure_function {
        Some(function) => {
            let name = isolate.qualified_function_name(function);
            isolate.intern(&name)
        }
        None => ic.target_name(),
    };
    invoke_no_such_method(isolate, receiver, selector, args, descriptor)
}

/// A non-closure object was called like a function: invoke its `call`
pub fn invoke_non_closure(isolate: &mut Isolate, descriptor: &ArgumentsDescriptor, args: &[Value]) -> Result<Value> {
    isolate.check_alive()?;
    invoke_closure(isolate, args, descriptor)
}
