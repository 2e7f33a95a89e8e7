//! Method resolution and synthesized dispatcher functions

use super::ArgumentsDescriptor;
use crate::error::Result;
use crate::runtime::{ClassId, DispatcherKind, FunctionId, FunctionKind, Isolate, Signature, Symbol};

/// First non-static function named `name` on `class` or an ancestor
fn lookup_dynamic_function(isolate: &Isolate, class: ClassId, name: Symbol) -> Option<FunctionId> {
    isolate
        .classes
        .superclass_chain(class)
        .filter_map(|c| c.lookup_function(name))
        .find(|&id| isolate.functions.get(id).is_some_and(|f| !f.is_static))
}

/// Resolve `name` for an instance of `class` called with `descriptor`.
///
/// Returns `None` when nothing matches, including when the first function
/// found by name does not accept the arguments. A getter selector with no
/// getter but a method of the same base name resolves to a method extractor,
/// created on first use.
pub fn resolve_dynamic_for_receiver_class(
    isolate: &mut Isolate,
    class: ClassId,
    name: Symbol,
    descriptor: &ArgumentsDescriptor,
) -> Result<Option<FunctionId>> {
    isolate.class(class)?;
    let found = match lookup_dynamic_function(isolate, class, name) {
        Some(found) => Some(found),
        None => create_method_extractor(isolate, class, name)?,
    };
    let Some(function) = found else {
        return Ok(None);
    };
    if !isolate.function(function)?.signature.accepts(descriptor) {
        return Ok(None);
    }
    Ok(Some(function))
}

fn create_method_extractor(isolate: &mut Isolate, class: ClassId, getter: Symbol) -> Result<Option<FunctionId>> {
    let Some(method_name) = isolate
        .symbols
        .field_name_of_getter(getter)
        .and_then(|field| isolate.symbols.get(field))
    else {
        return Ok(None);
    };
    let Some(method) = lookup_dynamic_function(isolate, class, method_name) else {
        return Ok(None);
    };
    let owner = isolate.function(method)?.owner;
    let extractor = isolate.functions.add(
        getter,
        owner,
        FunctionKind::MethodExtractor { method },
        Signature::fixed(1),
        false,
        true,
    );
    if let Some(owner) = isolate.classes.get_mut(owner) {
        owner.functions.insert(getter, extractor);
    }
    Ok(Some(extractor))
}

/// Dispatcher of `kind` for calls of `name` shaped like `descriptor` on
/// `class`, created on first use and reused afterwards
pub fn get_invocation_dispatcher(
    isolate: &mut Isolate,
    class: ClassId,
    name: Symbol,
    descriptor: &ArgumentsDescriptor,
    kind: DispatcherKind,
) -> Result<FunctionId> {
    if let Some(existing) = isolate.class(class)?.dispatcher(name, descriptor, kind) {
        return Ok(existing);
    }
    let function_kind = match kind {
        DispatcherKind::InvokeField => FunctionKind::InvokeFieldDispatcher {
            target_name: name,
            descriptor: descriptor.clone(),
        },
        DispatcherKind::NoSuchMethod => FunctionKind::NoSuchMethodDispatcher {
            target_name: name,
            descriptor: descriptor.clone(),
        },
    };
    let signature = Signature {
        num_fixed_parameters: descriptor.positional_count(),
        named_parameters: descriptor.named().to_vec(),
        ..Signature::default()
    };
    let id = isolate.functions.add(name, class, function_kind, signature, false, false);
    if let Some(owner) = isolate.classes.get_mut(class) {
        owner.dispatchers.insert((name, descriptor.clone(), kind), id);
    }
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeFlags;
    use crate::jit::BaselineCompiler;
    use crate::runtime::{ClassDecl, FunctionDecl, Value};
    use crate::types::AbstractType;

    fn isolate() -> Isolate {
        Isolate::new(RuntimeFlags::default(), BaselineCompiler)
    }

    #[test]
    fn test_resolves_through_superclass() {
        let mut isolate = isolate();
        let base = isolate.define_class(ClassDecl::new("Base")).unwrap();
        let derived = isolate
            .define_class(ClassDecl::new("Derived").extends(AbstractType::raw(base)))
            .unwrap();
        let add = isolate
            .define_function(FunctionDecl::method(base, "add", 1, |_, _| Ok(Value::Null)))
            .unwrap();
        let name = isolate.intern("add");

        let found = resolve_dynamic_for_receiver_class(&mut isolate, derived, name, &ArgumentsDescriptor::positional(2));
        assert_eq!(found.unwrap(), Some(add));
        let wrong_arity =
            resolve_dynamic_for_receiver_class(&mut isolate, derived, name, &ArgumentsDescriptor::positional(3));
        assert_eq!(wrong_arity.unwrap(), None);
    }

    #[test]
    fn test_static_functions_are_skipped() {
        let mut isolate = isolate();
        let class = isolate.define_class(ClassDecl::new("Util")).unwrap();
        isolate
            .define_function(FunctionDecl::static_function(class, "make", 1, |_, _| Ok(Value::Null)))
            .unwrap();
        let name = isolate.intern("make");
        let found = resolve_dynamic_for_receiver_class(&mut isolate, class, name, &ArgumentsDescriptor::positional(1));
        assert_eq!(found.unwrap(), None);
    }

    #[test]
    fn test_getter_of_method_creates_extractor_once() {
        let mut isolate = isolate();
        let class = isolate.define_class(ClassDecl::new("Widget")).unwrap();
        let draw = isolate
            .define_function(FunctionDecl::method(class, "draw", 0, |_, _| Ok(Value::Null)))
            .unwrap();
        let getter = isolate.intern("get:draw");
        let one = ArgumentsDescriptor::positional(1);

        let extractor = resolve_dynamic_for_receiver_class(&mut isolate, class, getter, &one)
            .unwrap()
            .unwrap();
        assert!(matches!(
            isolate.function(extractor).unwrap().kind,
            FunctionKind::MethodExtractor { method } if method == draw
        ));
        let again = resolve_dynamic_for_receiver_class(&mut isolate, class, getter, &one).unwrap();
        assert_eq!(again, Some(extractor));

        let missing = isolate.intern("get:erase");
        assert_eq!(resolve_dynamic_for_receiver_class(&mut isolate, class, missing, &one).unwrap(), None);
    }

    #[test]
    fn test_dispatchers_are_cached_per_shape() {
        let mut isolate = isolate();
        let class = isolate.define_class(ClassDecl::new("Holder")).unwrap();
        let name = isolate.intern("run");
        let two = ArgumentsDescriptor::positional(2);

        let a = get_invocation_dispatcher(&mut isolate, class, name, &two, DispatcherKind::InvokeField).unwrap();
        let b = get_invocation_dispatcher(&mut isolate, class, name, &two, DispatcherKind::InvokeField).unwrap();
        let c = get_invocation_dispatcher(&mut isolate, class, name, &two, DispatcherKind::NoSuchMethod).unwrap();
        let d = get_invocation_dispatcher(
            &mut isolate,
            class,
            name,
            &ArgumentsDescriptor::positional(3),
            DispatcherKind::InvokeField,
        )
        .unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert!(isolate.function(a).unwrap().is_dispatcher());
        assert!(isolate.function(a).unwrap().signature.accepts(&two));
    }
}
