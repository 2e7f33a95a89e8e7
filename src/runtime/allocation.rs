//! Allocation runtime entries

use super::{ClassId, FunctionId, FunctionKind, Isolate, Value};
use crate::diagnostics::targets;
use crate::error::{Error, Result};
use crate::gc::{HeapObject, ObjectKind};
use crate::types::{TypeArgsId, TypeContext};

/// Where the type arguments passed to an allocation come from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instantiator {
    /// The type arguments are already instantiated (or absent for a raw type)
    None,
    /// The type arguments are uninstantiated and resolve against this vector
    Vector(Option<TypeArgsId>),
}

fn check_instantiated_length(isolate: &Isolate, class: ClassId, type_arguments: Option<TypeArgsId>) -> Result<()> {
    let Some(id) = type_arguments else {
        return Ok(());
    };
    let expected = isolate.class(class)?.num_type_arguments();
    let instantiated = isolate.type_args.is_instantiated(id);
    let length = isolate
        .type_args
        .types(id)
        .map_or(expected, <[_]>::len);
    if !instantiated || length < expected {
        return Err(Error::internal(format!(
            "type arguments {:?} of '{}' must be instantiated with at least {} entries",
            id,
            isolate.class_name(class),
            expected
        )));
    }
    Ok(())
}

fn new_instance(isolate: &mut Isolate, class: ClassId, type_arguments: Option<TypeArgsId>) -> Result<Value> {
    let descriptor = isolate.class(class)?;
    if descriptor.is_abstract {
        return Err(Error::internal(format!(
            "cannot instantiate abstract class '{}'",
            isolate.class_name(class)
        )));
    }
    let fields = vec![Value::Null; descriptor.num_fields()];
    let object = HeapObject::new(class, ObjectKind::Instance { fields }).with_type_arguments(type_arguments);
    Ok(Value::Object(isolate.allocate(object)?))
}

/// Allocate an instance of `class`. With an instantiator the uninstantiated
/// `type_arguments` are paired with it into a deferred vector.
pub fn allocate_object(
    isolate: &mut Isolate,
    class: ClassId,
    type_arguments: Option<TypeArgsId>,
    instantiator: Instantiator,
) -> Result<Value> {
    isolate.check_alive()?;
    if isolate.class(class)?.num_type_arguments() == 0 {
        return new_instance(isolate, class, None);
    }
    let type_arguments = match instantiator {
        Instantiator::None => {
            check_instantiated_length(isolate, class, type_arguments)?;
            type_arguments
        }
        Instantiator::Vector(instantiator) => {
            let uninstantiated = type_arguments
                .ok_or_else(|| Error::internal("uninstantiated allocation without type arguments"))?;
            Some(isolate.type_args.defer(uninstantiated, instantiator))
        }
    };
    new_instance(isolate, class, type_arguments)
}

/// Allocate an instance of a generic `class`, instantiating its type
/// arguments eagerly. A bound violation throws a dynamic type error.
pub fn allocate_object_with_bounds_check(
    isolate: &mut Isolate,
    class: ClassId,
    type_arguments: Option<TypeArgsId>,
    instantiator: Instantiator,
) -> Result<Value> {
    isolate.check_alive()?;
    let type_arguments = match (instantiator, type_arguments) {
        (Instantiator::None, type_arguments) => {
            check_instantiated_length(isolate, class, type_arguments)?;
            type_arguments
        }
        (Instantiator::Vector(instantiator), Some(uninstantiated)) => {
            let context = TypeContext::new(&isolate.classes, &isolate.symbols, true);
            let checked = isolate
                .type_args
                .instantiate(&context, uninstantiated, instantiator)?
                .and_then(|instantiated| {
                    let arguments = isolate.type_args.types(instantiated).unwrap_or_default();
                    context.check_class_bounds(class, arguments).map(|()| instantiated)
                });
            match checked {
                Ok(instantiated) => Some(instantiated),
                Err(bound_error) => {
                    let location = isolate.caller_location();
                    if isolate.flags().trace.type_checks {
                        tracing::debug!(target: targets::TYPE_CHECKS, %bound_error, "allocation bound check failed");
                    }
                    return Err(Error::from_bound_error(location, &bound_error));
                }
            }
        }
        (Instantiator::Vector(_), None) => None,
    };
    new_instance(isolate, class, type_arguments)
}

/// Allocate a fixed-length array of `length` null elements. The element
/// vector may be longer than one entry.
pub fn allocate_array(isolate: &mut Isolate, length: usize, element_type: Option<TypeArgsId>) -> Result<Value> {
    isolate.check_alive()?;
    if let Some(id) = element_type {
        let length_ok = isolate.type_args.types(id).is_some_and(|types| !types.is_empty());
        if !length_ok || !isolate.type_args.is_instantiated(id) {
            return Err(Error::internal(format!(
                "array element type {:?} must be an instantiated vector",
                id
            )));
        }
    }
    let object = HeapObject::new(
        ClassId::ARRAY,
        ObjectKind::Array {
            elements: vec![Value::Null; length],
        },
    )
    .with_type_arguments(element_type);
    Ok(Value::Object(isolate.allocate(object)?))
}

/// Allocate a closure of `function` over `context`
pub fn allocate_closure(
    isolate: &mut Isolate,
    function: FunctionId,
    type_arguments: Option<TypeArgsId>,
    context: Vec<Value>,
) -> Result<Value> {
    isolate.check_alive()?;
    if !isolate.function(function)?.is_closure_function() {
        return Err(Error::internal(format!(
            "'{}' is not a closure function",
            isolate.qualified_function_name(function)
        )));
    }
    if let Some(id) = type_arguments {
        if !isolate.type_args.is_instantiated(id) {
            return Err(Error::internal("closure type arguments must be instantiated"));
        }
    }
    let object = HeapObject::new(ClassId::CLOSURE, ObjectKind::Closure { function, context })
        .with_type_arguments(type_arguments);
    Ok(Value::Object(isolate.allocate(object)?))
}

/// Allocate a closure of the tear-off `function` bound to `receiver`
pub fn allocate_implicit_instance_closure(
    isolate: &mut Isolate,
    function: FunctionId,
    receiver: Value,
    type_arguments: Option<TypeArgsId>,
) -> Result<Value> {
    if !matches!(isolate.function(function)?.kind, FunctionKind::ImplicitClosure { .. }) {
        return Err(Error::internal(format!(
            "'{}' is not an implicit instance closure",
            isolate.qualified_function_name(function)
        )));
    }
    allocate_closure(isolate, function, type_arguments, vec![receiver])
}

/// Allocate a context holding `num_variables` null variables
pub fn allocate_context(isolate: &mut Isolate, num_variables: usize) -> Result<Value> {
    isolate.check_alive()?;
    let object = HeapObject::new(
        ClassId::CONTEXT,
        ObjectKind::Context {
            parent: None,
            variables: vec![Value::Null; num_variables],
        },
    );
    Ok(Value::Object(isolate.allocate(object)?))
}

/// Copy `context` with its current variable values. The copy shares the
/// parent chain.
pub fn clone_context(isolate: &mut Isolate, context: Value) -> Result<Value> {
    isolate.check_alive()?;
    let source = context
        .as_object()
        .ok_or_else(|| Error::internal("context expected"))?;
    let kind = match &isolate.object(source)?.kind {
        ObjectKind::Context { parent, variables } => ObjectKind::Context {
            parent: *parent,
            variables: variables.clone(),
        },
        _ => return Err(Error::internal("context expected")),
    };
    Ok(Value::Object(isolate.allocate(HeapObject::new(ClassId::CONTEXT, kind))?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeFlags;
    use crate::jit::BaselineCompiler;
    use crate::runtime::ClassDecl;
    use crate::types::AbstractType;

    fn generic_class(isolate: &mut Isolate) -> ClassId {
        isolate
            .define_class(
                ClassDecl::new("Pair")
                    .bounded_type_parameter("T", AbstractType::raw(ClassId::NUM))
                    .field("first")
                    .field("second"),
            )
            .unwrap()
    }

    #[test]
    fn test_allocate_with_instantiator_defers() {
        let mut isolate = Isolate::new(RuntimeFlags::default(), BaselineCompiler);
        let pair = generic_class(&mut isolate);
        let t = isolate.intern("T");
        let uninstantiated = isolate.type_args.add_vector(vec![AbstractType::parameter(0, t)]);
        let instantiator = isolate.type_args.add_vector(vec![AbstractType::raw(ClassId::INT)]);

        let value = allocate_object(
            &mut isolate,
            pair,
            Some(uninstantiated),
            Instantiator::Vector(Some(instantiator)),
        )
        .unwrap();
        let object = isolate.object(value.as_object().unwrap()).unwrap();
        assert!(isolate.type_args.is_deferred(object.type_arguments.unwrap()));
        assert_eq!(object.kind, ObjectKind::Instance { fields: vec![Value::Null; 2] });
    }

    #[test]
    fn test_bounds_check_raises_type_error() {
        let mut isolate = Isolate::new(RuntimeFlags::default().with_type_checks(true), BaselineCompiler);
        let pair = generic_class(&mut isolate);
        let t = isolate.intern("T");
        let uninstantiated = isolate.type_args.add_vector(vec![AbstractType::parameter(0, t)]);
        let bad = isolate.type_args.add_vector(vec![AbstractType::raw(ClassId::STRING)]);
        let good = isolate.type_args.add_vector(vec![AbstractType::raw(ClassId::DOUBLE)]);

        let err = allocate_object_with_bounds_check(
            &mut isolate,
            pair,
            Some(uninstantiated),
            Instantiator::Vector(Some(bad)),
        )
        .unwrap_err();
        assert!(matches!(err, Error::DynamicType { ref src_type, .. } if src_type.is_empty()));

        let value = allocate_object_with_bounds_check(
            &mut isolate,
            pair,
            Some(uninstantiated),
            Instantiator::Vector(Some(good)),
        )
        .unwrap();
        let args = isolate.object(value.as_object().unwrap()).unwrap().type_arguments.unwrap();
        assert!(isolate.type_args.is_canonical(args));
    }

    #[test]
    fn test_allocate_array_accepts_longer_vectors() {
        let mut isolate = Isolate::new(RuntimeFlags::default(), BaselineCompiler);
        let shared = isolate.type_args.add_vector(vec![
            AbstractType::raw(ClassId::STRING),
            AbstractType::raw(ClassId::INT),
        ]);
        let value = allocate_array(&mut isolate, 3, Some(shared)).unwrap();
        let object = isolate.object(value.as_object().unwrap()).unwrap();
        assert_eq!(object.kind, ObjectKind::Array { elements: vec![Value::Null; 3] });

        let empty = isolate.type_args.add_vector(Vec::new());
        assert!(allocate_array(&mut isolate, 1, Some(empty)).is_err());
    }

    #[test]
    fn test_clone_context_copies_variables() {
        let mut isolate = Isolate::new(RuntimeFlags::default(), BaselineCompiler);
        let outer = allocate_context(&mut isolate, 1).unwrap();
        let inner = allocate_context(&mut isolate, 2).unwrap();
        let inner_id = inner.as_object().unwrap();
        if let ObjectKind::Context { parent, variables } = &mut isolate.object_mut(inner_id).unwrap().kind {
            *parent = outer.as_object();
            variables[1] = Value::Smi(3);
        }

        let copy = clone_context(&mut isolate, inner).unwrap();
        assert_ne!(copy, inner);
        let copied = isolate.object(copy.as_object().unwrap()).unwrap();
        assert_eq!(copied.class, ClassId::CONTEXT);
        assert_eq!(
            copied.kind,
            ObjectKind::Context {
                parent: outer.as_object(),
                variables: vec![Value::Null, Value::Smi(3)],
            }
        );

        // The copy keeps the parent alive on its own.
        isolate.stack.push_frame(0, vec![copy.into()]);
        isolate.collect_garbage();
        assert!(isolate.heap.contains(outer.as_object().unwrap()));
        assert!(clone_context(&mut isolate, Value::Smi(1)).is_err());
    }

    #[test]
    fn test_implicit_closure_requires_tear_off() {
        let mut isolate = Isolate::new(RuntimeFlags::default(), BaselineCompiler);
        let plain = isolate
            .define_function(crate::runtime::FunctionDecl::closure(ClassId::OBJECT, "f", 0, |_, _| Ok(Value::Null)))
            .unwrap();
        let err = allocate_implicit_instance_closure(&mut isolate, plain, Value::Smi(1), None).unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[test]
    fn test_abstract_class_is_rejected() {
        let mut isolate = Isolate::new(RuntimeFlags::default(), BaselineCompiler);
        assert!(allocate_object(&mut isolate, ClassId::NUM, None, Instantiator::None).is_err());
    }
}
