//! Type instantiation and type test runtime entries

use super::{AbstractType, BadType, SubtypeTestCache, SubtypeTestEntry, TypeArgsId, TypeContext};
use crate::diagnostics::targets;
use crate::error::{BoundError, Error, Result};
use crate::gc::ObjectId;
use crate::runtime::{ClassId, Isolate, Value};

/// Operands of a type test other than the tested instance
#[derive(Debug, Clone, Copy)]
pub struct TypeTest<'a> {
    /// Type tested against, possibly uninstantiated
    pub ty: &'a AbstractType,
    /// Object whose type arguments instantiate `ty`
    pub instantiator: Option<ObjectId>,
    /// Type arguments of the instantiator, possibly deferred
    pub instantiator_type_arguments: Option<TypeArgsId>,
}

impl<'a> TypeTest<'a> {
    /// Test against an instantiated type
    pub fn new(ty: &'a AbstractType) -> Self {
        Self {
            ty,
            instantiator: None,
            instantiator_type_arguments: None,
        }
    }

    pub fn with_instantiator(mut self, instantiator: ObjectId, type_arguments: Option<TypeArgsId>) -> Self {
        self.instantiator = Some(instantiator);
        self.instantiator_type_arguments = type_arguments;
        self
    }

    pub fn with_instantiator_type_arguments(mut self, type_arguments: TypeArgsId) -> Self {
        self.instantiator_type_arguments = Some(type_arguments);
        self
    }
}

/// Instantiate `ty` against `instantiator`. A bound violation is raised as a
/// dynamic type error at the caller.
pub fn instantiate_type(
    isolate: &mut Isolate,
    ty: &AbstractType,
    instantiator: Option<TypeArgsId>,
) -> Result<AbstractType> {
    isolate.check_alive()?;
    let instantiator = instantiator.map(|i| isolate.type_args.force(i)).transpose()?;
    let check_bounds = isolate.flags().enable_type_checks;
    let context = TypeContext::new(&isolate.classes, &isolate.symbols, check_bounds);
    let instantiator_types = instantiator.and_then(|i| isolate.type_args.types(i));
    context
        .instantiate_type(ty, instantiator_types)
        .map_err(|bound_error| Error::from_bound_error(isolate.caller_location(), &bound_error))
}

/// Instantiate an uninstantiated vector lazily: the result is a deferred
/// vector forced on first use
pub fn instantiate_type_arguments(
    isolate: &mut Isolate,
    uninstantiated: TypeArgsId,
    instantiator: Option<TypeArgsId>,
) -> Result<TypeArgsId> {
    isolate.check_alive()?;
    if isolate.type_args.get(uninstantiated).is_none() {
        return Err(Error::internal(format!("unknown type arguments {:?}", uninstantiated)));
    }
    if isolate.type_args.is_instantiated(uninstantiated) {
        return Ok(uninstantiated);
    }
    Ok(isolate.type_args.defer(uninstantiated, instantiator))
}

/// Replace the type arguments of `object` by their canonical form. Returns
/// whether they changed.
pub fn optimize_type_arguments(isolate: &mut Isolate, object: ObjectId) -> Result<bool> {
    let Some(current) = isolate.object(object)?.type_arguments else {
        return Ok(false);
    };
    let canonical = isolate.type_args.force(current)?;
    if canonical == current {
        return Ok(false);
    }
    isolate.object_mut(object)?.type_arguments = Some(canonical);
    Ok(true)
}

/// Identity key of a type test, taken after canonicalization
#[derive(Debug, Clone, Copy)]
struct CacheKey {
    class: ClassId,
    instance_type_arguments: Option<TypeArgsId>,
    instantiator_type_arguments: Option<TypeArgsId>,
    replaced: bool,
}

fn cache_key(isolate: &mut Isolate, instance: Value, test: &TypeTest<'_>) -> Result<CacheKey> {
    let class = isolate.class_id_of(instance)?;
    let mut replaced = false;
    let mut instance_type_arguments = None;
    if let Value::Object(id) = instance {
        if isolate.class(class)?.num_type_arguments() > 0 {
            replaced |= optimize_type_arguments(isolate, id)?;
            instance_type_arguments = isolate.object(id)?.type_arguments;
        }
    }
    let mut instantiator_type_arguments = test.instantiator_type_arguments;
    if let Some(instantiator) = test.instantiator {
        replaced |= optimize_type_arguments(isolate, instantiator)?;
        instantiator_type_arguments = isolate.object(instantiator)?.type_arguments;
    }
    Ok(CacheKey {
        class,
        instance_type_arguments,
        instantiator_type_arguments,
        replaced,
    })
}

fn cached_result(cache: Option<&SubtypeTestCache>, key: &CacheKey) -> Option<bool> {
    cache?.lookup(
        key.class,
        key.instance_type_arguments,
        key.instantiator_type_arguments,
    )
}

/// Structural test plus any bound violation seen instantiating the type
fn test_instance(
    isolate: &mut Isolate,
    key: &CacheKey,
    test: &TypeTest<'_>,
) -> Result<(bool, Option<BoundError>)> {
    let instance_type_arguments = key
        .instance_type_arguments
        .map(|i| isolate.type_args.force(i))
        .transpose()?;
    let instantiator = key
        .instantiator_type_arguments
        .map(|i| isolate.type_args.force(i))
        .transpose()?;
    let check_bounds = isolate.flags().enable_type_checks;
    let context = TypeContext::new(&isolate.classes, &isolate.symbols, check_bounds);
    Ok(context.is_instance_of(
        key.class,
        instance_type_arguments.and_then(|i| isolate.type_args.types(i)),
        test.ty,
        instantiator.and_then(|i| isolate.type_args.types(i)),
    ))
}

fn update_type_test_cache(
    isolate: &Isolate,
    key: &CacheKey,
    result: bool,
    cache: &mut SubtypeTestCache,
) {
    let trace = isolate.flags().trace.type_checks;
    if cache.is_full() {
        return;
    }
    if cached_result(Some(cache), key).is_some() {
        if trace {
            tracing::debug!(
                target: targets::TYPE_CHECKS,
                class = isolate.class_name(key.class),
                canonicalized = key.replaced,
                "duplicate cache entry"
            );
        }
        return;
    }
    let deferred = key
        .instantiator_type_arguments
        .is_some_and(|i| isolate.type_args.is_deferred(i));
    if deferred {
        return;
    }
    cache.add_check(SubtypeTestEntry {
        class: key.class,
        instance_type_arguments: key.instance_type_arguments,
        instantiator_type_arguments: key.instantiator_type_arguments,
        result,
    });
    if trace {
        tracing::debug!(
            target: targets::TYPE_CHECKS,
            index = cache.number_of_checks() - 1,
            class = isolate.class_name(key.class),
            instance_type_arguments = ?key.instance_type_arguments,
            instantiator_type_arguments = ?key.instantiator_type_arguments,
            result,
            "updated test cache"
        );
    }
}

fn trace_type_check(isolate: &Isolate, message: &str, key: &CacheKey, test: &TypeTest<'_>, result: bool) {
    if !isolate.flags().trace.type_checks {
        return;
    }
    let ty = isolate.type_context().type_name(test.ty);
    tracing::debug!(
        target: targets::TYPE_CHECKS,
        class = isolate.class_name(key.class),
        %ty,
        instantiator_type_arguments = ?key.instantiator_type_arguments,
        result,
        "{}", message
    );
}

/// `instance is ty`. Throws only when the test fails and a bound violation
/// was observed while instantiating `ty`.
pub fn instance_of(
    isolate: &mut Isolate,
    instance: Value,
    test: &TypeTest<'_>,
    cache: Option<&mut SubtypeTestCache>,
) -> Result<bool> {
    isolate.check_alive()?;
    let key = cache_key(isolate, instance, test)?;
    if let Some(result) = cached_result(cache.as_deref(), &key) {
        return Ok(result);
    }
    let (result, bound_error) = test_instance(isolate, &key, test)?;
    trace_type_check(isolate, "InstanceOf", &key, test, result);
    if !result {
        if let Some(bound_error) = bound_error {
            return Err(Error::from_bound_error(isolate.caller_location(), &bound_error));
        }
    }
    if let Some(cache) = cache {
        update_type_test_cache(isolate, &key, result, cache);
    }
    Ok(result)
}

/// Assignment check of `instance` to a variable named `dst_name` of type
/// `test.ty`. Returns the instance or throws a dynamic type error.
pub fn type_check(
    isolate: &mut Isolate,
    instance: Value,
    test: &TypeTest<'_>,
    dst_name: &str,
    cache: Option<&mut SubtypeTestCache>,
) -> Result<Value> {
    isolate.check_alive()?;
    if instance.is_null() {
        return Ok(instance);
    }
    let key = cache_key(isolate, instance, test)?;
    if cached_result(cache.as_deref(), &key) == Some(true) {
        return Ok(instance);
    }
    let (result, bound_error) = test_instance(isolate, &key, test)?;
    trace_type_check(isolate, "TypeCheck", &key, test, result);
    if !result {
        let instantiator = key
            .instantiator_type_arguments
            .map(|i| isolate.type_args.force(i))
            .transpose()?;
        let dst_type = test
            .ty
            .instantiate_from(instantiator.and_then(|i| isolate.type_args.types(i)));
        let context = isolate.type_context();
        let src_name = instance_type_name(isolate, &key);
        let dst_type_name = context.type_name(&dst_type);
        return Err(Error::dynamic_type(
            isolate.caller_location(),
            src_name,
            dst_type_name,
            dst_name,
            bound_error.as_ref(),
        ));
    }
    if let Some(cache) = cache {
        update_type_test_cache(isolate, &key, true, cache);
    }
    Ok(instance)
}

/// Error thrown when a condition evaluates to a non-`bool` value
pub fn non_bool_type_error(isolate: &Isolate, value: Value) -> Error {
    match isolate.class_id_of(value) {
        Ok(class) => Error::dynamic_type(
            isolate.caller_location(),
            isolate.type_context().type_name(&AbstractType::raw(class)),
            "bool",
            "boolean expression",
            None,
        ),
        Err(err) => err,
    }
}

/// Error thrown when `src` is checked against a malformed or malbounded
/// type declared for `dst_name`
pub fn bad_type_error(isolate: &Isolate, src: Value, dst_name: &str, bad_type: &BadType) -> Error {
    let class = match isolate.class_id_of(src) {
        Ok(class) => class,
        Err(err) => return err,
    };
    let arguments = src
        .as_object()
        .and_then(|id| isolate.heap.get(id))
        .and_then(|object| object.type_arguments)
        .and_then(|args| isolate.type_args.types(args))
        .map(<[AbstractType]>::to_vec)
        .unwrap_or_default();
    let src_type = isolate
        .type_context()
        .type_name(&AbstractType::generic(class, arguments));
    Error::DynamicType {
        location: isolate.caller_location(),
        src_type,
        dst_type: bad_type.kind_name().to_string(),
        dst_name: dst_name.to_string(),
        bound_error: Some(bad_type.message()),
    }
}

fn instance_type_name(isolate: &Isolate, key: &CacheKey) -> String {
    let arguments = key
        .instance_type_arguments
        .and_then(|i| isolate.type_args.types(i))
        .map(<[AbstractType]>::to_vec)
        .unwrap_or_default();
    isolate
        .type_context()
        .type_name(&AbstractType::generic(key.class, arguments))
}
