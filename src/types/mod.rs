//! Abstract types and type-argument vectors
//!
//! Type-argument vectors are stored in a per-isolate [`TypeArgumentsTable`]
//! and referenced by [`TypeArgsId`]. Caches compare vectors by id, so every
//! vector is forced and canonicalized before it is used as a cache key:
//! structurally equal canonical vectors always share one id.
//!
//! A vector is in one of three states:
//! - **uninstantiated**: contains type parameters
//! - **instantiated**: fully concrete
//! - **deferred**: an uninstantiated vector paired with the instantiator it
//!   will be resolved against, not yet forced
//!
//! Deferred pairs are interned, and forcing one records the canonical result
//! in place, so repeated allocations with one instantiator share an entry.

mod checks;
mod subtype_cache;

pub use checks::{
    bad_type_error, instance_of, instantiate_type, instantiate_type_arguments, non_bool_type_error,
    optimize_type_arguments, type_check, TypeTest,
};
pub use subtype_cache::{SubtypeTestCache, SubtypeTestEntry};

use crate::error::{self, BoundError, Error};
use crate::runtime::{ClassId, ClassTable, Symbol, SymbolTable};
use rustc_hash::FxHashMap;

/// Type-argument vector handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeArgsId(pub u32);

impl TypeArgsId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// A type reference
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AbstractType {
    /// `dynamic`: top and bottom of the subtype relation
    Dynamic,
    /// A class applied to type arguments. Missing arguments are `dynamic`.
    Interface {
        class: ClassId,
        arguments: Vec<AbstractType>,
    },
    /// Type parameter `index` of the enclosing generic class
    Parameter { index: usize, name: Symbol },
}

impl AbstractType {
    /// `Object`
    pub fn object() -> Self {
        Self::raw(ClassId::OBJECT)
    }

    /// `class` with no type arguments
    pub fn raw(class: ClassId) -> Self {
        AbstractType::Interface {
            class,
            arguments: Vec::new(),
        }
    }

    /// `class<arguments>`
    pub fn generic(class: ClassId, arguments: Vec<AbstractType>) -> Self {
        AbstractType::Interface { class, arguments }
    }

    pub fn parameter(index: usize, name: Symbol) -> Self {
        AbstractType::Parameter { index, name }
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self, AbstractType::Dynamic)
    }

    /// Class of an interface type
    pub fn class(&self) -> Option<ClassId> {
        match self {
            AbstractType::Interface { class, .. } => Some(*class),
            _ => None,
        }
    }

    /// Whether no type parameter occurs in this type
    pub fn is_instantiated(&self) -> bool {
        match self {
            AbstractType::Dynamic => true,
            AbstractType::Parameter { .. } => false,
            AbstractType::Interface { arguments, .. } => {
                arguments.iter().all(AbstractType::is_instantiated)
            }
        }
    }

    /// Substitute type parameters with the entries of `instantiator`.
    /// Parameters without an entry become `dynamic`. Bounds are not checked.
    pub fn instantiate_from(&self, instantiator: Option<&[AbstractType]>) -> AbstractType {
        match self {
            AbstractType::Dynamic => AbstractType::Dynamic,
            AbstractType::Parameter { index, .. } => instantiator
                .and_then(|types| types.get(*index))
                .cloned()
                .unwrap_or(AbstractType::Dynamic),
            AbstractType::Interface { class, arguments } => AbstractType::Interface {
                class: *class,
                arguments: arguments
                    .iter()
                    .map(|arg| arg.instantiate_from(instantiator))
                    .collect(),
            },
        }
    }
}

/// Storage for one type-argument vector
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeArguments {
    Vector {
        types: Vec<AbstractType>,
        canonical: bool,
    },
    /// Lazily instantiated pair
    Deferred {
        uninstantiated: TypeArgsId,
        instantiator: Option<TypeArgsId>,
        /// Canonical result, once forced
        forced: Option<TypeArgsId>,
    },
}

/// All type-argument vectors of an isolate plus the canonical and deferred
/// indexes
#[derive(Debug, Default)]
pub struct TypeArgumentsTable {
    entries: Vec<TypeArguments>,
    canonical: FxHashMap<Vec<AbstractType>, TypeArgsId>,
    deferred: FxHashMap<(TypeArgsId, Option<TypeArgsId>), TypeArgsId>,
}

fn unknown(id: TypeArgsId) -> Error {
    Error::internal(format!("unknown type arguments {:?}", id))
}

impl TypeArgumentsTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, entry: TypeArguments) -> TypeArgsId {
        let id = TypeArgsId(self.entries.len() as u32);
        self.entries.push(entry);
        id
    }

    /// Add a fresh, non-canonical vector
    pub fn add_vector(&mut self, types: Vec<AbstractType>) -> TypeArgsId {
        self.push(TypeArguments::Vector {
            types,
            canonical: false,
        })
    }

    /// The canonical vector structurally equal to `types`
    pub fn canonicalize_vector(&mut self, types: Vec<AbstractType>) -> TypeArgsId {
        if let Some(&id) = self.canonical.get(&types) {
            return id;
        }
        let id = self.push(TypeArguments::Vector {
            types: types.clone(),
            canonical: true,
        });
        self.canonical.insert(types, id);
        id
    }

    /// Pair `uninstantiated` with `instantiator` without resolving it. The
    /// same pair always yields the same id.
    pub fn defer(&mut self, uninstantiated: TypeArgsId, instantiator: Option<TypeArgsId>) -> TypeArgsId {
        if let Some(&id) = self.deferred.get(&(uninstantiated, instantiator)) {
            return id;
        }
        let id = self.push(TypeArguments::Deferred {
            uninstantiated,
            instantiator,
            forced: None,
        });
        self.deferred.insert((uninstantiated, instantiator), id);
        id
    }

    pub fn get(&self, id: TypeArgsId) -> Option<&TypeArguments> {
        self.entries.get(id.index())
    }

    pub fn is_deferred(&self, id: TypeArgsId) -> bool {
        matches!(self.get(id), Some(TypeArguments::Deferred { .. }))
    }

    pub fn is_canonical(&self, id: TypeArgsId) -> bool {
        matches!(self.get(id), Some(TypeArguments::Vector { canonical: true, .. }))
    }

    /// Types of a vector; `None` for deferred or unknown ids
    pub fn types(&self, id: TypeArgsId) -> Option<&[AbstractType]> {
        match self.get(id)? {
            TypeArguments::Vector { types, .. } => Some(types),
            TypeArguments::Deferred { .. } => None,
        }
    }

    /// Whether `id` is a vector free of type parameters. Deferred vectors
    /// count as instantiated.
    pub fn is_instantiated(&self, id: TypeArgsId) -> bool {
        match self.get(id) {
            Some(TypeArguments::Vector { types, .. }) => {
                types.iter().all(AbstractType::is_instantiated)
            }
            Some(TypeArguments::Deferred { .. }) => true,
            None => false,
        }
    }

    /// Canonical form of `id`, forcing it first if it is deferred.
    /// Forcing does not check bounds.
    pub fn force(&mut self, id: TypeArgsId) -> error::Result<TypeArgsId> {
        match self.get(id) {
            None => Err(unknown(id)),
            Some(TypeArguments::Vector { canonical: true, .. }) => Ok(id),
            Some(TypeArguments::Vector { types, .. }) => {
                let types = types.clone();
                Ok(self.canonicalize_vector(types))
            }
            Some(&TypeArguments::Deferred {
                forced: Some(forced), ..
            }) => Ok(forced),
            Some(&TypeArguments::Deferred {
                uninstantiated,
                instantiator,
                forced: None,
            }) => {
                let instantiator = instantiator.map(|i| self.force(i)).transpose()?;
                let uninstantiated = self.force(uninstantiated)?;
                let instantiator_types = instantiator.and_then(|i| self.types(i));
                let types: Vec<AbstractType> = self
                    .types(uninstantiated)
                    .unwrap_or_default()
                    .iter()
                    .map(|ty| ty.instantiate_from(instantiator_types))
                    .collect();
                let canonical = self.canonicalize_vector(types);
                if let Some(TypeArguments::Deferred { forced, .. }) = self.entries.get_mut(id.index()) {
                    *forced = Some(canonical);
                }
                Ok(canonical)
            }
        }
    }

    /// Eagerly instantiate `uninstantiated` against `instantiator`, checking
    /// bounds when `context` enforces them. The result is canonical.
    ///
    /// Fails on unknown ids; the inner result carries a bound violation.
    pub fn instantiate(
        &mut self,
        context: &TypeContext<'_>,
        uninstantiated: TypeArgsId,
        instantiator: Option<TypeArgsId>,
    ) -> error::Result<Result<TypeArgsId, BoundError>> {
        let instantiator = instantiator.map(|i| self.force(i)).transpose()?;
        let uninstantiated = self.force(uninstantiated)?;
        let types = context.instantiate_vector(
            self.types(uninstantiated).unwrap_or_default(),
            instantiator.and_then(|i| self.types(i)),
        );
        Ok(types.map(|types| self.canonicalize_vector(types)))
    }

    /// Number of vectors in the canonical index
    pub fn canonical_len(&self) -> usize {
        self.canonical.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Why a type annotation cannot be used in a check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BadType {
    /// Names an unknown class or applies the wrong number of type arguments
    Malformed(String),
    /// A type argument violates its parameter's bound
    Malbounded(BoundError),
}

impl BadType {
    /// Destination type name reported by the dynamic type error
    pub fn kind_name(&self) -> &'static str {
        match self {
            BadType::Malformed(_) => "malformed",
            BadType::Malbounded(_) => "malbounded",
        }
    }

    pub fn message(&self) -> String {
        match self {
            BadType::Malformed(message) => message.clone(),
            BadType::Malbounded(bound) => bound.to_string(),
        }
    }
}

/// Type operations over a class table
pub struct TypeContext<'a> {
    classes: &'a ClassTable,
    symbols: &'a SymbolTable,
    check_bounds: bool,
}

impl<'a> TypeContext<'a> {
    pub fn new(classes: &'a ClassTable, symbols: &'a SymbolTable, check_bounds: bool) -> Self {
        Self {
            classes,
            symbols,
            check_bounds,
        }
    }

    /// Instantiate `ty` against `instantiator`, reporting bound violations
    /// when bounds are enforced
    pub fn instantiate_type(
        &self,
        ty: &AbstractType,
        instantiator: Option<&[AbstractType]>,
    ) -> Result<AbstractType, BoundError> {
        let instantiated = ty.instantiate_from(instantiator);
        if self.check_bounds {
            self.check_type_bounds(&instantiated)?;
        }
        Ok(instantiated)
    }

    pub fn instantiate_vector(
        &self,
        types: &[AbstractType],
        instantiator: Option<&[AbstractType]>,
    ) -> Result<Vec<AbstractType>, BoundError> {
        types
            .iter()
            .map(|ty| self.instantiate_type(ty, instantiator))
            .collect()
    }

    /// Check `arguments` against the declared bounds of `class`
    pub fn check_class_bounds(&self, class: ClassId, arguments: &[AbstractType]) -> Result<(), BoundError> {
        self.check_type_bounds(&AbstractType::generic(class, arguments.to_vec()))
    }

    fn check_type_bounds(&self, ty: &AbstractType) -> Result<(), BoundError> {
        let AbstractType::Interface { class, arguments } = ty else {
            return Ok(());
        };
        for argument in arguments {
            self.check_type_bounds(argument)?;
        }
        if arguments.is_empty() {
            return Ok(());
        }
        let Some(class) = self.classes.get(*class) else {
            return Ok(());
        };
        for (index, parameter) in class.type_parameters.iter().enumerate() {
            let Some(bound) = &parameter.bound else {
                continue;
            };
            let bound = bound.instantiate_from(Some(arguments));
            let argument = arguments.get(index).unwrap_or(&AbstractType::Dynamic);
            if !self.is_subtype(argument, &bound) {
                return Err(BoundError {
                    argument: self.type_name(argument),
                    bound: self.type_name(&bound),
                    parameter: self.symbols.resolve(parameter.name).to_string(),
                });
            }
        }
        Ok(())
    }

    /// Whether `ty` names known classes with matching arities and respects
    /// the declared bounds
    pub fn check_well_formed(&self, ty: &AbstractType) -> Result<(), BadType> {
        self.check_arity(ty)?;
        self.check_type_bounds(ty).map_err(BadType::Malbounded)
    }

    fn check_arity(&self, ty: &AbstractType) -> Result<(), BadType> {
        let AbstractType::Interface { class, arguments } = ty else {
            return Ok(());
        };
        let Some(descriptor) = self.classes.get(*class) else {
            return Err(BadType::Malformed(format!("unknown class {}", class.0)));
        };
        let expected = descriptor.num_type_arguments();
        if !arguments.is_empty() && arguments.len() != expected {
            return Err(BadType::Malformed(format!(
                "wrong number of type arguments for '{}': expected {}, got {}",
                self.symbols.resolve(descriptor.name),
                expected,
                arguments.len()
            )));
        }
        arguments.iter().try_for_each(|argument| self.check_arity(argument))
    }

    /// Structural subtype test over instantiated types
    pub fn is_subtype(&self, sub: &AbstractType, sup: &AbstractType) -> bool {
        match (sub, sup) {
            (_, AbstractType::Dynamic) | (AbstractType::Dynamic, _) => true,
            (AbstractType::Parameter { .. }, _) | (_, AbstractType::Parameter { .. }) => sub == sup,
            (
                AbstractType::Interface {
                    class: sub_class,
                    arguments: sub_args,
                },
                AbstractType::Interface {
                    class: sup_class,
                    arguments: sup_args,
                },
            ) => {
                if *sub_class == ClassId::NULL || *sup_class == ClassId::OBJECT {
                    return true;
                }
                if sub_class == sup_class {
                    let len = sub_args.len().max(sup_args.len());
                    return (0..len).all(|i| {
                        let a = sub_args.get(i).unwrap_or(&AbstractType::Dynamic);
                        let b = sup_args.get(i).unwrap_or(&AbstractType::Dynamic);
                        self.is_subtype(a, b)
                    });
                }
                let Some(class) = self.classes.get(*sub_class) else {
                    return false;
                };
                class
                    .super_type
                    .iter()
                    .chain(class.interfaces.iter())
                    .any(|parent| self.is_subtype(&parent.instantiate_from(Some(sub_args)), sup))
            }
        }
    }

    /// Whether an instance of `class` carrying `type_arguments` is an instance
    /// of `ty` instantiated against `instantiator`. A bound violation found
    /// while instantiating `ty` is returned alongside the result.
    pub fn is_instance_of(
        &self,
        class: ClassId,
        type_arguments: Option<&[AbstractType]>,
        ty: &AbstractType,
        instantiator: Option<&[AbstractType]>,
    ) -> (bool, Option<BoundError>) {
        let (test_type, bound_error) = match self.instantiate_type(ty, instantiator) {
            Ok(instantiated) => (instantiated, None),
            Err(bound_error) => (ty.instantiate_from(instantiator), Some(bound_error)),
        };
        if class == ClassId::NULL {
            let result = match &test_type {
                AbstractType::Dynamic => true,
                AbstractType::Interface { class, .. } => {
                    *class == ClassId::OBJECT || *class == ClassId::NULL
                }
                AbstractType::Parameter { .. } => false,
            };
            return (result, bound_error);
        }
        let count = self.classes.get(class).map_or(0, |c| c.num_type_arguments());
        let arguments = type_arguments
            .map(|types| types.iter().take(count).cloned().collect())
            .unwrap_or_default();
        let instance_type = AbstractType::Interface { class, arguments };
        (self.is_subtype(&instance_type, &test_type), bound_error)
    }

    /// User-visible name of `ty`
    pub fn type_name(&self, ty: &AbstractType) -> String {
        match ty {
            AbstractType::Dynamic => String::from("dynamic"),
            AbstractType::Parameter { name, .. } => self.symbols.resolve(*name).to_string(),
            AbstractType::Interface { class, arguments } => {
                let mut name = self.class_name(*class);
                if !arguments.is_empty() {
                    let args: Vec<String> = arguments.iter().map(|a| self.type_name(a)).collect();
                    name.push('<');
                    name.push_str(&args.join(", "));
                    name.push('>');
                }
                name
            }
        }
    }

    fn class_name(&self, class: ClassId) -> String {
        match class {
            ClassId::SMI | ClassId::MINT => String::from("int"),
            _ => self
                .classes
                .get(class)
                .map(|c| self.symbols.resolve(c.name).to_string())
                .unwrap_or_else(|| String::from("<unknown>")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeFlags;
    use crate::jit::BaselineCompiler;
    use crate::runtime::{ClassDecl, Isolate};
    use pretty_assertions::assert_eq;

    fn string() -> AbstractType {
        AbstractType::raw(ClassId::STRING)
    }

    #[test]
    fn test_canonicalize_shares_structurally_equal_vectors() {
        let mut table = TypeArgumentsTable::new();
        let a = table.add_vector(vec![string()]);
        let b = table.add_vector(vec![string()]);
        assert_ne!(a, b);
        let ca = table.force(a).unwrap();
        let cb = table.force(b).unwrap();
        assert_eq!(ca, cb);
        assert!(table.is_canonical(ca));
        assert_eq!(table.force(ca).unwrap(), ca);
        assert_eq!(table.canonical_len(), 1);
    }

    #[test]
    fn test_force_deferred_vector() {
        let mut symbols = SymbolTable::new();
        let t = symbols.intern("T");
        let mut table = TypeArgumentsTable::new();
        let uninstantiated = table.add_vector(vec![AbstractType::generic(
            ClassId::ARRAY,
            vec![AbstractType::parameter(0, t)],
        )]);
        let first = table.add_vector(vec![string()]);
        let second = table.add_vector(vec![string()]);

        let d1 = table.defer(uninstantiated, Some(first));
        let d2 = table.defer(uninstantiated, Some(second));
        assert!(table.is_deferred(d1));

        let f1 = table.force(d1).unwrap();
        let f2 = table.force(d2).unwrap();
        assert_eq!(f1, f2);
        assert_eq!(
            table.types(f1),
            Some(&[AbstractType::generic(ClassId::ARRAY, vec![string()])][..])
        );
    }

    #[test]
    fn test_deferred_pairs_are_interned_and_forced_once() {
        let mut symbols = SymbolTable::new();
        let t = symbols.intern("T");
        let mut table = TypeArgumentsTable::new();
        let uninstantiated = table.add_vector(vec![AbstractType::parameter(0, t)]);
        let instantiator = table.canonicalize_vector(vec![string()]);

        let deferred = table.defer(uninstantiated, Some(instantiator));
        assert_eq!(table.defer(uninstantiated, Some(instantiator)), deferred);
        assert_ne!(table.defer(uninstantiated, None), deferred);

        let forced = table.force(deferred).unwrap();
        assert_eq!(forced, instantiator);
        let len = table.len();
        assert_eq!(table.force(deferred).unwrap(), forced);
        assert_eq!(table.len(), len);
        assert_eq!(
            table.get(deferred),
            Some(&TypeArguments::Deferred {
                uninstantiated,
                instantiator: Some(instantiator),
                forced: Some(forced),
            })
        );
    }

    #[test]
    fn test_force_unknown_id_fails() {
        let mut table = TypeArgumentsTable::new();
        let err = table.force(TypeArgsId(7)).unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[test]
    fn test_missing_instantiator_yields_dynamic() {
        let mut symbols = SymbolTable::new();
        let t = symbols.intern("T");
        let ty = AbstractType::parameter(0, t);
        assert_eq!(ty.instantiate_from(None), AbstractType::Dynamic);
        assert!(!ty.is_instantiated());
    }

    #[test]
    fn test_subtype_through_supertypes() {
        let mut isolate = Isolate::new(RuntimeFlags::default(), BaselineCompiler);
        let t = isolate.intern("T");
        let base = isolate
            .define_class(ClassDecl::new("Box").type_parameter("T"))
            .unwrap();
        let derived = isolate
            .define_class(
                ClassDecl::new("StringBox")
                    .extends(AbstractType::generic(base, vec![string()])),
            )
            .unwrap();
        let context = isolate.type_context();
        let box_of = |arg| AbstractType::generic(base, vec![arg]);

        assert!(context.is_subtype(&AbstractType::raw(derived), &box_of(string())));
        assert!(context.is_subtype(&AbstractType::raw(derived), &box_of(AbstractType::object())));
        assert!(!context.is_subtype(&AbstractType::raw(derived), &box_of(AbstractType::raw(ClassId::INT))));
        assert!(context.is_subtype(&AbstractType::raw(ClassId::SMI), &AbstractType::raw(ClassId::NUM)));
        assert!(!context.is_subtype(&AbstractType::raw(ClassId::NUM), &AbstractType::raw(ClassId::INT)));
        assert!(context.is_subtype(&AbstractType::raw(ClassId::NULL), &string()));
        assert!(!context.is_subtype(&AbstractType::parameter(0, t), &string()));
    }

    #[test]
    fn test_bounds_checked_only_when_enabled() {
        let flags = RuntimeFlags::default().with_type_checks(true);
        let mut isolate = Isolate::new(flags, BaselineCompiler);
        let numbers = isolate
            .define_class(
                ClassDecl::new("Numbers")
                    .bounded_type_parameter("T", AbstractType::raw(ClassId::NUM)),
            )
            .unwrap();
        let bad = AbstractType::generic(numbers, vec![string()]);
        let good = AbstractType::generic(numbers, vec![AbstractType::raw(ClassId::INT)]);

        let context = isolate.type_context();
        let err = context.instantiate_type(&bad, None).unwrap_err();
        assert_eq!(err.argument, "String");
        assert_eq!(err.bound, "num");
        assert_eq!(err.parameter, "T");
        assert!(context.instantiate_type(&good, None).is_ok());

        isolate.flags_mut().enable_type_checks = false;
        assert!(isolate.type_context().instantiate_type(&bad, None).is_ok());
    }

    #[test]
    fn test_well_formed_reports_malformed_and_malbounded() {
        let mut isolate = Isolate::new(RuntimeFlags::default(), BaselineCompiler);
        let numbers = isolate
            .define_class(
                ClassDecl::new("Numbers")
                    .bounded_type_parameter("T", AbstractType::raw(ClassId::NUM)),
            )
            .unwrap();
        let context = isolate.type_context();

        assert_eq!(context.check_well_formed(&AbstractType::raw(numbers)), Ok(()));
        let wrong_arity = AbstractType::generic(numbers, vec![string(), string()]);
        let err = context.check_well_formed(&wrong_arity).unwrap_err();
        assert_eq!(err.kind_name(), "malformed");
        assert!(err.message().contains("expected 1, got 2"));
        let unknown = AbstractType::generic(ClassId::ARRAY, vec![AbstractType::raw(ClassId(999))]);
        assert!(matches!(context.check_well_formed(&unknown), Err(BadType::Malformed(_))));

        let bad_bound = AbstractType::generic(numbers, vec![string()]);
        match context.check_well_formed(&bad_bound) {
            Err(BadType::Malbounded(bound)) => assert_eq!(bound.argument, "String"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_type_names() {
        let isolate = Isolate::new(RuntimeFlags::default(), BaselineCompiler);
        let context = isolate.type_context();
        let list = AbstractType::generic(ClassId::ARRAY, vec![string()]);
        assert_eq!(context.type_name(&list), "List<String>");
        assert_eq!(context.type_name(&AbstractType::raw(ClassId::SMI)), "int");
        assert_eq!(context.type_name(&AbstractType::Dynamic), "dynamic");
    }

    #[test]
    fn test_null_instance_of() {
        let isolate = Isolate::new(RuntimeFlags::default(), BaselineCompiler);
        let context = isolate.type_context();
        assert!(!context.is_instance_of(ClassId::NULL, None, &string(), None).0);
        assert!(context.is_instance_of(ClassId::NULL, None, &AbstractType::object(), None).0);
    }
}
