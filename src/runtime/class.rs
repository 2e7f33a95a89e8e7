//! Class descriptors and the class table

use super::function::FunctionId;
use super::intern::Symbol;
use crate::dispatch::ArgumentsDescriptor;
use crate::types::AbstractType;
use rustc_hash::FxHashMap as HashMap;

/// Runtime class identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(pub u32);

impl ClassId {
    pub const ILLEGAL: ClassId = ClassId(0);
    pub const OBJECT: ClassId = ClassId(1);
    pub const NULL: ClassId = ClassId(2);
    pub const BOOL: ClassId = ClassId(3);
    pub const NUM: ClassId = ClassId(4);
    pub const INT: ClassId = ClassId(5);
    pub const SMI: ClassId = ClassId(6);
    pub const MINT: ClassId = ClassId(7);
    pub const DOUBLE: ClassId = ClassId(8);
    pub const STRING: ClassId = ClassId(9);
    pub const ARRAY: ClassId = ClassId(10);
    pub const CLOSURE: ClassId = ClassId(11);
    pub const INVOCATION: ClassId = ClassId(12);
    pub const EXCEPTION: ClassId = ClassId(13);
    pub const CONTEXT: ClassId = ClassId(14);

    /// Number of classes created at isolate bootstrap
    pub const NUM_PREDEFINED: u32 = 15;
}

/// A declared type parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeParameter {
    pub name: Symbol,
    /// Upper bound, expressed over the declaring class's own parameters
    pub bound: Option<AbstractType>,
}

/// Kinds of synthesized dispatcher functions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatcherKind {
    /// Read a field through its getter and call the value
    InvokeField,
    /// Route the call to `noSuchMethod`
    NoSuchMethod,
}

/// Class recorded by a field guard
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum GuardedCid {
    /// No store observed yet
    #[default]
    Unknown,
    /// Every non-null store had this class
    Class(ClassId),
    /// Stores of more than one class were observed
    Dynamic,
}

/// What optimized code may assume about the values stored into a field
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FieldGuard {
    pub guarded_cid: GuardedCid,
    pub is_nullable: bool,
}

impl FieldGuard {
    /// Widen the guard to admit a value of class `cid`.
    /// Returns whether the guard changed.
    pub fn update(&mut self, cid: ClassId) -> bool {
        let before = *self;
        if cid == ClassId::NULL {
            self.is_nullable = true;
            if self.guarded_cid == GuardedCid::Unknown {
                self.guarded_cid = GuardedCid::Class(cid);
            }
        } else {
            self.guarded_cid = match self.guarded_cid {
                GuardedCid::Unknown => GuardedCid::Class(cid),
                GuardedCid::Class(ClassId::NULL) => GuardedCid::Class(cid),
                GuardedCid::Class(known) if known == cid => GuardedCid::Class(cid),
                _ => GuardedCid::Dynamic,
            };
        }
        *self != before
    }
}

/// Class descriptor. Immutable after definition apart from the lazily
/// populated dispatcher and closure caches.
#[derive(Debug, Clone)]
pub struct Class {
    pub id: ClassId,
    pub name: Symbol,
    /// Supertype, with arguments expressed over this class's parameters
    pub super_type: Option<AbstractType>,
    pub interfaces: Vec<AbstractType>,
    pub type_parameters: Vec<TypeParameter>,
    pub is_abstract: bool,
    /// Field names, own fields only
    pub fields: Vec<Symbol>,
    /// Index of the first own field in an instance's field slots
    pub field_offset: usize,
    /// One guard per own field
    pub field_guards: Vec<FieldGuard>,
    pub(crate) functions: HashMap<Symbol, FunctionId>,
    pub(crate) dispatchers: HashMap<(Symbol, ArgumentsDescriptor, DispatcherKind), FunctionId>,
    pub(crate) implicit_closures: HashMap<FunctionId, FunctionId>,
}

impl Class {
    /// Number of declared type parameters
    pub fn num_type_arguments(&self) -> usize {
        self.type_parameters.len()
    }

    /// Total number of field slots, inherited fields included
    pub fn num_fields(&self) -> usize {
        self.field_offset + self.fields.len()
    }

    /// Function declared directly on this class
    pub fn lookup_function(&self, name: Symbol) -> Option<FunctionId> {
        self.functions.get(&name).copied()
    }

    /// Class of the supertype, if any
    pub fn super_class(&self) -> Option<ClassId> {
        match &self.super_type {
            Some(AbstractType::Interface { class, .. }) => Some(*class),
            _ => None,
        }
    }

    pub(crate) fn dispatcher(
        &self,
        name: Symbol,
        descriptor: &ArgumentsDescriptor,
        kind: DispatcherKind,
    ) -> Option<FunctionId> {
        self.dispatchers
            .get(&(name, descriptor.clone(), kind))
            .copied()
    }
}

/// Declaration used to define a class
#[derive(Debug, Clone)]
pub struct ClassDecl {
    pub name: String,
    pub super_type: Option<AbstractType>,
    pub interfaces: Vec<AbstractType>,
    pub type_parameters: Vec<(String, Option<AbstractType>)>,
    pub is_abstract: bool,
    pub fields: Vec<String>,
}

impl ClassDecl {
    /// A class extending `Object`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            super_type: Some(AbstractType::object()),
            interfaces: Vec::new(),
            type_parameters: Vec::new(),
            is_abstract: false,
            fields: Vec::new(),
        }
    }

    pub fn extends(mut self, super_type: AbstractType) -> Self {
        self.super_type = Some(super_type);
        self
    }

    pub fn implements(mut self, interface: AbstractType) -> Self {
        self.interfaces.push(interface);
        self
    }

    pub fn type_parameter(mut self, name: impl Into<String>) -> Self {
        self.type_parameters.push((name.into(), None));
        self
    }

    pub fn bounded_type_parameter(mut self, name: impl Into<String>, bound: AbstractType) -> Self {
        self.type_parameters.push((name.into(), Some(bound)));
        self
    }

    pub fn field(mut self, name: impl Into<String>) -> Self {
        self.fields.push(name.into());
        self
    }

    pub fn abstract_class(mut self) -> Self {
        self.is_abstract = true;
        self
    }

    pub(crate) fn root(name: &str) -> Self {
        Self {
            super_type: None,
            ..Self::new(name)
        }
    }
}

/// All classes of an isolate, indexed by [`ClassId`]
#[derive(Debug, Default)]
pub struct ClassTable {
    classes: Vec<Class>,
    by_name: HashMap<Symbol, ClassId>,
}

impl ClassTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&mut self, mut class: Class) -> ClassId {
        let id = ClassId(self.classes.len() as u32);
        class.id = id;
        self.by_name.insert(class.name, id);
        self.classes.push(class);
        id
    }

    pub fn get(&self, id: ClassId) -> Option<&Class> {
        self.classes.get(id.0 as usize)
    }

    pub(crate) fn get_mut(&mut self, id: ClassId) -> Option<&mut Class> {
        self.classes.get_mut(id.0 as usize)
    }

    pub fn lookup(&self, name: Symbol) -> Option<ClassId> {
        self.by_name.get(&name).copied()
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// `class` followed by its superclasses, nearest first
    pub fn superclass_chain(&self, class: ClassId) -> impl Iterator<Item = &Class> + '_ {
        std::iter::successors(self.get(class), move |c| {
            c.super_class().and_then(|s| self.get(s))
        })
    }

    /// Whether `class` is `ancestor` or extends it
    pub fn is_subclass_of(&self, class: ClassId, ancestor: ClassId) -> bool {
        self.superclass_chain(class).any(|c| c.id == ancestor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::SymbolTable;

    fn class(symbols: &mut SymbolTable, name: &str, super_class: Option<ClassId>) -> Class {
        Class {
            id: ClassId::ILLEGAL,
            name: symbols.intern(name),
            super_type: super_class.map(AbstractType::raw),
            interfaces: Vec::new(),
            type_parameters: Vec::new(),
            is_abstract: false,
            fields: Vec::new(),
            field_offset: 0,
            field_guards: Vec::new(),
            functions: HashMap::default(),
            dispatchers: HashMap::default(),
            implicit_closures: HashMap::default(),
        }
    }

    #[test]
    fn test_superclass_chain() {
        let mut symbols = SymbolTable::new();
        let mut table = ClassTable::new();
        let a = table.add(class(&mut symbols, "A", None));
        let b = table.add(class(&mut symbols, "B", Some(a)));
        let c = table.add(class(&mut symbols, "C", Some(b)));

        let chain: Vec<ClassId> = table.superclass_chain(c).map(|k| k.id).collect();
        assert_eq!(chain, vec![c, b, a]);
        assert!(table.is_subclass_of(c, a));
        assert!(!table.is_subclass_of(a, c));
        assert_eq!(table.lookup(symbols.intern("B")), Some(b));
    }

    #[test]
    fn test_field_guard_widens_monotonically() {
        let mut guard = FieldGuard::default();
        assert!(guard.update(ClassId::NULL));
        assert_eq!(guard.guarded_cid, GuardedCid::Class(ClassId::NULL));
        assert!(guard.is_nullable);

        assert!(guard.update(ClassId::SMI));
        assert_eq!(guard.guarded_cid, GuardedCid::Class(ClassId::SMI));
        assert!(!guard.update(ClassId::SMI));
        assert!(!guard.update(ClassId::NULL));

        assert!(guard.update(ClassId::STRING));
        assert_eq!(guard.guarded_cid, GuardedCid::Dynamic);
        assert!(!guard.update(ClassId::SMI));
    }
}
