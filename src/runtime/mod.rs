//! Per-isolate runtime state
//!
//! An [`Isolate`] owns everything the runtime entries touch: symbols, classes,
//! functions, installed code, the canonical type-argument table, the heap, the
//! execution stack and the megamorphic cache table. All of it is created with
//! the isolate and dropped with it.

mod allocation;
mod class;
mod code;
mod field;
mod function;
pub mod intern;
mod invoke;
mod stack;
mod value;

pub use allocation::{
    allocate_array, allocate_closure, allocate_context, allocate_implicit_instance_closure, allocate_object,
    allocate_object_with_bounds_check, clone_context, Instantiator,
};
pub use class::{Class, ClassDecl, ClassId, ClassTable, DispatcherKind, FieldGuard, GuardedCid, TypeParameter};
pub use field::{field_guard, update_field_cid};
pub use code::{Code, CodeId, CodeKind, CodeSpec, CodeTable, DeoptId, DeoptTableEntry, StaticCallEntry};
pub use function::{
    Function, FunctionDecl, FunctionId, FunctionKind, FunctionTable, NativeFn, Signature,
    LOW_INVOCATION_COUNT,
};
pub use intern::{Symbol, SymbolTable};
pub use invoke::{invoke_closure, invoke_function, invoke_no_such_method};
pub use stack::{Frame, Stack, Word, FRAME_HEADER_SLOTS};
pub use value::{Value, SMI_MAX, SMI_MIN};

use crate::config::RuntimeFlags;
use crate::deopt::DeoptContext;
use crate::diagnostics::targets;
use crate::dispatch::MegamorphicCacheTable;
use crate::error::{messages, Error, FatalError, Result, SourceLocation};
use crate::gc::{GcConfig, Heap, HeapObject, ObjectId, ObjectKind};
use crate::jit::{Compiler, Debugger, Embedder, InterruptBits, NoDebugger, NoEmbedder};
use crate::types::{AbstractType, SubtypeTestCache, TypeArgumentsTable, TypeContext};
use rustc_hash::FxHashMap as HashMap;

/// Default stack capacity in slots, frame headers included
pub const DEFAULT_STACK_LIMIT: usize = 1 << 13;

/// Objects preallocated at isolate creation
#[derive(Debug, Clone, Copy)]
pub struct ObjectStore {
    /// Thrown on stack overflow without allocating
    pub stack_overflow: ObjectId,
}

/// An independently scheduled unit of execution with its own heap
pub struct Isolate {
    flags: RuntimeFlags,
    pub symbols: SymbolTable,
    pub classes: ClassTable,
    pub functions: FunctionTable,
    pub codes: CodeTable,
    pub type_args: TypeArgumentsTable,
    pub heap: Heap,
    pub stack: Stack,
    pub megamorphic: MegamorphicCacheTable,
    pub(crate) deopt_context: Option<DeoptContext>,
    pub(crate) interrupts: InterruptBits,
    pub(crate) compiler: Box<dyn Compiler>,
    pub(crate) debugger: Box<dyn Debugger>,
    pub(crate) embedder: Box<dyn Embedder>,
    object_store: ObjectStore,
    terminated: Option<FatalError>,
}

impl Isolate {
    /// Create an isolate with the core classes bootstrapped
    pub fn new(flags: RuntimeFlags, compiler: impl Compiler + 'static) -> Self {
        let mut heap = Heap::new();
        let stack_overflow = heap.allocate_permanent(HeapObject::new(
            ClassId::EXCEPTION,
            ObjectKind::Exception {
                message: messages::MAXIMUM_CALL_STACK.to_string(),
            },
        ));
        let mut isolate = Self {
            flags,
            symbols: SymbolTable::new(),
            classes: ClassTable::new(),
            functions: FunctionTable::new(),
            codes: CodeTable::new(),
            type_args: TypeArgumentsTable::new(),
            heap,
            stack: Stack::new(DEFAULT_STACK_LIMIT),
            megamorphic: MegamorphicCacheTable::new(),
            deopt_context: None,
            interrupts: InterruptBits::empty(),
            compiler: Box::new(compiler),
            debugger: Box::new(NoDebugger),
            embedder: Box::new(NoEmbedder),
            object_store: ObjectStore { stack_overflow },
            terminated: None,
        };
        isolate.bootstrap();
        isolate
    }

    pub fn with_debugger(mut self, debugger: impl Debugger + 'static) -> Self {
        self.debugger = Box::new(debugger);
        self
    }

    pub fn with_embedder(mut self, embedder: impl Embedder + 'static) -> Self {
        self.embedder = Box::new(embedder);
        self
    }

    pub fn with_stack_limit(mut self, limit: usize) -> Self {
        self.stack.set_limit(limit);
        self
    }

    pub fn with_gc_config(mut self, config: GcConfig) -> Self {
        self.heap.set_config(config);
        self
    }

    fn bootstrap(&mut self) {
        self.add_core_class(ClassDecl::root("<illegal>"));
        let object = self.add_core_class(ClassDecl::root("Object"));
        let raw = AbstractType::raw;
        self.add_core_class(ClassDecl::new("Null"));
        self.add_core_class(ClassDecl::new("bool"));
        let num = self.add_core_class(ClassDecl::new("num").abstract_class());
        let int = self.add_core_class(ClassDecl::new("int").extends(raw(num)).abstract_class());
        self.add_core_class(ClassDecl::new("_Smi").extends(raw(int)));
        self.add_core_class(ClassDecl::new("_Mint").extends(raw(int)));
        self.add_core_class(ClassDecl::new("double").extends(raw(num)));
        self.add_core_class(ClassDecl::new("String"));
        self.add_core_class(ClassDecl::new("List").type_parameter("E"));
        self.add_core_class(ClassDecl::new("_Closure"));
        self.add_core_class(ClassDecl::new("_InvocationMirror"));
        self.add_core_class(ClassDecl::new("StackOverflowError"));
        self.add_core_class(ClassDecl::new("_Context"));
        debug_assert_eq!(self.classes.len() as u32, ClassId::NUM_PREDEFINED);

        let no_such_method = FunctionDecl::method(object, "noSuchMethod", 1, default_no_such_method);
        let defined = self.define_function(no_such_method);
        debug_assert!(defined.is_ok());
    }

    fn add_core_class(&mut self, decl: ClassDecl) -> ClassId {
        let id = ClassId(self.classes.len() as u32);
        match self.define_class(decl) {
            Ok(defined) => defined,
            Err(_) => id,
        }
    }

    // ==================== Definitions ====================

    /// Define a class. Field getters are created implicitly.
    pub fn define_class(&mut self, decl: ClassDecl) -> Result<ClassId> {
        let name = self.symbols.intern(&decl.name);
        if self.classes.lookup(name).is_some() {
            return Err(Error::internal(format!("class '{}' already defined", decl.name)));
        }
        let field_offset = match &decl.super_type {
            Some(AbstractType::Interface { class, .. }) => self
                .classes
                .get(*class)
                .map(Class::num_fields)
                .ok_or_else(|| Error::internal(messages::dangling(messages::NO_SUCH_CLASS, class)))?,
            Some(other) => {
                return Err(Error::internal(format!("'{}' cannot extend {:?}", decl.name, other)))
            }
            None => 0,
        };
        let type_parameters = decl
            .type_parameters
            .iter()
            .map(|(param, bound)| TypeParameter {
                name: self.symbols.intern(param),
                bound: bound.clone(),
            })
            .collect();
        let fields: Vec<Symbol> = decl.fields.iter().map(|f| self.symbols.intern(f)).collect();

        let id = self.classes.add(Class {
            id: ClassId::ILLEGAL,
            name,
            super_type: decl.super_type,
            interfaces: decl.interfaces,
            type_parameters,
            is_abstract: decl.is_abstract,
            field_guards: vec![FieldGuard::default(); fields.len()],
            fields: fields.clone(),
            field_offset,
            functions: HashMap::default(),
            dispatchers: HashMap::default(),
            implicit_closures: HashMap::default(),
        });

        for (index, field) in fields.into_iter().enumerate() {
            let getter = self.symbols.getter_name(field);
            let function = self.functions.add(
                getter,
                id,
                FunctionKind::ImplicitGetter {
                    field: field_offset + index,
                },
                Signature::fixed(1),
                false,
                true,
            );
            if let Some(class) = self.classes.get_mut(id) {
                class.functions.insert(getter, function);
            }
        }
        Ok(id)
    }

    /// Define a function and register it on its owner class
    pub fn define_function(&mut self, decl: FunctionDecl) -> Result<FunctionId> {
        let name = self.symbols.intern(&decl.name);
        if self.classes.get(decl.owner).is_none() {
            return Err(Error::internal(messages::dangling(messages::NO_SUCH_CLASS, decl.owner)));
        }
        let id = self.functions.add(
            name,
            decl.owner,
            decl.kind,
            decl.signature,
            decl.is_static,
            decl.is_optimizable,
        );
        if let Some(class) = self.classes.get_mut(decl.owner) {
            class.functions.insert(name, id);
        }
        Ok(id)
    }

    // ==================== Accessors ====================

    pub fn flags(&self) -> &RuntimeFlags {
        &self.flags
    }

    pub fn flags_mut(&mut self) -> &mut RuntimeFlags {
        &mut self.flags
    }

    pub fn object_store(&self) -> &ObjectStore {
        &self.object_store
    }

    /// The deoptimization between frame capture and materialization, if any
    pub fn deopt_context(&self) -> Option<&DeoptContext> {
        self.deopt_context.as_ref()
    }

    pub fn intern(&mut self, s: &str) -> Symbol {
        self.symbols.intern(s)
    }

    pub fn function(&self, id: FunctionId) -> Result<&Function> {
        self.functions
            .get(id)
            .ok_or_else(|| Error::internal(messages::dangling(messages::NO_SUCH_FUNCTION, id)))
    }

    pub fn function_mut(&mut self, id: FunctionId) -> Result<&mut Function> {
        self.functions
            .get_mut(id)
            .ok_or_else(|| Error::internal(messages::dangling(messages::NO_SUCH_FUNCTION, id)))
    }

    pub fn class(&self, id: ClassId) -> Result<&Class> {
        self.classes
            .get(id)
            .ok_or_else(|| Error::internal(messages::dangling(messages::NO_SUCH_CLASS, id)))
    }

    pub fn code(&self, id: CodeId) -> Result<&Code> {
        self.codes
            .get(id)
            .ok_or_else(|| Error::internal(messages::dangling(messages::NO_SUCH_CODE, id)))
    }

    pub fn code_mut(&mut self, id: CodeId) -> Result<&mut Code> {
        self.codes
            .get_mut(id)
            .ok_or_else(|| Error::internal(messages::dangling(messages::NO_SUCH_CODE, id)))
    }

    pub fn object(&self, id: ObjectId) -> Result<&HeapObject> {
        self.heap
            .get(id)
            .ok_or_else(|| Error::internal(messages::dangling(messages::NO_SUCH_OBJECT, id)))
    }

    pub fn object_mut(&mut self, id: ObjectId) -> Result<&mut HeapObject> {
        self.heap
            .get_mut(id)
            .ok_or_else(|| Error::internal(messages::dangling(messages::NO_SUCH_OBJECT, id)))
    }

    /// Code object of the frame at `index`
    pub fn frame_code(&self, index: usize) -> Result<&Code> {
        let frame = self
            .stack
            .frame(index)
            .ok_or_else(|| Error::internal(messages::NO_DART_FRAME))?;
        self.codes
            .lookup_by_pc(frame.pc)
            .ok_or_else(|| Error::internal(messages::dangling(messages::NO_SUCH_CODE, frame.pc)))
    }

    /// Runtime class of `value`
    pub fn class_id_of(&self, value: Value) -> Result<ClassId> {
        Ok(match value {
            Value::Null => ClassId::NULL,
            Value::Bool(_) => ClassId::BOOL,
            Value::Smi(_) => ClassId::SMI,
            Value::Str(_) => ClassId::STRING,
            Value::Object(id) => self.object(id)?.class,
        })
    }

    pub fn class_name(&self, id: ClassId) -> &str {
        self.classes
            .get(id)
            .map(|class| self.symbols.resolve(class.name))
            .unwrap_or("<unknown>")
    }

    /// `Owner.name` of a function
    pub fn qualified_function_name(&self, id: FunctionId) -> String {
        match self.functions.get(id) {
            Some(function) => format!(
                "{}.{}",
                self.class_name(function.owner),
                self.symbols.resolve(function.name)
            ),
            None => format!("<function {}>", id.0),
        }
    }

    /// Type operations bound to this isolate's class table
    pub fn type_context(&self) -> TypeContext<'_> {
        TypeContext::new(&self.classes, &self.symbols, self.flags.enable_type_checks)
    }

    /// Empty subtype test cache for one call site, sized by
    /// `max_subtype_cache_entries`
    pub fn new_subtype_test_cache(&self) -> SubtypeTestCache {
        SubtypeTestCache::new(self.flags.max_subtype_cache_entries)
    }

    /// Source location of the innermost generated-code frame
    pub fn caller_location(&self) -> SourceLocation {
        self.stack
            .top_frame()
            .and_then(|frame| {
                self.codes
                    .lookup_by_pc(frame.pc)
                    .and_then(|code| code.token_pos_at(frame.pc))
            })
            .map(SourceLocation::at)
            .unwrap_or_else(SourceLocation::unknown)
    }

    // ==================== Heap ====================

    pub fn allocate(&mut self, object: HeapObject) -> Result<ObjectId> {
        Ok(self.heap.allocate(object)?)
    }

    /// Box an integer, using a small integer when it fits
    pub fn new_integer(&mut self, value: i64) -> Result<Value> {
        if Value::is_smi_value(value) {
            Ok(Value::Smi(value))
        } else {
            Ok(Value::Object(self.allocate(HeapObject::new(ClassId::MINT, ObjectKind::Mint(value)))?))
        }
    }

    /// Collect garbage. Roots are the stack, the in-flight deopt context, the
    /// object pools of live code and of code still running on the stack, and
    /// preallocated objects.
    pub fn collect_garbage(&mut self) -> usize {
        let mut roots: Vec<ObjectId> = self.stack.roots().collect();
        if let Some(context) = &self.deopt_context {
            roots.extend(context.roots());
        }
        // Frames marked for lazy deoptimization still run dead code.
        let running_dead = self
            .stack
            .frames()
            .iter()
            .filter_map(|frame| self.codes.lookup_by_pc(frame.pc))
            .filter(|code| !code.alive);
        roots.extend(
            self.codes
                .iter()
                .filter(|code| code.alive)
                .chain(running_dead)
                .flat_map(|code| code.object_pool().iter().filter_map(Value::as_object)),
        );
        roots.push(self.object_store.stack_overflow);
        let freed = self.heap.collect(roots);
        tracing::debug!(target: targets::GC, freed, live = self.heap.live_count(), "garbage collected");
        freed
    }

    // ==================== Lifecycle ====================

    /// Fail if a fatal error has stopped this isolate
    pub fn check_alive(&self) -> Result<()> {
        match &self.terminated {
            Some(fatal) => Err(Error::Fatal(fatal.clone())),
            None => Ok(()),
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.is_some()
    }

    /// Stop the isolate. Returns the error to propagate.
    pub fn terminate(&mut self, fatal: FatalError) -> Error {
        tracing::error!(target: targets::RUNTIME_CALLS, error = %fatal, "isolate terminated");
        self.terminated = Some(fatal.clone());
        Error::Fatal(fatal)
    }
}

/// `Object.noSuchMethod`: raise a no-such-method error describing the call
fn default_no_such_method(isolate: &mut Isolate, args: &[Value]) -> Result<Value> {
    let receiver = args.first().copied().unwrap_or(Value::Null);
    let receiver_class = isolate.class_id_of(receiver)?;
    let invocation = args
        .get(1)
        .and_then(Value::as_object)
        .ok_or_else(|| Error::internal("noSuchMethod expects an invocation"))?;
    let (selector, arguments) = match &isolate.object(invocation)?.kind {
        ObjectKind::Invocation { selector, values, .. } => (*selector, values.len()),
        _ => return Err(Error::internal("noSuchMethod expects an invocation")),
    };
    Err(Error::NoSuchMethod {
        receiver: isolate.class_name(receiver_class).to_string(),
        selector: isolate.symbols.resolve(selector).to_string(),
        arguments,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::BaselineCompiler;

    #[test]
    fn test_bootstrap_core_classes() {
        let isolate = Isolate::new(RuntimeFlags::default(), BaselineCompiler);
        assert_eq!(isolate.class_name(ClassId::SMI), "_Smi");
        assert_eq!(isolate.class_name(ClassId::ARRAY), "List");
        assert!(isolate.classes.is_subclass_of(ClassId::SMI, ClassId::NUM));
        let nsm = isolate.symbols.no_such_method;
        assert!(isolate.class(ClassId::OBJECT).unwrap().lookup_function(nsm).is_some());
    }

    #[test]
    fn test_define_class_creates_getters() {
        let mut isolate = Isolate::new(RuntimeFlags::default(), BaselineCompiler);
        let base = isolate.define_class(ClassDecl::new("Base").field("a")).unwrap();
        let derived = isolate
            .define_class(ClassDecl::new("Derived").extends(AbstractType::raw(base)).field("b"))
            .unwrap();
        let getter = isolate.intern("get:b");
        let class = isolate.class(derived).unwrap();
        assert_eq!(class.num_fields(), 2);
        let id = class.lookup_function(getter).unwrap();
        assert!(matches!(
            isolate.function(id).unwrap().kind,
            FunctionKind::ImplicitGetter { field: 1 }
        ));
        assert!(isolate.define_class(ClassDecl::new("Base")).is_err());
    }

    #[test]
    fn test_terminate_poisons_isolate() {
        let mut isolate = Isolate::new(RuntimeFlags::default(), BaselineCompiler);
        assert!(isolate.check_alive().is_ok());
        let err = isolate.terminate(FatalError::InterruptUnwindUnimplemented);
        assert!(err.is_fatal());
        assert!(isolate.is_terminated());
        assert!(isolate.check_alive().unwrap_err().is_fatal());
    }

    #[test]
    fn test_new_integer_boxes_large_values() {
        let mut isolate = Isolate::new(RuntimeFlags::default(), BaselineCompiler);
        assert_eq!(isolate.new_integer(7).unwrap(), Value::Smi(7));
        let boxed = isolate.new_integer(i64::MAX).unwrap();
        let id = boxed.as_object().unwrap();
        assert_eq!(isolate.object(id).unwrap().kind, ObjectKind::Mint(i64::MAX));
        assert_eq!(isolate.class_id_of(boxed).unwrap(), ClassId::MINT);
    }
}
