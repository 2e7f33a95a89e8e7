//! Shared test helpers for integration tests

use jitrt::jit::Compiler;
use jitrt::runtime::{ClassDecl, ClassId, CodeSpec, DeoptId, Function, FunctionDecl, FunctionId, Isolate, Value};
use jitrt::{Result, RuntimeFlags};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// What the scripted compiler hands out, and what it was asked for
#[derive(Debug, Default)]
pub struct Script {
    /// Baseline code per function; others get an empty default
    pub baseline: HashMap<FunctionId, CodeSpec>,
    /// Optimized code per function; others bail out
    pub optimized: HashMap<FunctionId, CodeSpec>,
    /// Every optimizing compilation requested, with its OSR entry
    pub optimizations: Vec<(FunctionId, Option<DeoptId>)>,
}

/// Compiler driven by a [`Script`] the test keeps a handle to
#[derive(Debug, Clone, Default)]
pub struct ScriptedCompiler {
    script: Rc<RefCell<Script>>,
}

impl Compiler for ScriptedCompiler {
    fn compile_unoptimized(&self, function: &Function) -> Result<CodeSpec> {
        let script = self.script.borrow();
        Ok(script
            .baseline
            .get(&function.id)
            .cloned()
            .unwrap_or_else(|| CodeSpec::unoptimized(32, function.signature.num_fixed_parameters)))
    }

    fn compile_optimized(&self, function: &Function, osr_id: Option<DeoptId>) -> Result<Option<CodeSpec>> {
        let mut script = self.script.borrow_mut();
        script.optimizations.push((function.id, osr_id));
        Ok(script.optimized.get(&function.id).cloned())
    }
}

/// Isolate using a scripted compiler, plus the script
pub fn scripted_isolate(flags: RuntimeFlags) -> (Isolate, Rc<RefCell<Script>>) {
    let compiler = ScriptedCompiler::default();
    let script = Rc::clone(&compiler.script);
    (Isolate::new(flags, compiler), script)
}

/// `IntList` and `StringList`, both implementing `length`, which answers
/// 1 and 2 respectively
#[allow(dead_code)]
pub fn define_lists(isolate: &mut Isolate) -> (ClassId, ClassId) {
    let int_list = isolate.define_class(ClassDecl::new("IntList")).unwrap();
    let string_list = isolate.define_class(ClassDecl::new("StringList")).unwrap();
    isolate
        .define_function(FunctionDecl::method(int_list, "length", 1, |_, _| Ok(Value::Smi(1))))
        .unwrap();
    isolate
        .define_function(FunctionDecl::method(string_list, "length", 1, |_, _| Ok(Value::Smi(2))))
        .unwrap();
    (int_list, string_list)
}

/// A fresh instance of `class`
#[allow(dead_code)]
pub fn instance(isolate: &mut Isolate, class: ClassId) -> Value {
    jitrt::runtime::allocate_object(isolate, class, None, jitrt::runtime::Instantiator::None).unwrap()
}
