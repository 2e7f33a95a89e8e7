//! Function descriptors

use super::class::ClassId;
use super::code::CodeId;
use super::intern::Symbol;
use super::{Isolate, Value};
use crate::dispatch::ArgumentsDescriptor;
use crate::error::Result;
use std::fmt;
use std::rc::Rc;

/// Usage-counter value that permanently suppresses optimization attempts
pub const LOW_INVOCATION_COUNT: i64 = -100_000_000;

/// Function handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionId(pub u32);

/// Body of a function as executed by generated code. Receives the isolate and
/// the full argument list, receiver (or closure) first.
pub type NativeFn = Rc<dyn Fn(&mut Isolate, &[Value]) -> Result<Value>>;

/// What a function does when invoked
#[derive(Clone)]
pub enum FunctionKind {
    /// Ordinary method or static function
    Regular(NativeFn),
    /// Closure function; `args[0]` is the closure object
    Closure(NativeFn),
    /// Getter synthesized for a field
    ImplicitGetter { field: usize },
    /// Getter returning `method` closurized over the receiver
    MethodExtractor { method: FunctionId },
    /// Closure function calling `target` on the receiver captured in the
    /// closure context
    ImplicitClosure { target: FunctionId },
    /// Reads the getter for `target_name` and calls the result
    InvokeFieldDispatcher {
        target_name: Symbol,
        descriptor: ArgumentsDescriptor,
    },
    /// Routes a call of `target_name` to `noSuchMethod`
    NoSuchMethodDispatcher {
        target_name: Symbol,
        descriptor: ArgumentsDescriptor,
    },
}

impl fmt::Debug for FunctionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FunctionKind::Regular(_) => write!(f, "Regular"),
            FunctionKind::Closure(_) => write!(f, "Closure"),
            FunctionKind::ImplicitGetter { field } => write!(f, "ImplicitGetter({})", field),
            FunctionKind::MethodExtractor { method } => write!(f, "MethodExtractor({:?})", method),
            FunctionKind::ImplicitClosure { target } => write!(f, "ImplicitClosure({:?})", target),
            FunctionKind::InvokeFieldDispatcher { target_name, .. } => {
                write!(f, "InvokeFieldDispatcher({:?})", target_name)
            }
            FunctionKind::NoSuchMethodDispatcher { target_name, .. } => {
                write!(f, "NoSuchMethodDispatcher({:?})", target_name)
            }
        }
    }
}

/// Parameter shape of a function. Counts include the receiver.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Signature {
    pub num_fixed_parameters: usize,
    pub num_optional_parameters: usize,
    pub named_parameters: Vec<Symbol>,
    pub num_type_parameters: usize,
}

impl Signature {
    /// `fixed` required parameters, receiver included
    pub fn fixed(fixed: usize) -> Self {
        Self {
            num_fixed_parameters: fixed,
            ..Self::default()
        }
    }

    /// Whether a call shaped like `descriptor` can bind to this signature
    pub fn accepts(&self, descriptor: &ArgumentsDescriptor) -> bool {
        let positional = descriptor.positional_count();
        if positional < self.num_fixed_parameters {
            return false;
        }
        if self.named_parameters.is_empty() {
            positional <= self.num_fixed_parameters + self.num_optional_parameters
                && descriptor.named().is_empty()
        } else {
            positional == self.num_fixed_parameters
                && descriptor
                    .named()
                    .iter()
                    .all(|name| self.named_parameters.contains(name))
        }
    }
}

/// A function and its compilation state
#[derive(Debug, Clone)]
pub struct Function {
    pub id: FunctionId,
    pub name: Symbol,
    pub owner: ClassId,
    pub kind: FunctionKind,
    pub signature: Signature,
    pub is_static: bool,
    /// Code executed by fresh calls
    pub current_code: Option<CodeId>,
    /// Baseline code, kept while optimized code is installed
    pub unoptimized_code: Option<CodeId>,
    pub usage_counter: i64,
    pub deoptimization_counter: u32,
    pub is_optimizable: bool,
}

impl Function {
    pub fn has_code(&self) -> bool {
        self.current_code.is_some()
    }

    /// Whether the current code is an optimized version
    pub fn has_optimized_code(&self) -> bool {
        self.current_code.is_some() && self.current_code != self.unoptimized_code
    }

    /// Revert to the baseline code
    pub fn switch_to_unoptimized_code(&mut self) {
        self.current_code = self.unoptimized_code;
    }

    /// Drop the code references; fresh calls recompile or reattach
    pub fn detach_code(&mut self) {
        self.current_code = None;
        self.unoptimized_code = None;
    }

    /// Install baseline code that was detached earlier
    pub fn reattach_code(&mut self, code: CodeId) {
        self.current_code = Some(code);
        self.unoptimized_code = Some(code);
    }

    pub fn is_closure_function(&self) -> bool {
        matches!(
            self.kind,
            FunctionKind::Closure(_) | FunctionKind::ImplicitClosure { .. }
        )
    }

    pub fn is_method_extractor(&self) -> bool {
        matches!(self.kind, FunctionKind::MethodExtractor { .. })
    }

    pub fn is_dispatcher(&self) -> bool {
        matches!(
            self.kind,
            FunctionKind::InvokeFieldDispatcher { .. } | FunctionKind::NoSuchMethodDispatcher { .. }
        )
    }
}

/// Declaration used to define a function
#[derive(Clone)]
pub struct FunctionDecl {
    pub name: String,
    pub owner: ClassId,
    pub kind: FunctionKind,
    pub signature: Signature,
    pub is_static: bool,
    pub is_optimizable: bool,
}

impl FunctionDecl {
    /// Instance method taking `arity` arguments besides the receiver
    pub fn method<F>(owner: ClassId, name: impl Into<String>, arity: usize, body: F) -> Self
    where
        F: Fn(&mut Isolate, &[Value]) -> Result<Value> + 'static,
    {
        Self {
            name: name.into(),
            owner,
            kind: FunctionKind::Regular(Rc::new(body)),
            signature: Signature::fixed(arity + 1),
            is_static: false,
            is_optimizable: true,
        }
    }

    /// Static function taking `arity` arguments
    pub fn static_function<F>(owner: ClassId, name: impl Into<String>, arity: usize, body: F) -> Self
    where
        F: Fn(&mut Isolate, &[Value]) -> Result<Value> + 'static,
    {
        Self {
            signature: Signature::fixed(arity),
            is_static: true,
            ..Self::method(owner, name, 0, body)
        }
    }

    /// Closure function taking `arity` arguments besides the closure itself
    pub fn closure<F>(owner: ClassId, name: impl Into<String>, arity: usize, body: F) -> Self
    where
        F: Fn(&mut Isolate, &[Value]) -> Result<Value> + 'static,
    {
        Self {
            name: name.into(),
            owner,
            kind: FunctionKind::Closure(Rc::new(body)),
            signature: Signature::fixed(arity + 1),
            is_static: false,
            is_optimizable: true,
        }
    }

    pub fn with_signature(mut self, signature: Signature) -> Self {
        self.signature = signature;
        self
    }

    pub fn not_optimizable(mut self) -> Self {
        self.is_optimizable = false;
        self
    }
}

/// All functions of an isolate, indexed by [`FunctionId`]
#[derive(Debug, Default)]
pub struct FunctionTable {
    functions: Vec<Function>,
}

impl FunctionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(
        &mut self,
        name: Symbol,
        owner: ClassId,
        kind: FunctionKind,
        signature: Signature,
        is_static: bool,
        is_optimizable: bool,
    ) -> FunctionId {
        let id = FunctionId(self.functions.len() as u32);
        self.functions.push(Function {
            id,
            name,
            owner,
            kind,
            signature,
            is_static,
            current_code: None,
            unoptimized_code: None,
            usage_counter: 0,
            deoptimization_counter: 0,
            is_optimizable,
        });
        id
    }

    pub fn get(&self, id: FunctionId) -> Option<&Function> {
        self.functions.get(id.0 as usize)
    }

    pub fn get_mut(&mut self, id: FunctionId) -> Option<&mut Function> {
        self.functions.get_mut(id.0 as usize)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Function> {
        self.functions.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::SymbolTable;

    #[test]
    fn test_signature_accepts() {
        let mut symbols = SymbolTable::new();
        let sig = Signature {
            num_fixed_parameters: 2,
            num_optional_parameters: 1,
            ..Signature::default()
        };
        assert!(sig.accepts(&ArgumentsDescriptor::positional(2)));
        assert!(sig.accepts(&ArgumentsDescriptor::positional(3)));
        assert!(!sig.accepts(&ArgumentsDescriptor::positional(1)));
        assert!(!sig.accepts(&ArgumentsDescriptor::positional(4)));

        let name = symbols.intern("x");
        let other = symbols.intern("y");
        let named = Signature {
            num_fixed_parameters: 1,
            named_parameters: vec![name],
            ..Signature::default()
        };
        assert!(named.accepts(&ArgumentsDescriptor::new(2, vec![name])));
        assert!(named.accepts(&ArgumentsDescriptor::positional(1)));
        assert!(!named.accepts(&ArgumentsDescriptor::new(2, vec![other])));
    }

    #[test]
    fn test_code_state() {
        let mut symbols = SymbolTable::new();
        let mut table = FunctionTable::new();
        let id = table.add(
            symbols.intern("f"),
            ClassId::OBJECT,
            FunctionKind::ImplicitGetter { field: 0 },
            Signature::fixed(1),
            false,
            true,
        );
        let f = table.get_mut(id).unwrap();
        assert!(!f.has_code());
        f.reattach_code(CodeId(1));
        assert!(!f.has_optimized_code());
        f.current_code = Some(CodeId(2));
        assert!(f.has_optimized_code());
        f.switch_to_unoptimized_code();
        assert_eq!(f.current_code, Some(CodeId(1)));
    }
}
