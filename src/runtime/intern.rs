//! Symbol interning for selectors, class names and field names
//!
//! Selectors are compared on every IC lookup, so they are interned once and
//! compared as integers afterwards.

use string_interner::{DefaultStringInterner, DefaultSymbol};

/// Interned string handle
pub type Symbol = DefaultSymbol;

/// Prefix the language uses for getter selectors
pub const GETTER_PREFIX: &str = "get:";

/// Per-isolate symbol table with pre-seeded well-known names
pub struct SymbolTable {
    interner: DefaultStringInterner,
    /// `call`, the selector invoked on callable objects
    pub call: Symbol,
    /// `noSuchMethod`, the fallback handler selector
    pub no_such_method: Symbol,
    /// The empty name
    pub empty: Symbol,
}

impl SymbolTable {
    /// Create a table with the well-known names interned
    pub fn new() -> Self {
        let mut interner = DefaultStringInterner::new();
        let call = interner.get_or_intern("call");
        let no_such_method = interner.get_or_intern("noSuchMethod");
        let empty = interner.get_or_intern("");
        Self {
            interner,
            call,
            no_such_method,
            empty,
        }
    }

    /// Intern a string, returning its symbol
    #[inline]
    pub fn intern(&mut self, s: &str) -> Symbol {
        self.interner.get_or_intern(s)
    }

    /// Get the symbol for a string if it's already interned
    #[inline]
    pub fn get(&self, s: &str) -> Option<Symbol> {
        self.interner.get(s)
    }

    /// Resolve a symbol; unknown symbols resolve to the empty string
    #[inline]
    pub fn resolve(&self, symbol: Symbol) -> &str {
        self.interner.resolve(symbol).unwrap_or("")
    }

    /// Symbol of the getter for `name` (`get:name`)
    pub fn getter_name(&mut self, name: Symbol) -> Symbol {
        let getter = format!("{}{}", GETTER_PREFIX, self.resolve(name));
        self.intern(&getter)
    }

    /// Field name behind a getter selector, if `selector` is one
    pub fn field_name_of_getter<'a>(&'a self, selector: Symbol) -> Option<&'a str> {
        self.resolve(selector).strip_prefix(GETTER_PREFIX)
    }

    /// Number of interned strings
    pub fn len(&self) -> usize {
        self.interner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interner.is_empty()
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}
