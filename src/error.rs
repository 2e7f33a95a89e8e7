//! Error types for the jitrt runtime layer

use std::fmt;
use thiserror::Error;

use crate::gc::{HeapExhausted, ObjectId};
use crate::runtime::Value;

/// Source position of the generated-code caller that raised an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceLocation {
    /// Token position in the caller's script, `None` when no Dart-level
    /// frame could be found
    pub token_pos: Option<usize>,
}

impl SourceLocation {
    /// Location with a known token position
    pub fn at(token_pos: usize) -> Self {
        Self {
            token_pos: Some(token_pos),
        }
    }

    /// Location used when no caller frame maps to source
    pub fn unknown() -> Self {
        Self { token_pos: None }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.token_pos {
            Some(pos) => write!(f, "@{}", pos),
            None => write!(f, "@<unknown>"),
        }
    }
}

/// A generic type argument violates the bound declared by its type parameter.
///
/// Instantiation reports this instead of failing outright; runtime entries
/// decide whether it becomes a [`Error::DynamicType`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("type argument '{argument}' does not extend bound '{bound}' of '{parameter}'")]
pub struct BoundError {
    pub argument: String,
    pub bound: String,
    pub parameter: String,
}

/// Conditions that stop the isolate instead of being thrown to managed code
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FatalError {
    /// An allocation failed while materializing deferred deopt values
    #[error("allocation failed during deoptimization materialization: {0}")]
    MaterializationFailed(String),

    /// The embedder interrupt callback declined to continue; unwinding the
    /// managed stack from an interrupt check is not implemented
    #[error("interrupt callback declined to continue and stack unwinding is not implemented")]
    InterruptUnwindUnimplemented,

    /// `stop_on_excessive_deoptimization` is set and a function hit the ceiling
    #[error("stop on excessive deoptimization: {function}")]
    ExcessiveDeoptimization { function: String },

    /// Deoptimization could not rebuild the baseline frames
    #[error("deoptimization failed: {0}")]
    DeoptimizationFailed(String),
}

/// Main error type for jitrt
#[derive(Error, Debug)]
pub enum Error {
    /// Failed `instanceof`/assignment check, or a bound violation observed
    /// while instantiating a type in checked code
    #[error("TypeError{location}: {}", dynamic_type_message(src_type, dst_type, dst_name, bound_error.as_deref()))]
    DynamicType {
        location: SourceLocation,
        src_type: String,
        dst_type: String,
        dst_name: String,
        bound_error: Option<String>,
    },

    /// Raised by the default `noSuchMethod` handler
    #[error("NoSuchMethodError: Class '{receiver}' has no instance method '{selector}' with matching arguments ({arguments} passed)")]
    NoSuchMethod {
        receiver: String,
        selector: String,
        arguments: usize,
    },

    /// The execution stack exceeded its limit at an interrupt check
    #[error("StackOverflow: {}", messages::MAXIMUM_CALL_STACK)]
    StackOverflow {
        /// The preallocated exception object
        exception: ObjectId,
    },

    /// Compiling a resolved target failed
    #[error("CompilationError: {function}: {message}")]
    Compilation { function: String, message: String },

    /// A language-level exception thrown by invoked code
    #[error("Unhandled exception: {0:?}")]
    Thrown(Value),

    /// The managed heap refused an allocation
    #[error("OutOfMemory: {source}")]
    OutOfMemory {
        #[from]
        source: HeapExhausted,
    },

    /// Unrecoverable runtime condition; the isolate is terminated
    #[error("Fatal: {0}")]
    Fatal(#[from] FatalError),

    /// Runtime-internal invariant violation
    #[error("InternalError: {0}")]
    Internal(String),
}

fn dynamic_type_message(
    src_type: &str,
    dst_type: &str,
    dst_name: &str,
    bound_error: Option<&str>,
) -> String {
    let mut message = if src_type.is_empty() && dst_type.is_empty() {
        String::from("malbounded type")
    } else {
        format!(
            "type '{}' is not a subtype of type '{}' of '{}'",
            src_type, dst_type, dst_name
        )
    };
    if let Some(bound) = bound_error {
        message.push_str(": ");
        message.push_str(bound);
    }
    message
}

impl Error {
    /// Dynamic type error for a failed check with a known source and destination
    pub fn dynamic_type(
        location: SourceLocation,
        src_type: impl Into<String>,
        dst_type: impl Into<String>,
        dst_name: impl Into<String>,
        bound_error: Option<&BoundError>,
    ) -> Self {
        Error::DynamicType {
            location,
            src_type: src_type.into(),
            dst_type: dst_type.into(),
            dst_name: dst_name.into(),
            bound_error: bound_error.map(|e| e.to_string()),
        }
    }

    /// Dynamic type error raised from a bound violation when no names are
    /// available at the caller
    pub fn from_bound_error(location: SourceLocation, bound_error: &BoundError) -> Self {
        Self::dynamic_type(location, "", "", "", Some(bound_error))
    }

    /// Create a compilation error
    pub fn compilation(function: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Compilation {
            function: function.into(),
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal(message.into())
    }

    /// Whether this error terminates the isolate
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal(_))
    }
}

/// Result type alias for jitrt
pub type Result<T> = std::result::Result<T, Error>;

/// Standardized error message templates
pub mod messages {
    pub const MAXIMUM_CALL_STACK: &str = "Maximum call stack size exceeded";
    pub const NO_SUCH_FUNCTION: &str = "no such function";
    pub const NO_SUCH_CLASS: &str = "no such class";
    pub const NO_SUCH_CODE: &str = "no such code object";
    pub const NO_SUCH_OBJECT: &str = "no such heap object";
    pub const NO_DART_FRAME: &str = "no Dart frame on the stack";

    /// Format a "X not found: id" message for a dangling runtime handle
    pub fn dangling(what: &str, id: impl std::fmt::Debug) -> String {
        format!("{}: {:?}", what, id)
    }

    /// Format a "expected optimized code" message
    pub fn expected_optimized(function: &str) -> String {
        format!("expected optimized code for '{}'", function)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dynamic_type_message_with_names() {
        let err = Error::dynamic_type(SourceLocation::at(12), "int", "String", "s", None);
        assert_eq!(
            err.to_string(),
            "TypeError@12: type 'int' is not a subtype of type 'String' of 's'"
        );
    }

    #[test]
    fn test_bound_error_without_names() {
        let bound = BoundError {
            argument: "Object".into(),
            bound: "num".into(),
            parameter: "T".into(),
        };
        let err = Error::from_bound_error(SourceLocation::unknown(), &bound);
        let text = err.to_string();
        assert!(text.starts_with("TypeError@<unknown>: malbounded type"));
        assert!(text.contains("does not extend bound 'num'"));
    }

    #[test]
    fn test_fatal_classification() {
        let err: Error = FatalError::InterruptUnwindUnimplemented.into();
        assert!(err.is_fatal());
        assert!(!Error::internal("x").is_fatal());
    }
}
