//! jitrt: runtime entry points for a JIT-compiled dynamic language
//!
//! Generated code calls into this layer whenever it cannot finish an
//! operation on its own: an inline cache misses, a type test is not in the
//! subtype test cache, a usage counter crosses its threshold, an interrupt
//! check fires, or a speculative assumption in optimized code fails.
//!
//! # Quick Start
//!
//! ```no_run
//! use jitrt::dispatch::{invoke_instance_call, ArgumentsDescriptor, InstanceCallSite};
//! use jitrt::jit::BaselineCompiler;
//! use jitrt::runtime::{ClassId, FunctionDecl, Isolate, Value};
//! use jitrt::RuntimeFlags;
//!
//! fn main() -> jitrt::Result<()> {
//!     let mut isolate = Isolate::new(RuntimeFlags::default(), BaselineCompiler);
//!     isolate.define_function(FunctionDecl::method(ClassId::OBJECT, "hello", 0, |_, _| Ok(Value::Smi(1))))?;
//!     let name = isolate.intern("hello");
//!     let mut site = InstanceCallSite::new(name, ArgumentsDescriptor::positional(1), 1);
//!     let result = invoke_instance_call(&mut isolate, &mut site, &[Value::Smi(3)])?;
//!     println!("Result: {:?}", result);
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! | Category | Modules |
//! |----------|---------|
//! | **State** | [`runtime`], [`gc`] |
//! | **Types** | [`types`] |
//! | **Calls** | [`dispatch`] |
//! | **Tiering** | [`jit`], [`deopt`] |
//! | **Ambient** | [`config`], [`diagnostics`], [`error`](Error) |

// The deopt context is built from the whole captured frame state.
#![allow(clippy::too_many_arguments)]

pub mod config;
pub mod deopt;
pub mod diagnostics;
pub mod dispatch;
pub mod error;
pub mod gc;
pub mod jit;
pub mod runtime;
pub mod types;

pub use config::{RuntimeFlags, TraceFlags};
pub use error::{BoundError, Error, FatalError, Result, SourceLocation};
pub use runtime::{Isolate, Value};
