//! Sandboxed Lua module engine for document templating pipelines.
//!
//! A host rendering pipeline hands this crate user-authored scripts stored
//! as named modules; each module is evaluated inside a resource-bounded
//! Lua sandbox, and the functions it exports come back to the host as
//! callable templating primitives.
//!
//! # Overview
//!
//! The host implements [`SourceResolver`] to supply module source text.
//! An [`Engine`] lives for one rendering session: it constructs the
//! sandbox runtime lazily, caches each module by canonical identity, and
//! compiles and runs a module's top level at most once. A module's top
//! level must return a table of exports; the callable entries become
//! [`ModuleFunction`] handles the host invokes with [`ScriptValue`]
//! arguments.
//!
//! # Example
//!
//! ```rust
//! use luamod::{CallContext, LuaEngine, ResolvedSource, ResourceLimits};
//! use luamod::{ScriptValue, SourceResolver};
//!
//! struct Fixed;
//!
//! impl SourceResolver for Fixed {
//!     fn resolve(&self, identity: &str) -> Option<ResolvedSource> {
//!         (identity == "greet").then(|| ResolvedSource {
//!             source: "return { hello = function(name) return 'Hello, ' .. name end }"
//!                 .to_string(),
//!             canonical: "greet".to_string(),
//!         })
//!     }
//! }
//!
//! let engine = LuaEngine::new(ResourceLimits::restricted(), Box::new(Fixed));
//! let module = engine.fetch_module("greet").unwrap().expect("module exists");
//! let hello = module.get_function("hello").unwrap().found().expect("exported");
//!
//! let out = hello
//!     .call(vec![ScriptValue::from("Lua")], &CallContext::default())
//!     .unwrap();
//! assert_eq!(out, ScriptValue::String("Hello, Lua".into()));
//! ```
//!
//! # Errors and resource limits
//!
//! Every interpreter-level failure surfaces as a [`ScriptError`] carrying
//! the module identity: syntax errors, runtime faults, breaches of the
//! CPU/memory ceilings ([`ScriptError::LimitExceeded`]), and malformed
//! export contracts. Scripts can neither crash nor hang the host: the
//! memory ceiling is enforced by the VM allocator and the CPU ceiling by
//! an instruction-budget hook, both configured through
//! [`ResourceLimits`].
//!
//! # Security
//!
//! Sandboxed code gets the `table`, `string`, `utf8`, and `math`
//! libraries plus the base functions, and nothing else:
//! - no filesystem access (`io` removed)
//! - no process control (`os` removed)
//! - no module loading (`require`, `package` removed)
//! - no code loading (`load`, `loadfile`, `dofile` removed)
//! - no VM introspection (`debug` removed)
//! - no GC control (`collectgarbage` removed)
//!
//! Host capabilities are granted explicitly, one callable at a time, via
//! [`Engine::register_host_function`].

#![deny(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod bridge;
pub mod engine;
pub mod module;
pub mod runtime;
pub mod types;

pub use bridge::{HostFunction, ScriptValue};
pub use engine::{Engine, LuaEngine, ResolvedSource, SourceResolver};
pub use module::{CallContext, FunctionLookup, Module, ModuleFunction};
pub use runtime::{Interpreter, LuaRuntime};
pub use types::{
    Fault, LimitKind, ResourceLimits, ResourceUsage, ScriptError, SyntaxDiagnostic, Validation,
};
