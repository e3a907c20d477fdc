//! Script modules and their exported functions.
//!
//! A [`Module`] owns one script's source and compiles and runs its top
//! level at most once, the first time an export is asked for. The outcome
//! is cached permanently, failures included: a module that failed to
//! compile keeps surfacing the identical error without ever recompiling.

use std::cell::RefCell;
use std::rc::Rc;

use crate::bridge::ScriptValue;
use crate::runtime::Interpreter;
use crate::types::{Fault, ScriptError, SyntaxDiagnostic, Validation};

/// Outcome of looking up an exported name.
///
/// Both misses are expected caller mistakes, not faults, and the two are
/// distinguishable: the name may be absent entirely, or bound to plain
/// data rather than a function.
pub enum FunctionLookup<R: Interpreter> {
    Found(ModuleFunction<R>),
    NotCallable,
    Missing,
}

impl<R: Interpreter> std::fmt::Debug for FunctionLookup<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FunctionLookup::Found(_) => f.write_str("Found(..)"),
            FunctionLookup::NotCallable => f.write_str("NotCallable"),
            FunctionLookup::Missing => f.write_str("Missing"),
        }
    }
}

impl<R: Interpreter> FunctionLookup<R> {
    pub fn found(self) -> Option<ModuleFunction<R>> {
        match self {
            FunctionLookup::Found(function) => Some(function),
            _ => None,
        }
    }
}

/// Extra context a host attaches to a function call, for diagnostics.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    /// Label of the document the call is rendered for, if any.
    pub page: Option<String>,
}

struct Exports<R: Interpreter> {
    /// String-keyed export table entries, in iteration order.
    entries: Vec<(String, R::Value)>,
    /// Names bound to callables, same order.
    function_names: Vec<String>,
}

enum InitState<R: Interpreter> {
    Uninitialized,
    /// Top-level evaluation is on the stack right now. Observing this
    /// means sandboxed code re-entered its own initialization (an import
    /// cycle through a host callable).
    Initializing,
    Initialized(Exports<R>),
    Failed(ScriptError),
}

/// One loaded script: canonical identity, source text, and the lazily
/// computed export table.
pub struct Module<R: Interpreter> {
    identity: String,
    source: String,
    runtime: Rc<R>,
    state: RefCell<InitState<R>>,
}

impl<R: Interpreter> Module<R> {
    pub(crate) fn new(
        identity: impl Into<String>,
        source: impl Into<String>,
        runtime: Rc<R>,
    ) -> Self {
        Self {
            identity: identity.into(),
            source: source.into(),
            runtime,
            state: RefCell::new(InitState::Uninitialized),
        }
    }

    /// The canonical key this module is cached and reported under.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Look up an exported name, initializing the module if needed.
    pub fn get_function(&self, name: &str) -> Result<FunctionLookup<R>, ScriptError> {
        self.with_exports(|exports| {
            match exports.entries.iter().find(|(entry, _)| entry == name) {
                Some((_, value)) if self.runtime.is_callable(value) => {
                    FunctionLookup::Found(ModuleFunction {
                        module: self.identity.clone(),
                        name: name.to_owned(),
                        callable: value.clone(),
                        runtime: Rc::clone(&self.runtime),
                    })
                }
                Some(_) => FunctionLookup::NotCallable,
                None => FunctionLookup::Missing,
            }
        })
    }

    /// The invocable export names, in export-table iteration order.
    pub fn function_names(&self) -> Result<Vec<String>, ScriptError> {
        self.with_exports(|exports| exports.function_names.clone())
    }

    /// The non-callable exports as host data, for host primitives that
    /// hand one module's data to another (import facilities). Callables
    /// stay inside the sandbox and are reachable via [`get_function`].
    ///
    /// [`get_function`]: Module::get_function
    pub fn exports(&self) -> Result<ScriptValue, ScriptError> {
        self.with_exports(|exports| {
            let mut data = Vec::new();
            for (name, value) in &exports.entries {
                if self.runtime.is_callable(value) {
                    continue;
                }
                let bridged = self
                    .runtime
                    .to_script_value(value)
                    .map_err(|fault| fault.into_error(&self.identity))?;
                data.push((name.clone(), bridged));
            }
            Ok(ScriptValue::Mapping(data))
        })?
    }

    /// Compile-check the source without executing it. Does not touch the
    /// initialization state; syntax problems come back as data.
    pub fn validate(&self) -> Result<Validation, ScriptError> {
        match self.runtime.compile(&self.source, &self.identity) {
            Ok(_) => Ok(Validation::Valid),
            Err(Fault::Syntax { message }) => {
                Ok(Validation::Invalid(vec![SyntaxDiagnostic::from_message(&message)]))
            }
            Err(fault) => Err(fault.into_error(&self.identity)),
        }
    }

    fn with_exports<T>(&self, f: impl FnOnce(&Exports<R>) -> T) -> Result<T, ScriptError> {
        self.initialize()?;
        match &*self.state.borrow() {
            InitState::Initialized(exports) => Ok(f(exports)),
            _ => Err(ScriptError::Runtime {
                module: self.identity.clone(),
                message: "module initialization state is inconsistent".to_owned(),
            }),
        }
    }

    /// One-shot lazy initialization. The Uninitialized → Initialized or
    /// Uninitialized → Failed transition happens at most once; afterwards
    /// the cached outcome is returned, re-raising a cached failure.
    fn initialize(&self) -> Result<(), ScriptError> {
        match &*self.state.borrow() {
            InitState::Initialized(_) => return Ok(()),
            InitState::Failed(error) => return Err(error.clone()),
            InitState::Initializing => {
                return Err(ScriptError::Runtime {
                    module: self.identity.clone(),
                    message: "module is already initializing (import cycle?)".to_owned(),
                });
            }
            InitState::Uninitialized => {}
        }

        *self.state.borrow_mut() = InitState::Initializing;
        match self.evaluate_top_level() {
            Ok(exports) => {
                *self.state.borrow_mut() = InitState::Initialized(exports);
                Ok(())
            }
            Err(error) => {
                tracing::warn!("module '{}' failed to initialize: {}", self.identity, error);
                *self.state.borrow_mut() = InitState::Failed(error.clone());
                Err(error)
            }
        }
    }

    /// Compile, run the top level once, and check the return contract:
    /// one or two values, the first a table of exports.
    fn evaluate_top_level(&self) -> Result<Exports<R>, ScriptError> {
        let chunk = self
            .runtime
            .compile(&self.source, &self.identity)
            .map_err(|fault| fault.into_error(&self.identity))?;
        let values = self
            .runtime
            .execute(&chunk)
            .map_err(|fault| fault.into_error(&self.identity))?;

        if values.is_empty() {
            return Err(ScriptError::NoReturn { module: self.identity.clone() });
        }
        if values.len() > 2 {
            return Err(ScriptError::TooManyReturns { module: self.identity.clone() });
        }
        let entries = self
            .runtime
            .mapping_entries(&values[0])
            .ok_or_else(|| ScriptError::NotATable { module: self.identity.clone() })?;

        let function_names = entries
            .iter()
            .filter(|(_, value)| self.runtime.is_callable(value))
            .map(|(name, _)| name.clone())
            .collect();
        Ok(Exports { entries, function_names })
    }
}

/// A callable handle bound to one exported entry point of a module.
///
/// Immutable once constructed and stateless between calls; whatever state
/// the sandbox retains internally belongs to the runtime.
pub struct ModuleFunction<R: Interpreter> {
    module: String,
    name: String,
    callable: R::Value,
    runtime: Rc<R>,
}

impl<R: Interpreter> ModuleFunction<R> {
    /// The export name this handle is bound to.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Identity of the module that exported this function.
    pub fn module(&self) -> &str {
        &self.module
    }

    /// Invoke the bound callable.
    ///
    /// Arguments are marshaled in, the first result is marshaled out, and
    /// any extra results are discarded. A call that produces no value
    /// yields `ScriptValue::Nil` (unlike the module-level no-return rule,
    /// which applies only to top-level evaluation). Faults come back as
    /// structured errors tagged with the module identity and, when the
    /// context names one, the requesting page.
    pub fn call(
        &self,
        args: Vec<ScriptValue>,
        ctx: &CallContext,
    ) -> Result<ScriptValue, ScriptError> {
        self.runtime.call(&self.callable, args).map_err(|fault| {
            let label = match &ctx.page {
                Some(page) => format!("{} (invoked from {})", self.module, page),
                None => self.module.clone(),
            };
            fault.into_error(&label)
        })
    }
}
