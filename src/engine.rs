//! Per-session engine owning the sandbox runtime and module cache.
//!
//! One [`Engine`] serves one rendering session. It constructs the sandbox
//! runtime lazily on the first operation that needs it, keeps exactly one
//! for its whole lifetime, and caches modules by canonical identity so a
//! script compiles and runs its top level at most once per session.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::bridge::HostFunction;
use crate::module::Module;
use crate::runtime::{Interpreter, LuaRuntime};
use crate::types::{Fault, ResourceLimits, ResourceUsage, ScriptError, Validation};

/// Source text together with the canonical identity it resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSource {
    pub source: String,
    /// Stable cache key and diagnostic label for this content.
    pub canonical: String,
}

/// The host's module fetch mechanism.
///
/// `None` means the identity does not name any module; that is an expected
/// outcome the host handles, not a failure.
pub trait SourceResolver {
    fn resolve(&self, identity: &str) -> Option<ResolvedSource>;
}

/// Coordinator for one rendering session.
///
/// Generic over the execution backend; [`LuaEngine`] is the Lua-backed
/// engine hosts use.
pub struct Engine<R: Interpreter = LuaRuntime> {
    limits: RefCell<ResourceLimits>,
    page: RefCell<Option<String>>,
    resolver: Box<dyn SourceResolver>,
    runtime: RefCell<Option<Rc<R>>>,
    host_functions: RefCell<Vec<(String, String, HostFunction)>>,
    modules: RefCell<HashMap<String, Rc<Module<R>>>>,
}

/// Engine backed by the sandboxed Lua runtime.
pub type LuaEngine = Engine<LuaRuntime>;

impl<R: Interpreter> Engine<R> {
    pub fn new(limits: ResourceLimits, resolver: Box<dyn SourceResolver>) -> Self {
        Self {
            limits: RefCell::new(limits),
            page: RefCell::new(None),
            resolver,
            runtime: RefCell::new(None),
            host_functions: RefCell::new(Vec::new()),
            modules: RefCell::new(HashMap::new()),
        }
    }

    /// Label of the document currently being rendered, if the host set
    /// one. Used in diagnostics only.
    pub fn page(&self) -> Option<String> {
        self.page.borrow().clone()
    }

    pub fn set_page(&self, page: impl Into<String>) {
        *self.page.borrow_mut() = Some(page.into());
    }

    /// Number of modules cached so far.
    pub fn module_count(&self) -> usize {
        self.modules.borrow().len()
    }

    /// Resolve an identity through the host and return its module.
    ///
    /// `Ok(None)` when the identity names nothing. The cache is keyed by
    /// canonical identity for the lifetime of the engine: a second fetch
    /// of the same identity returns the cached module even if the resolver
    /// would now hand back different source text.
    pub fn fetch_module(&self, identity: &str) -> Result<Option<Rc<Module<R>>>, ScriptError> {
        let Some(resolved) = self.resolver.resolve(identity) else {
            return Ok(None);
        };

        if let Some(module) = self.modules.borrow().get(&resolved.canonical) {
            return Ok(Some(Rc::clone(module)));
        }

        tracing::debug!("loading module '{}'", resolved.canonical);
        let runtime = self.runtime()?;
        let module = Rc::new(Module::new(resolved.canonical.clone(), resolved.source, runtime));
        self.modules.borrow_mut().insert(resolved.canonical, Rc::clone(&module));
        Ok(Some(module))
    }

    /// Compile-check source under a diagnostic label, bypassing both the
    /// resolver and the module cache. The throwaway module is discarded.
    pub fn validate(&self, source: &str, label: &str) -> Result<Validation, ScriptError> {
        let runtime = self.runtime()?;
        Module::new(label, source, runtime).validate()
    }

    /// Make a host callable visible to sandboxed code as
    /// `namespace.name(...)`.
    ///
    /// Registrations made before the runtime exists are queued and applied
    /// when it is constructed.
    pub fn register_host_function(
        &self,
        namespace: &str,
        name: &str,
        function: HostFunction,
    ) -> Result<(), ScriptError> {
        self.host_functions.borrow_mut().push((
            namespace.to_owned(),
            name.to_owned(),
            function.clone(),
        ));
        let runtime = self.runtime.borrow().clone();
        if let Some(runtime) = runtime {
            runtime
                .register_host_functions(namespace, &[(name.to_owned(), function)])
                .map_err(|fault| self.configuration_error(&fault))?;
        }
        Ok(())
    }

    /// Replace the limit configuration, pushing it to the runtime if one
    /// is already running.
    pub fn set_limits(&self, limits: ResourceLimits) -> Result<(), ScriptError> {
        *self.limits.borrow_mut() = limits;
        let runtime = self.runtime.borrow().clone();
        if let Some(runtime) = runtime {
            runtime.apply_limits(&limits).map_err(|fault| self.configuration_error(&fault))?;
        }
        Ok(())
    }

    pub fn limits(&self) -> ResourceLimits {
        *self.limits.borrow()
    }

    /// Resources consumed by the session's scripts so far.
    pub fn usage(&self) -> Result<ResourceUsage, ScriptError> {
        Ok(self.runtime()?.usage())
    }

    /// One human-readable line summarizing script memory consumption.
    pub fn usage_report(&self) -> Result<String, ScriptError> {
        let usage = self.usage()?;
        Ok(format!("Script memory usage: {}\n", format_memory(usage.memory_bytes)))
    }

    /// The session runtime, constructed on first use and shared by every
    /// module afterwards. Construction failure is fatal to the session.
    fn runtime(&self) -> Result<Rc<R>, ScriptError> {
        if let Some(runtime) = &*self.runtime.borrow() {
            return Ok(Rc::clone(runtime));
        }

        let limits = *self.limits.borrow();
        let runtime =
            R::initialize(&limits).map_err(|fault| self.configuration_error(&fault))?;
        for (namespace, name, function) in self.host_functions.borrow().iter() {
            runtime
                .register_host_functions(namespace, &[(name.clone(), function.clone())])
                .map_err(|fault| self.configuration_error(&fault))?;
        }
        tracing::debug!("sandbox runtime constructed");

        let runtime = Rc::new(runtime);
        *self.runtime.borrow_mut() = Some(Rc::clone(&runtime));
        Ok(runtime)
    }

    fn configuration_error(&self, fault: &Fault) -> ScriptError {
        let message = match &*self.page.borrow() {
            Some(page) => format!("{fault} (while rendering {page})"),
            None => fault.to_string(),
        };
        ScriptError::Configuration { message }
    }
}

/// Render a byte count the way the limits report wants it: raw bytes up
/// to 8192, then kilobytes below 8 MiB, then megabytes, fractions to two
/// decimal places.
fn format_memory(bytes: usize) -> String {
    if bytes < 8 * 1024 {
        format!("{bytes} bytes")
    } else if bytes < 8 * 1024 * 1024 {
        format!("{:.2} kilobytes", bytes as f64 / 1024.0)
    } else {
        format!("{:.2} megabytes", bytes as f64 / (1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, "0 bytes")]
    #[case(500, "500 bytes")]
    #[case(8191, "8191 bytes")]
    #[case(8192, "8.00 kilobytes")]
    #[case(100_000, "97.66 kilobytes")]
    #[case(8 * 1024 * 1024 - 1, "8192.00 kilobytes")]
    #[case(8 * 1024 * 1024, "8.00 megabytes")]
    #[case(50_000_000, "47.68 megabytes")]
    fn memory_formatting(#[case] bytes: usize, #[case] expected: &str) {
        assert_eq!(format_memory(bytes), expected);
    }
}
