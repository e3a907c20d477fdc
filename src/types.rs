//! Error taxonomy, resource limits, and diagnostic types.

use std::fmt;

use regex::Regex;
use serde::Serialize;
use thiserror::Error;

/// Which resource ceiling a script ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LimitKind {
    /// The CPU budget (counted in VM instructions).
    Cpu,
    /// The memory ceiling.
    Memory,
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitKind::Cpu => write!(f, "CPU"),
            LimitKind::Memory => write!(f, "memory"),
        }
    }
}

/// Host-facing script failures.
///
/// Every variant carries the identity of the module it arose in (except
/// `Configuration`, which precedes any module), so the host can render a
/// readable diagnostic. Absence of a module or function is *not* an error
/// and is expressed through `Option` / [`FunctionLookup`] variants instead.
///
/// [`FunctionLookup`]: crate::module::FunctionLookup
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScriptError {
    /// The sandbox runtime could not be constructed or configured.
    /// Fatal to the rendering session; never retried.
    #[error("script runtime unavailable: {message}")]
    Configuration { message: String },

    /// The module source failed to compile.
    #[error("syntax error in module '{module}': {message}")]
    Syntax { module: String, message: String },

    /// A fault was raised during top-level evaluation or a function call.
    #[error("runtime error in module '{module}': {message}")]
    Runtime { module: String, message: String },

    /// A resource ceiling was breached while executing the module.
    #[error("{resource} limit exceeded in module '{module}'")]
    LimitExceeded { module: String, resource: LimitKind },

    /// The module's top-level evaluation produced no value.
    #[error("module '{module}' did not return a value")]
    NoReturn { module: String },

    /// The module's top-level evaluation produced more than two values.
    #[error("module '{module}' returned more than two values")]
    TooManyReturns { module: String },

    /// The first value returned by the module is not a table of exports.
    #[error("module '{module}' did not return a table of exports")]
    NotATable { module: String },
}

/// Interpreter-level faults, before a module identity is attached.
///
/// The runtime layer reports these; [`Module`] and [`ModuleFunction`] map
/// them into [`ScriptError`] with the owning module's identity.
///
/// [`Module`]: crate::module::Module
/// [`ModuleFunction`]: crate::module::ModuleFunction
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Fault {
    #[error("syntax error: {message}")]
    Syntax { message: String },

    #[error("{message}")]
    Runtime { message: String },

    #[error("instruction budget exhausted")]
    CpuExceeded,

    #[error("memory limit exceeded")]
    MemoryExceeded,
}

impl Fault {
    /// Attach the identity of the module this fault arose in.
    pub fn into_error(self, module: &str) -> ScriptError {
        match self {
            Fault::Syntax { message } => ScriptError::Syntax { module: module.to_owned(), message },
            Fault::Runtime { message } => {
                ScriptError::Runtime { module: module.to_owned(), message }
            }
            Fault::CpuExceeded => ScriptError::LimitExceeded {
                module: module.to_owned(),
                resource: LimitKind::Cpu,
            },
            Fault::MemoryExceeded => ScriptError::LimitExceeded {
                module: module.to_owned(),
                resource: LimitKind::Memory,
            },
        }
    }
}

/// Resource ceilings applied to a sandbox runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Maximum memory the VM can allocate (in bytes). 0 = unlimited.
    pub memory_bytes: usize,

    /// CPU budget in VM instructions, cumulative over the session.
    /// 0 = unlimited.
    pub instruction_budget: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self::restricted()
    }
}

impl ResourceLimits {
    /// A restrictive configuration suitable for user scripts.
    pub fn restricted() -> Self {
        Self {
            memory_bytes: 50 * 1024 * 1024, // 50 MB
            instruction_budget: 10_000_000,
        }
    }

    /// An unrestricted configuration (use with caution).
    pub fn unrestricted() -> Self {
        Self { memory_bytes: 0, instruction_budget: 0 }
    }
}

/// Resource consumption accumulated by a sandbox runtime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResourceUsage {
    /// Memory currently held by the VM, in bytes.
    pub memory_bytes: usize,

    /// VM instructions executed so far.
    pub instructions: u64,
}

/// One syntax problem reported by the compiler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyntaxDiagnostic {
    /// Source line the compiler pointed at, when it named one.
    pub line: Option<u32>,
    pub message: String,
}

impl SyntaxDiagnostic {
    /// Split an interpreter message of the form `label:LINE: text` into a
    /// line number and the bare message. Messages in any other shape are
    /// kept whole with no line.
    pub fn from_message(message: &str) -> Self {
        let re = Regex::new(r":(\d+):\s*(.+)").expect("valid regex");
        match re.captures(message) {
            Some(caps) => SyntaxDiagnostic {
                line: caps.get(1).and_then(|m| m.as_str().parse().ok()),
                message: caps
                    .get(2)
                    .map_or_else(|| message.to_owned(), |m| m.as_str().to_owned()),
            },
            None => SyntaxDiagnostic { line: None, message: message.to_owned() },
        }
    }
}

/// Result of compile-checking a piece of source without executing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Validation {
    Valid,
    /// Non-empty by construction.
    Invalid(Vec<SyntaxDiagnostic>),
}

impl Validation {
    pub fn is_valid(&self) -> bool {
        matches!(self, Validation::Valid)
    }

    pub fn diagnostics(&self) -> &[SyntaxDiagnostic] {
        match self {
            Validation::Valid => &[],
            Validation::Invalid(diagnostics) => diagnostics,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostic_extracts_line_and_message() {
        let diag =
            SyntaxDiagnostic::from_message(r#"[string "bad"]:3: unexpected symbol near '<eof>'"#);
        assert_eq!(diag.line, Some(3));
        assert_eq!(diag.message, "unexpected symbol near '<eof>'");
    }

    #[test]
    fn diagnostic_keeps_unrecognized_message_whole() {
        let diag = SyntaxDiagnostic::from_message("truncated chunk");
        assert_eq!(diag.line, None);
        assert_eq!(diag.message, "truncated chunk");
    }

    #[test]
    fn fault_maps_to_error_with_module_identity() {
        let err = Fault::CpuExceeded.into_error("Module:Infobox");
        assert_eq!(
            err,
            ScriptError::LimitExceeded {
                module: "Module:Infobox".into(),
                resource: LimitKind::Cpu
            }
        );
        assert!(err.to_string().contains("Module:Infobox"));
    }

    #[test]
    fn restricted_limits_are_bounded() {
        let limits = ResourceLimits::restricted();
        assert!(limits.memory_bytes > 0);
        assert!(limits.instruction_budget > 0);
        assert_eq!(ResourceLimits::default(), limits);
    }

    #[test]
    fn unrestricted_limits_disable_ceilings() {
        let limits = ResourceLimits::unrestricted();
        assert_eq!(limits.memory_bytes, 0);
        assert_eq!(limits.instruction_budget, 0);
    }

    #[test]
    fn validation_accessors() {
        assert!(Validation::Valid.is_valid());
        assert!(Validation::Valid.diagnostics().is_empty());

        let invalid =
            Validation::Invalid(vec![SyntaxDiagnostic { line: Some(1), message: "bad".into() }]);
        assert!(!invalid.is_valid());
        assert_eq!(invalid.diagnostics().len(), 1);
    }
}
