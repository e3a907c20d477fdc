//! Interpreter abstraction and the mlua-backed sandbox runtime.
//!
//! [`Interpreter`] is the narrow contract the engine needs from an
//! execution backend: compile a chunk under a diagnostic label, run it,
//! interrogate the values it produced, invoke callables, and account for
//! resources. [`LuaRuntime`] is the Lua implementation; tests substitute
//! doubles behind the same trait.

use std::cell::Cell;
use std::rc::Rc;

use mlua::{Lua, LuaOptions, MultiValue, StdLib, Value, VmState};

use crate::bridge::{HostFunction, ScriptValue, value_from_lua, value_to_lua, wrap_host_function};
use crate::types::{Fault, ResourceLimits, ResourceUsage};

/// VM instructions executed between budget checks.
const INSTRUCTION_CHECK_INTERVAL: u32 = 1000;

/// Execution backend contract.
///
/// All fallible operations report [`Fault`]s; the module and function
/// layers attach module identities and map them into the host-facing
/// taxonomy.
pub trait Interpreter: Sized {
    /// A compiled, not-yet-executed script unit.
    type Chunk;
    /// A sandbox-side value handle.
    type Value: Clone;

    /// Construct the backend and apply the given limits.
    fn initialize(limits: &ResourceLimits) -> Result<Self, Fault>;

    /// Push a changed limit configuration to the running backend.
    fn apply_limits(&self, limits: &ResourceLimits) -> Result<(), Fault>;

    /// Make host callables visible to sandboxed code as
    /// `namespace.name(...)`.
    fn register_host_functions(
        &self,
        namespace: &str,
        entries: &[(String, HostFunction)],
    ) -> Result<(), Fault>;

    /// Compile source into a chunk, tagged with `label` for diagnostics.
    fn compile(&self, source: &str, label: &str) -> Result<Self::Chunk, Fault>;

    /// Run a chunk's top level and collect every value it returned.
    fn execute(&self, chunk: &Self::Chunk) -> Result<Vec<Self::Value>, Fault>;

    /// The string-keyed entries of a table value, in iteration order.
    /// `None` if the value is not a table.
    fn mapping_entries(&self, value: &Self::Value) -> Option<Vec<(String, Self::Value)>>;

    /// Whether the value can be invoked.
    fn is_callable(&self, value: &Self::Value) -> bool;

    /// Invoke a callable with marshaled arguments and return its first
    /// result, or `ScriptValue::Nil` if it returned nothing.
    fn call(&self, callable: &Self::Value, args: Vec<ScriptValue>) -> Result<ScriptValue, Fault>;

    /// A sandbox value as host data. Faults for values that cannot leave
    /// the sandbox.
    fn to_script_value(&self, value: &Self::Value) -> Result<ScriptValue, Fault>;

    /// Resources consumed so far.
    fn usage(&self) -> ResourceUsage;
}

/// Sandboxed Lua execution backend.
///
/// The standard library is restricted to `table`, `string`, `utf8`, and
/// `math` (base functions are always present), and dangerous globals are
/// removed before any user code runs. The memory ceiling is enforced by
/// the allocator; the CPU ceiling is a cumulative instruction budget
/// enforced by a VM hook.
pub struct LuaRuntime {
    lua: Lua,
    instructions: Rc<Cell<u64>>,
    budget_tripped: Rc<Cell<bool>>,
}

impl LuaRuntime {
    /// Remove globals that would let scripts escape the sandbox:
    /// arbitrary code loading, filesystem access, process control, module
    /// loading, VM introspection, and GC control.
    fn strip_globals(lua: &Lua) -> mlua::Result<()> {
        let dangerous = [
            "dofile",
            "loadfile",
            "load",
            "require",
            "package",
            "io",
            "os",
            "debug",
            "collectgarbage",
        ];
        let globals = lua.globals();
        for name in dangerous {
            globals.set(name, Value::Nil)?;
        }
        Ok(())
    }

    /// Map an mlua error into a fault, consulting the budget flag so a
    /// hook-initiated abort reads as a CPU fault rather than a script
    /// error.
    fn translate(&self, err: &mlua::Error) -> Fault {
        if self.budget_tripped.get() {
            return Fault::CpuExceeded;
        }
        fault_from_lua(err)
    }
}

fn fault_from_lua(err: &mlua::Error) -> Fault {
    match err {
        mlua::Error::SyntaxError { message, .. } => Fault::Syntax { message: message.clone() },
        mlua::Error::MemoryError(_) => Fault::MemoryExceeded,
        mlua::Error::CallbackError { cause, .. } => fault_from_lua(cause),
        other => Fault::Runtime { message: other.to_string() },
    }
}

impl Interpreter for LuaRuntime {
    type Chunk = mlua::Function;
    type Value = Value;

    fn initialize(limits: &ResourceLimits) -> Result<Self, Fault> {
        let libs = StdLib::TABLE | StdLib::STRING | StdLib::UTF8 | StdLib::MATH;
        let lua = Lua::new_with(libs, LuaOptions::default())
            .map_err(|e| Fault::Runtime { message: e.to_string() })?;
        Self::strip_globals(&lua).map_err(|e| Fault::Runtime { message: e.to_string() })?;

        let runtime = Self {
            lua,
            instructions: Rc::new(Cell::new(0)),
            budget_tripped: Rc::new(Cell::new(false)),
        };
        runtime.apply_limits(limits)?;
        Ok(runtime)
    }

    fn apply_limits(&self, limits: &ResourceLimits) -> Result<(), Fault> {
        self.lua
            .set_memory_limit(limits.memory_bytes)
            .map_err(|e| Fault::Runtime { message: e.to_string() })?;

        if limits.instruction_budget > 0 {
            let budget = limits.instruction_budget;
            let instructions = Rc::clone(&self.instructions);
            let tripped = Rc::clone(&self.budget_tripped);
            self.lua.set_hook(
                mlua::HookTriggers::new().every_nth_instruction(INSTRUCTION_CHECK_INTERVAL),
                move |_, _| {
                    instructions.set(instructions.get() + u64::from(INSTRUCTION_CHECK_INTERVAL));
                    if instructions.get() > budget {
                        tripped.set(true);
                        return Err(mlua::Error::runtime("instruction budget exhausted"));
                    }
                    Ok(VmState::Continue)
                },
            );
        } else {
            self.lua.remove_hook();
        }
        Ok(())
    }

    fn register_host_functions(
        &self,
        namespace: &str,
        entries: &[(String, HostFunction)],
    ) -> Result<(), Fault> {
        let registered: mlua::Result<()> = (|| {
            let globals = self.lua.globals();
            let table = match globals.get::<Option<mlua::Table>>(namespace)? {
                Some(table) => table,
                None => {
                    let table = self.lua.create_table()?;
                    globals.set(namespace, table.clone())?;
                    table
                }
            };
            for (name, func) in entries {
                table.set(name.as_str(), wrap_host_function(&self.lua, func)?)?;
            }
            Ok(())
        })();
        registered.map_err(|e| fault_from_lua(&e))
    }

    fn compile(&self, source: &str, label: &str) -> Result<Self::Chunk, Fault> {
        self.lua
            .load(source)
            .set_name(label)
            .into_function()
            .map_err(|e| self.translate(&e))
    }

    fn execute(&self, chunk: &Self::Chunk) -> Result<Vec<Value>, Fault> {
        self.budget_tripped.set(false);
        let values =
            chunk.call::<MultiValue>(()).map_err(|e| self.translate(&e))?;
        Ok(values.into_iter().collect())
    }

    fn mapping_entries(&self, value: &Value) -> Option<Vec<(String, Value)>> {
        let Value::Table(table) = value else {
            return None;
        };
        let mut entries = Vec::new();
        for pair in table.clone().pairs::<Value, Value>() {
            let Ok((key, item)) = pair else {
                continue;
            };
            if let Value::String(name) = key {
                if let Ok(name) = name.to_str() {
                    entries.push((name.to_string(), item));
                }
            }
        }
        Some(entries)
    }

    fn is_callable(&self, value: &Value) -> bool {
        matches!(value, Value::Function(_))
    }

    fn call(&self, callable: &Value, args: Vec<ScriptValue>) -> Result<ScriptValue, Fault> {
        let Value::Function(func) = callable else {
            return Err(Fault::Runtime { message: "value is not callable".to_owned() });
        };
        self.budget_tripped.set(false);

        let mut lua_args = Vec::with_capacity(args.len());
        for arg in &args {
            lua_args.push(value_to_lua(&self.lua, arg).map_err(|e| self.translate(&e))?);
        }
        let results = func
            .call::<MultiValue>(MultiValue::from_iter(lua_args))
            .map_err(|e| self.translate(&e))?;

        // Only the first result is part of the contract; none at all is an
        // explicit nil, not an error.
        match results.into_iter().next() {
            Some(value) => value_from_lua(value, 0),
            None => Ok(ScriptValue::Nil),
        }
    }

    fn to_script_value(&self, value: &Value) -> Result<ScriptValue, Fault> {
        value_from_lua(value.clone(), 0)
    }

    fn usage(&self) -> ResourceUsage {
        ResourceUsage {
            memory_bytes: self.lua.used_memory(),
            instructions: self.instructions.get(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::HostFunction;

    fn runtime() -> LuaRuntime {
        LuaRuntime::initialize(&ResourceLimits::restricted()).unwrap()
    }

    fn eval(rt: &LuaRuntime, source: &str) -> Vec<Value> {
        let chunk = rt.compile(source, "test").unwrap();
        rt.execute(&chunk).unwrap()
    }

    #[test]
    fn scalars_cross_the_boundary() {
        let rt = runtime();
        let values = eval(&rt, "return nil, true, 7, 0.5, 'hi'");
        let bridged: Vec<ScriptValue> =
            values.iter().map(|v| rt.to_script_value(v).unwrap()).collect();
        assert_eq!(
            bridged,
            vec![
                ScriptValue::Nil,
                ScriptValue::Boolean(true),
                ScriptValue::Integer(7),
                ScriptValue::Number(0.5),
                ScriptValue::String("hi".into()),
            ]
        );
    }

    #[test]
    fn consecutive_integer_keys_make_a_sequence() {
        let rt = runtime();
        let values = eval(&rt, "return {1, 2, 'a'}");
        assert_eq!(
            rt.to_script_value(&values[0]).unwrap(),
            ScriptValue::Sequence(vec![
                ScriptValue::Integer(1),
                ScriptValue::Integer(2),
                ScriptValue::String("a".into()),
            ])
        );
    }

    #[test]
    fn mixed_keys_make_a_mapping_with_stringified_integers() {
        let rt = runtime();
        let values = eval(&rt, "return { [1] = 'a', x = 'b' }");
        let bridged = rt.to_script_value(&values[0]).unwrap();
        assert_eq!(bridged.get("1"), Some(&ScriptValue::String("a".into())));
        assert_eq!(bridged.get("x"), Some(&ScriptValue::String("b".into())));
    }

    #[test]
    fn empty_table_is_an_empty_mapping() {
        let rt = runtime();
        let values = eval(&rt, "return {}");
        assert_eq!(rt.to_script_value(&values[0]).unwrap(), ScriptValue::Mapping(vec![]));
    }

    #[test]
    fn sandbox_functions_cannot_leave_as_data() {
        let rt = runtime();
        let values = eval(&rt, "return { f = function() end }");
        let entries = rt.mapping_entries(&values[0]).unwrap();
        let (_, func) = &entries[0];
        assert!(rt.is_callable(func));
        assert!(rt.to_script_value(func).is_err());
    }

    #[test]
    fn cyclic_table_faults_instead_of_hanging() {
        let rt = runtime();
        let values = eval(&rt, "local t = {}; t.this = t; return { t = t }");
        let entries = rt.mapping_entries(&values[0]).unwrap();
        let (_, cyclic) = &entries[0];
        let fault = rt.to_script_value(cyclic).unwrap_err();
        assert!(matches!(fault, Fault::Runtime { .. }));
    }

    #[test]
    fn dangerous_globals_are_stripped() {
        let rt = runtime();
        for global in ["io", "os", "require", "load", "dofile", "debug"] {
            let values = eval(&rt, &format!("return {{ present = {global} ~= nil }}"));
            let bridged = rt.to_script_value(&values[0]).unwrap();
            assert_eq!(
                bridged.get("present"),
                Some(&ScriptValue::Boolean(false)),
                "{global} should be nil in the sandbox"
            );
        }
    }

    #[test]
    fn host_function_reentry_is_synchronous() {
        let rt = runtime();
        rt.register_host_functions(
            "host",
            &[(
                "double".to_owned(),
                HostFunction::new(|args| match args.first() {
                    Some(ScriptValue::Integer(i)) => Ok(ScriptValue::Integer(i * 2)),
                    _ => Ok(ScriptValue::Nil),
                }),
            )],
        )
        .unwrap();

        let values = eval(&rt, "return { result = host.double(21) }");
        let bridged = rt.to_script_value(&values[0]).unwrap();
        assert_eq!(bridged.get("result"), Some(&ScriptValue::Integer(42)));
    }

    #[test]
    fn usage_reports_memory_and_instructions() {
        let rt = runtime();
        eval(&rt, "local s = string.rep('x', 4096); return { s = s }");
        let usage = rt.usage();
        assert!(usage.memory_bytes > 0);
    }
}
