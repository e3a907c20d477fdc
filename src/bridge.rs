//! Value marshaling across the sandbox boundary.
//!
//! [`ScriptValue`] is the tagged representation values take while crossing
//! between the host and sandboxed code, in either direction. Conversions
//! are exhaustive over both value models; the only values with no
//! counterpart on the host side are sandbox-internal handles (functions,
//! userdata), which stay inside the sandbox and are reachable through
//! [`ModuleFunction`] handles only.
//!
//! [`ModuleFunction`]: crate::module::ModuleFunction

use std::fmt;
use std::rc::Rc;

use mlua::{Lua, MultiValue, Value};

use crate::types::{Fault, ScriptError};

/// Nesting depth past which table conversion gives up.
///
/// Lua tables can be cyclic; the cap turns a cycle into a fault instead of
/// unbounded recursion.
const MAX_TABLE_DEPTH: usize = 64;

/// A host-provided callable visible to sandboxed code.
///
/// When invoked from inside the sandbox, arguments are marshaled out to
/// [`ScriptValue`]s, the closure runs on the host side of the boundary, and
/// its result is marshaled back in. The whole exchange is one synchronous
/// nested call on the current stack.
#[derive(Clone)]
pub struct HostFunction(Rc<dyn Fn(Vec<ScriptValue>) -> Result<ScriptValue, ScriptError>>);

impl HostFunction {
    pub fn new(
        f: impl Fn(Vec<ScriptValue>) -> Result<ScriptValue, ScriptError> + 'static,
    ) -> Self {
        Self(Rc::new(f))
    }

    pub fn invoke(&self, args: Vec<ScriptValue>) -> Result<ScriptValue, ScriptError> {
        (self.0)(args)
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostFunction(<native>)")
    }
}

impl PartialEq for HostFunction {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

/// Tagged value representation crossing the host/sandbox boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptValue {
    Nil,
    Boolean(bool),
    Integer(i64),
    Number(f64),
    String(String),
    /// Array-like table (keys were exactly 1..=n).
    Sequence(Vec<ScriptValue>),
    /// Keyed table entries, in iteration order. Keys are strings; integer
    /// table keys arrive stringified in decimal.
    Mapping(Vec<(String, ScriptValue)>),
    /// A host callable to expose to sandboxed code.
    HostFunction(HostFunction),
}

impl ScriptValue {
    pub fn is_nil(&self) -> bool {
        matches!(self, ScriptValue::Nil)
    }

    /// Look up a key in a `Mapping`; `None` for other variants too.
    pub fn get(&self, key: &str) -> Option<&ScriptValue> {
        match self {
            ScriptValue::Mapping(entries) => {
                entries.iter().find(|(name, _)| name == key).map(|(_, value)| value)
            }
            _ => None,
        }
    }

    /// Convert from the host's JSON data model.
    pub fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => ScriptValue::Nil,
            serde_json::Value::Bool(b) => ScriptValue::Boolean(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => ScriptValue::Integer(i),
                None => ScriptValue::Number(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => ScriptValue::String(s),
            serde_json::Value::Array(items) => {
                ScriptValue::Sequence(items.into_iter().map(Self::from_json).collect())
            }
            serde_json::Value::Object(map) => ScriptValue::Mapping(
                map.into_iter().map(|(k, v)| (k, Self::from_json(v))).collect(),
            ),
        }
    }

    /// Convert into the host's JSON data model.
    ///
    /// `None` if the value embeds a [`HostFunction`], which has no JSON
    /// form. Non-finite numbers become `null`.
    pub fn to_json(&self) -> Option<serde_json::Value> {
        match self {
            ScriptValue::Nil => Some(serde_json::Value::Null),
            ScriptValue::Boolean(b) => Some(serde_json::Value::Bool(*b)),
            ScriptValue::Integer(i) => Some(serde_json::Value::from(*i)),
            ScriptValue::Number(n) => Some(
                serde_json::Number::from_f64(*n)
                    .map_or(serde_json::Value::Null, serde_json::Value::Number),
            ),
            ScriptValue::String(s) => Some(serde_json::Value::String(s.clone())),
            ScriptValue::Sequence(items) => Some(serde_json::Value::Array(
                items.iter().map(ScriptValue::to_json).collect::<Option<_>>()?,
            )),
            ScriptValue::Mapping(entries) => {
                let mut map = serde_json::Map::with_capacity(entries.len());
                for (key, value) in entries {
                    map.insert(key.clone(), value.to_json()?);
                }
                Some(serde_json::Value::Object(map))
            }
            ScriptValue::HostFunction(_) => None,
        }
    }
}

impl From<bool> for ScriptValue {
    fn from(b: bool) -> Self {
        ScriptValue::Boolean(b)
    }
}

impl From<i64> for ScriptValue {
    fn from(i: i64) -> Self {
        ScriptValue::Integer(i)
    }
}

impl From<f64> for ScriptValue {
    fn from(n: f64) -> Self {
        ScriptValue::Number(n)
    }
}

impl From<&str> for ScriptValue {
    fn from(s: &str) -> Self {
        ScriptValue::String(s.to_owned())
    }
}

impl From<String> for ScriptValue {
    fn from(s: String) -> Self {
        ScriptValue::String(s)
    }
}

/// Push a host value into the sandbox's representation.
pub(crate) fn value_to_lua(lua: &Lua, value: &ScriptValue) -> mlua::Result<Value> {
    match value {
        ScriptValue::Nil => Ok(Value::Nil),
        ScriptValue::Boolean(b) => Ok(Value::Boolean(*b)),
        ScriptValue::Integer(i) => Ok(Value::Integer(*i)),
        ScriptValue::Number(n) => Ok(Value::Number(*n)),
        ScriptValue::String(s) => Ok(Value::String(lua.create_string(s)?)),
        ScriptValue::Sequence(items) => {
            let table = lua.create_table_with_capacity(items.len(), 0)?;
            for (i, item) in items.iter().enumerate() {
                table.raw_set(i + 1, value_to_lua(lua, item)?)?;
            }
            Ok(Value::Table(table))
        }
        ScriptValue::Mapping(entries) => {
            let table = lua.create_table_with_capacity(0, entries.len())?;
            for (key, item) in entries {
                table.raw_set(key.as_str(), value_to_lua(lua, item)?)?;
            }
            Ok(Value::Table(table))
        }
        ScriptValue::HostFunction(f) => Ok(Value::Function(wrap_host_function(lua, f)?)),
    }
}

/// Pull a sandbox value out into the host's representation.
///
/// Sandbox-side functions, userdata, and threads have no host counterpart
/// and fault; they never leave the sandbox as data.
pub(crate) fn value_from_lua(value: Value, depth: usize) -> Result<ScriptValue, Fault> {
    if depth > MAX_TABLE_DEPTH {
        return Err(Fault::Runtime {
            message: format!("table nesting exceeds {MAX_TABLE_DEPTH} levels (cyclic table?)"),
        });
    }
    match value {
        Value::Nil => Ok(ScriptValue::Nil),
        Value::Boolean(b) => Ok(ScriptValue::Boolean(b)),
        Value::Integer(i) => Ok(ScriptValue::Integer(i)),
        Value::Number(n) => Ok(ScriptValue::Number(n)),
        Value::String(s) => match s.to_str() {
            Ok(text) => Ok(ScriptValue::String(text.to_string())),
            Err(_) => {
                Err(Fault::Runtime { message: "string is not valid UTF-8".to_owned() })
            }
        },
        Value::Table(table) => table_from_lua(&table, depth),
        other => Err(Fault::Runtime {
            message: format!("{} values cannot cross the sandbox boundary", other.type_name()),
        }),
    }
}

fn table_from_lua(table: &mlua::Table, depth: usize) -> Result<ScriptValue, Fault> {
    let mut pairs = Vec::new();
    for pair in table.clone().pairs::<Value, Value>() {
        let (key, value) = pair.map_err(|e| Fault::Runtime { message: e.to_string() })?;
        pairs.push((key, value));
    }

    // The array part iterates first and in order, so a pure sequence shows
    // up as keys 1..=n in position.
    let is_sequence = !pairs.is_empty()
        && pairs
            .iter()
            .enumerate()
            .all(|(i, (key, _))| matches!(key, Value::Integer(k) if *k == i as i64 + 1));

    if is_sequence {
        let mut items = Vec::with_capacity(pairs.len());
        for (_, value) in pairs {
            items.push(value_from_lua(value, depth + 1)?);
        }
        return Ok(ScriptValue::Sequence(items));
    }

    let mut entries = Vec::with_capacity(pairs.len());
    for (key, value) in pairs {
        let name = match key {
            Value::String(s) => s
                .to_str()
                .map_err(|_| Fault::Runtime {
                    message: "table key is not valid UTF-8".to_owned(),
                })?
                .to_string(),
            Value::Integer(i) => i.to_string(),
            other => {
                return Err(Fault::Runtime {
                    message: format!("unsupported table key of type {}", other.type_name()),
                });
            }
        };
        entries.push((name, value_from_lua(value, depth + 1)?));
    }
    Ok(ScriptValue::Mapping(entries))
}

/// Wrap a host callable as a native sandbox function.
pub(crate) fn wrap_host_function(lua: &Lua, f: &HostFunction) -> mlua::Result<mlua::Function> {
    let host = f.clone();
    lua.create_function(move |lua, args: MultiValue| {
        let mut host_args = Vec::with_capacity(args.len());
        for value in args {
            host_args.push(
                value_from_lua(value, 0).map_err(|fault| mlua::Error::runtime(fault.to_string()))?,
            );
        }
        let result = host.invoke(host_args).map_err(mlua::Error::external)?;
        value_to_lua(lua, &result)
    })
}
