use std::collections::HashMap;

use luamod::{
    CallContext, LimitKind, LuaEngine, ResolvedSource, ResourceLimits, ScriptError, ScriptValue,
    SourceResolver,
};

struct MapResolver {
    modules: HashMap<String, String>,
}

impl SourceResolver for MapResolver {
    fn resolve(&self, identity: &str) -> Option<ResolvedSource> {
        self.modules.get(identity).map(|source| ResolvedSource {
            source: source.clone(),
            canonical: identity.to_owned(),
        })
    }
}

fn engine_with(limits: ResourceLimits, modules: &[(&str, &str)]) -> LuaEngine {
    let resolver = MapResolver {
        modules: modules
            .iter()
            .map(|(name, source)| ((*name).to_owned(), (*source).to_owned()))
            .collect(),
    };
    LuaEngine::new(limits, Box::new(resolver))
}

fn call(engine: &LuaEngine, module: &str, function: &str) -> Result<ScriptValue, ScriptError> {
    engine
        .fetch_module(module)
        .unwrap()
        .expect("module exists")
        .get_function(function)
        .unwrap()
        .found()
        .expect("function exported")
        .call(vec![], &CallContext::default())
}

#[test]
fn infinite_loop_trips_the_cpu_ceiling() {
    let limits = ResourceLimits { memory_bytes: 0, instruction_budget: 200_000 };
    let engine = engine_with(
        limits,
        &[("spin", "return { forever = function() while true do end end }")],
    );

    let err = call(&engine, "spin", "forever").unwrap_err();
    assert_eq!(
        err,
        ScriptError::LimitExceeded { module: "spin".to_owned(), resource: LimitKind::Cpu }
    );
}

#[test]
fn cpu_budget_is_cumulative_across_calls() {
    let limits = ResourceLimits { memory_bytes: 0, instruction_budget: 200_000 };
    let engine = engine_with(
        limits,
        &[("spin", "return { forever = function() while true do end end }")],
    );

    let first = call(&engine, "spin", "forever").unwrap_err();
    let second = call(&engine, "spin", "forever").unwrap_err();
    assert!(matches!(first, ScriptError::LimitExceeded { resource: LimitKind::Cpu, .. }));
    assert!(matches!(second, ScriptError::LimitExceeded { resource: LimitKind::Cpu, .. }));
}

#[test]
fn runaway_allocation_trips_the_memory_ceiling() {
    let limits = ResourceLimits { memory_bytes: 2 * 1024 * 1024, instruction_budget: 0 };
    let engine = engine_with(
        limits,
        &[(
            "hog",
            "return { grow = function() local s = 'x' while true do s = s .. s end end }",
        )],
    );

    let err = call(&engine, "hog", "grow").unwrap_err();
    assert_eq!(
        err,
        ScriptError::LimitExceeded { module: "hog".to_owned(), resource: LimitKind::Memory }
    );
}

#[test]
fn limit_breach_during_top_level_evaluation_is_cached() {
    let limits = ResourceLimits { memory_bytes: 0, instruction_budget: 100_000 };
    let engine = engine_with(limits, &[("busy", "while true do end")]);

    let module = engine.fetch_module("busy").unwrap().unwrap();
    let first = module.function_names().unwrap_err();
    assert!(matches!(first, ScriptError::LimitExceeded { resource: LimitKind::Cpu, .. }));
    let second = module.function_names().unwrap_err();
    assert_eq!(first, second);
}

#[test]
fn tightened_limits_apply_to_the_running_session() {
    let engine = engine_with(
        ResourceLimits { memory_bytes: 0, instruction_budget: 10_000_000 },
        &[(
            "mixed",
            "return { quick = function() return 1 end, \
                      forever = function() while true do end end }",
        )],
    );

    assert_eq!(call(&engine, "mixed", "quick").unwrap(), ScriptValue::Integer(1));

    engine
        .set_limits(ResourceLimits { memory_bytes: 0, instruction_budget: 100_000 })
        .unwrap();
    let err = call(&engine, "mixed", "forever").unwrap_err();
    assert!(matches!(err, ScriptError::LimitExceeded { resource: LimitKind::Cpu, .. }));
}

#[test]
fn usage_grows_and_reports_in_scaled_units() {
    let engine = engine_with(
        ResourceLimits::restricted(),
        &[("pad", "return { wide = string.rep('x', 16384) }")],
    );
    engine.fetch_module("pad").unwrap().unwrap().function_names().unwrap();

    let usage = engine.usage().unwrap();
    assert!(usage.memory_bytes > 0);

    let report = engine.usage_report().unwrap();
    assert!(report.starts_with("Script memory usage: "), "report was: {report}");
    assert!(report.ends_with('\n'));
}
