use std::collections::BTreeMap;
use std::sync::Arc;

use mh_core::{HostError, HostValue};
use mh_runtime::{
    BuildOptions, Builder, CapabilityRegistry, FileStore, MemoryFileStore, Runner, RunnerPool,
};

/// Pool size used when the caller does not pick one.
pub const DEFAULT_POOL_SIZE: usize = 100;

#[derive(Clone, Default)]
pub struct CreateHostOptions {
    /// Method scripts by filename. Every entry is compiled and must export a
    /// valid method; files pulled in via `require` come from the store.
    pub sources: BTreeMap<String, String>,
    /// Backing store for `require`/`open`. Defaults to an in-memory store
    /// seeded with `sources`, so the method scripts can require each other.
    pub store: Option<Arc<dyn FileStore>>,
    pub registry: Option<Arc<CapabilityRegistry>>,
    pub compatibility_mode: Option<String>,
    pub include_system_env_vars: bool,
    pub env: BTreeMap<String, String>,
    pub meta_identifier_field: Option<String>,
}

pub fn create_builder(options: CreateHostOptions) -> Result<Builder, HostError> {
    let store = options.store.unwrap_or_else(|| {
        let seeded = MemoryFileStore::new();
        for (filename, source) in &options.sources {
            seeded.insert(filename.clone(), source.clone());
        }
        Arc::new(seeded)
    });
    let registry = options
        .registry
        .unwrap_or_else(|| Arc::new(CapabilityRegistry::with_defaults()));

    let mut build_options = BuildOptions {
        include_system_env_vars: options.include_system_env_vars,
        env: options.env,
        ..BuildOptions::default()
    };
    if let Some(mode) = options.compatibility_mode {
        build_options.compatibility_mode = mode;
    }
    if let Some(field) = options.meta_identifier_field {
        build_options.meta_identifier_field = field;
    }

    let mut builder = Builder::new(store, registry, build_options)?;
    for (filename, source) in &options.sources {
        builder.compile(filename, source)?;
    }
    Ok(builder)
}

pub fn create_runner(options: CreateHostOptions) -> Result<Runner, HostError> {
    create_builder(options)?.build()
}

/// Builds a bounded pool of independent runners plus the method metadata of
/// one of them. Every runner carries the same methods, so one runner's
/// metadata describes the whole pool.
pub fn create_runner_pool(
    options: CreateHostOptions,
    size: usize,
) -> Result<(RunnerPool, Vec<BTreeMap<String, HostValue>>), HostError> {
    let builder = create_builder(options)?;
    let pool = RunnerPool::build(&builder, size)?;
    let metas = pool.acquire().metas();
    Ok((pool, metas))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mh_core::InvocationContext;

    fn sources(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn create_runner_runs_a_single_method_script() {
        let runner = create_runner(CreateHostOptions {
            sources: sources(&[("answer.rhai", r#"exports["default"] = |arg| 41.0 + arg;"#)]),
            ..CreateHostOptions::default()
        })
        .expect("runner builds");

        let result = runner
            .run_default(&InvocationContext::background(), HostValue::Number(1.0))
            .expect("default runs");
        assert_eq!(result, HostValue::Number(42.0));
    }

    #[test]
    fn provided_sources_can_require_each_other_by_default() {
        let runner = create_runner(CreateHostOptions {
            sources: sources(&[
                (
                    "shared.rhai",
                    r#"
                    exports.meta = #{ id: "shared" };
                    exports.factor = 2;
                    exports["default"] = |arg| arg;
                    "#,
                ),
                (
                    "main.rhai",
                    r#"
                    let shared = require("./shared.rhai");
                    exports.meta = #{ id: "main" };
                    exports["default"] = |arg| arg * shared.factor;
                    "#,
                ),
            ]),
            ..CreateHostOptions::default()
        })
        .expect("runner builds");

        assert_eq!(
            runner
                .run_method(&InvocationContext::background(), "main", HostValue::Number(3.0))
                .expect("main runs"),
            HostValue::Number(6.0)
        );
    }

    #[test]
    fn modules_belong_in_an_explicit_store_not_in_sources() {
        let store = MemoryFileStore::new();
        store.insert("lib.rhai", "exports.factor = 2;");
        let runner = create_runner(CreateHostOptions {
            sources: sources(&[(
                "main.rhai",
                r#"
                let lib = require("./lib.rhai");
                exports["default"] = |arg| arg * lib.factor;
                "#,
            )]),
            store: Some(Arc::new(store)),
            ..CreateHostOptions::default()
        })
        .expect("runner builds");

        assert_eq!(
            runner
                .run_default(&InvocationContext::background(), HostValue::Number(21.0))
                .expect("default runs"),
            HostValue::Number(42.0)
        );
    }

    #[test]
    fn multi_script_hosts_dispatch_by_identifier() {
        let runner = create_runner(CreateHostOptions {
            sources: sources(&[
                (
                    "a.rhai",
                    r#"exports.meta = #{ id: "alpha" }; exports["default"] = |arg| "a";"#,
                ),
                (
                    "b.rhai",
                    r#"exports.meta = #{ id: "beta" }; exports["default"] = |arg| "b";"#,
                ),
            ]),
            ..CreateHostOptions::default()
        })
        .expect("runner builds");

        assert_eq!(
            runner
                .run_method(&InvocationContext::background(), "alpha", HostValue::Null)
                .expect("alpha runs"),
            HostValue::String("a".to_string())
        );
        assert_eq!(runner.method_names(), vec!["alpha", "beta"]);
    }

    #[test]
    fn invalid_compatibility_mode_is_reported_before_compiling() {
        let error = create_builder(CreateHostOptions {
            sources: sources(&[("a.rhai", "exports = 1;")]),
            compatibility_mode: Some("es6".to_string()),
            ..CreateHostOptions::default()
        })
        .err().expect("mode is invalid");
        assert_eq!(error, HostError::InvalidCompatibilityMode("es6".to_string()));
    }

    #[test]
    fn pool_reports_the_shared_method_metadata() {
        let (pool, metas) = create_runner_pool(
            CreateHostOptions {
                sources: sources(&[(
                    "main.rhai",
                    r#"
                    exports.meta = #{ id: "job", owner: "team-a" };
                    exports["default"] = |arg| arg;
                    "#,
                )]),
                ..CreateHostOptions::default()
            },
            4,
        )
        .expect("pool builds");

        assert_eq!(pool.size(), 4);
        assert_eq!(metas.len(), 1);
        assert_eq!(
            metas[0].get("owner"),
            Some(&HostValue::String("team-a".to_string()))
        );

        let runner = pool.acquire();
        assert_eq!(
            runner
                .run_default(&InvocationContext::background(), HostValue::Bool(true))
                .expect("pooled runner works"),
            HostValue::Bool(true)
        );
    }

    #[test]
    fn env_vars_flow_through_the_options() {
        let runner = create_runner(CreateHostOptions {
            sources: sources(&[(
                "main.rhai",
                r#"
                let stage = __ENV["STAGE"];
                exports["default"] = |arg| stage;
                "#,
            )]),
            env: BTreeMap::from([("STAGE".to_string(), "prod".to_string())]),
            ..CreateHostOptions::default()
        })
        .expect("runner builds");

        assert_eq!(
            runner
                .run_default(&InvocationContext::background(), HostValue::Null)
                .expect("default runs"),
            HostValue::String("prod".to_string())
        );
    }
}
