use std::collections::BTreeMap;
use std::sync::Arc;

use rhai::{Dynamic, Engine, FnPtr, ImmutableString, Map, Module, Scope, AST};

use mh_core::{CompatibilityMode, HostError, HostValue};

use crate::bridge::{compile_error, dynamic_to_host_value, interrupt_token, unwrap_script_error};
use crate::environment::{Environment, InvocationSlot, POLYFILLS};
use crate::loader::{parent_dir, ModuleLoader, SharedPrograms};
use crate::registry::CapabilityRegistry;
use crate::runner::{Method, Runner};
use crate::store::FileStore;

/// One compiled top-level script. Immutable once created and shared read-only
/// across every environment built from the same Builder.
#[derive(Clone)]
pub struct CompiledUnit {
    filename: String,
    ast: Arc<AST>,
}

impl CompiledUnit {
    pub fn filename(&self) -> &str {
        &self.filename
    }
}

#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub compatibility_mode: String,
    pub include_system_env_vars: bool,
    pub env: BTreeMap<String, String>,
    /// Key of the metadata field used as the method identifier, `"id"` by
    /// convention, `"name"` in some deployments.
    pub meta_identifier_field: String,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            compatibility_mode: String::new(),
            include_system_env_vars: false,
            env: BTreeMap::new(),
            meta_identifier_field: "id".to_string(),
        }
    }
}

/// A self-contained bundle of compiled scripts, ready to be instantiated into
/// execution environments. Compilation happens once per source file;
/// instantiation happens once per environment.
pub struct Builder {
    mode: CompatibilityMode,
    meta_identifier_field: String,
    env_vars: Map,
    store: Arc<dyn FileStore>,
    registry: Arc<CapabilityRegistry>,
    compiler: Engine,
    polyfills: Option<Arc<Module>>,
    shared: Arc<SharedPrograms>,
    units: Vec<CompiledUnit>,
}

impl Builder {
    pub fn new(
        store: Arc<dyn FileStore>,
        registry: Arc<CapabilityRegistry>,
        options: BuildOptions,
    ) -> Result<Self, HostError> {
        let mode = CompatibilityMode::parse(&options.compatibility_mode)?;
        let compiler = new_engine(mode);

        let mut env_pairs = BTreeMap::new();
        if options.include_system_env_vars {
            env_pairs.extend(std::env::vars());
        }
        env_pairs.extend(options.env);
        let mut env_vars = Map::new();
        for (key, value) in env_pairs {
            env_vars.insert(key.into(), Dynamic::from(value));
        }

        let polyfills = match mode {
            CompatibilityMode::Base => None,
            CompatibilityMode::Extended => {
                let ast = compiler
                    .compile(POLYFILLS)
                    .map_err(|error| compile_error("<polyfills>", &error))?;
                let module = Module::eval_ast_as_new(Scope::new(), &ast, &compiler)
                    .map_err(|error| unwrap_script_error(*error))?;
                Some(Arc::new(module))
            }
        };

        Ok(Self {
            mode,
            meta_identifier_field: options.meta_identifier_field,
            env_vars,
            store,
            registry,
            compiler,
            polyfills,
            shared: Arc::new(SharedPrograms::default()),
            units: Vec::new(),
        })
    }

    pub fn compatibility_mode(&self) -> CompatibilityMode {
        self.mode
    }

    pub fn units(&self) -> &[CompiledUnit] {
        &self.units
    }

    /// Compiles one top-level script and adds it to the bundle. Deterministic
    /// in its inputs; nothing runs until `build`.
    pub fn compile(&mut self, filename: &str, source: &str) -> Result<(), HostError> {
        let unit = self.compile_unit(filename, source)?;
        self.units.push(unit);
        Ok(())
    }

    fn compile_unit(&self, filename: &str, source: &str) -> Result<CompiledUnit, HostError> {
        let mut ast = self
            .compiler
            .compile(source)
            .map_err(|error| compile_error(filename, &error))?;
        ast.set_source(filename);
        Ok(CompiledUnit {
            filename: filename.to_string(),
            ast: Arc::new(ast),
        })
    }

    /// Instantiates a fresh environment, runs every compiled script in it
    /// once, validates the exported contracts and wraps the result in a
    /// Runner.
    ///
    /// Building into an environment that already exists is a separate entry
    /// point: [`Builder::build_from_string`] takes the environment to reuse,
    /// so `build` never has to be told whether one is on hand.
    pub fn build(&self) -> Result<Runner, HostError> {
        let environment = Arc::new(self.instantiate_env()?);
        self.build_units(environment, &self.units)
    }

    /// Counterpart of [`Builder::build`] for a caller that is holding a warm
    /// [`Environment`]: runs the same validation path against one ad-hoc
    /// script evaluated in that environment instead of a fresh one. Used for
    /// one-off script execution.
    pub fn build_from_string(
        &self,
        source: &str,
        environment: &Arc<Environment>,
    ) -> Result<Runner, HostError> {
        let unit = self.compile_unit("_default_", source)?;
        self.build_units(Arc::clone(environment), std::slice::from_ref(&unit))
    }

    fn instantiate_env(&self) -> Result<Environment, HostError> {
        let slot = InvocationSlot::default();
        let mut engine = new_engine(self.mode);

        let loader = Arc::new(ModuleLoader::new(
            Arc::clone(&self.store),
            Arc::clone(&self.registry),
            Arc::clone(&self.shared),
            self.env_vars.clone(),
            slot.clone(),
        ));
        loader.install(&mut engine);
        self.registry.install_all(&mut engine, &slot);

        let progress = slot.clone();
        engine.on_progress(move |ops| {
            if ops % 256 != 0 {
                return None;
            }
            if progress.should_interrupt() {
                Some(interrupt_token())
            } else {
                None
            }
        });

        if let Some(polyfills) = &self.polyfills {
            engine.register_global_module(Arc::clone(polyfills));
        }

        Ok(Environment::new(engine, slot, loader))
    }

    fn build_units(
        &self,
        environment: Arc<Environment>,
        units: &[CompiledUnit],
    ) -> Result<Runner, HostError> {
        let mut methods: BTreeMap<String, Method> = BTreeMap::new();
        let mut default = None;
        let mut last: Option<(Dynamic, Arc<AST>)> = None;

        if let [unit] = units {
            let parts = self.create_method(&environment, unit, true)?;
            // Function pointers in the exports may point into required
            // modules; link their functions in before binding the method.
            let linked = Arc::new(environment.loader().link_functions(&unit.ast));
            let name = parts.name.unwrap_or_else(|| "default".to_string());
            let meta = parts.meta.unwrap_or_else(|| {
                BTreeMap::from([("name".to_string(), HostValue::String(name.clone()))])
            });
            let method = Method::new(name.clone(), meta, parts.entry, Arc::clone(&linked));
            default = Some(method.clone());
            methods.insert(name, method);
            last = Some((parts.exports, linked));
        } else {
            for unit in units {
                let parts = self.create_method(&environment, unit, false)?;
                let linked = Arc::new(environment.loader().link_functions(&unit.ast));
                let name = parts
                    .name
                    .expect("multi-script validation always yields an identifier");
                if methods.contains_key(&name) {
                    return Err(HostError::DuplicateIdentifier {
                        filename: unit.filename.clone(),
                        id: name,
                    });
                }
                let meta = parts
                    .meta
                    .expect("multi-script validation always yields metadata");
                let method = Method::new(name.clone(), meta, parts.entry, Arc::clone(&linked));
                methods.insert(name, method);
                last = Some((parts.exports, linked));
            }
        }

        let (exports, ast) = last.ok_or_else(|| HostError::runtime("no scripts compiled"))?;
        Ok(Runner::new(environment, default, methods, exports, ast))
    }

    /// Runs one script's top level exactly once in the environment and
    /// extracts its validated method. First validation failure wins.
    fn create_method(
        &self,
        environment: &Environment,
        unit: &CompiledUnit,
        is_default: bool,
    ) -> Result<MethodParts, HostError> {
        let exports: Dynamic = Dynamic::from_map(Map::new()).into_shared();
        let mut scope = Scope::new();
        scope.push_dynamic("exports", exports.clone());
        scope.push_constant_dynamic(
            "__ENV",
            Dynamic::from_map(environment.loader().env_vars().clone()),
        );

        environment.loader().push_dir(parent_dir(&unit.filename));
        let executed = environment
            .engine()
            .run_ast_with_scope(&mut scope, &unit.ast);
        environment.loader().pop_dir();
        executed.map_err(|error| unwrap_script_error(*error))?;

        // The script may have reassigned `exports` wholesale; the scope holds
        // the final value.
        let final_exports = scope
            .get_value::<Dynamic>("exports")
            .expect("exports was pushed into the scope");
        let filename = unit.filename.clone();

        let Some(exports_map) = final_exports.flatten_clone().try_cast::<Map>() else {
            return Err(HostError::InvalidExports { filename });
        };

        let entry = match extract(&exports_map, "default", |value| value.try_cast::<FnPtr>()) {
            Extracted::Present(entry) => entry,
            Extracted::Absent => return Err(HostError::MissingDefault { filename }),
            Extracted::WrongType => return Err(HostError::DefaultNotCallable { filename }),
        };

        let meta_map = match extract(&exports_map, "meta", |value| value.try_cast::<Map>()) {
            Extracted::Present(meta) => meta,
            Extracted::Absent | Extracted::WrongType if is_default => {
                return Ok(MethodParts {
                    name: None,
                    meta: None,
                    entry,
                    exports: final_exports,
                });
            }
            Extracted::Absent | Extracted::WrongType => {
                return Err(HostError::MissingMeta { filename });
            }
        };

        let field = self.meta_identifier_field.as_str();
        let name = match meta_map.get(field) {
            Some(value) if !value.is_unit() => identifier_text(value),
            _ => String::new(),
        };
        let meta = meta_to_host(&meta_map)?;

        if name.is_empty() {
            if is_default {
                return Ok(MethodParts {
                    name: None,
                    meta: Some(meta),
                    entry,
                    exports: final_exports,
                });
            }
            return Err(HostError::MissingIdentifier {
                filename,
                field: field.to_string(),
            });
        }

        Ok(MethodParts {
            name: Some(name),
            meta: Some(meta),
            entry,
            exports: final_exports,
        })
    }
}

struct MethodParts {
    name: Option<String>,
    meta: Option<BTreeMap<String, HostValue>>,
    entry: FnPtr,
    exports: Dynamic,
}

enum Extracted<T> {
    Present(T),
    Absent,
    WrongType,
}

fn extract<T>(map: &Map, key: &str, cast: impl Fn(Dynamic) -> Option<T>) -> Extracted<T> {
    match map.get(key) {
        None => Extracted::Absent,
        Some(value) if value.is_unit() => Extracted::Absent,
        Some(value) => match cast(value.flatten_clone()) {
            Some(value) => Extracted::Present(value),
            None => Extracted::WrongType,
        },
    }
}

fn identifier_text(value: &Dynamic) -> String {
    let value = value.flatten_clone();
    if value.is::<ImmutableString>() {
        value.cast::<ImmutableString>().to_string()
    } else {
        value.to_string()
    }
}

fn meta_to_host(meta: &Map) -> Result<BTreeMap<String, HostValue>, HostError> {
    let mut out = BTreeMap::new();
    for (key, value) in meta {
        out.insert(key.to_string(), dynamic_to_host_value(value.clone())?);
    }
    Ok(out)
}

fn new_engine(mode: CompatibilityMode) -> Engine {
    let mut engine = Engine::new();
    if mode == CompatibilityMode::Base {
        engine.disable_symbol("eval");
    }
    engine.on_print(|text| log::info!(target: "script", "{text}"));
    engine.on_debug(|text, source, position| {
        log::debug!(
            target: "script",
            "{}:{position} {text}",
            source.unwrap_or("script")
        )
    });
    engine
}
