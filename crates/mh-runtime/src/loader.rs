use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::debug;
use rhai::{Dynamic, Engine, Map, Scope, AST};

use mh_core::HostError;

use crate::bridge::{compile_error, throw, unwrap_script_error};
use crate::environment::InvocationSlot;
use crate::registry::CapabilityRegistry;
use crate::store::{fetch, is_absolute_path, FileStore};
use crate::BUILTIN_NAMESPACE;

/// Compiled-program cache shared by every environment built from one Builder.
/// Programs are immutable once compiled, so sharing them is safe; only their
/// execution is per-environment.
#[derive(Default)]
pub(crate) struct SharedPrograms {
    programs: Mutex<HashMap<String, Arc<AST>>>,
}

impl SharedPrograms {
    fn get(&self, filename: &str) -> Option<Arc<AST>> {
        self.programs
            .lock()
            .expect("program cache lock should not be poisoned")
            .get(filename)
            .cloned()
    }

    fn insert(&self, filename: &str, ast: Arc<AST>) {
        self.programs
            .lock()
            .expect("program cache lock should not be poisoned")
            .insert(filename.to_string(), ast);
    }
}

/// Resolves and loads script-visible imports for one environment. The exports
/// cache is never shared across environments: a fresh environment re-executes
/// every module once, so module-level mutable state cannot leak.
pub(crate) struct ModuleLoader {
    store: Arc<dyn FileStore>,
    registry: Arc<CapabilityRegistry>,
    shared: Arc<SharedPrograms>,
    exports_cache: Mutex<HashMap<String, Dynamic>>,
    dir_stack: Mutex<Vec<String>>,
    // Functions of every module executed in this environment. Function
    // pointers handed out through module exports resolve against this
    // library when a method later calls them.
    library: Mutex<AST>,
    env_vars: Map,
    slot: InvocationSlot,
}

impl ModuleLoader {
    pub(crate) fn new(
        store: Arc<dyn FileStore>,
        registry: Arc<CapabilityRegistry>,
        shared: Arc<SharedPrograms>,
        env_vars: Map,
        slot: InvocationSlot,
    ) -> Self {
        Self {
            store,
            registry,
            shared,
            exports_cache: Mutex::new(HashMap::new()),
            dir_stack: Mutex::new(Vec::new()),
            library: Mutex::new(AST::empty()),
            env_vars,
            slot,
        }
    }

    /// Registers `require` and `open` on an environment's engine.
    pub(crate) fn install(self: &Arc<Self>, engine: &mut Engine) {
        let loader = Arc::clone(self);
        engine.register_fn(
            "require",
            move |ctx: rhai::NativeCallContext,
                  specifier: &str|
                  -> Result<Dynamic, Box<rhai::EvalAltResult>> {
                loader.require(ctx.engine(), specifier).map_err(throw)
            },
        );

        let loader = Arc::clone(self);
        engine.register_fn(
            "open",
            move |filename: &str| -> Result<Dynamic, Box<rhai::EvalAltResult>> {
                loader.open(filename, false).map_err(throw)
            },
        );

        let loader = Arc::clone(self);
        engine.register_fn(
            "open",
            move |filename: &str, mode: &str| -> Result<Dynamic, Box<rhai::EvalAltResult>> {
                loader.open(filename, mode == "b").map_err(throw)
            },
        );
    }

    pub(crate) fn env_vars(&self) -> &Map {
        &self.env_vars
    }

    pub(crate) fn push_dir(&self, dir: String) {
        self.dir_stack
            .lock()
            .expect("dir stack lock should not be poisoned")
            .push(dir);
    }

    pub(crate) fn pop_dir(&self) {
        self.dir_stack
            .lock()
            .expect("dir stack lock should not be poisoned")
            .pop();
    }

    fn current_dir(&self) -> String {
        self.dir_stack
            .lock()
            .expect("dir stack lock should not be poisoned")
            .last()
            .cloned()
            .unwrap_or_default()
    }

    /// Implements `require()`. Builtin resolution deliberately shadows any
    /// same-named user file.
    pub(crate) fn require(&self, engine: &Engine, specifier: &str) -> Result<Dynamic, HostError> {
        self.ensure_init_phase("require()")?;

        if specifier == BUILTIN_NAMESPACE
            || specifier.starts_with(&format!("{BUILTIN_NAMESPACE}/"))
        {
            return self.registry.exports_for(specifier);
        }

        let filename = canonicalize(&self.current_dir(), specifier);
        debug!("require specifier={specifier} resolved={filename}");

        if let Some(exports) = self
            .exports_cache
            .lock()
            .expect("exports cache lock should not be poisoned")
            .get(&filename)
        {
            // Covers completed modules and modules currently executing: a
            // cyclic import observes the partially-populated exports object
            // instead of re-entering execution.
            return Ok(exports.clone());
        }

        let ast = self.load_program(engine, &filename)?;

        let exports: Dynamic = Dynamic::from_map(Map::new()).into_shared();
        self.exports_cache
            .lock()
            .expect("exports cache lock should not be poisoned")
            .insert(filename.clone(), exports.clone());

        self.push_dir(parent_dir(&filename));
        let executed = self.execute_module(engine, &ast, exports.clone());
        self.pop_dir();

        if let Err(error) = executed {
            self.exports_cache
                .lock()
                .expect("exports cache lock should not be poisoned")
                .remove(&filename);
            return Err(error);
        }

        self.library
            .lock()
            .expect("library lock should not be poisoned")
            .combine(ast.clone_functions_only());

        Ok(exports)
    }

    /// A base program plus every function loaded into this environment so
    /// far. Statements are stripped; the result is only consulted for
    /// function resolution.
    pub(crate) fn link_functions(&self, base: &AST) -> AST {
        let mut linked = base.clone_functions_only();
        linked.combine(
            self.library
                .lock()
                .expect("library lock should not be poisoned")
                .clone_functions_only(),
        );
        linked
    }

    /// Implements `open()`: file contents by the same resolution rules as
    /// `require`, raw bytes in binary mode, decoded text otherwise.
    pub(crate) fn open(&self, filename: &str, binary: bool) -> Result<Dynamic, HostError> {
        self.ensure_init_phase("open()")?;
        if filename.is_empty() {
            return Err(HostError::EmptyFilename);
        }

        let resolved = canonicalize(&self.current_dir(), filename);
        let data = self.read_file(&resolved)?;
        if binary {
            Ok(Dynamic::from_blob(data))
        } else {
            Ok(Dynamic::from(String::from_utf8_lossy(&data).into_owned()))
        }
    }

    fn ensure_init_phase(&self, what: &str) -> Result<(), HostError> {
        if self.slot.current().is_some() {
            return Err(HostError::runtime(format!(
                "{what} can only be used in the init context"
            )));
        }
        Ok(())
    }

    fn load_program(&self, engine: &Engine, filename: &str) -> Result<Arc<AST>, HostError> {
        if let Some(ast) = self.shared.get(filename) {
            return Ok(ast);
        }

        let data = self.read_file(filename)?;
        let source = String::from_utf8_lossy(&data).into_owned();

        let mut ast = engine
            .compile(&source)
            .map_err(|error| compile_error(filename, &error))?;
        ast.set_source(filename);

        let ast = Arc::new(ast);
        self.shared.insert(filename, ast.clone());
        Ok(ast)
    }

    fn execute_module(
        &self,
        engine: &Engine,
        ast: &AST,
        exports: Dynamic,
    ) -> Result<(), HostError> {
        let mut scope = Scope::new();
        scope.push_dynamic("exports", exports);
        scope.push_constant_dynamic("__ENV", Dynamic::from_map(self.env_vars.clone()));
        engine
            .run_ast_with_scope(&mut scope, ast)
            .map_err(|error| unwrap_script_error(*error))
    }

    fn read_file(&self, name: &str) -> Result<Vec<u8>, HostError> {
        if name.contains("://") {
            return fetch(name);
        }
        if is_absolute_path(name) {
            return std::fs::read(name).map_err(|error| map_read_error(name, error));
        }
        self.store
            .read(name)
            .map_err(|error| map_read_error(name, error))
    }
}

fn map_read_error(name: &str, error: std::io::Error) -> HostError {
    if error.kind() == std::io::ErrorKind::NotFound {
        HostError::FileNotFound(name.to_string())
    } else {
        HostError::runtime(format!("read {name}: {error}"))
    }
}

/// Resolves a specifier against the requiring module's directory and returns
/// the normalized cache key. Scheme-qualified and non-relative specifiers
/// pass through untouched apart from separator cleanup.
pub(crate) fn canonicalize(current_dir: &str, specifier: &str) -> String {
    if specifier.contains("://") {
        return specifier.to_string();
    }
    let resolved = resolve(current_dir, specifier);
    normalize(&resolved)
}

pub(crate) fn resolve(current_dir: &str, specifier: &str) -> String {
    let relative = specifier.starts_with("./")
        || specifier.starts_with("../")
        || specifier.starts_with(".\\")
        || specifier.starts_with("..\\");
    if relative && !current_dir.is_empty() {
        format!("{current_dir}/{specifier}")
    } else {
        specifier.to_string()
    }
}

/// Lexically resolves `.`/`..` segments and unifies separators.
pub(crate) fn normalize(path: &str) -> String {
    let unified = path.replace('\\', "/");
    let absolute = unified.starts_with('/');

    let mut segments: Vec<&str> = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.last().map_or(true, |last| *last == "..") {
                    if !absolute {
                        segments.push("..");
                    }
                } else {
                    segments.pop();
                }
            }
            other => segments.push(other),
        }
    }

    let joined = segments.join("/");
    if absolute {
        format!("/{joined}")
    } else {
        joined
    }
}

pub(crate) fn parent_dir(filename: &str) -> String {
    match filename.rfind('/') {
        Some(index) => filename[..index].to_string(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_markers_join_against_the_current_dir() {
        assert_eq!(canonicalize("lib", "./util.rhai"), "lib/util.rhai");
        assert_eq!(canonicalize("lib/deep", "../util.rhai"), "lib/util.rhai");
        assert_eq!(canonicalize("lib", ".\\win.rhai"), "lib/win.rhai");
        assert_eq!(canonicalize("", "./util.rhai"), "util.rhai");
    }

    #[test]
    fn bare_and_absolute_specifiers_pass_through() {
        assert_eq!(canonicalize("lib", "shared/a.rhai"), "shared/a.rhai");
        assert_eq!(canonicalize("lib", "/opt/x.rhai"), "/opt/x.rhai");
        assert_eq!(
            canonicalize("lib", "https://example.com/a.rhai"),
            "https://example.com/a.rhai"
        );
    }

    #[test]
    fn normalize_folds_dot_segments() {
        assert_eq!(normalize("a/./b/../c.rhai"), "a/c.rhai");
        assert_eq!(normalize("../a.rhai"), "../a.rhai");
        assert_eq!(normalize("/a/../../b"), "/b");
        assert_eq!(normalize("a\\b\\c.rhai"), "a/b/c.rhai");
    }

    #[test]
    fn parent_dir_splits_on_the_last_separator() {
        assert_eq!(parent_dir("lib/util.rhai"), "lib");
        assert_eq!(parent_dir("main.rhai"), "");
    }
}
