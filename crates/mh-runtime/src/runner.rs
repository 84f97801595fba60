use std::collections::BTreeMap;
use std::sync::Arc;

use rhai::{Dynamic, EvalAltResult, FnPtr, Map, AST};

use mh_core::{HostError, HostValue, InvocationContext};

use crate::bridge::{
    dynamic_to_host_value, host_value_to_dynamic, is_interrupt_sentinel, unwrap_script_error,
};
use crate::environment::Environment;
use crate::INTERRUPT_SENTINEL;

/// A validated entry point extracted from a script's exports, together with
/// the program it closes over.
#[derive(Clone)]
pub struct Method {
    name: String,
    meta: BTreeMap<String, HostValue>,
    entry: FnPtr,
    ast: Arc<AST>,
}

impl Method {
    pub(crate) fn new(
        name: String,
        meta: BTreeMap<String, HostValue>,
        entry: FnPtr,
        ast: Arc<AST>,
    ) -> Self {
        Self {
            name,
            meta,
            entry,
            ast,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn meta(&self) -> &BTreeMap<String, HostValue> {
        &self.meta
    }
}

/// One environment's executable face: the validated methods plus the exports
/// object of the last script that ran in it. Runs one invocation at a time;
/// concurrency comes from pooling whole Runners, never from sharing one.
pub struct Runner {
    environment: Arc<Environment>,
    default: Option<Method>,
    methods: BTreeMap<String, Method>,
    exports: Dynamic,
    ast: Arc<AST>,
    no_cookies_reset: bool,
}

impl Runner {
    pub(crate) fn new(
        environment: Arc<Environment>,
        default: Option<Method>,
        methods: BTreeMap<String, Method>,
        exports: Dynamic,
        ast: Arc<AST>,
    ) -> Self {
        Self {
            environment,
            default,
            methods,
            exports,
            ast,
            no_cookies_reset: false,
        }
    }

    pub fn environment(&self) -> &Arc<Environment> {
        &self.environment
    }

    pub fn method(&self, name: &str) -> Option<&Method> {
        self.methods.get(name)
    }

    pub fn method_names(&self) -> Vec<&str> {
        self.methods.keys().map(String::as_str).collect()
    }

    /// Metadata of every validated method, in identifier order.
    pub fn metas(&self) -> Vec<BTreeMap<String, HostValue>> {
        self.methods
            .values()
            .map(|method| method.meta.clone())
            .collect()
    }

    /// Keeps the cookie jar of the caller's context across the invocation
    /// instead of starting from an empty jar.
    pub fn set_no_cookies_reset(&mut self, no_reset: bool) {
        self.no_cookies_reset = no_reset;
    }

    pub fn run_default(
        &self,
        ctx: &InvocationContext,
        arg: HostValue,
    ) -> Result<HostValue, HostError> {
        let method = self
            .default
            .as_ref()
            .ok_or_else(|| HostError::MethodMissing("default".to_string()))?;
        self.run_fn(ctx, "default", method, arg)
    }

    pub fn run_method(
        &self,
        ctx: &InvocationContext,
        name: &str,
        arg: HostValue,
    ) -> Result<HostValue, HostError> {
        let method = self
            .methods
            .get(name)
            .ok_or_else(|| HostError::MethodMissing(name.to_string()))?;
        self.run_fn(ctx, name, method, arg)
    }

    /// Runs an optional lifecycle export by key. A missing or non-callable
    /// export is not an error; the invocation simply yields null.
    pub fn run_part(
        &self,
        ctx: &InvocationContext,
        key: &str,
        arg: HostValue,
    ) -> Result<HostValue, HostError> {
        let Some(exports) = self.exports.flatten_clone().try_cast::<Map>() else {
            return Ok(HostValue::Null);
        };
        let Some(entry) = exports
            .get(key)
            .and_then(|value| value.flatten_clone().try_cast::<FnPtr>())
        else {
            return Ok(HostValue::Null);
        };
        let method = Method::new(key.to_string(), BTreeMap::new(), entry, Arc::clone(&self.ast));
        self.run_fn(ctx, key, &method, arg)
    }

    fn run_fn(
        &self,
        ctx: &InvocationContext,
        name: &str,
        method: &Method,
        arg: HostValue,
    ) -> Result<HostValue, HostError> {
        let ctx = if self.no_cookies_reset {
            ctx.clone()
        } else {
            ctx.with_fresh_cookies()
        };
        let _guard = self.environment.slot().enter(ctx.clone());

        let result: Result<Dynamic, Box<EvalAltResult>> = method.entry.call(
            self.environment.engine(),
            method.ast.as_ref(),
            (host_value_to_dynamic(&arg),),
        );
        match result {
            Ok(value) => dynamic_to_host_value(value),
            Err(error) => Err(translate_run_error(&ctx, name, *error)),
        }
    }
}

/// Maps an engine failure onto the invocation outcome. A deadline that ran
/// out wins over whatever the engine reported, except when the interruption
/// carries a payload some other party raised deliberately.
fn translate_run_error(ctx: &InvocationContext, name: &str, error: EvalAltResult) -> HostError {
    // Terminations may arrive wrapped in call-stack context.
    let termination = match peel_call_frames(&error) {
        EvalAltResult::ErrorTerminated(token, _) => Some(token.clone()),
        _ => None,
    };

    if ctx.deadline_elapsed() {
        match &termination {
            Some(token) if !is_interrupt_sentinel(token) => {}
            _ => return HostError::Timeout(name.to_string()),
        }
    }

    match termination {
        Some(token) => {
            if is_interrupt_sentinel(&token) {
                return HostError::runtime(INTERRUPT_SENTINEL);
            }
            match token.clone().try_cast::<HostError>() {
                Some(host_error) => host_error,
                None => HostError::runtime(token.to_string()),
            }
        }
        None => unwrap_script_error(error),
    }
}

fn peel_call_frames(error: &EvalAltResult) -> &EvalAltResult {
    match error {
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => peel_call_frames(inner),
        other => other,
    }
}
