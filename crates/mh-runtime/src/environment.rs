use std::sync::{Arc, Mutex};

use rhai::Engine;

use mh_core::{HostError, InvocationContext};

use crate::loader::ModuleLoader;

/// Mutable "current invocation" slot of one execution environment. Builtin
/// capabilities and the loader read it to observe cancellation and to refuse
/// work during the init phase.
#[derive(Clone, Default)]
pub struct InvocationSlot {
    inner: Arc<Mutex<Option<InvocationContext>>>,
}

impl InvocationSlot {
    pub fn current(&self) -> Option<InvocationContext> {
        self.inner
            .lock()
            .expect("invocation slot lock should not be poisoned")
            .clone()
    }

    /// Resolves the active context for a capability call, failing when the
    /// environment is still in its init phase.
    pub fn require_active(&self, capability: &str) -> Result<InvocationContext, HostError> {
        self.current().ok_or_else(|| HostError::UsedOutsideInvocation {
            capability: capability.to_string(),
        })
    }

    pub(crate) fn should_interrupt(&self) -> bool {
        self.current()
            .map(|ctx| ctx.should_interrupt())
            .unwrap_or(false)
    }

    /// Publishes `ctx` as the active invocation. The guard restores the idle
    /// state on drop, including during unwinding.
    pub(crate) fn enter(&self, ctx: InvocationContext) -> SlotGuard {
        *self
            .inner
            .lock()
            .expect("invocation slot lock should not be poisoned")
            = Some(ctx);
        SlotGuard { slot: self.clone() }
    }
}

pub(crate) struct SlotGuard {
    slot: InvocationSlot,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let mut current = match self.slot.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *current = None;
    }
}

/// One instance of the script engine's global state plus its bound host
/// functions. The unit of isolation: never runs two scripts or two
/// invocations concurrently.
pub struct Environment {
    engine: Engine,
    slot: InvocationSlot,
    loader: Arc<ModuleLoader>,
}

impl Environment {
    pub(crate) fn new(engine: Engine, slot: InvocationSlot, loader: Arc<ModuleLoader>) -> Self {
        Self {
            engine,
            slot,
            loader,
        }
    }

    pub(crate) fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn slot(&self) -> &InvocationSlot {
        &self.slot
    }

    pub(crate) fn loader(&self) -> &Arc<ModuleLoader> {
        &self.loader
    }
}

/// Standard helpers loaded into every `extended` environment at build time.
pub(crate) const POLYFILLS: &str = r#"
fn clamp(value, low, high) {
    if value < low { low } else if value > high { high } else { value }
}

fn sum(items) {
    let total = 0;
    for item in items { total += item; }
    total
}

fn avg(items) {
    if items.len == 0 { return 0; }
    sum(items) / items.len
}

fn pad_left(text, width, pad) {
    let out = text.to_string();
    while out.len < width { out = pad + out; }
    out
}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_is_idle_until_entered() {
        let slot = InvocationSlot::default();
        assert!(slot.current().is_none());
        assert!(!slot.should_interrupt());

        let error = slot
            .require_active("host/http")
            .expect_err("init phase refuses capabilities");
        assert_eq!(
            error,
            HostError::UsedOutsideInvocation {
                capability: "host/http".to_string()
            }
        );
    }

    #[test]
    fn slot_guard_restores_idle_state_on_drop() {
        let slot = InvocationSlot::default();
        {
            let _guard = slot.enter(InvocationContext::background());
            assert!(slot.current().is_some());
        }
        assert!(slot.current().is_none());
    }

    #[test]
    fn slot_observes_cancellation_of_the_active_context() {
        let slot = InvocationSlot::default();
        let ctx = InvocationContext::background();
        let _guard = slot.enter(ctx.clone());
        assert!(!slot.should_interrupt());
        ctx.cancel();
        assert!(slot.should_interrupt());
    }
}
