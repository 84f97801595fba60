use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex};

use mh_core::HostError;

use crate::builder::Builder;
use crate::runner::Runner;

/// A fixed set of independent Runners built up front from one Builder.
/// Acquisition blocks when every runner is checked out, which bounds the
/// number of concurrent invocations to the pool size.
pub struct RunnerPool {
    inner: Arc<PoolInner>,
    size: usize,
}

struct PoolInner {
    runners: Mutex<Vec<Runner>>,
    available: Condvar,
}

impl RunnerPool {
    pub fn build(builder: &Builder, size: usize) -> Result<Self, HostError> {
        let mut runners = Vec::with_capacity(size);
        for _ in 0..size {
            runners.push(builder.build()?);
        }
        Ok(Self {
            inner: Arc::new(PoolInner {
                runners: Mutex::new(runners),
                available: Condvar::new(),
            }),
            size,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Checks a runner out, blocking until one is free. The runner returns
    /// to the pool when the handle drops, including during unwinding.
    pub fn acquire(&self) -> PooledRunner {
        let mut runners = self
            .inner
            .runners
            .lock()
            .expect("pool lock should not be poisoned");
        loop {
            if let Some(runner) = runners.pop() {
                return PooledRunner {
                    runner: Some(runner),
                    pool: Arc::clone(&self.inner),
                };
            }
            runners = self
                .inner
                .available
                .wait(runners)
                .expect("pool lock should not be poisoned");
        }
    }

    /// Non-blocking variant; `None` when the pool is exhausted.
    pub fn try_acquire(&self) -> Option<PooledRunner> {
        let mut runners = self
            .inner
            .runners
            .lock()
            .expect("pool lock should not be poisoned");
        runners.pop().map(|runner| PooledRunner {
            runner: Some(runner),
            pool: Arc::clone(&self.inner),
        })
    }
}

/// Scoped checkout of one pooled Runner.
pub struct PooledRunner {
    runner: Option<Runner>,
    pool: Arc<PoolInner>,
}

impl Deref for PooledRunner {
    type Target = Runner;

    fn deref(&self) -> &Runner {
        self.runner.as_ref().expect("runner present until drop")
    }
}

impl DerefMut for PooledRunner {
    fn deref_mut(&mut self) -> &mut Runner {
        self.runner.as_mut().expect("runner present until drop")
    }
}

impl Drop for PooledRunner {
    fn drop(&mut self) {
        if let Some(runner) = self.runner.take() {
            let mut runners = match self.pool.runners.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            runners.push(runner);
            self.pool.available.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::BuildOptions;
    use crate::registry::CapabilityRegistry;
    use crate::store::MemoryFileStore;
    use mh_core::{HostValue, InvocationContext};
    use std::time::Duration;

    fn pool_of(size: usize) -> RunnerPool {
        let mut builder = Builder::new(
            Arc::new(MemoryFileStore::new()),
            Arc::new(CapabilityRegistry::with_defaults()),
            BuildOptions::default(),
        )
        .expect("builder options are valid");
        builder
            .compile("main.rhai", r#"exports["default"] = |arg| arg + 1.0;"#)
            .expect("main compiles");
        RunnerPool::build(&builder, size).expect("pool builds")
    }

    #[test]
    fn acquired_runners_execute_independently() {
        let pool = pool_of(2);
        let first = pool.acquire();
        let second = pool.acquire();
        let ctx = InvocationContext::background();
        assert_eq!(
            first
                .run_default(&ctx, HostValue::Number(1.0))
                .expect("first runs"),
            HostValue::Number(2.0)
        );
        assert_eq!(
            second
                .run_default(&ctx, HostValue::Number(2.0))
                .expect("second runs"),
            HostValue::Number(3.0)
        );
    }

    #[test]
    fn exhausted_pool_refuses_non_blocking_acquisition() {
        let pool = pool_of(1);
        let held = pool.try_acquire().expect("one runner is free");
        assert!(pool.try_acquire().is_none());
        drop(held);
        assert!(pool.try_acquire().is_some());
    }

    #[test]
    fn blocking_acquisition_wakes_when_a_runner_returns() {
        let pool = Arc::new(pool_of(1));
        let held = pool.acquire();

        let waiter = {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || {
                let runner = pool.acquire();
                runner
                    .run_default(&InvocationContext::background(), HostValue::Number(41.0))
                    .expect("runner works after handoff")
            })
        };

        std::thread::sleep(Duration::from_millis(20));
        drop(held);
        assert_eq!(
            waiter.join().expect("waiter finishes"),
            HostValue::Number(42.0)
        );
    }

    #[test]
    fn runners_survive_a_panicking_borrower() {
        let pool = Arc::new(pool_of(1));
        let crasher = {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || {
                let _runner = pool.acquire();
                panic!("borrower crashed");
            })
        };
        assert!(crasher.join().is_err());
        // The runner was released during unwinding.
        assert!(pool.try_acquire().is_some());
    }
}
