//! Bounded pool of reusable script engines.
//!
//! The pool holds at most `pool_size` engines. Acquiring waits for a slot with
//! a timeout; pool exhaustion therefore surfaces as [`Error::Timeout`] rather
//! than unbounded queueing. Engines are reused across executions, and an
//! engine that has already been handed out more than `max_engine_uses` times
//! is discarded and rebuilt on its next acquire.

use std::ops::Deref;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use tokenweave_core::config::SandboxConfig;
use tokenweave_core::{Error, Result};

use crate::engine::{HostCapabilities, ScriptEngine};

pub struct SandboxPool {
    semaphore: Arc<Semaphore>,
    free: Mutex<Vec<ScriptEngine>>,
    capabilities: HostCapabilities,
    config: SandboxConfig,
}

impl SandboxPool {
    pub fn new(capabilities: HostCapabilities, config: SandboxConfig) -> Arc<Self> {
        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(config.pool_size)),
            free: Mutex::new(Vec::new()),
            capabilities,
            config,
        })
    }

    /// Wait for a free slot and hand out an engine. The engine returns to the
    /// pool when the handle is dropped.
    pub async fn acquire(self: &Arc<Self>) -> Result<EngineHandle> {
        let permit = tokio::time::timeout(
            Duration::from_millis(self.config.acquire_timeout_ms),
            Arc::clone(&self.semaphore).acquire_owned(),
        )
        .await
        .map_err(|_| Error::timeout("sandbox pool exhausted"))?
        .map_err(|_| Error::internal("sandbox pool closed"))?;

        let mut engine = self.take_or_build()?;
        engine.begin_use();

        Ok(EngineHandle {
            engine: Some(engine),
            _permit: permit,
            pool: Arc::clone(self),
        })
    }

    fn take_or_build(&self) -> Result<ScriptEngine> {
        let recycled = {
            let mut free = self
                .free
                .lock()
                .map_err(|_| Error::internal("sandbox pool poisoned"))?;
            free.pop()
        };
        match recycled {
            Some(engine) if engine.uses() <= self.config.max_engine_uses => Ok(engine),
            Some(worn) => {
                tracing::debug!(uses = worn.uses(), "discarding worn sandbox engine");
                drop(worn);
                Ok(ScriptEngine::new(&self.capabilities, &self.config))
            }
            None => Ok(ScriptEngine::new(&self.capabilities, &self.config)),
        }
    }

    fn release(&self, engine: ScriptEngine) {
        if let Ok(mut free) = self.free.lock() {
            free.push(engine);
        }
    }
}

/// An engine on loan from the pool. Dropping it releases both the engine and
/// the pool slot.
pub struct EngineHandle {
    engine: Option<ScriptEngine>,
    _permit: OwnedSemaphorePermit,
    pool: Arc<SandboxPool>,
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle").finish_non_exhaustive()
    }
}

impl Deref for EngineHandle {
    type Target = ScriptEngine;

    fn deref(&self) -> &ScriptEngine {
        match &self.engine {
            Some(engine) => engine,
            // The engine is only taken in Drop.
            None => unreachable!("engine handle used after drop"),
        }
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        if let Some(engine) = self.engine.take() {
            self.pool.release(engine);
        }
    }
}
