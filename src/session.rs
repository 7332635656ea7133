//! Session pool: bounded, lazily-built pool of expensive execution contexts.
//!
//! Sessions are created on demand up to `max_size`, reused across tasks,
//! and only destroyed at shutdown. Acquisition hands out an RAII guard so
//! the slot is returned on every exit path, including early returns and
//! panicking callers.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::SessionError;
use crate::util::poll_until;

/// The opaque expensive handle a session wraps (a browser context, a device
/// emulator, ...). The pool never looks inside it.
#[async_trait]
pub trait SessionContext: Send + Sync {
    /// Opaque reference the collaborator uses to address this context.
    fn reference(&self) -> &str;

    /// Tear the context down. Best-effort; called once at pool shutdown.
    async fn close(&self);
}

/// Builds new session contexts when the pool grows.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create(&self, id: u32) -> Result<Box<dyn SessionContext>, SessionError>;
}

/// A pooled execution context.
pub struct Session {
    pub id: u32,
    pub context: Box<dyn SessionContext>,
    pub created_at: Instant,
}

/// Pool status snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub total: usize,
    pub in_use: usize,
    pub available: usize,
    pub max_size: usize,
}

struct Slot {
    session: Arc<Session>,
    in_use: bool,
}

struct PoolState {
    slots: Vec<Slot>,
    /// Slots reserved for sessions currently being constructed. Counts
    /// against `max_size` so concurrent acquires cannot overshoot the cap.
    building: usize,
    next_id: u32,
}

/// Bounded pool of reusable sessions.
pub struct SessionPool {
    factory: Arc<dyn SessionFactory>,
    max_size: usize,
    poll_interval: Duration,
    inner: Mutex<PoolState>,
}

enum AcquirePlan {
    Reuse(Arc<Session>),
    Build(u32),
    Wait,
}

impl SessionPool {
    pub fn new(factory: Arc<dyn SessionFactory>, max_size: usize, poll_interval: Duration) -> Self {
        Self {
            factory,
            max_size,
            poll_interval,
            inner: Mutex::new(PoolState {
                slots: Vec::new(),
                building: 0,
                next_id: 0,
            }),
        }
    }

    /// Acquire a session, waiting up to `timeout` for one to free up.
    ///
    /// Order per attempt: reuse the first idle session; otherwise build a
    /// new one while under capacity; otherwise sleep a poll interval and
    /// retry. `None` once the timeout elapses, a hard failure for this
    /// attempt, retried only on a later batch pass.
    pub async fn acquire(self: &Arc<Self>, timeout: Duration) -> Option<SessionGuard> {
        poll_until(timeout, self.poll_interval, || self.try_acquire()).await
    }

    async fn try_acquire(self: &Arc<Self>) -> Option<SessionGuard> {
        let plan = {
            let mut state = self.inner.lock().expect("session pool poisoned");
            if let Some(slot) = state.slots.iter_mut().find(|s| !s.in_use) {
                slot.in_use = true;
                AcquirePlan::Reuse(Arc::clone(&slot.session))
            } else if state.slots.len() + state.building < self.max_size {
                state.building += 1;
                let id = state.next_id;
                state.next_id += 1;
                AcquirePlan::Build(id)
            } else {
                AcquirePlan::Wait
            }
        };

        match plan {
            AcquirePlan::Reuse(session) => {
                debug!(id = session.id, "Reusing session");
                Some(SessionGuard {
                    pool: Arc::clone(self),
                    session,
                })
            }
            AcquirePlan::Build(id) => {
                info!(id, "Creating session");
                match self.factory.create(id).await {
                    Ok(context) => {
                        let session = Arc::new(Session {
                            id,
                            context,
                            created_at: Instant::now(),
                        });
                        let mut state = self.inner.lock().expect("session pool poisoned");
                        state.building -= 1;
                        state.slots.push(Slot {
                            session: Arc::clone(&session),
                            in_use: true,
                        });
                        Some(SessionGuard {
                            pool: Arc::clone(self),
                            session,
                        })
                    }
                    Err(e) => {
                        // Surrender the reservation and let the poll loop
                        // retry until the timeout decides.
                        self.inner.lock().expect("session pool poisoned").building -= 1;
                        warn!(id, error = %e, "Session creation failed");
                        None
                    }
                }
            }
            AcquirePlan::Wait => None,
        }
    }

    fn release_slot(&self, id: u32) {
        let mut state = self.inner.lock().expect("session pool poisoned");
        if let Some(slot) = state.slots.iter_mut().find(|s| s.session.id == id) {
            slot.in_use = false;
            debug!(id, "Session returned to pool");
        }
    }

    /// Force-destroy every tracked session. Shutdown only, best-effort.
    pub async fn close_all(&self) {
        let sessions: Vec<Arc<Session>> = {
            let mut state = self.inner.lock().expect("session pool poisoned");
            state.slots.drain(..).map(|s| s.session).collect()
        };
        for session in sessions {
            session.context.close().await;
            info!(id = session.id, "Session closed");
        }
    }

    pub fn stats(&self) -> SessionStats {
        let state = self.inner.lock().expect("session pool poisoned");
        let in_use = state.slots.iter().filter(|s| s.in_use).count();
        SessionStats {
            total: state.slots.len(),
            in_use,
            available: state.slots.len() - in_use,
            max_size: self.max_size,
        }
    }
}

/// RAII handle to an acquired session. Dropping it returns the slot.
pub struct SessionGuard {
    pool: Arc<SessionPool>,
    session: Arc<Session>,
}

impl SessionGuard {
    pub fn session(&self) -> &Session {
        &self.session
    }
}

impl std::ops::Deref for SessionGuard {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.session
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.pool.release_slot(self.session.id);
    }
}
