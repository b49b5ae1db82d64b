//! Session store, admission control and idle reaping
//!
//! The map of open sessions and the "still accepting" flag live behind one
//! mutex, so the open-session count is always the map's length and a
//! capacity check can never race an insert. Engines are closed after the
//! lock is released.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::{Engine, SessionFactory};

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Client sent an explicit termination request
    Client,
    /// Idle longer than the timeout
    Idle,
    /// Process shutdown
    Drain,
    /// The engine closed itself
    Engine,
    /// The initialization exchange failed
    InitFailed,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Client => "client",
            Self::Idle => "idle",
            Self::Drain => "drain",
            Self::Engine => "engine",
            Self::InitFailed => "init_failed",
        })
    }
}

/// Why a new session was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionError {
    /// Open-session count is at the configured maximum
    AtCapacity {
        /// Sessions open at the time of the check
        active: usize,
    },
    /// Shutdown drain has started
    ShuttingDown,
}

struct SessionEntry {
    engine: Arc<Engine>,
    last_activity: Instant,
}

struct StoreState {
    sessions: HashMap<Uuid, SessionEntry>,
    accepting: bool,
}

/// In-memory registry of open sessions
pub struct SessionStore {
    state: Mutex<StoreState>,
    factory: SessionFactory,
    max_sessions: usize,
}

impl SessionStore {
    /// Create an empty store admitting at most `max_sessions` sessions
    pub fn new(factory: SessionFactory, max_sessions: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(StoreState {
                sessions: HashMap::new(),
                accepting: true,
            }),
            factory,
            max_sessions,
        })
    }

    /// Admit a new session.
    ///
    /// Capacity is checked before the engine is built, and the check, the
    /// build and the insert happen under one lock. The returned id resolves
    /// through [`get`](Self::get) as soon as this returns.
    pub fn admit(self: &Arc<Self>) -> Result<(Uuid, Arc<Engine>), AdmissionError> {
        let (id, engine, active) = {
            let mut state = self.state.lock();
            if !state.accepting {
                return Err(AdmissionError::ShuttingDown);
            }
            let active = state.sessions.len();
            if active >= self.max_sessions {
                return Err(AdmissionError::AtCapacity { active });
            }

            let id = Uuid::new_v4();
            let engine = Arc::new(self.factory.create(Some(id.to_string())));
            state.sessions.insert(
                id,
                SessionEntry {
                    engine: Arc::clone(&engine),
                    last_activity: Instant::now(),
                },
            );
            (id, engine, active + 1)
        };

        debug!(session_id = %id, active_sessions = active, "Session admitted");
        self.watch_engine(id, &engine);
        Ok((id, engine))
    }

    /// Remove the entry once its engine closes, whoever closed it
    fn watch_engine(self: &Arc<Self>, id: Uuid, engine: &Arc<Engine>) {
        let store: Weak<Self> = Arc::downgrade(self);
        let engine = Arc::downgrade(engine);
        tokio::spawn(async move {
            let Some(signal) = engine.upgrade().map(|e| e.close_signal()) else {
                return;
            };
            signal.cancelled().await;
            if let Some(store) = store.upgrade() {
                store.remove(id, CloseReason::Engine);
            }
        });
    }

    /// Look up an open session and bump its activity timestamp
    pub fn get(&self, id: &Uuid) -> Option<Arc<Engine>> {
        let mut state = self.state.lock();
        let entry = state.sessions.get_mut(id)?;
        entry.last_activity = Instant::now();
        Some(Arc::clone(&entry.engine))
    }

    /// Whether `id` names an open session. Does not count as activity.
    pub fn contains(&self, id: &Uuid) -> bool {
        self.state.lock().sessions.contains_key(id)
    }

    /// Remove a session and close its engine.
    ///
    /// Returns `false` when the session was already gone, so a second
    /// termination is a no-op.
    pub fn remove(&self, id: Uuid, reason: CloseReason) -> bool {
        let (entry, active) = {
            let mut state = self.state.lock();
            let entry = state.sessions.remove(&id);
            (entry, state.sessions.len())
        };

        let Some(entry) = entry else {
            return false;
        };
        close_engine(id, &entry.engine, reason);
        info!(
            session_id = %id,
            reason = %reason,
            active_sessions = active,
            "Session closed"
        );
        true
    }

    /// Close and remove every session idle for longer than `idle_timeout`.
    /// Returns how many were reaped.
    pub fn reap_idle(&self, idle_timeout: Duration) -> usize {
        let expired: Vec<(Uuid, SessionEntry)> = {
            let mut state = self.state.lock();
            let ids: Vec<Uuid> = state
                .sessions
                .iter()
                .filter(|(_, e)| e.last_activity.elapsed() > idle_timeout)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| state.sessions.remove(&id).map(|e| (id, e)))
                .collect()
        };

        for (id, entry) in &expired {
            close_engine(*id, &entry.engine, CloseReason::Idle);
            info!(session_id = %id, reason = %CloseReason::Idle, "Session closed");
        }
        expired.len()
    }

    /// Stop admitting, close every open session and empty the store.
    /// Returns how many sessions were closed.
    pub fn drain(&self) -> usize {
        let drained: Vec<(Uuid, SessionEntry)> = {
            let mut state = self.state.lock();
            state.accepting = false;
            state.sessions.drain().collect()
        };

        for (id, entry) in &drained {
            close_engine(*id, &entry.engine, CloseReason::Drain);
        }
        info!(closed = drained.len(), "Sessions drained");
        drained.len()
    }

    /// Number of open sessions
    pub fn len(&self) -> usize {
        self.state.lock().sessions.len()
    }

    /// Whether no session is open
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether new sessions are still admitted
    pub fn is_accepting(&self) -> bool {
        self.state.lock().accepting
    }

    /// Configured admission cap
    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }
}

/// Close one engine. Never fails the surrounding sweep.
fn close_engine(id: Uuid, engine: &Engine, reason: CloseReason) {
    if reason == CloseReason::Engine {
        return;
    }
    if !engine.close() {
        warn!(session_id = %id, reason = %reason, "Engine was already closed");
    }
}

/// Spawn the idle reaper. It ticks every `interval` until `shutdown` fires.
pub fn spawn_reaper(
    store: Arc<SessionStore>,
    interval: Duration,
    idle_timeout: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reaped = store.reap_idle(idle_timeout);
                    if reaped > 0 {
                        info!(reaped, active_sessions = store.len(), "Idle sessions reaped");
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Idle reaper stopped");
                    break;
                }
            }
        }
    })
}
