//! Cooperative shutdown: `Running → Draining → Stopped`.
//!
//! The first interrupt moves to `Draining`: no new batch is admitted and the
//! in-flight batch gets up to `grace` to finish. A second interrupt escalates:
//! state goes straight to `Stopped` with `escalated` set and the in-flight batch is
//! abandoned. Cloning yields another handle to the same state.

use crate::checkpoint::CheckpointStore;
use crate::error::PipelineResult;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    Draining,
    Stopped,
}

struct Inner {
    state: ShutdownState,
    draining_since: Option<Instant>,
    escalated: bool,
}

#[derive(Clone)]
pub struct ShutdownCoordinator {
    shared: Arc<(Mutex<Inner>, Condvar)>,
    grace: Duration,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl ShutdownCoordinator {
    pub fn new(grace: Duration) -> Self {
        let inner = Inner { state: ShutdownState::Running, draining_since: None, escalated: false };
        Self { shared: Arc::new((Mutex::new(inner), Condvar::new())), grace }
    }

    pub fn grace_period(&self) -> Duration {
        self.grace
    }

    pub fn state(&self) -> ShutdownState {
        self.shared.0.lock().state
    }

    pub fn is_running(&self) -> bool {
        self.state() == ShutdownState::Running
    }

    /// True once a second interrupt asked for an immediate stop.
    pub fn is_escalated(&self) -> bool {
        self.shared.0.lock().escalated
    }

    /// Handle an interruption signal; returns the new state.
    pub fn interrupt(&self) -> ShutdownState {
        let (lock, cv) = &*self.shared;
        let mut g = lock.lock();
        match g.state {
            ShutdownState::Running => {
                g.state = ShutdownState::Draining;
                g.draining_since = Some(Instant::now());
                tracing::info!("interrupt received: draining in-flight batch (grace {:?}); interrupt again to stop now", self.grace);
            }
            ShutdownState::Draining => {
                g.state = ShutdownState::Stopped;
                g.escalated = true;
                tracing::warn!("second interrupt: stopping without waiting for the in-flight batch");
            }
            ShutdownState::Stopped => {}
        }
        cv.notify_all();
        g.state
    }

    /// Deadline for the in-flight batch while draining.
    pub fn drain_deadline(&self) -> Option<Instant> {
        let g = self.shared.0.lock();
        match g.state {
            ShutdownState::Draining => g.draining_since.map(|t| t + self.grace),
            _ => None,
        }
    }

    /// Sleep for `dur` unless an escalated stop arrives first.
    /// Returns false if woken by escalation.
    pub fn sleep_unless_escalated(&self, dur: Duration) -> bool {
        let (lock, cv) = &*self.shared;
        let deadline = Instant::now() + dur;
        let mut g = lock.lock();
        while !g.escalated {
            if cv.wait_until(&mut g, deadline).timed_out() {
                return !g.escalated;
            }
        }
        false
    }

    /// Flush the checkpoint and move to `Stopped`.
    pub fn stop(&self, store: &mut CheckpointStore) -> PipelineResult<()> {
        let res = store.flush();
        let (lock, cv) = &*self.shared;
        let mut g = lock.lock();
        if g.state != ShutdownState::Stopped {
            g.state = ShutdownState::Stopped;
            tracing::debug!("shutdown coordinator stopped");
        }
        cv.notify_all();
        res
    }

    /// Listen for SIGINT (and SIGTERM on unix) on a helper thread, feeding each
    /// one into `interrupt()`. The thread exits once the state reaches `Stopped`.
    pub fn spawn_signal_listener(&self) -> std::io::Result<JoinHandle<()>> {
        let coordinator = self.clone();
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
        std::thread::Builder::new().name("mailconv-signals".into()).spawn(move || {
            rt.block_on(async move {
                #[cfg(unix)]
                let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(s) => Some(s),
                    Err(e) => {
                        tracing::warn!("cannot listen for SIGTERM: {}", e);
                        None
                    }
                };
                loop {
                    #[cfg(unix)]
                    let received = match term.as_mut() {
                        Some(term) => tokio::select! {
                            r = tokio::signal::ctrl_c() => r.is_ok(),
                            _ = term.recv() => true,
                        },
                        None => tokio::signal::ctrl_c().await.is_ok(),
                    };
                    #[cfg(not(unix))]
                    let received = tokio::signal::ctrl_c().await.is_ok();

                    if !received {
                        tracing::warn!("signal listener failed; interrupts will not be handled");
                        break;
                    }
                    if coordinator.interrupt() == ShutdownState::Stopped {
                        break;
                    }
                }
            });
        })
    }
}
