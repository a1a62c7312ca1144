//! Shutdown coordinator (C11).
//!
//! An explicit ordered-teardown type, named in the component overview but left underspecified in
//! §4: it cancels every turn it's tracking, gives each a grace period to wind down cooperatively
//! (via the same [`CancellationToken`] §5's per-turn cancellation already threads through
//! [`TurnLoop`](crate::runtime::turn_loop::TurnLoop)), forcibly aborts whatever's still running
//! past that, then tears down external resources — SSE subscriber registries, tool providers that
//! hold their own connections — in the order they were registered.
//!
//! Grounded in the teacher's per-protocol `shutdown(&mut self)` hook (`tool_protocol::ToolProtocol`,
//! `tool_protocols.rs`, `resource_protocol.rs`), generalized from "one protocol tears itself down"
//! to "the process tears down every protocol/subscriber registry it owns", plus the §5 cancellation
//! semantics generalized from one turn to every turn in flight.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::runtime::turn_loop::CancellationToken;

/// An external resource the coordinator tears down during shutdown: an SSE subscriber registry,
/// a tool provider holding a persistent connection, anything else a host wants torn down in a
/// known order rather than left to `Drop`.
#[async_trait]
pub trait Shutdownable: Send + Sync {
    async fn shutdown(&self);
}

struct TrackedTurn {
    cancellation: CancellationToken,
    handle: JoinHandle<()>,
}

/// Coordinates ordered teardown of in-flight turns and registered external resources.
///
/// Tasks and resources are accumulated via [`ShutdownCoordinator::track_turn`] and
/// [`ShutdownCoordinator::register_resource`] as the host spins them up; [`ShutdownCoordinator::shutdown`]
/// is the single ordered teardown entry point, intended to run once during process shutdown.
#[derive(Default)]
pub struct ShutdownCoordinator {
    turns: Mutex<Vec<TrackedTurn>>,
    resources: Mutex<Vec<Box<dyn Shutdownable>>>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        ShutdownCoordinator::default()
    }

    /// Track one turn's cancellation token and its driving task handle, so
    /// [`ShutdownCoordinator::shutdown`] can cancel and, if necessary, abort it.
    pub fn track_turn(&self, cancellation: CancellationToken, handle: JoinHandle<()>) {
        self.turns.lock().unwrap().push(TrackedTurn { cancellation, handle });
    }

    /// Register an external resource to be torn down after every turn has stopped, in
    /// registration order.
    pub fn register_resource(&self, resource: Box<dyn Shutdownable>) {
        self.resources.lock().unwrap().push(resource);
    }

    /// Ordered teardown (§5, generalized per SPEC_FULL B.2):
    /// 1. Signal cancellation to every tracked turn (aborts in-flight provider HTTP calls and
    ///    tool executions cooperatively, per §5).
    /// 2. Wait up to `grace_period` for each turn's task to finish on its own.
    /// 3. Forcibly abort whatever is still running past the grace period.
    /// 4. Shut down every registered resource, in registration order.
    pub async fn shutdown(&self, grace_period: Duration) {
        let turns = std::mem::take(&mut *self.turns.lock().unwrap());
        for turn in &turns {
            turn.cancellation.cancel();
        }

        let mut pending: Vec<JoinHandle<()>> = Vec::new();
        for turn in turns {
            pending.push(turn.handle);
        }

        let _ = tokio::time::timeout(grace_period, join_all_ignoring_errors(&mut pending)).await;
        for handle in pending {
            if !handle.is_finished() {
                log::warn!("turn task did not stop within the grace period, aborting");
                handle.abort();
            }
        }

        let resources = std::mem::take(&mut *self.resources.lock().unwrap());
        for resource in resources {
            resource.shutdown().await;
        }
    }
}

/// Await every handle in `handles`, tolerating individual task panics/cancellation (a turn task
/// that already aborted or panicked shouldn't stop teardown of the rest).
async fn join_all_ignoring_errors(handles: &mut [JoinHandle<()>]) {
    for handle in handles.iter_mut() {
        let _ = handle.await;
    }
}
