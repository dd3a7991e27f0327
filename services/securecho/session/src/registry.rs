//! Set of live connection handles owned by the listener.

use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, info};

use crate::connection::{ConnectionHandle, ConnectionId, ConnectionStats, HandleState};
use crate::transport::RetryPolicy;

/// Owns every [`ConnectionHandle`] the listener spawned
#[derive(Debug)]
pub struct ConnectionRegistry {
    handles: Vec<ConnectionHandle>,
    join_grace: Duration,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::with_join_grace(RetryPolicy::default().shutdown_grace * 2)
    }
}

impl ConnectionRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty registry whose [`stop_all`](Self::stop_all) aborts workers still
    /// running `join_grace` after the stop signal
    pub fn with_join_grace(join_grace: Duration) -> Self {
        Self {
            handles: Vec::new(),
            join_grace,
        }
    }

    /// Time each worker gets to finish once stopped
    pub fn join_grace(&self) -> Duration {
        self.join_grace
    }

    /// Take ownership of a freshly spawned handle
    pub fn add(&mut self, handle: ConnectionHandle) {
        debug!("Registered connection {} from {}", handle.id(), handle.peer_addr());
        self.handles.push(handle);
    }

    /// Number of handles held, finished or not
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// True when no handles are held
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Ids of the held handles, in spawn order
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.handles.iter().map(ConnectionHandle::id).collect()
    }

    /// Current state of every held handle
    pub fn states(&self) -> Vec<(ConnectionId, HandleState)> {
        self.handles.iter().map(|h| (h.id(), h.state())).collect()
    }

    /// Look up a handle by id
    pub fn get(&self, id: ConnectionId) -> Option<&ConnectionHandle> {
        self.handles.iter().find(|h| h.id() == id)
    }

    /// Drop handles whose worker already returned; returns how many went
    pub fn reap(&mut self) -> usize {
        let before = self.handles.len();
        self.handles.retain(|h| !h.is_finished());
        let reaped = before - self.handles.len();
        if reaped > 0 {
            debug!("Reaped {} finished connections", reaped);
        }
        reaped
    }

    /// Signal every worker, wait for all of them to reach `Stopped`, then clear.
    ///
    /// A worker still running after the join grace is aborted and reported
    /// as [`EndReason::Aborted`](crate::EndReason::Aborted). Stats come back
    /// in spawn order.
    pub async fn stop_all(&mut self) -> Vec<ConnectionStats> {
        if self.handles.is_empty() {
            return Vec::new();
        }
        info!("Stopping {} connections", self.handles.len());

        for handle in &self.handles {
            handle.stop();
        }
        let handles = std::mem::take(&mut self.handles);
        let grace = self.join_grace;
        let stats = join_all(handles.into_iter().map(|h| h.join_within(grace))).await;

        info!("All {} connections stopped", stats.len());
        stats
    }
}
