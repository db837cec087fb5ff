//! Computing lock: a lease persisted on the compute node record.
//!
//! Winning [`NodeStore::try_acquire_lock`] is the only ownership signal.
//! Holders keep the lease alive by heartbeating at batch boundaries; there
//! is no timer thread. Losers poll until the holder releases or the lease
//! looks abandoned, in which case they fail without breaking the lock.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ComputeError;
use crate::node::{ComputeNode, Node, NodeId};
use crate::store::NodeStore;

/// Held computing lock. Released on drop if not released explicitly.
pub struct LockGuard {
    store: Arc<dyn NodeStore>,
    node_id: NodeId,
    node_name: String,
    execution_id: Uuid,
    released: bool,
}

impl LockGuard {
    /// Try to take the lock of `node`. `None` means someone else holds it.
    pub fn try_acquire(
        store: Arc<dyn NodeStore>,
        node: &ComputeNode,
    ) -> Result<Option<Self>, ComputeError> {
        let execution_id = Uuid::new_v4();
        if !store.try_acquire_lock(node.id, execution_id, Utc::now())? {
            debug!(node = %node.name, "computing lock held elsewhere");
            return Ok(None);
        }
        debug!(node = %node.name, execution = %execution_id, "computing lock acquired");
        Ok(Some(Self {
            store,
            node_id: node.id,
            node_name: node.name.clone(),
            execution_id,
            released: false,
        }))
    }

    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    pub fn heartbeat(&self) -> Result<(), ComputeError> {
        self.store.heartbeat(self.node_id, Utc::now())
    }

    /// A cloneable handle workers use to renew this lease.
    pub fn heartbeat_handle(&self) -> Heartbeat {
        Heartbeat {
            store: Arc::clone(&self.store),
            node_id: self.node_id,
        }
    }

    pub fn release(mut self) -> Result<(), ComputeError> {
        self.released = true;
        self.store.release_lock(self.node_id)?;
        debug!(node = %self.node_name, execution = %self.execution_id, "computing lock released");
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.store.release_lock(self.node_id) {
            warn!(node = %self.node_name, error = %e, "failed to release computing lock");
        }
    }
}

/// Lease renewal handle shared with batch workers.
#[derive(Clone)]
pub struct Heartbeat {
    store: Arc<dyn NodeStore>,
    node_id: NodeId,
}

impl Heartbeat {
    pub fn beat(&self) -> Result<(), ComputeError> {
        self.store.heartbeat(self.node_id, Utc::now())
    }
}

/// Poll until the lock of `node_id` is released.
///
/// Fails with [`ComputeError::LockTimeout`] once `max_wait` has passed since
/// the holder's last heartbeat. The stale lock is left in place. A budget
/// too large to add to a timestamp never expires.
pub fn await_release(
    store: &dyn NodeStore,
    node_id: NodeId,
    poll_interval: Duration,
    max_wait: Duration,
) -> Result<(), ComputeError> {
    let started = std::time::Instant::now();
    let budget = chrono::Duration::from_std(max_wait).ok();

    loop {
        let node = match store.get(node_id)? {
            Some(Node::Compute(node)) => node,
            Some(Node::Data(node)) => return Err(ComputeError::NotComputeNode(node.name)),
            None => return Err(ComputeError::NodeNotFound(node_id.to_string())),
        };
        if !node.lock.is_computing() {
            debug!(node = %node.name, waited_ms = started.elapsed().as_millis() as u64, "computing lock released by holder");
            return Ok(());
        }

        let last_sign_of_life = node
            .lock
            .last_heartbeat_time
            .or(node.lock.computing_started_at);
        let deadline = last_sign_of_life
            .zip(budget)
            .and_then(|(last, budget)| last.checked_add_signed(budget));
        if let (Some(last), Some(deadline)) = (last_sign_of_life, deadline) {
            if Utc::now() >= deadline {
                warn!(node = %node.name, last_heartbeat = %last, "gave up waiting for computing lock");
                return Err(ComputeError::LockTimeout {
                    node: node.name,
                    waited: started.elapsed(),
                });
            }
        }

        std::thread::sleep(poll_interval);
    }
}

/// Clear a lock left behind by a crashed holder.
pub fn force_release(store: &dyn NodeStore, node_id: NodeId) -> Result<(), ComputeError> {
    store.release_lock(node_id)?;
    info!(node = %node_id, "computing lock force-released");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::computation::SelectConfig;
    use crate::node::ComputeKind;
    use crate::store::MemoryNodeStore;

    fn setup() -> (Arc<dyn NodeStore>, ComputeNode) {
        let node = ComputeNode::new(
            "locked",
            ComputeKind::Select(SelectConfig { keys: vec!["a".into()] }),
        );
        let store: Arc<dyn NodeStore> =
            Arc::new(MemoryNodeStore::with_nodes([Node::Compute(node.clone())]));
        (store, node)
    }

    #[test]
    fn second_acquire_fails_until_release() {
        let (store, node) = setup();
        let guard = LockGuard::try_acquire(Arc::clone(&store), &node).unwrap().unwrap();
        assert!(LockGuard::try_acquire(Arc::clone(&store), &node).unwrap().is_none());
        guard.release().unwrap();
        assert!(LockGuard::try_acquire(store, &node).unwrap().is_some());
    }

    #[test]
    fn dropping_guard_releases() {
        let (store, node) = setup();
        {
            let _guard = LockGuard::try_acquire(Arc::clone(&store), &node).unwrap().unwrap();
        }
        assert!(LockGuard::try_acquire(store, &node).unwrap().is_some());
    }

    #[test]
    fn awaiter_returns_once_holder_releases() {
        let (store, node) = setup();
        let guard = LockGuard::try_acquire(Arc::clone(&store), &node).unwrap().unwrap();

        let releaser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            guard.release().unwrap();
        });
        await_release(
            store.as_ref(),
            node.id,
            Duration::from_millis(5),
            Duration::from_secs(5),
        )
        .unwrap();
        releaser.join().unwrap();
    }

    #[test]
    fn unbounded_wait_budget_does_not_overflow() {
        let (store, node) = setup();
        let guard = LockGuard::try_acquire(Arc::clone(&store), &node).unwrap().unwrap();

        let releaser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            guard.release().unwrap();
        });
        await_release(
            store.as_ref(),
            node.id,
            Duration::from_millis(5),
            Duration::from_secs(100_000_000_000_000),
        )
        .unwrap();
        releaser.join().unwrap();
    }

    #[test]
    fn timed_out_awaiter_leaves_lock_in_place() {
        let (store, node) = setup();
        let guard = LockGuard::try_acquire(Arc::clone(&store), &node).unwrap().unwrap();
        // Simulate a crashed holder: the lease is never renewed or released.
        std::mem::forget(guard);

        let err = await_release(
            store.as_ref(),
            node.id,
            Duration::from_millis(5),
            Duration::from_millis(20),
        )
        .unwrap_err();
        assert!(matches!(err, ComputeError::LockTimeout { .. }));
        assert!(LockGuard::try_acquire(Arc::clone(&store), &node).unwrap().is_none());

        force_release(store.as_ref(), node.id).unwrap();
        assert!(LockGuard::try_acquire(store, &node).unwrap().is_some());
    }
}
