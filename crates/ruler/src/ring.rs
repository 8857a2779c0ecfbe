//! Consistent-hash membership ring.
//!
//! Instances register a set of tokens in a 32-bit hash space and keep
//! themselves alive with heartbeats. Ownership of a key is decided by
//! hashing it into the token space and walking clockwise to the first
//! healthy instance. The [`Membership`] registry is authoritative: an
//! instance that stops heartbeating past the grace period is excluded
//! from ownership computation even though its tokens are still present,
//! and must stop its local schedulers once it observes the loss.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::watch;

/// Hash a key into the ring's token space.
pub fn hash_key(key: &str) -> u32 {
    let digest = Sha256::digest(key.as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceDesc {
    pub id: String,
    pub addr: String,
    pub tokens: Vec<u32>,
    pub last_heartbeat: DateTime<Utc>,
}

/// Read-only view of the ring exposed on the debug page.
#[derive(Debug, Clone, Serialize)]
pub struct RingSnapshot {
    pub topology_version: u64,
    pub instances: Vec<RingInstance>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RingInstance {
    pub id: String,
    pub addr: String,
    pub num_tokens: usize,
    pub healthy: bool,
    pub last_heartbeat: DateTime<Utc>,
}

#[derive(Default)]
struct RingState {
    instances: HashMap<String, InstanceDesc>,
    version: u64,
}

/// Authoritative membership registry shared by every instance handle.
pub struct Membership {
    state: RwLock<RingState>,
    changes: watch::Sender<u64>,
    heartbeat_grace: Duration,
}

impl Membership {
    pub fn new(heartbeat_grace: Duration) -> Arc<Self> {
        let (changes, _) = watch::channel(0);
        Arc::new(Self {
            state: RwLock::new(RingState::default()),
            changes,
            heartbeat_grace,
        })
    }

    /// Register an instance with `num_tokens` tokens derived
    /// deterministically from its id. Re-registering refreshes the
    /// heartbeat and address.
    pub fn register(&self, id: &str, addr: &str, num_tokens: usize) -> crate::Result<()> {
        if num_tokens == 0 {
            return Err(crate::Error::Ring(format!(
                "instance {id} must register at least one token"
            )));
        }
        let tokens: Vec<u32> = (0..num_tokens)
            .map(|i| hash_key(&format!("{id}/{i}")))
            .collect();
        let mut state = self.write_state();
        state.instances.insert(
            id.to_string(),
            InstanceDesc {
                id: id.to_string(),
                addr: addr.to_string(),
                tokens,
                last_heartbeat: Utc::now(),
            },
        );
        self.bump(&mut state);
        Ok(())
    }

    pub fn deregister(&self, id: &str) {
        let mut state = self.write_state();
        if state.instances.remove(id).is_some() {
            self.bump(&mut state);
        }
    }

    pub fn heartbeat(&self, id: &str) -> crate::Result<()> {
        let mut state = self.write_state();
        match state.instances.get_mut(id) {
            Some(desc) => {
                desc.last_heartbeat = Utc::now();
                Ok(())
            }
            None => Err(crate::Error::Ring(format!(
                "instance {id} is not registered"
            ))),
        }
    }

    /// First `replicas` healthy instances walking clockwise from the
    /// key's position in the token space.
    pub fn owners(&self, key: &str, replicas: usize) -> Vec<InstanceDesc> {
        let hash = hash_key(key);
        let now = Utc::now();
        let state = self.read_state();

        let mut tokens: Vec<(u32, &InstanceDesc)> = state
            .instances
            .values()
            .filter(|desc| self.is_healthy(desc, now))
            .flat_map(|desc| desc.tokens.iter().map(move |t| (*t, desc)))
            .collect();
        if tokens.is_empty() {
            return Vec::new();
        }
        tokens.sort_by_key(|(t, _)| *t);

        let start = tokens.partition_point(|(t, _)| *t < hash);
        let mut owners: Vec<InstanceDesc> = Vec::with_capacity(replicas);
        for i in 0..tokens.len() {
            let (_, desc) = tokens[(start + i) % tokens.len()];
            if owners.iter().any(|o| o.id == desc.id) {
                continue;
            }
            owners.push(desc.clone());
            if owners.len() == replicas {
                break;
            }
        }
        owners
    }

    pub fn topology_version(&self) -> u64 {
        self.read_state().version
    }

    /// Change-notification stream carrying the topology version.
    pub fn watch(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    pub fn snapshot(&self) -> RingSnapshot {
        let now = Utc::now();
        let state = self.read_state();
        let mut instances: Vec<RingInstance> = state
            .instances
            .values()
            .map(|desc| RingInstance {
                id: desc.id.clone(),
                addr: desc.addr.clone(),
                num_tokens: desc.tokens.len(),
                healthy: self.is_healthy(desc, now),
                last_heartbeat: desc.last_heartbeat,
            })
            .collect();
        instances.sort_by(|a, b| a.id.cmp(&b.id));
        RingSnapshot {
            topology_version: state.version,
            instances,
        }
    }

    /// Addresses of healthy instances other than `exclude`, for query fan-out.
    pub fn peer_addrs(&self, exclude: &str) -> Vec<String> {
        let now = Utc::now();
        let state = self.read_state();
        let mut addrs: Vec<String> = state
            .instances
            .values()
            .filter(|desc| desc.id != exclude && self.is_healthy(desc, now))
            .map(|desc| desc.addr.clone())
            .collect();
        addrs.sort();
        addrs
    }

    fn is_healthy(&self, desc: &InstanceDesc, now: DateTime<Utc>) -> bool {
        let grace = chrono::Duration::from_std(self.heartbeat_grace)
            .unwrap_or_else(|_| chrono::Duration::seconds(i64::MAX / 1_000));
        now - desc.last_heartbeat <= grace
    }

    fn bump(&self, state: &mut RingState) {
        state.version += 1;
        let _ = self.changes.send(state.version);
        crate::metrics::RING_TOPOLOGY_VERSION.set(state.version as i64);
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, RingState> {
        // Lock poisoning only happens if a holder panicked; the ring
        // state itself is always internally consistent.
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, RingState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// One instance's connection to the ring.
pub struct RingHandle {
    membership: Arc<Membership>,
    instance_id: String,
}

impl RingHandle {
    /// Join the ring. Failure here is the only process-fatal condition
    /// in the service.
    pub fn join(
        membership: Arc<Membership>,
        instance_id: &str,
        addr: &str,
        num_tokens: usize,
    ) -> crate::Result<Self> {
        membership.register(instance_id, addr, num_tokens)?;
        tracing::info!(instance = instance_id, num_tokens, "joined membership ring");
        Ok(Self {
            membership,
            instance_id: instance_id.to_string(),
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn membership(&self) -> &Arc<Membership> {
        &self.membership
    }

    /// Single-owner semantics: does this instance own `key` right now?
    pub fn owns(&self, key: &str) -> bool {
        self.membership
            .owners(key, 1)
            .first()
            .is_some_and(|desc| desc.id == self.instance_id)
    }

    /// Keep this instance alive in the registry until the returned task
    /// is aborted.
    pub fn spawn_heartbeat(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let membership = self.membership.clone();
        let id = self.instance_id.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = membership.heartbeat(&id) {
                    tracing::warn!(instance = %id, error = %e, "heartbeat failed");
                }
            }
        })
    }

    pub fn leave(&self) {
        self.membership.deregister(&self.instance_id);
        tracing::info!(instance = %self.instance_id, "left membership ring");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(grace_secs: u64) -> Arc<Membership> {
        Membership::new(Duration::from_secs(grace_secs))
    }

    #[test]
    fn single_instance_owns_everything() {
        let membership = ring(30);
        membership.register("ruler-1", "http://a", 16).unwrap();
        for key in ["user1/ns/g1", "user2/ns/g2", "user3/ns/g3"] {
            let owners = membership.owners(key, 1);
            assert_eq!(owners.len(), 1);
            assert_eq!(owners[0].id, "ruler-1");
        }
    }

    #[test]
    fn ownership_is_deterministic() {
        let membership = ring(30);
        membership.register("ruler-1", "http://a", 64).unwrap();
        membership.register("ruler-2", "http://b", 64).unwrap();
        let first = membership.owners("user1/ns/g1", 1);
        for _ in 0..10 {
            assert_eq!(membership.owners("user1/ns/g1", 1)[0].id, first[0].id);
        }
    }

    #[test]
    fn keys_spread_across_instances() {
        let membership = ring(30);
        membership.register("ruler-1", "http://a", 64).unwrap();
        membership.register("ruler-2", "http://b", 64).unwrap();
        let mut owned = std::collections::HashSet::new();
        for i in 0..100 {
            let owners = membership.owners(&format!("tenant-{i}/ns/group"), 1);
            owned.insert(owners[0].id.clone());
        }
        assert_eq!(owned.len(), 2, "both instances should own some keys");
    }

    #[test]
    fn unhealthy_instance_is_skipped() {
        let membership = ring(0); // everything is immediately past grace
        membership.register("ruler-1", "http://a", 16).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert!(membership.owners("user1/ns/g1", 1).is_empty());
    }

    #[test]
    fn failed_instance_hands_off_to_survivor() {
        let membership = ring(30);
        membership.register("ruler-1", "http://a", 64).unwrap();
        membership.register("ruler-2", "http://b", 64).unwrap();

        // Find a key owned by ruler-1, then remove ruler-1.
        let key = (0..200)
            .map(|i| format!("tenant-{i}/ns/group"))
            .find(|k| membership.owners(k, 1)[0].id == "ruler-1")
            .expect("some key must map to ruler-1");
        membership.deregister("ruler-1");

        let owners = membership.owners(&key, 1);
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].id, "ruler-2");
    }

    #[test]
    fn topology_version_is_monotonic() {
        let membership = ring(30);
        let v0 = membership.topology_version();
        membership.register("ruler-1", "http://a", 4).unwrap();
        let v1 = membership.topology_version();
        membership.register("ruler-2", "http://b", 4).unwrap();
        let v2 = membership.topology_version();
        membership.deregister("ruler-1");
        let v3 = membership.topology_version();
        assert!(v0 < v1 && v1 < v2 && v2 < v3);
    }

    #[tokio::test]
    async fn watch_observes_changes() {
        let membership = ring(30);
        let mut rx = membership.watch();
        membership.register("ruler-1", "http://a", 4).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), membership.topology_version());
    }

    #[test]
    fn handle_owns_only_what_the_ring_assigns() {
        let membership = ring(30);
        let h1 = RingHandle::join(membership.clone(), "ruler-1", "http://a", 64).unwrap();
        let h2 = RingHandle::join(membership.clone(), "ruler-2", "http://b", 64).unwrap();
        for i in 0..50 {
            let key = format!("tenant-{i}/ns/group");
            assert_ne!(h1.owns(&key), h2.owns(&key), "exactly one owner for {key}");
        }
    }

    #[test]
    fn replicas_are_distinct_instances() {
        let membership = ring(30);
        membership.register("ruler-1", "http://a", 64).unwrap();
        membership.register("ruler-2", "http://b", 64).unwrap();
        let owners = membership.owners("user1/ns/g1", 2);
        assert_eq!(owners.len(), 2);
        assert_ne!(owners[0].id, owners[1].id);
    }
}
