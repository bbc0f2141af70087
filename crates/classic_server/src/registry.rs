//! The live peer registry and packet fan-out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::debug;

/// Size of the wire id space. Assigned ids are always in `0..MAX_PEERS`, so
/// the 255 sentinel the protocol reserves for "self" can never collide with a
/// live peer.
pub(crate) const MAX_PEERS: usize = 128;

/// Key of one live connection. Monotonic and never reused, unlike wire ids.
pub(crate) type ConnectionId = u64;

/// Record of one live peer.
struct Peer {
    name: String,
    wire_id: u8,
    authenticated: bool,
    /// Feeds the peer's writer task. Closed or full means the peer is dead.
    outgoing: flume::Sender<Bytes>,
    /// Hands a kick reason to the peer's own worker.
    control: flume::Sender<String>,
}

#[derive(Default)]
pub(crate) struct PeerRegistry {
    next_key: AtomicU64,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    peers: HashMap<ConnectionId, Peer>,
    next_wire_id: u8,
}

impl PeerRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Admits a peer under the next free wire id, rotating through the
    /// 128-slot space. Returns `None` when every slot is taken.
    pub(crate) fn register(
        &self,
        name: String,
        outgoing: flume::Sender<Bytes>,
        control: flume::Sender<String>,
    ) -> Option<(ConnectionId, u8)> {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);

        let mut inner = self.inner.lock();
        if inner.peers.len() >= MAX_PEERS {
            return None;
        }
        let mut wire_id = inner.next_wire_id;
        while inner.peers.values().any(|peer| peer.wire_id == wire_id) {
            wire_id = (wire_id + 1) % MAX_PEERS as u8;
        }
        inner.next_wire_id = (wire_id + 1) % MAX_PEERS as u8;
        inner.peers.insert(
            key,
            Peer {
                name,
                wire_id,
                authenticated: false,
                outgoing,
                control,
            },
        );
        Some((key, wire_id))
    }

    /// Drops a peer, returning its wire id and name when it was still
    /// registered. Fan-out may have evicted it first.
    pub(crate) fn remove(&self, key: ConnectionId) -> Option<(u8, String)> {
        self.inner
            .lock()
            .peers
            .remove(&key)
            .map(|peer| (peer.wire_id, peer.name))
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().peers.len()
    }

    pub(crate) fn set_authenticated(&self, key: ConnectionId) {
        if let Some(peer) = self.inner.lock().peers.get_mut(&key) {
            peer.authenticated = true;
        }
    }

    pub(crate) fn is_authenticated(&self, key: ConnectionId) -> bool {
        self.inner
            .lock()
            .peers
            .get(&key)
            .is_some_and(|peer| peer.authenticated)
    }

    /// Wire id and name of every live peer other than `key`.
    pub(crate) fn others(&self, key: ConnectionId) -> Vec<(u8, String)> {
        self.inner
            .lock()
            .peers
            .iter()
            .filter(|&(&peer_key, _)| peer_key != key)
            .map(|(_, peer)| (peer.wire_id, peer.name.clone()))
            .collect()
    }

    /// Case-insensitive name lookup.
    pub(crate) fn find_by_name(&self, name: &str) -> Option<ConnectionId> {
        self.inner
            .lock()
            .peers
            .iter()
            .find(|(_, peer)| peer.name.eq_ignore_ascii_case(name))
            .map(|(&key, _)| key)
    }

    /// Asks a peer's own worker to disconnect it with `reason`. A kick
    /// already in flight wins; later reasons are dropped.
    pub(crate) fn kick(&self, key: ConnectionId, reason: &str) -> bool {
        let control = self
            .inner
            .lock()
            .peers
            .get(&key)
            .map(|peer| peer.control.clone());
        control.is_some_and(|tx| tx.try_send(reason.to_owned()).is_ok())
    }

    /// Queues `bytes` to every live peer except `exclude`.
    ///
    /// Senders are snapshotted under the lock and written outside it. A peer
    /// whose queue is closed or full is evicted after the pass; its own
    /// worker observes the closed channel and runs the normal termination
    /// path. A slow consumer therefore only hurts itself.
    pub(crate) fn broadcast(&self, bytes: &Bytes, exclude: Option<ConnectionId>) {
        let targets: Vec<(ConnectionId, flume::Sender<Bytes>)> = {
            self.inner
                .lock()
                .peers
                .iter()
                .filter(|&(&key, _)| Some(key) != exclude)
                .map(|(&key, peer)| (key, peer.outgoing.clone()))
                .collect()
        };

        let mut dead = vec![];
        for (key, tx) in targets {
            if tx.try_send(bytes.clone()).is_err() {
                dead.push(key);
            }
        }

        if !dead.is_empty() {
            let mut inner = self.inner.lock();
            for key in dead {
                if let Some(peer) = inner.peers.remove(&key) {
                    debug!(key, name = %peer.name, "evicted unresponsive peer");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channels() -> (flume::Sender<Bytes>, flume::Receiver<Bytes>, flume::Sender<String>) {
        let (out_tx, out_rx) = flume::bounded(16);
        let (ctl_tx, _ctl_rx) = flume::bounded(1);
        (out_tx, out_rx, ctl_tx)
    }

    #[test]
    fn wire_ids_stay_unique_under_churn() {
        let registry = PeerRegistry::new();
        let mut rxs = vec![];
        let mut live: HashMap<ConnectionId, u8> = HashMap::new();

        // Enough joins to wrap the 128-slot id space several times while up
        // to 100 peers stay live.
        for round in 0..400_u32 {
            let (out_tx, out_rx, ctl_tx) = channels();
            rxs.push(out_rx);
            let (key, wire_id) = registry
                .register(format!("peer{round}"), out_tx, ctl_tx)
                .unwrap();
            assert!(wire_id < 128);
            assert!(
                !live.values().any(|&other| other == wire_id),
                "wire id {wire_id} reused while still live"
            );
            live.insert(key, wire_id);

            if live.len() >= 100 {
                let victim = *live.keys().next().unwrap();
                registry.remove(victim).unwrap();
                live.remove(&victim);
            }
        }
    }

    #[test]
    fn full_registry_refuses_peers() {
        let registry = PeerRegistry::new();
        let mut rxs = vec![];
        for n in 0..MAX_PEERS {
            let (out_tx, out_rx, ctl_tx) = channels();
            rxs.push(out_rx);
            assert!(registry.register(format!("peer{n}"), out_tx, ctl_tx).is_some());
        }

        let (out_tx, _out_rx, ctl_tx) = channels();
        assert!(registry.register("late".into(), out_tx, ctl_tx).is_none());
        assert_eq!(registry.len(), MAX_PEERS);
    }

    #[test]
    fn broadcast_skips_excluded_and_evicts_dead() {
        let registry = PeerRegistry::new();

        let (a_tx, a_rx, a_ctl) = channels();
        let (a_key, _) = registry.register("a".into(), a_tx, a_ctl).unwrap();
        let (b_tx, b_rx, b_ctl) = channels();
        let (b_key, _) = registry.register("b".into(), b_tx, b_ctl).unwrap();
        let (c_tx, c_rx, c_ctl) = channels();
        registry.register("c".into(), c_tx, c_ctl).unwrap();
        drop(c_rx);

        registry.broadcast(&Bytes::from_static(b"hello"), Some(a_key));

        assert!(a_rx.try_recv().is_err());
        assert_eq!(b_rx.try_recv().unwrap(), Bytes::from_static(b"hello"));
        // The dead peer is gone after the pass.
        assert_eq!(registry.len(), 2);
        assert!(registry.find_by_name("c").is_none());
        assert_eq!(registry.find_by_name("B"), Some(b_key));
    }

    #[test]
    fn kick_reaches_the_target_worker() {
        let registry = PeerRegistry::new();
        let (out_tx, _out_rx) = flume::bounded(16);
        let (ctl_tx, ctl_rx) = flume::bounded(1);
        let (key, _) = registry.register("Target".into(), out_tx, ctl_tx).unwrap();

        assert_eq!(registry.find_by_name("target"), Some(key));
        assert!(registry.kick(key, "Kicked by operator"));
        assert_eq!(ctl_rx.recv().unwrap(), "Kicked by operator");
    }

    #[test]
    fn authentication_flag_tracks_per_peer() {
        let registry = PeerRegistry::new();
        let (out_tx, _out_rx, ctl_tx) = channels();
        let (key, _) = registry.register("a".into(), out_tx, ctl_tx).unwrap();

        assert!(!registry.is_authenticated(key));
        registry.set_authenticated(key);
        assert!(registry.is_authenticated(key));
        registry.remove(key);
        assert!(!registry.is_authenticated(key));
    }
}
