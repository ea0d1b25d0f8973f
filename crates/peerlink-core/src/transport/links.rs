//! Per-peer table of live WebSocket legs.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

use super::SharedWriter;

/// Which side opened a leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Accepted by our listener
    Inbound,
    /// Dialed by this node
    Outbound,
}

/// Identifies one leg so a closing read loop removes only its own entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId(u64);

struct Leg {
    id: LinkId,
    writer: SharedWriter,
}

#[derive(Default)]
struct PeerLegs {
    inbound: Option<Leg>,
    outbound: Option<Leg>,
}

impl PeerLegs {
    fn slot(&mut self, direction: Direction) -> &mut Option<Leg> {
        match direction {
            Direction::Inbound => &mut self.inbound,
            Direction::Outbound => &mut self.outbound,
        }
    }

    fn preferred(&self) -> Option<&Leg> {
        self.outbound.as_ref().or(self.inbound.as_ref())
    }

    fn is_empty(&self) -> bool {
        self.inbound.is_none() && self.outbound.is_none()
    }
}

/// Result of [`LinkTable::insert`].
pub struct Insertion {
    /// Id of the new leg
    pub id: LinkId,
    /// The peer had no legs before this one
    pub new_peer: bool,
    /// Writer of the leg this one replaced, which the caller should close
    pub replaced: Option<SharedWriter>,
}

/// Result of [`LinkTable::remove`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Removal {
    /// The leg was still registered
    pub removed: bool,
    /// The peer has no legs left
    pub peer_gone: bool,
}

/// Live connections keyed by peer address.
///
/// Each peer is one logical entry with at most one leg per direction.
/// Writes go to the outbound leg when there is one.
#[derive(Default)]
pub struct LinkTable {
    peers: Mutex<HashMap<IpAddr, PeerLegs>>,
    next_id: AtomicU64,
}

impl LinkTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a leg, replacing any previous leg in the same direction.
    pub async fn insert(
        &self,
        peer: IpAddr,
        direction: Direction,
        writer: SharedWriter,
    ) -> Insertion {
        let id = LinkId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut peers = self.peers.lock().await;
        let legs = peers.entry(peer).or_default();
        let new_peer = legs.is_empty();
        let replaced = legs
            .slot(direction)
            .replace(Leg { id, writer })
            .map(|leg| leg.writer);
        Insertion {
            id,
            new_peer,
            replaced,
        }
    }

    /// Remove a leg if it is still the registered one.
    pub async fn remove(&self, peer: IpAddr, id: LinkId) -> Removal {
        let mut peers = self.peers.lock().await;
        let Some(legs) = peers.get_mut(&peer) else {
            return Removal {
                removed: false,
                peer_gone: true,
            };
        };

        let mut removed = false;
        for direction in [Direction::Inbound, Direction::Outbound] {
            let slot = legs.slot(direction);
            if slot.as_ref().is_some_and(|leg| leg.id == id) {
                *slot = None;
                removed = true;
            }
        }

        let peer_gone = legs.is_empty();
        if peer_gone {
            peers.remove(&peer);
        }
        Removal { removed, peer_gone }
    }

    /// Remove whichever leg of `peer` writes through `writer`.
    pub async fn remove_writer(&self, peer: IpAddr, writer: &SharedWriter) -> Removal {
        let id = {
            let peers = self.peers.lock().await;
            peers.get(&peer).and_then(|legs| {
                [legs.inbound.as_ref(), legs.outbound.as_ref()]
                    .into_iter()
                    .flatten()
                    .find(|leg| Arc::ptr_eq(&leg.writer, writer))
                    .map(|leg| leg.id)
            })
        };
        match id {
            Some(id) => self.remove(peer, id).await,
            None => Removal {
                removed: false,
                peer_gone: !self.contains(peer).await,
            },
        }
    }

    /// Writer to use for `peer`, preferring the outbound leg.
    pub async fn writer(&self, peer: IpAddr) -> Option<SharedWriter> {
        let peers = self.peers.lock().await;
        peers
            .get(&peer)
            .and_then(PeerLegs::preferred)
            .map(|leg| leg.writer.clone())
    }

    /// Whether any leg to `peer` is live.
    pub async fn contains(&self, peer: IpAddr) -> bool {
        self.peers.lock().await.contains_key(&peer)
    }

    /// Whether a leg in the given direction is live.
    pub async fn has(&self, peer: IpAddr, direction: Direction) -> bool {
        let mut peers = self.peers.lock().await;
        peers
            .get_mut(&peer)
            .is_some_and(|legs| legs.slot(direction).is_some())
    }

    /// Remove every leg of `peer` and return their writers.
    pub async fn take(&self, peer: IpAddr) -> Vec<SharedWriter> {
        let mut peers = self.peers.lock().await;
        peers.remove(&peer).map(legs_into_writers).unwrap_or_default()
    }

    /// Remove every leg of every peer.
    pub async fn drain(&self) -> Vec<(IpAddr, Vec<SharedWriter>)> {
        let mut peers = self.peers.lock().await;
        peers
            .drain()
            .map(|(ip, legs)| (ip, legs_into_writers(legs)))
            .collect()
    }

    /// Preferred writer of every connected peer.
    pub async fn writers(&self) -> Vec<(IpAddr, SharedWriter)> {
        let peers = self.peers.lock().await;
        peers
            .iter()
            .filter_map(|(ip, legs)| legs.preferred().map(|leg| (*ip, leg.writer.clone())))
            .collect()
    }

    /// Addresses of every connected peer, sorted.
    pub async fn peers(&self) -> Vec<IpAddr> {
        let mut ips: Vec<IpAddr> = self.peers.lock().await.keys().copied().collect();
        ips.sort();
        ips
    }
}

fn legs_into_writers(legs: PeerLegs) -> Vec<SharedWriter> {
    [legs.outbound, legs.inbound]
        .into_iter()
        .flatten()
        .map(|leg| leg.writer)
        .collect()
}
