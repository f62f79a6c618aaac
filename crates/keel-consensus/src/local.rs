//! In-process gossip for devnets and tests.
//!
//! [`LocalNetwork`] connects engines running in the same process. Delivery never blocks the
//! sender: when a peer's queue is full the message is dropped, like on a lossy link. Nodes can
//! be taken offline, which drops everything they send or would receive.

use crate::engine::EngineHandle;
use crate::error::Result;
use crate::message::ConsensusMessage;
use crate::traits::Gossip;
use async_trait::async_trait;
use keel_types::Address;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

#[derive(Default)]
struct Peers {
    handles: BTreeMap<Address, EngineHandle>,
    offline: HashSet<Address>,
}

/// A hub connecting in-process engines.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    peers: Arc<RwLock<Peers>>,
}

impl LocalNetwork {
    /// Creates an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Connects the engine of `address`, replacing an earlier registration.
    pub fn register(&self, address: Address, handle: EngineHandle) {
        self.peers.write().handles.insert(address, handle);
    }

    /// Disconnects `address`.
    pub fn unregister(&self, address: &Address) {
        self.peers.write().handles.remove(address);
    }

    /// Takes `address` offline or brings it back.
    pub fn set_online(&self, address: Address, online: bool) {
        let mut peers = self.peers.write();
        if online {
            peers.offline.remove(&address);
        } else {
            peers.offline.insert(address);
        }
        tracing::info!(node = %address.short(), online, "node connectivity changed");
    }

    /// Whether `address` is reachable.
    pub fn is_online(&self, address: &Address) -> bool {
        !self.peers.read().offline.contains(address)
    }

    /// The gossip endpoint for the node at `address`.
    pub fn gossip(&self, address: Address) -> LocalGossip {
        LocalGossip {
            network: self.clone(),
            address,
        }
    }

    fn targets(&self, from: &Address, to: Option<&Address>) -> Vec<EngineHandle> {
        let peers = self.peers.read();
        if peers.offline.contains(from) {
            return Vec::new();
        }
        peers
            .handles
            .iter()
            .filter(|(addr, _)| *addr != from && !peers.offline.contains(*addr))
            .filter(|(addr, _)| to.map_or(true, |to| *addr == to))
            .map(|(_, handle)| handle.clone())
            .collect()
    }
}

/// One node's view of a [`LocalNetwork`].
#[derive(Clone)]
pub struct LocalGossip {
    network: LocalNetwork,
    address: Address,
}

#[async_trait]
impl Gossip for LocalGossip {
    async fn broadcast(&self, message: ConsensusMessage) -> Result<()> {
        for handle in self.network.targets(&self.address, None) {
            handle.try_deliver(self.address, message.clone());
        }
        Ok(())
    }

    async fn send_to(&self, peer: Address, message: ConsensusMessage) -> Result<()> {
        for handle in self.network.targets(&self.address, Some(&peer)) {
            handle.try_deliver(self.address, message.clone());
        }
        Ok(())
    }
}
