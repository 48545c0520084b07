use std::collections::HashMap;
use std::sync::Arc;

use tendril_consensus::{ConsensusError, ConsensusHandle, MsgInfo, NetworkOutbox, PeerId};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// In-process gossip between engines: broadcasts reach every other engine,
/// unicasts reach their destination.
#[derive(Clone)]
pub struct LocalNetwork {
    peers: Arc<HashMap<PeerId, ConsensusHandle>>,
}

impl LocalNetwork {
    pub fn new(handles: &[ConsensusHandle]) -> Self {
        let peers = handles
            .iter()
            .map(|handle| (handle.our_id().clone(), handle.clone()))
            .collect();
        LocalNetwork {
            peers: Arc::new(peers),
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Forwards everything `from` sends until the outbox closes.
    pub fn spawn_router(&self, from: PeerId, mut outbox: NetworkOutbox) -> JoinHandle<()> {
        let network = self.clone();
        tokio::spawn(async move {
            let (mut broadcast_open, mut unicast_open) = (true, true);
            while broadcast_open || unicast_open {
                tokio::select! {
                    mi = outbox.broadcast.recv(), if broadcast_open => match mi {
                        Some(mi) => network.broadcast(&from, mi),
                        None => broadcast_open = false,
                    },
                    mi = outbox.unicast.recv(), if unicast_open => match mi {
                        Some(mi) => {
                            let to = mi.peer_id.clone();
                            network.deliver(&to, MsgInfo::new(mi.msg, from.clone()));
                        }
                        None => unicast_open = false,
                    },
                }
            }
            debug!("Router for {} stopped", from);
        })
    }

    fn broadcast(&self, from: &PeerId, mi: MsgInfo) {
        for to in self.peers.keys().filter(|id| *id != from) {
            self.deliver(to, mi.clone());
        }
    }

    fn deliver(&self, to: &PeerId, mi: MsgInfo) {
        let Some(handle) = self.peers.get(to) else {
            warn!("Dropping {} for unknown peer {}", mi.msg.kind(), to);
            return;
        };
        match handle.send_peer_message(mi) {
            Ok(()) => {}
            Err(ConsensusError::EngineStopped) => debug!("Peer {} stopped", to),
            Err(e) => warn!("Dropping message for {}: {}", to, e),
        }
    }
}
