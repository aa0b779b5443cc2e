//! Composed libp2p `NetworkBehaviour` of a room swarm.
//!
//! Combines GossipSub (room frames), Kademlia (rendezvous: room members
//! provide the hashed room key) and Identify (address exchange).

use libp2p::{
    gossipsub, identify,
    kad::{self, store::MemoryStore},
    swarm::NetworkBehaviour,
};

/// All sub-behaviours are driven by the single swarm event loop.
/// Construction is handled by [`super::transport::build_swarm`].
#[derive(NetworkBehaviour)]
#[behaviour(to_swarm = "MeridianEvent")]
pub struct MeridianBehaviour {
    pub gossipsub: gossipsub::Behaviour,
    pub kademlia: kad::Behaviour<MemoryStore>,
    pub identify: identify::Behaviour,
}

#[derive(Debug)]
pub enum MeridianEvent {
    Gossipsub(gossipsub::Event),
    Kademlia(kad::Event),
    Identify(identify::Event),
}

impl From<gossipsub::Event> for MeridianEvent {
    fn from(event: gossipsub::Event) -> Self {
        MeridianEvent::Gossipsub(event)
    }
}

impl From<kad::Event> for MeridianEvent {
    fn from(event: kad::Event) -> Self {
        MeridianEvent::Kademlia(event)
    }
}

impl From<identify::Event> for MeridianEvent {
    fn from(event: identify::Event) -> Self {
        MeridianEvent::Identify(event)
    }
}
