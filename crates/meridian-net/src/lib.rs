// Room transports: libp2p gossip rooms and an in-process hub.

pub mod behaviour;
pub mod discovery;
pub mod gossip;
pub mod memory;
pub mod peers;
pub mod room;
pub mod swarm;
pub mod transport;

pub use behaviour::{MeridianBehaviour, MeridianEvent};
pub use discovery::{load_bootstrap_peers, parse_multiaddrs, parse_signaling};
pub use gossip::GossipTransport;
pub use memory::MemoryHub;
pub use peers::{ConnectionInfo, PeerTracker};
pub use room::{RoomEvent, RoomLink, RoomSender, RoomSpec, RoomTransport};
pub use swarm::{spawn_swarm, SwarmCommand, SwarmConfig, SwarmNotification};
pub use transport::build_swarm;
