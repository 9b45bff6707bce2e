// Real-time channel, frame routing and directory access over the relay server.

pub mod channel;
pub mod directory;
pub mod endpoint;
pub mod memory;
pub mod router;
pub mod transport;

pub use channel::{recv_from, Channel, ChannelEvent, ChannelSender};
pub use directory::{Directory, HttpDirectory};
pub use memory::{MemoryDirectory, MemoryLink, MemoryTransportFactory};
pub use router::{dispatch, route, FrameHandler};
pub use transport::{Transport, TransportEvent, TransportFactory, WsTransport, WsTransportFactory};
