//! Client transport over a single connection, split into a reliable ordered
//! channel and an unreliable datagram channel.

pub mod connection;
pub mod handle;
pub mod latch;
pub mod manager;
pub mod memory;
pub mod read_loop;

pub use connection::{ChannelReader, ChannelWriter, Connection, Connector, Duplex};
pub use handle::ChannelHandle;
pub use latch::CloseLatch;
pub use manager::Transport;
pub use memory::{MemoryAcceptor, MemoryBehavior, MemoryConnector, MemoryPeer, ReadyBehavior};
pub use read_loop::{ReadLoop, ReadLoopStats};

pub use dualink_core::{
    ChannelKind, CloseReason, CloseSource, ConnectionState, EventKind, LinkError, TransportError,
    TransportEvent, TransportSettings,
};
