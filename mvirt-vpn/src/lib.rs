pub mod buffer;
pub mod config;
pub mod error;
pub mod interface;
pub mod packet;
pub mod pump;
pub mod queue;
pub mod test_util;
pub mod tun;

pub use buffer::{Buffer, BufferId, BufferPool, ReleaseStatus};
pub use config::PumpConfig;
pub use error::{ExitReason, PumpError};
pub use packet::{Packet, TransportProtocol};
pub use pump::{PacketPump, PumpHandle, PumpStats, spawn};
pub use queue::{InboundQueue, PacketQueue, TcpQueue, UdpQueue};
