//! udpeer protocol core: peer discovery and file transfer over plain datagrams.
//! Host-driven: no sockets or timers here; the host feeds decoded messages and the current
//! time in, and sends out whatever replies come back.

pub mod chunk;
pub mod id;
pub mod integrity;
pub mod protocol;
pub mod receiver;
pub mod registry;
pub mod retry;
pub mod session;
pub mod wire;

pub use chunk::{ChunkReader, OutboundTransfer, TransferPhase, TransferProgress};
pub use id::new_transfer_id;
pub use protocol::Message;
pub use receiver::{EndStep, Handled, ReceiverEvent, TransferTable};
pub use registry::{Device, DeviceRegistry, PeerUpdate};
pub use retry::{Attempt, Backoff, RetryPolicy};
pub use session::{ChunkOutcome, EndOutcome, TransferSession};
pub use wire::{decode, encode, DecodeError, EncodeError};
