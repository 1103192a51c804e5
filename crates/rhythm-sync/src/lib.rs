pub mod channel;
pub mod loopback;
pub mod publisher;
pub mod router;
pub mod socket;
pub mod stats;
pub mod wire;


pub use channel::{ChannelError, DeliveryPath, DurableSlots, Inbound, SyncChannel};
pub use loopback::{LoopbackChannel, LoopbackEnd};
pub use publisher::{DualChannelPublisher, InboundNormalizer};
pub use router::{fresh_request_id, ReceiverState, RouterIntent, SessionEventRouter, StartRequestGate};
pub use socket::SocketChannel;
pub use stats::{MemoryStatsRecorder, StatsRecorder, StatsSummary, TrainingRecord};
pub use wire::{CodecError, Delivery, Fact, FactKind, WireMessage};
