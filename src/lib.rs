#![doc(html_root_url = "https://docs.rs/framemux/latest")]
//! Public API for the `framemux` library.
//!
//! This crate multiplexes logical frame streams over one control byte stream
//! and a scheduled pool of data byte streams: small frames ride the control
//! channel inline, large payloads are tagged, fanned out across the data
//! connections by predicted delivery time, and reassembled on the far side.

pub mod chunker;
pub mod config;
pub mod control;
pub mod endpoint;
pub mod error;
/// Result type alias re-exported for convenience when working with the
/// transport.
pub use error::Result;
pub mod frame;
pub mod input_queue;
pub mod rate;
pub mod scheduler;
pub mod serializer;
pub mod transport;
pub mod wire;

pub use chunker::MessageChunker;
pub use config::TransportOptions;
pub use endpoint::{IgnoreSecurityFrames, SecurityFrameHandler};
pub use error::{CloseStatus, ProtocolError, TransportError};
pub use frame::{Frame, FrameHeader, FrameType, IncomingFrame, IncomingPayload};
pub use input_queue::{InputQueue, InputQueueDepths, ReadTicket};
pub use rate::{DeliveryData, SendRate, SharedSendRate};
pub use scheduler::{
    ChannelInfo,
    OutputScheduler,
    QueuedFrame,
    Reader,
    SchedulerSnapshot,
    SchedulingPolicy,
    WeightedFairPolicy,
};
pub use serializer::{BincodeSerializer, SerializeError, Serializer};
pub use transport::{
    DataConnectionHandle,
    FrameTransport,
    IncomingFrames,
    TransportDiagnostics,
};
pub use wire::{ControlHeader, DataHeader, PayloadTag, padding};
