//! # Portico
//!
//! A device bridge that exposes multiplexed, credit-flow-controlled
//! wireless data-link channels as virtual serial ports:
//! - Registry of port records with dense small ids and capped count
//! - Reference-counted port lifecycle with deferred teardown while open
//! - Blocking, interruptible opens that dial the channel on first use
//! - Credit-aware outbound accounting with MTU-sized chunking
//! - Pending-data handoff when adopting an already connected channel
//! - Modem signal mapping and remote line-parameter negotiation
//! - Scriptable in-memory channel for tests and development
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use portico::sim::LoopbackChannel;
//! use portico::{CreateRequest, DlcChannel, Interrupt, NullHost, PortBridge, QueueConsumer};
//!
//! let bridge = PortBridge::new(Arc::new(NullHost));
//! let driver = LoopbackChannel::new(1024);
//! let channel = DlcChannel::new(driver.clone());
//! driver.bind(&channel);
//!
//! let req = CreateRequest::new(
//!     "00:00:00:00:00:00".parse().unwrap(),
//!     "00:1A:7D:DA:71:13".parse().unwrap(),
//!     1,
//! )
//! .privileged();
//! let id = bridge.create(&req, &channel).unwrap();
//!
//! let (consumer, events) = QueueConsumer::new();
//! let port = bridge.open(id, consumer, &Interrupt::new()).unwrap();
//! port.write(b"AT\r\n").unwrap();
//! assert_eq!(driver.transmitted().len(), 1);
//!
//! port.close();
//! bridge.shutdown();
//! drop(events);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod bridge;
pub mod channel;
pub mod consumer;
pub mod device;
pub mod error;
pub mod port;
mod registry;
pub mod settings;
pub mod sim;

// Re-exports for convenience
pub use crate::bridge::{
    CreateRequest, PortBridge, PortInfo, ReleaseRequest, RequestFlags, FLAG_ATTACHED,
    FLAG_RELEASED, FLAG_RELEASE_ON_HANGUP, FLAG_REUSE_CHANNEL,
};
pub use crate::channel::{ChannelDriver, ChannelState, DlcChannel, EndpointAddr};
pub use crate::consumer::{
    NullHost, PortAttributes, PortConsumer, PortEvent, PortHost, QueueConsumer,
};
pub use crate::device::{Interrupt, TxChunk};
pub use crate::error::BridgeError;
pub use crate::port::Port;
pub use crate::registry::MAX_PORTS;
pub use crate::settings::{LineFlowControl, LineParity, LineSettings, PortNegotiation};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
