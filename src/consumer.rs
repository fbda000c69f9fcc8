//! Consumer-facing integration traits
//!
//! The bridge does not own a terminal, a socket, or any other byte sink of
//! its own. Whatever presents the emulated ports to applications implements
//! [`PortConsumer`] for per-port delivery and [`PortHost`] for device node
//! registration. Both are called from bridge internals, sometimes with
//! bridge locks held, so implementations must hand work off rather than
//! call back into the bridge inline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::channel::EndpointAddr;

/// Modem line bit: data terminal ready
pub const LINE_DTR: u32 = 0x0002;
/// Modem line bit: request to send
pub const LINE_RTS: u32 = 0x0004;
/// Modem line bit: clear to send
pub const LINE_CTS: u32 = 0x0020;
/// Modem line bit: carrier detect
pub const LINE_CD: u32 = 0x0040;
/// Modem line bit: ring indicator
pub const LINE_RI: u32 = 0x0080;
/// Modem line bit: data set ready
pub const LINE_DSR: u32 = 0x0100;

/// Attributes published for a port when it is registered with the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortAttributes {
    /// Remote endpoint the port will connect to
    pub remote: EndpointAddr,
    /// Service selector on the remote endpoint
    pub selector: u8,
}

/// Per-port byte sink and event target
///
/// One consumer is attached for the lifetime of an open port. Inbound
/// bytes are pushed through [`insert_rx`](Self::insert_rx) followed by a
/// [`commit_rx`](Self::commit_rx) once the batch is complete.
///
/// Implementations must not call back into the bridge from these methods.
/// They run on channel event threads and may hold the channel lock; a
/// consumer that needs to react by writing, closing, or releasing must
/// queue that work for its own context.
pub trait PortConsumer: Send + Sync {
    /// Accept inbound bytes, returning how many were taken
    fn insert_rx(&self, data: &[u8]) -> usize;

    /// Make previously inserted bytes visible to the reader
    fn commit_rx(&self);

    /// Wake a writer blocked on buffer room
    fn wake_writer(&self);

    /// Signal that the line was hung up and the port should wind down
    fn hangup(&self);

    /// Whether carrier loss should be ignored instead of hanging up
    fn ignore_carrier(&self) -> bool {
        false
    }
}

/// Host-side registration surface for port device nodes
///
/// The bridge calls these as ports come and go so the host can publish
/// matching device entries. Registration happens outside bridge locks;
/// relocation and unregistration may not.
#[cfg_attr(test, mockall::automock)]
pub trait PortHost: Send + Sync {
    /// Publish a device entry for a newly created port
    fn register(&self, id: u16, attrs: &PortAttributes) -> Result<(), crate::error::BridgeError>;

    /// Remove the device entry for a destroyed port
    fn unregister(&self, id: u16);

    /// Re-anchor the device entry to a transport endpoint, or back to the
    /// bridge itself when `endpoint` is `None`
    fn relocate<'a>(&self, id: u16, endpoint: Option<&'a EndpointAddr>);
}

/// Event emitted by a [`QueueConsumer`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortEvent {
    /// A batch of inbound bytes
    Data(Bytes),
    /// Write room opened up again
    WriterReady,
    /// The line hung up
    Hangup,
}

/// Consumer that forwards everything into a channel
///
/// The callback contract forbids consumers from re-entering the bridge,
/// so the usual shape is to queue events and handle them elsewhere. This
/// adapter does exactly that: callbacks become [`PortEvent`]s on an
/// unbounded queue, and the application drains the receiver in its own
/// context.
pub struct QueueConsumer {
    tx: Sender<PortEvent>,
    staged: Mutex<Vec<u8>>,
    ignore_carrier: AtomicBool,
}

impl QueueConsumer {
    /// Create the consumer and the receiving end of its event queue
    #[must_use]
    pub fn new() -> (Arc<Self>, Receiver<PortEvent>) {
        let (tx, rx) = unbounded();
        (
            Arc::new(Self {
                tx,
                staged: Mutex::new(Vec::new()),
                ignore_carrier: AtomicBool::new(false),
            }),
            rx,
        )
    }

    /// Treat carrier loss as a line event instead of a hangup
    pub fn set_ignore_carrier(&self, ignore: bool) {
        self.ignore_carrier.store(ignore, Ordering::SeqCst);
    }
}

impl PortConsumer for QueueConsumer {
    fn insert_rx(&self, data: &[u8]) -> usize {
        self.staged.lock().extend_from_slice(data);
        data.len()
    }

    fn commit_rx(&self) {
        let batch = std::mem::take(&mut *self.staged.lock());
        if !batch.is_empty() {
            let _ = self.tx.send(PortEvent::Data(Bytes::from(batch)));
        }
    }

    fn wake_writer(&self) {
        let _ = self.tx.send(PortEvent::WriterReady);
    }

    fn hangup(&self) {
        let _ = self.tx.send(PortEvent::Hangup);
    }

    fn ignore_carrier(&self) -> bool {
        self.ignore_carrier.load(Ordering::SeqCst)
    }
}

/// A host that publishes nothing
///
/// Useful for tests and for embedders that track ports purely through the
/// bridge API.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHost;

impl PortHost for NullHost {
    fn register(&self, _id: u16, _attrs: &PortAttributes) -> Result<(), crate::error::BridgeError> {
        Ok(())
    }

    fn unregister(&self, _id: u16) {}

    fn relocate(&self, _id: u16, _endpoint: Option<&EndpointAddr>) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_bits_are_distinct() {
        let bits = [LINE_DTR, LINE_RTS, LINE_CTS, LINE_CD, LINE_RI, LINE_DSR];
        let mut seen = 0u32;
        for bit in bits {
            assert_eq!(seen & bit, 0);
            seen |= bit;
        }
    }

    #[test]
    fn test_null_host_accepts_everything() {
        let host = NullHost;
        let attrs = PortAttributes {
            remote: EndpointAddr::default(),
            selector: 1,
        };
        assert!(host.register(0, &attrs).is_ok());
        host.relocate(0, Some(&attrs.remote));
        host.unregister(0);
    }

    #[test]
    fn test_queue_consumer_batches_data() {
        let (consumer, rx) = QueueConsumer::new();
        assert_eq!(consumer.insert_rx(b"he"), 2);
        assert_eq!(consumer.insert_rx(b"llo"), 3);
        assert!(rx.try_recv().is_err());
        consumer.commit_rx();
        assert_eq!(rx.try_recv().unwrap(), PortEvent::Data(Bytes::from_static(b"hello")));
        // An empty commit produces no event.
        consumer.commit_rx();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_queue_consumer_signals() {
        let (consumer, rx) = QueueConsumer::new();
        consumer.wake_writer();
        consumer.hangup();
        assert_eq!(rx.try_recv().unwrap(), PortEvent::WriterReady);
        assert_eq!(rx.try_recv().unwrap(), PortEvent::Hangup);
        assert!(!consumer.ignore_carrier());
        consumer.set_ignore_carrier(true);
        assert!(consumer.ignore_carrier());
    }
}
