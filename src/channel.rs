//! Data-link channel abstraction
//!
//! A [`DlcChannel`] wraps one multiplexed, credit-flow-controlled channel
//! provided by some wireless transport. The transport side implements
//! [`ChannelDriver`]; the bridge side installs itself as the channel owner
//! and receives inbound data, state transitions, and modem signal updates
//! through the event entry points on [`DlcChannel`].
//!
//! Lock ordering: the registry lock nests outside the channel lock. Event
//! entry points take only the channel lock; anything that needs registry
//! work drops the channel lock first and re-checks device liveness after.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, trace};

use crate::device::{PortDevice, TxChunk};
use crate::error::BridgeError;
use crate::settings::PortNegotiation;

/// Remote signal bit: ready to communicate
pub const V24_RTC: u8 = 0x04;
/// Remote signal bit: ready to receive
pub const V24_RTR: u8 = 0x08;
/// Remote signal bit: incoming call
pub const V24_IC: u8 = 0x40;
/// Remote signal bit: data valid (carrier)
pub const V24_DV: u8 = 0x80;

/// Transport endpoint address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
pub struct EndpointAddr(pub [u8; 6]);

impl fmt::Display for EndpointAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for EndpointAddr {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(BridgeError::InvalidAddress(format!(
                "expected 6 octets, got {}",
                parts.len()
            )));
        }
        let mut addr = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            addr[i] = u8::from_str_radix(part, 16)
                .map_err(|_| BridgeError::InvalidAddress(format!("bad octet '{part}'")))?;
        }
        Ok(Self(addr))
    }
}

/// Connection state of a data-link channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ChannelState {
    /// No connection
    Closed,
    /// Connection request in flight
    Connecting,
    /// Link up, parameters being negotiated
    Negotiating,
    /// Ready to carry data
    Connected,
    /// Shutdown in progress
    Disconnecting,
}

/// Transport-side implementation of one data-link channel
///
/// The getter methods (`state`, `mtu`, `tx_credits`, `has_tx_backlog`,
/// `modem_status`) are called from paths that already hold bridge locks
/// and must not take the channel lock or call back into the bridge.
/// Event delivery through [`DlcChannel`] must happen with no
/// driver-internal locks held.
pub trait ChannelDriver: Send + Sync {
    /// Request a connection to the remote endpoint
    fn connect(
        &self,
        local: &EndpointAddr,
        remote: &EndpointAddr,
        selector: u8,
    ) -> Result<(), BridgeError>;

    /// Shut the channel down, giving queued data at most `linger` to drain
    fn shutdown(&self, linger: Duration);

    /// Queue one chunk for transmission
    ///
    /// The chunk's accounting guard must be dropped exactly when the
    /// transport is done with the payload, whether it was sent or purged.
    fn send(&self, chunk: TxChunk) -> Result<(), BridgeError>;

    /// Stop the remote end from sending
    fn throttle(&self);

    /// Allow the remote end to send again
    fn unthrottle(&self);

    /// Signal bits last announced by the remote end (`V24_*`)
    fn remote_signals(&self) -> u8;

    /// Signal bits we currently announce to the remote end
    fn local_signals(&self) -> u8;

    /// Replace the signal bits announced to the remote end
    fn set_local_signals(&self, signals: u8);

    /// Send a remote port negotiation message
    fn negotiate(&self, params: &PortNegotiation) -> Result<(), BridgeError>;

    /// Current connection state
    fn state(&self) -> ChannelState;

    /// Maximum payload per chunk, always at least one byte
    fn mtu(&self) -> usize;

    /// Transmit credits currently granted by the remote end
    fn tx_credits(&self) -> usize;

    /// Whether queued outbound data is still waiting on the channel
    fn has_tx_backlog(&self) -> bool;

    /// Drop all queued outbound data, running each chunk's accounting guard
    fn purge_tx(&self);

    /// Take ownership of any inbound data the channel buffered before it
    /// had an owner to deliver to
    fn claim_pending_rx(&self) -> Vec<Bytes>;
}

pub(crate) struct ChannelShared {
    /// Owning device, if any. Guarded by the channel lock; cleared on
    /// device teardown.
    pub(crate) owner: Weak<PortDevice>,
}

/// One data-link channel as seen by the bridge
///
/// Created around a [`ChannelDriver`] and handed to
/// [`PortBridge::create`](crate::bridge::PortBridge::create), which installs
/// the owning device. The transport delivers events by calling
/// [`data_ready`](Self::data_ready), [`state_changed`](Self::state_changed)
/// and [`modem_changed`](Self::modem_changed).
pub struct DlcChannel {
    driver: Arc<dyn ChannelDriver>,
    shared: Mutex<ChannelShared>,
}

impl DlcChannel {
    /// Wrap a transport driver into a bridge-attachable channel
    #[must_use]
    pub fn new(driver: Arc<dyn ChannelDriver>) -> Arc<Self> {
        Arc::new(Self {
            driver,
            shared: Mutex::new(ChannelShared { owner: Weak::new() }),
        })
    }

    /// The transport driver behind this channel
    #[must_use]
    pub fn driver(&self) -> &Arc<dyn ChannelDriver> {
        &self.driver
    }

    pub(crate) fn lock_shared(&self) -> MutexGuard<'_, ChannelShared> {
        self.shared.lock()
    }

    /// Install `dev` as the channel owner. Runs under the channel lock,
    /// with the registry lock already held by the caller.
    pub(crate) fn adopt(&self, dev: &Arc<PortDevice>, reuse: bool) {
        let mut shared = self.shared.lock();
        if reuse {
            // Hold the remote end off until the new owner attaches a
            // consumer, and carry over anything already buffered.
            self.driver.throttle();
            let claimed = self.driver.claim_pending_rx();
            if !claimed.is_empty() {
                trace!(chunks = claimed.len(), "carrying buffered data across handoff");
                dev.seed_pending(claimed);
            }
        }
        shared.owner = Arc::downgrade(dev);
        dev.apply_modem_signals(self.driver.remote_signals());
    }

    /// Clear the owner slot if it still points at `dev`
    pub(crate) fn clear_owner_if(&self, dev: *const PortDevice) {
        let mut shared = self.shared.lock();
        if std::ptr::eq(shared.owner.as_ptr(), dev) {
            shared.owner = Weak::new();
        }
    }

    /// Deliver one inbound chunk to the owning device
    ///
    /// A channel without a living owner silently discards the chunk.
    pub fn data_ready(&self, chunk: Bytes) {
        let guard = self.shared.lock();
        match guard.owner.upgrade() {
            Some(dev) => {
                dev.take_inbound(chunk);
                // Release the channel lock before the device reference: a
                // last reference dropped here would re-enter this lock
                // during teardown.
                drop(guard);
                drop(dev);
            }
            None => trace!(len = chunk.len(), "discarding data for unowned channel"),
        }
    }

    /// Record a channel state transition
    ///
    /// Wakes any blocked opener. When the channel reached closed state,
    /// either signals hangup to the attached consumer or, for an unattached
    /// release-on-hangup device, tears the device down.
    pub fn state_changed(&self, err: Option<BridgeError>) {
        let guard = self.shared.lock();
        let Some(dev) = guard.owner.upgrade() else {
            drop(guard);
            return;
        };

        let state = self.driver.state();
        debug!(port = dev.id(), ?state, ?err, "channel state changed");
        dev.note_channel_state(err);

        let mut reap = None;
        if state == ChannelState::Closed {
            if let Some(consumer) = dev.consumer() {
                consumer.hangup();
            } else if dev.config().release_on_hangup {
                reap = Some((dev.bridge_handle(), dev.id()));
            }
        }

        drop(guard);
        drop(dev);

        // The registry lock nests outside the channel lock, so teardown
        // starts only after both references above are gone. The device is
        // looked up again in case a concurrent removal got there first.
        if let Some((bridge, id)) = reap {
            bridge.reap(id);
        }
    }

    /// Record updated remote signal bits
    pub fn modem_changed(&self, signals: u8) {
        let guard = self.shared.lock();
        match guard.owner.upgrade() {
            Some(dev) => {
                dev.apply_modem_signals(signals);
                drop(guard);
                drop(dev);
            }
            None => trace!(signals, "discarding signals for unowned channel"),
        }
    }
}
