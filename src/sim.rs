//! Scriptable in-memory channel and consumer
//!
//! [`LoopbackChannel`] implements [`ChannelDriver`] without any radio
//! behind it. Tests and embedders drive it directly: complete or refuse
//! connections, hold transmitted chunks in a backlog to exercise flow
//! control, inject inbound data, and flip remote signal bits. The
//! recording consumer and host capture everything the bridge pushes at
//! them.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::trace;

use crate::channel::{ChannelDriver, ChannelState, DlcChannel, EndpointAddr};
use crate::consumer::{PortAttributes, PortConsumer, PortHost};
use crate::device::TxChunk;
use crate::error::BridgeError;
use crate::settings::PortNegotiation;

/// In-memory channel driver with scriptable behavior
pub struct LoopbackChannel {
    mtu: AtomicUsize,
    credits: AtomicUsize,
    state: Mutex<ChannelState>,
    link: Mutex<Weak<DlcChannel>>,

    auto_connect: AtomicBool,
    refuse_connect: Mutex<Option<BridgeError>>,
    fail_send: Mutex<Option<BridgeError>>,
    hold_sends: AtomicBool,
    throttled: AtomicBool,

    backlog: Mutex<VecDeque<TxChunk>>,
    transmitted: Mutex<Vec<Bytes>>,
    unclaimed_rx: Mutex<Vec<Bytes>>,

    local_sig: AtomicU8,
    remote_sig: AtomicU8,
    negotiated: Mutex<Option<PortNegotiation>>,

    connect_calls: AtomicUsize,
    shutdown_calls: AtomicUsize,
}

impl LoopbackChannel {
    /// Create a closed channel with the given MTU
    ///
    /// Connections complete inline until [`hold_connect`](Self::hold_connect)
    /// is called, and sends are recorded immediately until
    /// [`hold_sends`](Self::hold_sends).
    #[must_use]
    pub fn new(mtu: usize) -> Arc<Self> {
        Arc::new(Self {
            mtu: AtomicUsize::new(mtu),
            credits: AtomicUsize::new(8),
            state: Mutex::new(ChannelState::Closed),
            link: Mutex::new(Weak::new()),
            auto_connect: AtomicBool::new(true),
            refuse_connect: Mutex::new(None),
            fail_send: Mutex::new(None),
            hold_sends: AtomicBool::new(false),
            throttled: AtomicBool::new(false),
            backlog: Mutex::new(VecDeque::new()),
            transmitted: Mutex::new(Vec::new()),
            unclaimed_rx: Mutex::new(Vec::new()),
            local_sig: AtomicU8::new(0),
            remote_sig: AtomicU8::new(0),
            negotiated: Mutex::new(None),
            connect_calls: AtomicUsize::new(0),
            shutdown_calls: AtomicUsize::new(0),
        })
    }

    /// Attach the channel this driver reports events to
    pub fn bind(&self, channel: &Arc<DlcChannel>) {
        *self.link.lock() = Arc::downgrade(channel);
    }

    fn link(&self) -> Option<Arc<DlcChannel>> {
        self.link.lock().upgrade()
    }

    /// Keep connect requests pending until [`complete_connect`](Self::complete_connect)
    pub fn hold_connect(&self) {
        self.auto_connect.store(false, Ordering::SeqCst);
    }

    /// Make the next connect request fail synchronously
    pub fn refuse_next_connect(&self, err: BridgeError) {
        *self.refuse_connect.lock() = Some(err);
    }

    /// Make the next send fail
    pub fn fail_next_send(&self, err: BridgeError) {
        *self.fail_send.lock() = Some(err);
    }

    /// Park sent chunks in a backlog instead of completing them
    pub fn hold_sends(&self) {
        self.hold_sends.store(true, Ordering::SeqCst);
    }

    /// Complete up to `n` backlogged chunks, oldest first
    pub fn release_backlog(&self, n: usize) {
        for _ in 0..n {
            let chunk = self.backlog.lock().pop_front();
            match chunk {
                Some(chunk) => {
                    self.transmitted.lock().push(chunk.payload().clone());
                    // chunk drops here, returning its reserved room
                }
                None => break,
            }
        }
    }

    /// Finish a held connect request successfully
    pub fn complete_connect(&self) {
        *self.state.lock() = ChannelState::Connected;
        if let Some(link) = self.link() {
            link.state_changed(None);
        }
    }

    /// Finish a held connect request with a failure
    pub fn fail_connect(&self, err: BridgeError) {
        *self.state.lock() = ChannelState::Closed;
        if let Some(link) = self.link() {
            link.state_changed(Some(err));
        }
    }

    /// Drop the link from the remote side
    pub fn drop_link(&self, err: Option<BridgeError>) {
        *self.state.lock() = ChannelState::Closed;
        if let Some(link) = self.link() {
            link.state_changed(err);
        }
    }

    /// Deliver inbound bytes from the remote side
    pub fn inject_rx(&self, data: Bytes) {
        if let Some(link) = self.link() {
            link.data_ready(data);
        }
    }

    /// Buffer inbound bytes for a later owner to claim
    pub fn seed_unclaimed_rx(&self, data: Bytes) {
        self.unclaimed_rx.lock().push(data);
    }

    /// Update the remote signal bits and report the change
    pub fn set_remote_signals(&self, signals: u8) {
        self.remote_sig.store(signals, Ordering::SeqCst);
        if let Some(link) = self.link() {
            link.modem_changed(signals);
        }
    }

    /// Force the connection state without reporting an event
    pub fn set_state(&self, state: ChannelState) {
        *self.state.lock() = state;
    }

    /// Change the granted transmit credits
    pub fn set_credits(&self, credits: usize) {
        self.credits.store(credits, Ordering::SeqCst);
    }

    /// Payloads completed so far, in order
    #[must_use]
    pub fn transmitted(&self) -> Vec<Bytes> {
        self.transmitted.lock().clone()
    }

    /// How many connect requests were made
    #[must_use]
    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    /// How many shutdowns were requested
    #[must_use]
    pub fn shutdown_calls(&self) -> usize {
        self.shutdown_calls.load(Ordering::SeqCst)
    }

    /// Whether the remote end is currently held off
    #[must_use]
    pub fn is_throttled(&self) -> bool {
        self.throttled.load(Ordering::SeqCst)
    }

    /// The last negotiation message sent, if any
    #[must_use]
    pub fn last_negotiation(&self) -> Option<PortNegotiation> {
        *self.negotiated.lock()
    }
}

impl ChannelDriver for LoopbackChannel {
    fn connect(
        &self,
        local: &EndpointAddr,
        remote: &EndpointAddr,
        selector: u8,
    ) -> Result<(), BridgeError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        trace!(%local, %remote, selector, "loopback connect");
        if let Some(err) = self.refuse_connect.lock().take() {
            return Err(err);
        }
        if *self.state.lock() == ChannelState::Connected {
            return Ok(());
        }
        *self.state.lock() = ChannelState::Connecting;
        if self.auto_connect.load(Ordering::SeqCst) {
            self.complete_connect();
        }
        Ok(())
    }

    fn shutdown(&self, _linger: Duration) {
        self.shutdown_calls.fetch_add(1, Ordering::SeqCst);
        {
            let mut state = self.state.lock();
            if *state == ChannelState::Closed {
                return;
            }
            *state = ChannelState::Closed;
        }
        if let Some(link) = self.link() {
            link.state_changed(None);
        }
    }

    fn send(&self, chunk: TxChunk) -> Result<(), BridgeError> {
        if let Some(err) = self.fail_send.lock().take() {
            return Err(err);
        }
        if self.hold_sends.load(Ordering::SeqCst) {
            self.backlog.lock().push_back(chunk);
        } else {
            self.transmitted.lock().push(chunk.payload().clone());
        }
        Ok(())
    }

    fn throttle(&self) {
        self.throttled.store(true, Ordering::SeqCst);
    }

    fn unthrottle(&self) {
        self.throttled.store(false, Ordering::SeqCst);
    }

    fn remote_signals(&self) -> u8 {
        self.remote_sig.load(Ordering::SeqCst)
    }

    fn local_signals(&self) -> u8 {
        self.local_sig.load(Ordering::SeqCst)
    }

    fn set_local_signals(&self, signals: u8) {
        self.local_sig.store(signals, Ordering::SeqCst);
    }

    fn negotiate(&self, params: &PortNegotiation) -> Result<(), BridgeError> {
        *self.negotiated.lock() = Some(*params);
        Ok(())
    }

    fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    fn mtu(&self) -> usize {
        self.mtu.load(Ordering::SeqCst)
    }

    fn tx_credits(&self) -> usize {
        self.credits.load(Ordering::SeqCst)
    }

    fn has_tx_backlog(&self) -> bool {
        !self.backlog.lock().is_empty()
    }

    fn purge_tx(&self) {
        let purged: Vec<TxChunk> = self.backlog.lock().drain(..).collect();
        drop(purged);
    }

    fn claim_pending_rx(&self) -> Vec<Bytes> {
        self.unclaimed_rx.lock().drain(..).collect()
    }
}

/// Consumer that records everything delivered to it
pub struct RecordingConsumer {
    buffer: Mutex<Vec<u8>>,
    capacity: AtomicUsize,
    commits: AtomicUsize,
    wakes: AtomicUsize,
    hangups: AtomicUsize,
    ignore_carrier: AtomicBool,
}

impl Default for RecordingConsumer {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingConsumer {
    /// Create a consumer with unbounded buffer room
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: Mutex::new(Vec::new()),
            capacity: AtomicUsize::new(usize::MAX),
            commits: AtomicUsize::new(0),
            wakes: AtomicUsize::new(0),
            hangups: AtomicUsize::new(0),
            ignore_carrier: AtomicBool::new(false),
        }
    }

    /// Ignore carrier loss instead of treating it as a hangup
    #[must_use]
    pub fn ignoring_carrier(self) -> Self {
        self.ignore_carrier.store(true, Ordering::SeqCst);
        self
    }

    /// Limit how many bytes the buffer will accept in total
    #[must_use]
    pub fn with_capacity(self, capacity: usize) -> Self {
        self.capacity.store(capacity, Ordering::SeqCst);
        self
    }

    /// Everything received so far
    #[must_use]
    pub fn received(&self) -> Vec<u8> {
        self.buffer.lock().clone()
    }

    /// Number of completed delivery batches
    #[must_use]
    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    /// Number of writer wakeups
    #[must_use]
    pub fn writer_wakes(&self) -> usize {
        self.wakes.load(Ordering::SeqCst)
    }

    /// Number of hangup signals
    #[must_use]
    pub fn hangups(&self) -> usize {
        self.hangups.load(Ordering::SeqCst)
    }
}

impl PortConsumer for RecordingConsumer {
    fn insert_rx(&self, data: &[u8]) -> usize {
        let mut buffer = self.buffer.lock();
        let room = self
            .capacity
            .load(Ordering::SeqCst)
            .saturating_sub(buffer.len());
        let take = data.len().min(room);
        buffer.extend_from_slice(&data[..take]);
        take
    }

    fn commit_rx(&self) {
        self.commits.fetch_add(1, Ordering::SeqCst);
    }

    fn wake_writer(&self) {
        self.wakes.fetch_add(1, Ordering::SeqCst);
    }

    fn hangup(&self) {
        self.hangups.fetch_add(1, Ordering::SeqCst);
    }

    fn ignore_carrier(&self) -> bool {
        self.ignore_carrier.load(Ordering::SeqCst)
    }
}

/// One host callback observed by [`RecordingHost`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    /// A port was registered
    Registered(u16),
    /// A port was unregistered
    Unregistered(u16),
    /// A port was re-anchored
    Relocated(u16, Option<EndpointAddr>),
}

/// Host that records registration traffic
#[derive(Default)]
pub struct RecordingHost {
    events: Mutex<Vec<HostEvent>>,
    refuse_register: Mutex<Option<BridgeError>>,
}

impl RecordingHost {
    /// Create an empty recording host
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next registration fail
    pub fn refuse_next_register(&self, err: BridgeError) {
        *self.refuse_register.lock() = Some(err);
    }

    /// Everything observed so far
    #[must_use]
    pub fn events(&self) -> Vec<HostEvent> {
        self.events.lock().clone()
    }
}

impl PortHost for RecordingHost {
    fn register(&self, id: u16, _attrs: &PortAttributes) -> Result<(), BridgeError> {
        if let Some(err) = self.refuse_register.lock().take() {
            return Err(err);
        }
        self.events.lock().push(HostEvent::Registered(id));
        Ok(())
    }

    fn unregister(&self, id: u16) {
        self.events.lock().push(HostEvent::Unregistered(id));
    }

    fn relocate(&self, id: u16, endpoint: Option<&EndpointAddr>) {
        self.events.lock().push(HostEvent::Relocated(id, endpoint.copied()));
    }
}
