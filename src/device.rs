//! Per-port device records
//!
//! A [`PortDevice`] ties one registry slot, one data-link channel, and at
//! most one attached consumer together. Records are reference counted;
//! the registry holds one reference, every open port handle holds one,
//! and channel callbacks take short-lived ones. Destruction runs when the
//! last reference goes away, which is only legal after the record has been
//! unlinked from the registry.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use tracing::{debug, trace, warn};

use crate::bridge::{CreateRequest, PortBridge, RequestFlags};
use crate::channel::{
    ChannelState, DlcChannel, EndpointAddr, V24_DV, V24_IC, V24_RTC, V24_RTR,
};
use crate::consumer::{
    PortAttributes, PortConsumer, PortHost, LINE_CD, LINE_CTS, LINE_DSR, LINE_DTR, LINE_RI,
    LINE_RTS,
};
use crate::error::BridgeError;
use crate::settings::LineSettings;

/// Cancellation token for a blocking open
///
/// Clone the token and hand one copy to the opener; raising the other copy
/// from any thread makes a wait in progress return
/// [`BridgeError::Interrupted`]. A token is bound to one open call at a
/// time.
#[derive(Clone, Default)]
pub struct Interrupt {
    inner: Arc<InterruptState>,
}

#[derive(Default)]
struct InterruptState {
    raised: AtomicBool,
    target: Mutex<Weak<PortDevice>>,
}

impl Interrupt {
    /// Create an unraised token
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the token has been raised
    #[must_use]
    pub fn is_raised(&self) -> bool {
        self.inner.raised.load(Ordering::SeqCst)
    }

    /// Raise the token, waking any wait bound to it
    pub fn raise(&self) {
        self.inner.raised.store(true, Ordering::SeqCst);
        let target = self.inner.target.lock().upgrade();
        if let Some(dev) = target {
            dev.interrupt_connect_wait();
        }
    }

    pub(crate) fn bind(&self, dev: &Arc<PortDevice>) {
        *self.inner.target.lock() = Arc::downgrade(dev);
    }

    pub(crate) fn unbind(&self) {
        *self.inner.target.lock() = Weak::new();
    }
}

/// One chunk of outbound data with its accounting reservation
///
/// Dropping the chunk, anywhere, returns the reserved room to the port
/// and wakes a writer waiting for it. Transports therefore keep the chunk
/// alive exactly as long as the payload is queued.
pub struct TxChunk {
    data: Bytes,
    _guard: TxGuard,
}

impl TxChunk {
    /// The payload to put on the wire
    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.data
    }

    /// Payload length in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the payload is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

pub(crate) struct TxGuard {
    dev: Arc<PortDevice>,
    size: usize,
}

impl Drop for TxGuard {
    fn drop(&mut self) {
        self.dev.release_tx(self.size);
    }
}

impl std::fmt::Debug for PortDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortDevice")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Internal record for one bridged port
pub(crate) struct PortDevice {
    id: u16,
    name: String,
    local: EndpointAddr,
    remote: EndpointAddr,
    selector: u8,
    config: RequestFlags,

    released: AtomicBool,
    attached: AtomicBool,
    linked: AtomicBool,
    registered: AtomicBool,

    modem_status: AtomicU32,
    tx_outstanding: AtomicUsize,

    open_count: Mutex<u32>,
    pending: Mutex<VecDeque<Bytes>>,
    settings: Mutex<LineSettings>,

    /// Attached consumer. The slot itself is a lock, but attachment and
    /// detachment are additionally serialized by the channel lock so that
    /// channel callbacks see a stable consumer.
    consumer: RwLock<Option<Arc<dyn PortConsumer>>>,

    conn_err: Mutex<Option<BridgeError>>,
    connect_wait: Condvar,

    channel: Arc<DlcChannel>,
    host: Arc<dyn PortHost>,
    bridge: Arc<PortBridge>,
}

impl PortDevice {
    pub(crate) fn new(
        id: u16,
        req: &CreateRequest,
        channel: Arc<DlcChannel>,
        host: Arc<dyn PortHost>,
        bridge: Arc<PortBridge>,
    ) -> Self {
        Self {
            id,
            name: format!("vsp{id}"),
            local: req.local,
            remote: req.remote,
            selector: req.selector,
            config: req.flags,
            released: AtomicBool::new(false),
            attached: AtomicBool::new(false),
            linked: AtomicBool::new(false),
            registered: AtomicBool::new(false),
            modem_status: AtomicU32::new(0),
            tx_outstanding: AtomicUsize::new(0),
            open_count: Mutex::new(0),
            pending: Mutex::new(VecDeque::new()),
            settings: Mutex::new(LineSettings::default()),
            consumer: RwLock::new(None),
            conn_err: Mutex::new(None),
            connect_wait: Condvar::new(),
            channel,
            host,
            bridge,
        }
    }

    pub(crate) fn id(&self) -> u16 {
        self.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn local(&self) -> &EndpointAddr {
        &self.local
    }

    pub(crate) fn remote(&self) -> &EndpointAddr {
        &self.remote
    }

    pub(crate) fn selector(&self) -> u8 {
        self.selector
    }

    pub(crate) fn config(&self) -> RequestFlags {
        self.config
    }

    pub(crate) fn attributes(&self) -> PortAttributes {
        PortAttributes {
            remote: self.remote,
            selector: self.selector,
        }
    }

    pub(crate) fn channel(&self) -> &Arc<DlcChannel> {
        &self.channel
    }

    pub(crate) fn host(&self) -> &Arc<dyn PortHost> {
        &self.host
    }

    pub(crate) fn bridge_handle(&self) -> Arc<PortBridge> {
        Arc::clone(&self.bridge)
    }

    pub(crate) fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Set the released flag, returning whether it was already set
    pub(crate) fn mark_released(&self) -> bool {
        self.released.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    pub(crate) fn set_attached(&self, attached: bool) {
        self.attached.store(attached, Ordering::SeqCst);
    }

    pub(crate) fn set_linked(&self, linked: bool) {
        self.linked.store(linked, Ordering::SeqCst);
    }

    pub(crate) fn mark_registered(&self) {
        self.registered.store(true, Ordering::SeqCst);
    }

    pub(crate) fn open_count(&self) -> MutexGuard<'_, u32> {
        self.open_count.lock()
    }

    pub(crate) fn settings(&self) -> MutexGuard<'_, LineSettings> {
        self.settings.lock()
    }

    pub(crate) fn consumer(&self) -> Option<Arc<dyn PortConsumer>> {
        self.consumer.read().clone()
    }

    /// Caller must hold the channel lock
    pub(crate) fn install_consumer(&self, consumer: Arc<dyn PortConsumer>) {
        *self.consumer.write() = Some(consumer);
    }

    /// Caller must hold the channel lock
    pub(crate) fn remove_consumer(&self) -> Option<Arc<dyn PortConsumer>> {
        self.consumer.write().take()
    }

    pub(crate) fn seed_pending(&self, chunks: Vec<Bytes>) {
        let mut pending = self.pending.lock();
        pending.extend(chunks);
    }

    /// Route one inbound chunk. Runs under the channel lock.
    ///
    /// While the pending queue is non-empty, new data lines up behind it
    /// so nothing overtakes the handoff backlog. Without a consumer the
    /// data is held for delivery at open time.
    pub(crate) fn take_inbound(&self, chunk: Bytes) {
        let mut pending = self.pending.lock();
        if !pending.is_empty() {
            pending.push_back(chunk);
            return;
        }
        match self.consumer() {
            Some(consumer) => {
                drop(pending);
                deliver(self.id, &*consumer, &chunk);
                consumer.commit_rx();
            }
            None => pending.push_back(chunk),
        }
    }

    /// Hand held data to the attached consumer, oldest first
    ///
    /// The queue lock is held through delivery, so a chunk arriving
    /// concurrently cannot overtake the backlog.
    pub(crate) fn drain_pending(&self) {
        let consumer = self.consumer();
        let mut pending = self.pending.lock();
        if pending.is_empty() {
            return;
        }
        debug!(port = self.id, chunks = pending.len(), "delivering held data");
        while let Some(chunk) = pending.pop_front() {
            if let Some(consumer) = &consumer {
                deliver(self.id, &**consumer, &chunk);
            }
        }
        drop(pending);
        if let Some(consumer) = &consumer {
            consumer.commit_rx();
        }
    }

    /// Fold remote signal bits into the modem line bitmap
    ///
    /// A carrier drop hangs the attached consumer up unless it asked to
    /// ignore carrier.
    pub(crate) fn apply_modem_signals(&self, signals: u8) {
        let old = self.modem_status.load(Ordering::Relaxed);
        if old & LINE_CD != 0 && signals & V24_DV == 0 {
            if let Some(consumer) = self.consumer() {
                if !consumer.ignore_carrier() {
                    debug!(port = self.id, "carrier lost, hanging up");
                    consumer.hangup();
                }
            }
        }

        let mut status = 0u32;
        if signals & V24_RTC != 0 {
            status |= LINE_DSR | LINE_DTR;
        }
        if signals & V24_RTR != 0 {
            status |= LINE_RTS | LINE_CTS;
        }
        if signals & V24_IC != 0 {
            status |= LINE_RI;
        }
        if signals & V24_DV != 0 {
            status |= LINE_CD;
        }
        self.modem_status.store(status, Ordering::Relaxed);
        trace!(port = self.id, signals, status, "modem signals updated");
    }

    pub(crate) fn modem_status_bits(&self) -> u32 {
        self.modem_status.load(Ordering::Relaxed)
    }

    /// Record a channel transition and wake any blocked opener
    pub(crate) fn note_channel_state(&self, err: Option<BridgeError>) {
        let mut slot = self.conn_err.lock();
        *slot = err;
        self.connect_wait.notify_all();
    }

    pub(crate) fn interrupt_connect_wait(&self) {
        // Taking the wait mutex before notifying closes the window where a
        // waiter has checked the token but not yet gone to sleep.
        let _slot = self.conn_err.lock();
        self.connect_wait.notify_all();
    }

    /// Block until the channel settles into connected or closed state, or
    /// the interrupt fires
    pub(crate) fn wait_for_connection(&self, interrupt: &Interrupt) -> Result<(), BridgeError> {
        let mut slot = self.conn_err.lock();
        loop {
            match self.channel.driver().state() {
                ChannelState::Connected => return Ok(()),
                ChannelState::Closed => {
                    return Err(slot.take().unwrap_or(BridgeError::ChannelClosed));
                }
                _ => {}
            }
            if interrupt.is_raised() {
                return Err(BridgeError::Interrupted);
            }
            self.connect_wait.wait(&mut slot);
        }
    }

    fn tx_room_limit(&self) -> usize {
        let driver = self.channel.driver();
        // The limit never falls below one MTU. A writer that is told there
        // is no room only gets woken by a completed send, and with zero
        // credits there would never be one.
        driver.mtu() * driver.tx_credits().max(1)
    }

    /// Room left for outbound data before writers should back off
    pub(crate) fn tx_room(&self) -> usize {
        self.tx_room_limit()
            .saturating_sub(self.tx_outstanding.load(Ordering::Relaxed))
    }

    /// Reserve accounting for one outbound chunk
    ///
    /// Succeeds while outstanding data is under the limit, so a single
    /// chunk may run past it; the next reservation then fails.
    pub(crate) fn reserve_tx(self: &Arc<Self>, size: usize) -> Option<TxGuard> {
        if self.tx_outstanding.load(Ordering::Relaxed) >= self.tx_room_limit() {
            return None;
        }
        self.tx_outstanding.fetch_add(size, Ordering::Relaxed);
        Some(TxGuard {
            dev: Arc::clone(self),
            size,
        })
    }

    /// Build a chunk from reserved room
    pub(crate) fn make_chunk(data: Bytes, guard: TxGuard) -> TxChunk {
        TxChunk {
            data,
            _guard: guard,
        }
    }

    fn release_tx(&self, size: usize) {
        self.tx_outstanding.fetch_sub(size, Ordering::Relaxed);
        if self.attached.load(Ordering::SeqCst) {
            if let Some(consumer) = self.consumer() {
                consumer.wake_writer();
            }
        }
    }
}

fn deliver(id: u16, consumer: &dyn PortConsumer, chunk: &Bytes) {
    let taken = consumer.insert_rx(chunk);
    if taken < chunk.len() {
        warn!(
            port = id,
            dropped = chunk.len() - taken,
            "consumer dropped inbound bytes"
        );
    }
}

impl Drop for PortDevice {
    fn drop(&mut self) {
        // The last reference can only go away after the registry dropped
        // its own; reaching here while linked is a refcounting bug.
        assert!(
            !self.linked.load(Ordering::SeqCst),
            "port {} destroyed while still in the registry",
            self.id
        );
        let ptr: *const PortDevice = self;
        self.channel.clear_owner_if(ptr);
        if self.registered.load(Ordering::SeqCst) {
            self.host.unregister(self.id);
        }
        trace!(port = self.id, name = %self.name, "port device destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::CreateRequest;
    use crate::consumer::NullHost;
    use crate::sim::{LoopbackChannel, RecordingConsumer};
    use std::time::Duration;

    fn make_device(driver: &Arc<LoopbackChannel>) -> Arc<PortDevice> {
        let channel = DlcChannel::new(driver.clone());
        driver.bind(&channel);
        let bridge = PortBridge::new(Arc::new(NullHost));
        let req = CreateRequest::new(
            EndpointAddr::default(),
            EndpointAddr([0x11; 6]),
            3,
        );
        Arc::new(PortDevice::new(7, &req, channel, Arc::new(NullHost), bridge))
    }

    #[test]
    fn test_room_floor_with_zero_credits() {
        let driver = LoopbackChannel::new(512);
        driver.set_credits(0);
        let dev = make_device(&driver);
        assert_eq!(dev.tx_room(), 512);
    }

    #[test]
    fn test_room_scales_with_credits() {
        let driver = LoopbackChannel::new(128);
        driver.set_credits(4);
        let dev = make_device(&driver);
        assert_eq!(dev.tx_room(), 512);
    }

    #[test]
    fn test_reserve_release_cycle() {
        let driver = LoopbackChannel::new(100);
        driver.set_credits(2);
        let dev = make_device(&driver);

        let guard = dev.reserve_tx(100).unwrap();
        assert_eq!(dev.tx_room(), 100);
        drop(guard);
        assert_eq!(dev.tx_room(), 200);
    }

    #[test]
    fn test_reserve_stops_at_limit() {
        let driver = LoopbackChannel::new(100);
        driver.set_credits(1);
        let dev = make_device(&driver);

        let g1 = dev.reserve_tx(100);
        assert!(g1.is_some());
        assert!(dev.reserve_tx(100).is_none());
        drop(g1);
        assert!(dev.reserve_tx(100).is_some());
    }

    #[test]
    fn test_release_wakes_attached_writer() {
        let driver = LoopbackChannel::new(64);
        driver.set_credits(1);
        let dev = make_device(&driver);
        let consumer = Arc::new(RecordingConsumer::new());
        dev.install_consumer(consumer.clone());
        dev.set_attached(true);

        let guard = dev.reserve_tx(64).unwrap();
        assert_eq!(consumer.writer_wakes(), 0);
        drop(guard);
        assert_eq!(consumer.writer_wakes(), 1);
    }

    #[test]
    fn test_modem_signal_mapping() {
        let driver = LoopbackChannel::new(64);
        let dev = make_device(&driver);
        dev.apply_modem_signals(V24_RTC | V24_DV);
        let bits = dev.modem_status_bits();
        assert_eq!(bits, LINE_DSR | LINE_DTR | LINE_CD);

        dev.apply_modem_signals(V24_RTR | V24_IC);
        let bits = dev.modem_status_bits();
        assert_eq!(bits, LINE_RTS | LINE_CTS | LINE_RI);
    }

    #[test]
    fn test_carrier_drop_hangs_up() {
        let driver = LoopbackChannel::new(64);
        let dev = make_device(&driver);
        let consumer = Arc::new(RecordingConsumer::new());
        dev.install_consumer(consumer.clone());

        dev.apply_modem_signals(V24_DV);
        assert_eq!(consumer.hangups(), 0);
        dev.apply_modem_signals(0);
        assert_eq!(consumer.hangups(), 1);
    }

    #[test]
    fn test_carrier_drop_ignored_when_asked() {
        let driver = LoopbackChannel::new(64);
        let dev = make_device(&driver);
        let consumer = Arc::new(RecordingConsumer::new().ignoring_carrier());
        dev.install_consumer(consumer.clone());

        dev.apply_modem_signals(V24_DV);
        dev.apply_modem_signals(0);
        assert_eq!(consumer.hangups(), 0);
    }

    #[test]
    fn test_inbound_queues_behind_pending() {
        let driver = LoopbackChannel::new(64);
        let dev = make_device(&driver);
        let consumer = Arc::new(RecordingConsumer::new());
        dev.install_consumer(consumer.clone());

        dev.seed_pending(vec![Bytes::from_static(b"one")]);
        dev.take_inbound(Bytes::from_static(b"two"));
        // Nothing reaches the consumer until the backlog drains.
        assert!(consumer.received().is_empty());

        dev.drain_pending();
        assert_eq!(consumer.received(), b"onetwo");

        dev.take_inbound(Bytes::from_static(b"three"));
        assert_eq!(consumer.received(), b"onetwothree");
    }

    #[test]
    fn test_inbound_held_without_consumer() {
        let driver = LoopbackChannel::new(64);
        let dev = make_device(&driver);

        dev.take_inbound(Bytes::from_static(b"early"));
        let consumer = Arc::new(RecordingConsumer::new());
        dev.install_consumer(consumer.clone());
        dev.drain_pending();
        assert_eq!(consumer.received(), b"early");
    }

    #[test]
    fn test_interrupt_wakes_connect_wait() {
        let driver = LoopbackChannel::new(64);
        driver.set_state(ChannelState::Connecting);
        let dev = make_device(&driver);
        let interrupt = Interrupt::new();
        interrupt.bind(&dev);

        let (tx, rx) = crossbeam_channel::bounded(1);
        let waiter = {
            let dev = dev.clone();
            let interrupt = interrupt.clone();
            std::thread::spawn(move || {
                let r = dev.wait_for_connection(&interrupt);
                tx.send(r).unwrap();
            })
        };

        interrupt.raise();
        let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(result, Err(BridgeError::Interrupted));
        waiter.join().unwrap();
    }

    #[test]
    fn test_connect_wait_returns_stored_error() {
        let driver = LoopbackChannel::new(64);
        driver.set_state(ChannelState::Closed);
        let dev = make_device(&driver);
        dev.note_channel_state(Some(BridgeError::Transport("refused".into())));

        let interrupt = Interrupt::new();
        let result = dev.wait_for_connection(&interrupt);
        assert_eq!(result, Err(BridgeError::Transport("refused".into())));
    }

    #[test]
    #[should_panic(expected = "still in the registry")]
    fn test_destroy_while_linked_panics() {
        let driver = LoopbackChannel::new(64);
        let dev = make_device(&driver);
        dev.set_linked(true);
        drop(dev);
    }
}
