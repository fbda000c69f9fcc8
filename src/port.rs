//! Open port handles
//!
//! A [`Port`] is the I/O surface over one bridged device. The first open
//! attaches the consumer and dials the channel, blocking until the link
//! settles; the last close detaches and shuts the channel down. Opens
//! in between just raise the open count and share everything.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::channel::{ChannelState, V24_DV, V24_IC, V24_RTC, V24_RTR};
use crate::consumer::{PortConsumer, LINE_CD, LINE_CTS, LINE_DSR, LINE_DTR, LINE_RI, LINE_RTS};
use crate::device::{Interrupt, PortDevice};
use crate::error::BridgeError;
use crate::settings::{self, LineSettings};

/// Handle to an open port
///
/// Dropping the handle closes it; [`close`](Self::close) does the same
/// explicitly.
pub struct Port {
    dev: Arc<PortDevice>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Port")
            .field("dev", &self.dev)
            .field("closed", &self.closed)
            .finish()
    }
}

impl Port {
    pub(crate) fn establish(
        dev: Arc<PortDevice>,
        consumer: Arc<dyn PortConsumer>,
        interrupt: &Interrupt,
    ) -> Result<Self, BridgeError> {
        {
            let mut count = dev.open_count();
            *count += 1;
            if *count > 1 {
                drop(count);
                debug!(port = dev.id(), "port opened again");
                return Ok(Self {
                    dev,
                    closed: AtomicBool::new(false),
                });
            }
        }

        debug!(port = dev.id(), remote = %dev.remote(), "first open, dialing channel");
        {
            let _shared = dev.channel().lock_shared();
            dev.install_consumer(consumer);
        }
        dev.set_attached(true);

        let port = Self {
            dev,
            closed: AtomicBool::new(false),
        };
        let dev = &port.dev;

        if let Err(err) = dev
            .channel()
            .driver()
            .connect(dev.local(), dev.remote(), dev.selector())
        {
            warn!(port = dev.id(), error = %err, "connect request failed");
            port.close_inner();
            return Err(err);
        }

        interrupt.bind(dev);
        let waited = dev.wait_for_connection(interrupt);
        interrupt.unbind();

        match waited {
            Ok(()) => {
                dev.host().relocate(dev.id(), Some(dev.remote()));
                dev.drain_pending();
                dev.channel().driver().unthrottle();
                debug!(port = dev.id(), "port open");
                Ok(port)
            }
            Err(err) => {
                debug!(port = port.dev.id(), error = %err, "open did not complete");
                port.close_inner();
                Err(err)
            }
        }
    }

    /// Port id
    #[must_use]
    pub fn id(&self) -> u16 {
        self.dev.id()
    }

    /// Port name derived from the id
    #[must_use]
    pub fn name(&self) -> &str {
        self.dev.name()
    }

    /// Connection state of the underlying channel
    #[must_use]
    pub fn channel_state(&self) -> ChannelState {
        self.dev.channel().driver().state()
    }

    /// Write bytes, splitting them into MTU-sized chunks
    ///
    /// Stops early when outbound accounting runs out of room and returns
    /// how much was accepted. An error from the channel surfaces only
    /// when nothing was accepted at all.
    pub fn write(&self, data: &[u8]) -> Result<usize, BridgeError> {
        let driver = self.dev.channel().driver();
        let mtu = driver.mtu();
        let mut sent = 0usize;
        let mut failure = None;
        while sent < data.len() {
            let size = (data.len() - sent).min(mtu);
            let Some(guard) = self.dev.reserve_tx(size) else {
                break;
            };
            let chunk = PortDevice::make_chunk(Bytes::copy_from_slice(&data[sent..sent + size]), guard);
            if let Err(err) = driver.send(chunk) {
                failure = Some(err);
                break;
            }
            sent += size;
        }
        trace!(port = self.dev.id(), requested = data.len(), sent, "write");
        if sent > 0 {
            Ok(sent)
        } else if let Some(err) = failure {
            Err(err)
        } else {
            Ok(0)
        }
    }

    /// Room left for outbound data before writes start being cut short
    #[must_use]
    pub fn write_room(&self) -> usize {
        self.dev.tx_room()
    }

    /// Rough amount of data still queued on the channel
    ///
    /// Reported as one MTU while a backlog exists, zero otherwise.
    #[must_use]
    pub fn queued_len(&self) -> usize {
        let driver = self.dev.channel().driver();
        if driver.has_tx_backlog() {
            driver.mtu()
        } else {
            0
        }
    }

    /// Discard queued outbound data and wake the writer
    pub fn flush_tx(&self) {
        self.dev.channel().driver().purge_tx();
        if let Some(consumer) = self.dev.consumer() {
            consumer.wake_writer();
        }
    }

    /// Stop the remote end from sending
    pub fn throttle(&self) {
        self.dev.channel().driver().throttle();
    }

    /// Allow the remote end to send again
    pub fn unthrottle(&self) {
        self.dev.channel().driver().unthrottle();
    }

    /// Modem line bitmap as driven by the remote end (`LINE_*`)
    #[must_use]
    pub fn modem_status(&self) -> u32 {
        self.dev.modem_status_bits()
    }

    /// Raise and lower local modem lines
    ///
    /// Line bits fold into the channel's signal bits pairwise: DTR and DSR
    /// drive ready-to-communicate, RTS and CTS drive ready-to-receive.
    pub fn set_modem_lines(&self, set: u32, clear: u32) {
        let driver = self.dev.channel().driver();
        let mut signals = driver.local_signals();
        if set & (LINE_DTR | LINE_DSR) != 0 {
            signals |= V24_RTC;
        }
        if set & (LINE_RTS | LINE_CTS) != 0 {
            signals |= V24_RTR;
        }
        if set & LINE_RI != 0 {
            signals |= V24_IC;
        }
        if set & LINE_CD != 0 {
            signals |= V24_DV;
        }
        if clear & (LINE_DTR | LINE_DSR) != 0 {
            signals &= !V24_RTC;
        }
        if clear & (LINE_RTS | LINE_CTS) != 0 {
            signals &= !V24_RTR;
        }
        if clear & LINE_RI != 0 {
            signals &= !V24_IC;
        }
        if clear & LINE_CD != 0 {
            signals &= !V24_DV;
        }
        driver.set_local_signals(signals);
    }

    /// Current line settings
    #[must_use]
    pub fn current_settings(&self) -> LineSettings {
        *self.dev.settings()
    }

    /// Apply new line settings, negotiating changed fields with the peer
    pub fn apply_settings(&self, new: &LineSettings) {
        let mut current = self.dev.settings();
        if let Some(params) = settings::translate(&current, new) {
            if let Err(err) = self.dev.channel().driver().negotiate(&params) {
                warn!(port = self.dev.id(), error = %err, "parameter negotiation failed");
            }
        }
        *current = *new;
    }

    /// Handle a line hangup
    ///
    /// Flushes queued output; a release-on-hangup port also starts its own
    /// teardown, unless someone else already has.
    pub fn hangup(&self) {
        debug!(port = self.dev.id(), "hangup");
        self.flush_tx();
        if self.dev.config().release_on_hangup {
            self.dev.bridge_handle().reap(self.dev.id());
        }
    }

    /// Close the handle
    pub fn close(self) {
        self.close_inner();
    }

    fn close_inner(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let dev = &self.dev;
        let mut count = dev.open_count();
        debug_assert!(*count > 0);
        *count -= 1;
        if *count > 0 {
            return;
        }
        drop(count);

        debug!(port = dev.id(), "last close, shutting channel down");
        dev.host().relocate(dev.id(), None);
        dev.channel().driver().shutdown(Duration::ZERO);
        dev.set_attached(false);
        let previous = {
            let _shared = dev.channel().lock_shared();
            dev.remove_consumer()
        };
        drop(previous);

        if dev.is_released() {
            dev.bridge_handle().complete_deferred_removal(dev);
        }
    }
}

impl Drop for Port {
    fn drop(&mut self) {
        self.close_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{
        CreateRequest, PortBridge, ReleaseRequest, RequestFlags, FLAG_RELEASED,
    };
    use crate::channel::{ChannelDriver, DlcChannel, EndpointAddr};
    use crate::consumer::NullHost;
    use crate::settings::{CHANGE_BITRATE, BAUD_115200};
    use crate::sim::{LoopbackChannel, RecordingConsumer};

    fn setup(mtu: usize) -> (Arc<PortBridge>, Arc<LoopbackChannel>, u16) {
        let bridge = PortBridge::new(Arc::new(NullHost));
        let driver = LoopbackChannel::new(mtu);
        let channel = DlcChannel::new(driver.clone());
        driver.bind(&channel);
        let req = CreateRequest::new(EndpointAddr::default(), EndpointAddr([5; 6]), 4).privileged();
        let id = bridge.create(&req, &channel).unwrap();
        (bridge, driver, id)
    }

    fn open(bridge: &Arc<PortBridge>, id: u16) -> (Port, Arc<RecordingConsumer>) {
        let consumer = Arc::new(RecordingConsumer::new());
        let port = bridge.open(id, consumer.clone(), &Interrupt::new()).unwrap();
        (port, consumer)
    }

    #[test]
    fn test_write_splits_at_mtu() {
        let (bridge, driver, id) = setup(8);
        let (port, _consumer) = open(&bridge, id);

        let n = port.write(b"abcdefghijklmnopqrst").unwrap();
        assert_eq!(n, 20);
        let sent = driver.transmitted();
        assert_eq!(sent.len(), 3);
        assert_eq!(&sent[0][..], b"abcdefgh");
        assert_eq!(&sent[1][..], b"ijklmnop");
        assert_eq!(&sent[2][..], b"qrst");

        port.close();
        bridge.shutdown();
    }

    #[test]
    fn test_write_stops_when_room_runs_out() {
        let (bridge, driver, id) = setup(8);
        driver.set_credits(1);
        driver.hold_sends();
        let (port, consumer) = open(&bridge, id);

        let n = port.write(&[0x55; 64]).unwrap();
        assert_eq!(n, 8);
        assert_eq!(port.write_room(), 0);
        assert_eq!(port.write(&[0x55; 8]).unwrap(), 0);

        driver.release_backlog(1);
        assert_eq!(port.write_room(), 8);
        assert!(consumer.writer_wakes() > 0);

        port.close();
        bridge.shutdown();
    }

    #[test]
    fn test_write_surfaces_send_failure() {
        let (bridge, driver, id) = setup(8);
        let (port, _consumer) = open(&bridge, id);

        driver.fail_next_send(BridgeError::Transport("link reset".into()));
        let err = port.write(b"hello").unwrap_err();
        assert_eq!(err, BridgeError::Transport("link reset".into()));
        // Failed sends return their reserved room.
        assert_eq!(port.write_room(), 8 * 8);

        port.close();
        bridge.shutdown();
    }

    #[test]
    fn test_queued_len_tracks_backlog() {
        let (bridge, driver, id) = setup(8);
        driver.set_credits(2);
        driver.hold_sends();
        let (port, _consumer) = open(&bridge, id);

        assert_eq!(port.queued_len(), 0);
        port.write(&[1u8; 16]).unwrap();
        assert_eq!(port.queued_len(), 8);
        driver.release_backlog(2);
        assert_eq!(port.queued_len(), 0);

        port.close();
        bridge.shutdown();
    }

    #[test]
    fn test_flush_discards_backlog() {
        let (bridge, driver, id) = setup(8);
        driver.set_credits(2);
        driver.hold_sends();
        let (port, consumer) = open(&bridge, id);

        port.write(&[1u8; 16]).unwrap();
        assert_eq!(port.write_room(), 0);
        port.flush_tx();
        assert_eq!(port.queued_len(), 0);
        assert_eq!(port.write_room(), 16);
        assert!(consumer.writer_wakes() > 0);
        assert!(driver.transmitted().is_empty());

        port.close();
        bridge.shutdown();
    }

    #[test]
    fn test_modem_lines_fold_into_signals() {
        let (bridge, driver, id) = setup(8);
        let (port, _consumer) = open(&bridge, id);

        port.set_modem_lines(LINE_DTR | LINE_RTS, 0);
        assert_eq!(driver.local_signals(), V24_RTC | V24_RTR);
        port.set_modem_lines(LINE_RI, LINE_DTR);
        assert_eq!(driver.local_signals(), V24_RTR | V24_IC);

        driver.set_remote_signals(V24_DV | V24_RTC);
        assert_eq!(port.modem_status(), LINE_CD | LINE_DSR | LINE_DTR);

        port.close();
        bridge.shutdown();
    }

    #[test]
    fn test_apply_settings_negotiates_changes() {
        let (bridge, driver, id) = setup(8);
        let (port, _consumer) = open(&bridge, id);

        let faster = port.current_settings().with_baud(115_200);
        port.apply_settings(&faster);
        let msg = driver.last_negotiation().unwrap();
        assert_eq!(msg.mask, CHANGE_BITRATE);
        assert_eq!(msg.baud, BAUD_115200);
        assert_eq!(port.current_settings().baud, 115_200);

        port.close();
        bridge.shutdown();
    }

    #[test]
    fn test_second_open_shares_consumer() {
        let (bridge, driver, id) = setup(8);
        let (first, consumer) = open(&bridge, id);
        let ignored = Arc::new(RecordingConsumer::new());
        let second = bridge.open(id, ignored.clone(), &Interrupt::new()).unwrap();

        assert_eq!(driver.connect_calls(), 1);
        driver.inject_rx(Bytes::from_static(b"shared"));
        assert_eq!(consumer.received(), b"shared");
        assert!(ignored.received().is_empty());

        first.close();
        // Still attached: the remaining handle keeps the consumer.
        driver.inject_rx(Bytes::from_static(b"!"));
        assert_eq!(consumer.received(), b"shared!");
        assert_eq!(driver.shutdown_calls(), 0);

        second.close();
        assert_eq!(driver.shutdown_calls(), 1);
        bridge.shutdown();
    }

    #[test]
    fn test_failed_open_rebalances() {
        let (bridge, driver, id) = setup(8);
        driver.refuse_next_connect(BridgeError::Transport("refused".into()));

        let consumer = Arc::new(RecordingConsumer::new());
        let err = bridge.open(id, consumer, &Interrupt::new()).unwrap_err();
        assert_eq!(err, BridgeError::Transport("refused".into()));

        // The failed open left nothing attached, so release removes the
        // port immediately instead of deferring.
        bridge.release(id, &ReleaseRequest::new().privileged()).unwrap();
        assert_eq!(bridge.info(id), Err(BridgeError::NotFound));
    }

    #[test]
    fn test_interrupted_open() {
        let (bridge, driver, id) = setup(8);
        driver.hold_connect();

        let interrupt = Interrupt::new();
        let (tx, rx) = crossbeam_channel::bounded(1);
        let opener = {
            let bridge = bridge.clone();
            let interrupt = interrupt.clone();
            std::thread::spawn(move || {
                let consumer = Arc::new(RecordingConsumer::new());
                tx.send(()).unwrap();
                bridge.open(id, consumer, &interrupt)
            })
        };

        rx.recv().unwrap();
        // Give the opener a moment to reach the wait before cancelling.
        std::thread::sleep(std::time::Duration::from_millis(20));
        interrupt.raise();
        let result = opener.join().unwrap();
        assert!(matches!(result, Err(BridgeError::Interrupted)));

        bridge.release(id, &ReleaseRequest::new().privileged()).unwrap();
        assert_eq!(bridge.info(id), Err(BridgeError::NotFound));
    }

    #[test]
    fn test_hangup_tears_down_release_on_hangup_port() {
        let bridge = PortBridge::new(Arc::new(NullHost));
        let driver = LoopbackChannel::new(8);
        driver.set_state(ChannelState::Connected);
        let channel = DlcChannel::new(driver.clone());
        driver.bind(&channel);
        let req = CreateRequest::new(EndpointAddr::default(), EndpointAddr([5; 6]), 4)
            .with_flags(RequestFlags::unprivileged());
        let id = bridge.create(&req, &channel).unwrap();

        let (port, _consumer) = open(&bridge, id);
        assert!(!driver.is_throttled());

        port.hangup();
        let info = bridge.info(id).unwrap();
        assert_ne!(info.flags & FLAG_RELEASED, 0);

        port.close();
        assert_eq!(bridge.info(id), Err(BridgeError::NotFound));
    }
}
