//! Bridge control surface
//!
//! One [`PortBridge`] owns the registry and carries the host integration.
//! Ports are created around a data-link channel, looked up by id, opened
//! into [`Port`] handles, and released either explicitly or automatically
//! when their line hangs up. Devices keep a reference back to the bridge,
//! so the bridge outlives every port it ever created.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::channel::{ChannelState, DlcChannel, EndpointAddr};
use crate::consumer::{PortConsumer, PortHost};
use crate::device::{Interrupt, PortDevice};
use crate::error::BridgeError;
use crate::port::Port;
use crate::registry::PortRegistry;

/// Config flag bit: tear the port down when its line hangs up
pub const FLAG_RELEASE_ON_HANGUP: u32 = 1 << 0;
/// Config flag bit: the port adopted an already connected channel
pub const FLAG_REUSE_CHANNEL: u32 = 1 << 1;
/// Runtime flag bit: a consumer is attached
pub const FLAG_ATTACHED: u32 = 1 << 2;
/// Runtime flag bit: release in progress
pub const FLAG_RELEASED: u32 = 1 << 3;

/// Per-port configuration flags chosen at creation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFlags {
    /// Tear the port down automatically when the line hangs up
    pub release_on_hangup: bool,
    /// Adopt the already connected channel instead of dialing out
    pub reuse_channel: bool,
}

impl RequestFlags {
    /// The exact flag pair unprivileged callers are allowed to use
    #[must_use]
    pub fn unprivileged() -> Self {
        Self {
            release_on_hangup: true,
            reuse_channel: true,
        }
    }

    pub(crate) fn is_unprivileged(self) -> bool {
        self.release_on_hangup && self.reuse_channel
    }

    pub(crate) fn bits(self) -> u32 {
        let mut bits = 0;
        if self.release_on_hangup {
            bits |= FLAG_RELEASE_ON_HANGUP;
        }
        if self.reuse_channel {
            bits |= FLAG_REUSE_CHANNEL;
        }
        bits
    }
}

/// Parameters for creating a port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateRequest {
    /// Specific id to use, or `None` for the smallest free one
    pub id: Option<u16>,
    /// Local endpoint the connection originates from
    pub local: EndpointAddr,
    /// Remote endpoint to connect to
    pub remote: EndpointAddr,
    /// Service selector on the remote endpoint
    pub selector: u8,
    /// Configuration flags
    pub flags: RequestFlags,
    /// Whether the caller holds administrative privilege
    pub privileged: bool,
}

impl CreateRequest {
    /// Create a request with default flags and automatic id choice
    #[must_use]
    pub fn new(local: EndpointAddr, remote: EndpointAddr, selector: u8) -> Self {
        Self {
            id: None,
            local,
            remote,
            selector,
            flags: RequestFlags::default(),
            privileged: false,
        }
    }

    /// Request a specific port id
    #[must_use]
    pub fn with_id(mut self, id: u16) -> Self {
        self.id = Some(id);
        self
    }

    /// Set the configuration flags
    #[must_use]
    pub fn with_flags(mut self, flags: RequestFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Mark the caller as privileged
    #[must_use]
    pub fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }
}

/// Parameters for releasing a port
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseRequest {
    /// Close the channel immediately instead of waiting for the consumer
    pub hangup_now: bool,
    /// Whether the caller holds administrative privilege
    pub privileged: bool,
}

impl ReleaseRequest {
    /// Create a plain release request
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Close the channel immediately
    #[must_use]
    pub fn hangup_now(mut self) -> Self {
        self.hangup_now = true;
        self
    }

    /// Mark the caller as privileged
    #[must_use]
    pub fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }
}

/// Snapshot of one port's externally visible state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    /// Port id
    pub id: u16,
    /// Combined `FLAG_*` bits, configuration and runtime
    pub flags: u32,
    /// Connection state of the underlying channel
    pub state: ChannelState,
    /// Service selector on the remote endpoint
    pub selector: u8,
    /// Local endpoint
    pub local: EndpointAddr,
    /// Remote endpoint
    pub remote: EndpointAddr,
}

/// The device bridge
///
/// Create one per transport stack, hand every accepted or dialed channel
/// to [`create`](Self::create), and open ports into I/O handles with
/// [`open`](Self::open).
pub struct PortBridge {
    registry: PortRegistry,
    host: Arc<dyn PortHost>,
}

impl PortBridge {
    /// Create a bridge that publishes ports through `host`
    #[must_use]
    pub fn new(host: Arc<dyn PortHost>) -> Arc<Self> {
        Arc::new(Self {
            registry: PortRegistry::new(),
            host,
        })
    }

    /// Create a port around `channel` and return its id
    ///
    /// Unprivileged callers must request exactly the
    /// [`RequestFlags::unprivileged`] pair. Adopting a channel with
    /// `reuse_channel` requires it to be connected already; its buffered
    /// inbound data is carried over and delivered once the port is opened.
    pub fn create(
        self: &Arc<Self>,
        req: &CreateRequest,
        channel: &Arc<DlcChannel>,
    ) -> Result<u16, BridgeError> {
        if !req.flags.is_unprivileged() && !req.privileged {
            return Err(BridgeError::PermissionDenied);
        }
        if req.flags.reuse_channel && channel.driver().state() != ChannelState::Connected {
            return Err(BridgeError::BadState("channel to reuse is not connected"));
        }

        let dev = self.registry.insert_with(req.id, |id| {
            let dev = Arc::new(PortDevice::new(
                id,
                req,
                Arc::clone(channel),
                Arc::clone(&self.host),
                Arc::clone(self),
            ));
            channel.adopt(&dev, req.flags.reuse_channel);
            Ok(dev)
        })?;

        debug!(
            port = dev.id(),
            remote = %dev.remote(),
            selector = dev.selector(),
            "port created"
        );

        if let Err(err) = self.host.register(dev.id(), &dev.attributes()) {
            warn!(port = dev.id(), error = %err, "host rejected port registration");
            channel.clear_owner_if(Arc::as_ptr(&dev));
            let removed = self.registry.unlink(dev.id());
            drop(removed);
            return Err(err);
        }
        dev.mark_registered();
        Ok(dev.id())
    }

    /// Release a port
    ///
    /// Releasing while the port is open marks it released and defers
    /// teardown to the last close. Ports created with release-on-hangup
    /// are only detached here when `hangup_now` closes their channel; the
    /// hangup path finishes the job.
    pub fn release(&self, id: u16, req: &ReleaseRequest) -> Result<(), BridgeError> {
        let dev = self.lookup(id).ok_or(BridgeError::NotFound)?;
        if !dev.config().is_unprivileged() && !req.privileged {
            return Err(BridgeError::PermissionDenied);
        }
        debug!(port = id, hangup_now = req.hangup_now, "releasing port");
        if req.hangup_now {
            dev.channel().driver().shutdown(Duration::ZERO);
        }
        // Wind the consumer down before the record can go away.
        if let Some(consumer) = dev.consumer() {
            consumer.hangup();
        }
        if !dev.config().release_on_hangup {
            self.remove_device(&dev);
        }
        Ok(())
    }

    /// Open a port, blocking until its channel connects
    ///
    /// The first open attaches `consumer` and dials the channel; further
    /// opens share the attached consumer and return at once, dropping the
    /// one passed in. `interrupt` cancels the connect wait. A failed or
    /// cancelled open leaves the port closed again.
    pub fn open(
        &self,
        id: u16,
        consumer: Arc<dyn PortConsumer>,
        interrupt: &Interrupt,
    ) -> Result<Port, BridgeError> {
        let dev = self.lookup(id).ok_or(BridgeError::NotFound)?;
        Port::establish(dev, consumer, interrupt)
    }

    /// Snapshot of up to `limit` live ports in id order
    #[must_use]
    pub fn list(&self, limit: usize) -> Vec<PortInfo> {
        self.registry
            .snapshot(limit)
            .iter()
            .map(|dev| Self::describe(dev))
            .collect()
    }

    /// Details for one port
    ///
    /// Released ports stay visible here until teardown completes, with
    /// [`FLAG_RELEASED`] set in the flags word.
    pub fn info(&self, id: u16) -> Result<PortInfo, BridgeError> {
        let dev = self.registry.find_any(id).ok_or(BridgeError::NotFound)?;
        Ok(Self::describe(&dev))
    }

    /// Release every remaining port, for transport-stack teardown
    pub fn shutdown(&self) {
        let drained = self.registry.clear();
        if !drained.is_empty() {
            info!(ports = drained.len(), "bridge shut down with live ports");
        }
        for dev in drained {
            dev.mark_released();
            // reference dropped here, outside the registry lock
        }
    }

    fn describe(dev: &Arc<PortDevice>) -> PortInfo {
        let mut flags = dev.config().bits();
        if dev.is_attached() {
            flags |= FLAG_ATTACHED;
        }
        if dev.is_released() {
            flags |= FLAG_RELEASED;
        }
        PortInfo {
            id: dev.id(),
            flags,
            state: dev.channel().driver().state(),
            selector: dev.selector(),
            local: *dev.local(),
            remote: *dev.remote(),
        }
    }

    pub(crate) fn lookup(&self, id: u16) -> Option<Arc<PortDevice>> {
        self.registry.find(id)
    }

    /// Start teardown for a record already in hand
    ///
    /// Marks the record released; removing the same record twice is a
    /// caller bug. With the port still open, teardown is left for the
    /// last close to finish.
    pub(crate) fn remove_device(&self, dev: &Arc<PortDevice>) {
        assert!(!dev.mark_released(), "port {} released twice", dev.id());
        {
            let count = dev.open_count();
            if *count > 0 {
                debug!(port = dev.id(), holders = *count, "deferring teardown to last close");
                return;
            }
        }
        let removed = self.registry.unlink(dev.id());
        drop(removed);
    }

    /// Teardown entry for channel callbacks
    ///
    /// Looks the record up again so a removal that got there first wins.
    pub(crate) fn reap(&self, id: u16) {
        if let Some(dev) = self.lookup(id) {
            self.remove_device(&dev);
        }
    }

    /// Finish a removal that was deferred while the port was open
    pub(crate) fn complete_deferred_removal(&self, dev: &Arc<PortDevice>) {
        let removed = self.registry.unlink(dev.id());
        drop(removed);
    }
}
