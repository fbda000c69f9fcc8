//! Registry of port records
//!
//! A single sorted list indexed by small integer id. The list owns one
//! reference per record; everything else reaches records through the
//! lookup operations here, never by iterating the list directly. All
//! record initialization happens before the registry lock is released so
//! a freshly chosen id is never visible half built.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::device::PortDevice;
use crate::error::BridgeError;

/// Highest number of ports a bridge will track at once
pub const MAX_PORTS: u16 = 256;

#[derive(Default)]
pub(crate) struct PortRegistry {
    devices: Mutex<Vec<Arc<PortDevice>>>,
}

impl PortRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Pick an id, build the record with `init`, and link it in
    ///
    /// With no requested id the smallest free one is used. `init` runs
    /// under the registry lock and may take the channel lock.
    pub(crate) fn insert_with<F>(
        &self,
        requested: Option<u16>,
        init: F,
    ) -> Result<Arc<PortDevice>, BridgeError>
    where
        F: FnOnce(u16) -> Result<Arc<PortDevice>, BridgeError>,
    {
        let mut devices = self.devices.lock();
        let (id, at) = match requested {
            Some(id) => {
                if id >= MAX_PORTS {
                    return Err(BridgeError::TooManyPorts);
                }
                match devices.binary_search_by_key(&id, |d| d.id()) {
                    Ok(_) => return Err(BridgeError::AddressInUse(id)),
                    Err(pos) => (id, pos),
                }
            }
            None => {
                // The list is sorted, so the first index whose id does
                // not match it is the smallest free id.
                let mut pick = devices.len();
                for (i, dev) in devices.iter().enumerate() {
                    if usize::from(dev.id()) != i {
                        pick = i;
                        break;
                    }
                }
                if pick >= usize::from(MAX_PORTS) {
                    return Err(BridgeError::TooManyPorts);
                }
                let Ok(id) = u16::try_from(pick) else {
                    return Err(BridgeError::TooManyPorts);
                };
                (id, pick)
            }
        };

        let dev = init(id)?;
        dev.set_linked(true);
        devices.insert(at, Arc::clone(&dev));
        Ok(dev)
    }

    /// Look a record up by id, skipping released ones
    pub(crate) fn find(&self, id: u16) -> Option<Arc<PortDevice>> {
        let devices = self.devices.lock();
        let i = devices.binary_search_by_key(&id, |d| d.id()).ok()?;
        let dev = &devices[i];
        if dev.is_released() {
            None
        } else {
            Some(Arc::clone(dev))
        }
    }

    /// Look a record up by id, released or not
    pub(crate) fn find_any(&self, id: u16) -> Option<Arc<PortDevice>> {
        let devices = self.devices.lock();
        let i = devices.binary_search_by_key(&id, |d| d.id()).ok()?;
        Some(Arc::clone(&devices[i]))
    }

    /// Remove a record, handing the registry's reference to the caller
    ///
    /// The caller drops that reference outside registry and channel locks,
    /// since it may be the last one.
    pub(crate) fn unlink(&self, id: u16) -> Option<Arc<PortDevice>> {
        let mut devices = self.devices.lock();
        let i = devices.binary_search_by_key(&id, |d| d.id()).ok()?;
        let dev = devices.remove(i);
        dev.set_linked(false);
        Some(dev)
    }

    /// Unlink every record at once, for bridge shutdown
    pub(crate) fn clear(&self) -> Vec<Arc<PortDevice>> {
        let mut devices = self.devices.lock();
        let drained: Vec<_> = devices.drain(..).collect();
        for dev in &drained {
            dev.set_linked(false);
        }
        drained
    }

    /// Up to `limit` live records in id order
    pub(crate) fn snapshot(&self, limit: usize) -> Vec<Arc<PortDevice>> {
        let devices = self.devices.lock();
        devices
            .iter()
            .filter(|d| !d.is_released())
            .take(limit)
            .map(Arc::clone)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{CreateRequest, PortBridge};
    use crate::channel::{DlcChannel, EndpointAddr};
    use crate::consumer::NullHost;
    use crate::sim::LoopbackChannel;

    fn build(id: u16) -> Result<Arc<PortDevice>, BridgeError> {
        let driver = LoopbackChannel::new(64);
        let channel = DlcChannel::new(driver);
        let bridge = PortBridge::new(Arc::new(NullHost));
        let req = CreateRequest::new(EndpointAddr::default(), EndpointAddr([1; 6]), 1);
        Ok(Arc::new(PortDevice::new(
            id,
            &req,
            channel,
            Arc::new(NullHost),
            bridge,
        )))
    }

    fn drain(registry: &PortRegistry) {
        drop(registry.clear());
    }

    #[test]
    fn test_ids_allocate_densely() {
        let registry = PortRegistry::new();
        for expect in 0..3u16 {
            let dev = registry.insert_with(None, build).unwrap();
            assert_eq!(dev.id(), expect);
        }
        drain(&registry);
    }

    #[test]
    fn test_freed_id_is_reused_first() {
        let registry = PortRegistry::new();
        for _ in 0..3 {
            registry.insert_with(None, build).unwrap();
        }
        drop(registry.unlink(1));
        let dev = registry.insert_with(None, build).unwrap();
        assert_eq!(dev.id(), 1);
        let dev = registry.insert_with(None, build).unwrap();
        assert_eq!(dev.id(), 3);
        drain(&registry);
    }

    #[test]
    fn test_requested_id_collision() {
        let registry = PortRegistry::new();
        registry.insert_with(Some(5), build).unwrap();
        let err = registry.insert_with(Some(5), build).unwrap_err();
        assert_eq!(err, BridgeError::AddressInUse(5));
        // The allocator walks around occupied ids.
        let dev = registry.insert_with(None, build).unwrap();
        assert_eq!(dev.id(), 0);
        drain(&registry);
    }

    #[test]
    fn test_requested_id_out_of_range() {
        let registry = PortRegistry::new();
        let err = registry.insert_with(Some(MAX_PORTS), build).unwrap_err();
        assert_eq!(err, BridgeError::TooManyPorts);
    }

    #[test]
    fn test_allocation_exhausts() {
        let registry = PortRegistry::new();
        for _ in 0..MAX_PORTS {
            registry.insert_with(None, build).unwrap();
        }
        let err = registry.insert_with(None, build).unwrap_err();
        assert_eq!(err, BridgeError::TooManyPorts);
        drain(&registry);
    }

    #[test]
    fn test_find_skips_released() {
        let registry = PortRegistry::new();
        let dev = registry.insert_with(None, build).unwrap();
        assert!(registry.find(0).is_some());
        assert!(!dev.mark_released());
        assert!(registry.find(0).is_none());
        assert!(registry.find_any(0).is_some());
        drop(dev);
        drop(registry.unlink(0));
        assert!(registry.find_any(0).is_none());
    }

    #[test]
    fn test_snapshot_excludes_released() {
        let registry = PortRegistry::new();
        for _ in 0..4 {
            registry.insert_with(None, build).unwrap();
        }
        registry.find(2).unwrap().mark_released();
        let live: Vec<u16> = registry.snapshot(10).iter().map(|d| d.id()).collect();
        assert_eq!(live, vec![0, 1, 3]);
        let limited: Vec<u16> = registry.snapshot(2).iter().map(|d| d.id()).collect();
        assert_eq!(limited, vec![0, 1]);
        drain(&registry);
    }

    #[test]
    fn test_init_failure_leaves_no_trace() {
        let registry = PortRegistry::new();
        let err = registry
            .insert_with(None, |_| Err(BridgeError::PermissionDenied))
            .unwrap_err();
        assert_eq!(err, BridgeError::PermissionDenied);
        let dev = registry.insert_with(None, build).unwrap();
        assert_eq!(dev.id(), 0);
        drain(&registry);
    }
}
