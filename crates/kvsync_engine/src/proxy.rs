//! Syncer selection by storage flavour.

use crate::engine::PermissionCheck;
use crate::error::{SyncError, SyncResult};
use crate::interface::SyncInterface;
use crate::operation::{OnComplete, OnFinalize};
use crate::strategy::strategy_for;
use crate::syncer::{GenericSyncer, LocalChangeEvent, Syncer, SyncerServices, WipePolicy};
use crate::time_helper::sys_current_time;
use kvsync_protocol::{DeviceId, InterfaceType, SyncMode, Timestamp};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;

/// Builds the syncer matching a storage flavour.
pub struct SyncerFactory;

impl SyncerFactory {
    /// Creates a syncer for `interface_type`.
    pub fn create(interface_type: InterfaceType, services: SyncerServices) -> Arc<GenericSyncer> {
        Arc::new(GenericSyncer::new(strategy_for(interface_type), services))
    }

    /// Creates a syncer from a wire-level interface type code.
    ///
    /// Unknown codes yield no syncer and are reported as an allocation
    /// failure.
    pub fn create_for_code(code: u8, services: SyncerServices) -> SyncResult<Arc<GenericSyncer>> {
        let interface_type = InterfaceType::from_code(code)
            .map_err(|_| SyncError::OutOfMemory(format!("no syncer for interface type {code}")))?;
        Ok(Self::create(interface_type, services))
    }
}

/// Stable handle that creates its syncer on first `initialize`.
///
/// Until then every operation fails with [`SyncError::NotInit`], except
/// [`Syncer::get_time_stamp`] which falls back to the system clock.
pub struct SyncerProxy {
    services: SyncerServices,
    syncer: RwLock<Option<Arc<GenericSyncer>>>,
}

impl SyncerProxy {
    /// Creates an empty proxy.
    pub fn new(services: SyncerServices) -> Self {
        Self {
            services,
            syncer: RwLock::new(None),
        }
    }

    /// The syncer, once created.
    pub fn syncer(&self) -> Option<Arc<GenericSyncer>> {
        self.syncer.read().clone()
    }

    fn current(&self) -> SyncResult<Arc<GenericSyncer>> {
        self.syncer().ok_or(SyncError::NotInit)
    }
}

impl Syncer for SyncerProxy {
    fn initialize(&self, sync_interface: Arc<dyn SyncInterface>) -> SyncResult<()> {
        let syncer = {
            let mut slot = self.syncer.write();
            match slot.as_ref() {
                Some(syncer) => Arc::clone(syncer),
                None => {
                    let interface_type = sync_interface.interface_type();
                    debug!(?interface_type, "creating syncer");
                    let syncer = SyncerFactory::create(interface_type, self.services.clone());
                    *slot = Some(Arc::clone(&syncer));
                    syncer
                }
            }
        };
        syncer.initialize(sync_interface)
    }

    fn close(&self) -> SyncResult<()> {
        self.current()?.close()
    }

    fn sync(
        &self,
        devices: &[DeviceId],
        mode: SyncMode,
        on_complete: Option<OnComplete>,
        on_finalize: Option<OnFinalize>,
        wait: bool,
    ) -> SyncResult<u32> {
        self.current()?
            .sync(devices, mode, on_complete, on_finalize, wait)
    }

    fn remove_sync_operation(&self, sync_id: u32) -> SyncResult<()> {
        self.current()?.remove_sync_operation(sync_id)
    }

    fn get_time_stamp(&self) -> Timestamp {
        match self.syncer() {
            Some(syncer) => syncer.get_time_stamp(),
            None => sys_current_time(),
        }
    }

    fn enable_auto_sync(&self, enable: bool) {
        if let Some(syncer) = self.syncer() {
            syncer.enable_auto_sync(enable);
        }
    }

    fn local_data_changed(&self, event: LocalChangeEvent) {
        if let Some(syncer) = self.syncer() {
            syncer.local_data_changed(event);
        }
    }

    fn remote_data_changed(&self, device: &str) {
        if let Some(syncer) = self.syncer() {
            syncer.remote_data_changed(device);
        }
    }

    fn erase_device_water_mark(&self, device: &str, is_need_hash: bool) -> SyncResult<()> {
        self.current()?.erase_device_water_mark(device, is_need_hash)
    }

    fn get_queued_sync_size(&self) -> SyncResult<usize> {
        self.current()?.get_queued_sync_size()
    }

    fn set_queued_sync_limit(&self, limit: usize) -> SyncResult<()> {
        self.current()?.set_queued_sync_limit(limit)
    }

    fn get_queued_sync_limit(&self) -> SyncResult<usize> {
        self.current()?.get_queued_sync_limit()
    }

    fn disable_manual_sync(&self) -> SyncResult<()> {
        self.current()?.disable_manual_sync()
    }

    fn enable_manual_sync(&self) -> SyncResult<()> {
        self.current()?.enable_manual_sync()
    }

    fn get_local_identity(&self) -> SyncResult<String> {
        self.current()?.get_local_identity()
    }

    fn set_stale_data_wipe_policy(&self, policy: WipePolicy) -> SyncResult<()> {
        self.current()?.set_stale_data_wipe_policy(policy)
    }

    fn set_permission_check(&self, check: Option<PermissionCheck>) -> SyncResult<()> {
        self.current()?.set_permission_check(check)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communicator::LoopbackNetwork;
    use crate::memory::MemorySyncInterface;

    fn services(network: &LoopbackNetwork) -> SyncerServices {
        SyncerServices::new(network.communicator("local")).unwrap()
    }

    #[test]
    fn factory_picks_strategy() {
        let network = LoopbackNetwork::new();
        let single = SyncerFactory::create(InterfaceType::SingleVersion, services(&network));
        assert_eq!(single.interface_type(), InterfaceType::SingleVersion);
        let multi = SyncerFactory::create(InterfaceType::MultiVersion, services(&network));
        assert_eq!(multi.interface_type(), InterfaceType::MultiVersion);
    }

    #[test]
    fn factory_rejects_unknown_code() {
        let network = LoopbackNetwork::new();
        assert!(matches!(
            SyncerFactory::create_for_code(0xff, services(&network)),
            Err(SyncError::OutOfMemory(_))
        ));
    }

    #[test]
    fn proxy_before_initialize() {
        let network = LoopbackNetwork::new();
        let proxy = SyncerProxy::new(services(&network));
        assert_eq!(
            proxy.sync(&["peer".into()], SyncMode::Push, None, None, false),
            Err(SyncError::NotInit)
        );
        assert_eq!(proxy.get_queued_sync_size(), Err(SyncError::NotInit));
        assert_eq!(proxy.close(), Err(SyncError::NotInit));
        assert!(proxy.get_time_stamp() > 0);
        proxy.enable_auto_sync(true);
        assert!(proxy.syncer().is_none());
    }

    #[test]
    fn proxy_creates_syncer_for_storage() {
        let network = LoopbackNetwork::new();
        let proxy = SyncerProxy::new(services(&network));
        proxy
            .initialize(Arc::new(MemorySyncInterface::multi_version("db")))
            .unwrap();
        let syncer = proxy.syncer().unwrap();
        assert_eq!(syncer.interface_type(), InterfaceType::MultiVersion);
        assert!(syncer.is_initialized());
        assert_eq!(proxy.get_queued_sync_limit(), Ok(32));
        proxy.close().unwrap();
    }
}
