//! Child devices and their lifecycle on the bus.
//!
//! A `ChildDevice` is a shared handle. The bus table holds one, every admitted
//! request holds one for as long as it runs, open handles hold one. When the
//! last handle goes away the device is destroyed: its record reference is
//! released first, then its serial goes back to the allocator.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bthid_common::config::ChildOptions;
use bthid_common::device::remote_name;
use bthid_common::events::{BusEvent, ChannelKind, RemovalReason};
use bthid_common::{DeviceType, RemoteAddress};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::bus::Bus;
use crate::connection::ConnectionRecord;
use crate::error::{BusError, ChannelError, Result, TableError};
use crate::slots::{Serial, SlotLease};

/// Identity and policy a child presents to the layers above.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildProperties {
    pub device_id: String,
    pub hardware_id: String,
    pub instance_id: String,
    pub display_name: &'static str,
    pub remote_name: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial: u32,
    pub options: ChildOptions,
}

struct ChildDeviceInner {
    // Field order is drop order: record reference first, serial last.
    record: Arc<ConnectionRecord>,
    lease: SlotLease,
    options: ChildOptions,
    removed: AtomicBool,
    idle_requested: AtomicBool,
    opens: AtomicUsize,
    last_activity: Mutex<Instant>,
}

impl Drop for ChildDeviceInner {
    fn drop(&mut self) {
        debug!(
            "Child device {} ({}) destroyed",
            self.record.address(),
            self.lease.serial()
        );
    }
}

#[derive(Clone)]
pub struct ChildDevice {
    inner: Arc<ChildDeviceInner>,
}

#[derive(Clone)]
pub struct WeakChildDevice {
    inner: Weak<ChildDeviceInner>,
}

impl WeakChildDevice {
    pub fn upgrade(&self) -> Option<ChildDevice> {
        self.inner.upgrade().map(|inner| ChildDevice { inner })
    }
}

impl ChildDevice {
    pub(crate) fn new(record: Arc<ConnectionRecord>, lease: SlotLease, options: ChildOptions) -> Self {
        debug_assert_eq!(record.serial(), lease.serial());
        Self {
            inner: Arc::new(ChildDeviceInner {
                record,
                lease,
                options,
                removed: AtomicBool::new(false),
                idle_requested: AtomicBool::new(false),
                opens: AtomicUsize::new(0),
                last_activity: Mutex::new(Instant::now()),
            }),
        }
    }

    pub fn record(&self) -> &Arc<ConnectionRecord> {
        &self.inner.record
    }

    pub fn address(&self) -> RemoteAddress {
        self.inner.record.address()
    }

    pub fn serial(&self) -> Serial {
        self.inner.lease.serial()
    }

    pub fn device_type(&self) -> DeviceType {
        self.inner.record.device_type()
    }

    pub fn options(&self) -> ChildOptions {
        self.inner.options
    }

    pub fn properties(&self) -> ChildProperties {
        let ty = self.device_type();
        let info = ty.info();
        ChildProperties {
            device_id: ty.device_id(),
            hardware_id: ty.hardware_id(),
            instance_id: self.address().instance_id(),
            display_name: info.display_name,
            remote_name: self.inner.record.remote_name().to_string(),
            vendor_id: info.vendor_id,
            product_id: info.product_id,
            serial: self.serial().get(),
            options: self.inner.options,
        }
    }

    pub fn is_removed(&self) -> bool {
        self.inner.removed.load(Ordering::Acquire)
    }

    /// The bus dropped the link because the child went idle.
    pub fn idle_requested(&self) -> bool {
        self.inner.idle_requested.load(Ordering::Acquire)
    }

    /// True for the one caller that flips the device into removal.
    fn mark_removed(&self) -> bool {
        !self.inner.removed.swap(true, Ordering::AcqRel)
    }

    /// Open the device under its access policy.
    pub fn open(&self, is_admin: bool) -> Result<OpenHandle> {
        if self.is_removed() {
            return Err(BusError::DeviceRemoved);
        }
        if self.inner.options.admin_only && !is_admin {
            return Err(BusError::AccessDenied);
        }
        if self.inner.options.exclusive {
            self.inner
                .opens
                .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
                .map_err(|_| BusError::SharingViolation)?;
        } else {
            self.inner.opens.fetch_add(1, Ordering::AcqRel);
        }
        Ok(OpenHandle {
            device: self.clone(),
        })
    }

    pub fn open_count(&self) -> usize {
        self.inner.opens.load(Ordering::Acquire)
    }

    pub(crate) fn touch(&self) {
        *self.inner.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.inner.last_activity.lock().elapsed()
    }

    pub fn downgrade(&self) -> WeakChildDevice {
        WeakChildDevice {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn ptr_eq(&self, other: &ChildDevice) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Live handles to this device, including the bus's own.
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl std::fmt::Debug for ChildDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildDevice")
            .field("record", &self.inner.record)
            .field("removed", &self.is_removed())
            .finish()
    }
}

/// An open of a child device; closes on drop.
pub struct OpenHandle {
    device: ChildDevice,
}

impl OpenHandle {
    pub fn device(&self) -> &ChildDevice {
        &self.device
    }
}

impl Drop for OpenHandle {
    fn drop(&mut self) {
        self.device.inner.opens.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Bus {
    /// Enumerate a child for a newly connected remote.
    ///
    /// On failure nothing is left behind: a serial taken here is returned when
    /// the half-built device is dropped.
    pub fn create_child_device(
        self: &Arc<Self>,
        address: RemoteAddress,
        device_type: DeviceType,
        name: &str,
    ) -> Result<ChildDevice> {
        let settings = self.settings();
        if !settings.supported.is_supported(device_type) {
            warn!("Refusing {} at {}: device type disabled", device_type, address);
            return Err(BusError::UnsupportedDeviceType(device_type));
        }
        if self.table.find_by_address(address).is_ok() {
            return Err(BusError::AlreadyExists(address));
        }

        let lease = SlotLease::acquire(&self.slots).inspect_err(|_| {
            warn!("No free slot for {} ({})", address, device_type);
        })?;
        let record = Arc::new(ConnectionRecord::new(
            address,
            device_type,
            remote_name(name),
            lease.serial(),
        ));
        let device = ChildDevice::new(record.clone(), lease, settings.options_for(address));

        match self.table.insert(record, device.clone()) {
            Ok(()) => {}
            Err(TableError::Duplicate(address)) => return Err(BusError::AlreadyExists(address)),
            Err(e) => return Err(e.into()),
        }

        info!(
            "Created child {} {} for {} ({:?})",
            device.serial(),
            device_type,
            address,
            name
        );
        self.publish(BusEvent::ChildArrived {
            address,
            serial: device.serial().get(),
            device_type,
        });
        self.arm_idle_watchdog(&device);
        Ok(device)
    }

    /// Connect control, then interrupt.
    pub async fn connect_channels(&self, device: &ChildDevice) -> Result<()> {
        for kind in [ChannelKind::Control, ChannelKind::Interrupt] {
            let channel = device.record().channel(kind);
            let result = channel.connect(self.transport.as_ref()).await;
            self.publish_channel(device, kind);
            result?;
        }
        info!("Child {} for {} is ready", device.serial(), device.address());
        Ok(())
    }

    /// Tear a child down. Only the first call for a device does anything;
    /// later ones return `DeviceRemoved`.
    ///
    /// The serial is released when the last handle to the device drops, which
    /// may be after this returns if requests are still running against it.
    pub async fn destroy_child_device(&self, device: &ChildDevice, reason: RemovalReason) -> Result<()> {
        if !device.mark_removed() {
            debug!("Child {} already being removed", device.address());
            return Err(BusError::DeviceRemoved);
        }
        let address = device.address();
        // The remote dropped the link, or an idle request already did.
        let link_down = reason == RemovalReason::RemoteDisconnect || device.idle_requested();
        let reason = match reason {
            RemovalReason::RemoteDisconnect if device.idle_requested() => RemovalReason::Unplug,
            reason => reason,
        };
        info!(
            "Removing child {} for {} ({:?})",
            device.serial(),
            address,
            reason
        );

        for kind in [ChannelKind::Interrupt, ChannelKind::Control] {
            let channel = device.record().channel(kind);
            match channel.disconnect(self.transport.as_ref()).await {
                Ok(()) => {}
                Err(BusError::Channel(ChannelError::AlreadyInProgress(_))) => {
                    channel.wait_disconnected().await;
                }
                Err(e) => warn!("Closing {} channel of {} failed: {}", kind, address, e),
            }
            self.publish_channel(device, kind);
        }

        if !link_down {
            if let Err(e) = self.transport.disconnect(address).await {
                warn!("Forced disconnect of {} failed: {:#}", address, e);
            }
        }

        match self.table.remove_by_address(address) {
            Ok(entry) => {
                debug_assert!(entry.device.ptr_eq(device));
                drop(entry);
            }
            Err(e) => warn!("Removing child from table: {}", e),
        }

        self.publish(BusEvent::ChildRemoved {
            address,
            serial: device.serial().get(),
            reason,
        });
        Ok(())
    }

    pub async fn destroy_by_address(&self, address: RemoteAddress, reason: RemovalReason) -> Result<()> {
        let device = self.table.device_by_address(address)?;
        self.destroy_child_device(&device, reason).await
    }

    /// Administrative unplug.
    pub async fn unplug(&self, address: RemoteAddress) -> Result<()> {
        self.destroy_by_address(address, RemovalReason::Unplug).await
    }

    /// The remote has no low-power mode, so going idle means dropping the
    /// link. The disconnect indication that follows removes the child as an
    /// unplug.
    pub async fn notify_idle(&self, device: &ChildDevice) -> Result<()> {
        if device.is_removed() {
            return Err(BusError::DeviceRemoved);
        }
        info!(
            "Child {} for {} idle for {:?}, disconnecting",
            device.serial(),
            device.address(),
            device.idle_for()
        );
        device.inner.idle_requested.store(true, Ordering::Release);
        self.transport
            .disconnect(device.address())
            .await
            .map_err(BusError::Transport)
    }

    fn arm_idle_watchdog(self: &Arc<Self>, device: &ChildDevice) {
        let timeout_ms = device.options().idle_timeout_ms;
        if timeout_ms == 0 {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("No runtime, idle watchdog for {} not armed", device.address());
            return;
        };
        let timeout = Duration::from_millis(u64::from(timeout_ms));
        let bus = Arc::downgrade(self);
        let weak = device.downgrade();

        // Holds no strong handle while sleeping so it never delays destruction.
        runtime.spawn(async move {
            loop {
                let idle = match weak.upgrade() {
                    Some(device) if !device.is_removed() => device.idle_for(),
                    _ => return,
                };
                if idle < timeout {
                    tokio::time::sleep(timeout - idle).await;
                    continue;
                }
                let (Some(bus), Some(device)) = (bus.upgrade(), weak.upgrade()) else {
                    return;
                };
                if let Err(e) = bus.notify_idle(&device).await {
                    debug!("Idle notification for {} failed: {}", device.address(), e);
                }
                return;
            }
        });
    }

    fn publish_channel(&self, device: &ChildDevice, channel: ChannelKind) {
        self.publish(BusEvent::ChannelChanged {
            address: device.address(),
            channel,
            state: device.record().channel(channel).state(),
        });
    }
}
