//! Live connections, one arena slot per serial number.
//!
//! Lookups by address are linear scans. The table never holds more entries
//! than the slot allocator has serials, so a scan is cheap.

use std::sync::Arc;

use bthid_common::RemoteAddress;
use parking_lot::Mutex;
use tracing::{error, warn};

use crate::child::ChildDevice;
use crate::connection::ConnectionRecord;
use crate::error::TableError;

/// The table's reference to a record plus the child device bound to it.
pub struct TableEntry {
    pub record: Arc<ConnectionRecord>,
    pub device: ChildDevice,
}

pub struct ConnectionTable {
    entries: Mutex<Vec<Option<TableEntry>>>,
}

impl ConnectionTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new((0..capacity).map(|_| None).collect()),
        }
    }

    pub fn insert(&self, record: Arc<ConnectionRecord>, device: ChildDevice) -> Result<(), TableError> {
        let address = record.address();
        let serial = record.serial();
        let mut entries = self.entries.lock();

        if entries
            .iter()
            .flatten()
            .any(|e| e.record.address() == address)
        {
            warn!("Connection for {} is already in the table", address);
            return Err(TableError::Duplicate(address));
        }

        let inserted = match entries.get_mut(serial.index()) {
            Some(slot) if slot.is_none() => {
                *slot = Some(TableEntry { record, device });
                true
            }
            _ => false,
        };
        drop(entries);

        if inserted {
            Ok(())
        } else {
            error!("Table slot for serial {} is occupied or out of range", serial);
            debug_assert!(false, "table slot {serial} occupied");
            Err(TableError::SlotOccupied(serial.get()))
        }
    }

    pub fn remove_by_address(&self, address: RemoteAddress) -> Result<TableEntry, TableError> {
        let mut entries = self.entries.lock();
        entries
            .iter_mut()
            .find(|slot| matches!(slot, Some(e) if e.record.address() == address))
            .and_then(Option::take)
            .ok_or(TableError::NotFound(address))
    }

    pub fn find_by_address(&self, address: RemoteAddress) -> Result<Arc<ConnectionRecord>, TableError> {
        self.entries
            .lock()
            .iter()
            .flatten()
            .find(|e| e.record.address() == address)
            .map(|e| e.record.clone())
            .ok_or(TableError::NotFound(address))
    }

    pub fn device_by_address(&self, address: RemoteAddress) -> Result<ChildDevice, TableError> {
        self.entries
            .lock()
            .iter()
            .flatten()
            .find(|e| e.record.address() == address)
            .map(|e| e.device.clone())
            .ok_or(TableError::NotFound(address))
    }

    pub fn count(&self) -> usize {
        self.entries.lock().iter().flatten().count()
    }

    /// Devices ordered by serial.
    pub fn devices(&self) -> Vec<ChildDevice> {
        self.entries
            .lock()
            .iter()
            .flatten()
            .map(|e| e.device.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slots::{SlotAllocator, SlotLease};
    use bthid_common::config::ChildOptions;
    use bthid_common::device::remote_name;
    use bthid_common::DeviceType;

    fn entry(slots: &Arc<SlotAllocator>, raw: u64) -> (Arc<ConnectionRecord>, ChildDevice) {
        let lease = SlotLease::acquire(slots).unwrap();
        let record = Arc::new(ConnectionRecord::new(
            RemoteAddress::new(raw),
            DeviceType::Sixaxis,
            remote_name("PLAYSTATION(R)3 Controller"),
            lease.serial(),
        ));
        let device = ChildDevice::new(record.clone(), lease, ChildOptions::default());
        (record, device)
    }

    #[test]
    fn test_insert_find_remove() {
        let slots = Arc::new(SlotAllocator::new(4));
        let table = ConnectionTable::new(4);
        let (record, device) = entry(&slots, 0xa);
        table.insert(record, device).unwrap();
        assert_eq!(table.count(), 1);

        let found = table.find_by_address(RemoteAddress::new(0xa)).unwrap();
        assert_eq!(found.serial().get(), 1);

        let removed = table.remove_by_address(RemoteAddress::new(0xa)).unwrap();
        assert_eq!(removed.record.address(), RemoteAddress::new(0xa));
        assert!(matches!(
            table.find_by_address(RemoteAddress::new(0xa)),
            Err(TableError::NotFound(_))
        ));
        assert_eq!(table.count(), 0);
    }

    #[test]
    fn test_second_remove_is_not_found() {
        let slots = Arc::new(SlotAllocator::new(2));
        let table = ConnectionTable::new(2);
        let (record, device) = entry(&slots, 0xb);
        table.insert(record, device).unwrap();
        assert!(table.remove_by_address(RemoteAddress::new(0xb)).is_ok());
        assert!(matches!(
            table.remove_by_address(RemoteAddress::new(0xb)),
            Err(TableError::NotFound(_))
        ));
    }

    #[test]
    fn test_duplicate_address_rejected() {
        let slots = Arc::new(SlotAllocator::new(4));
        let table = ConnectionTable::new(4);
        let (record, device) = entry(&slots, 0xc);
        table.insert(record, device).unwrap();

        let (record, device) = entry(&slots, 0xc);
        assert_eq!(
            table.insert(record, device).err(),
            Some(TableError::Duplicate(RemoteAddress::new(0xc)))
        );
        assert_eq!(table.count(), 1);
        // The rejected entry gave its serial back.
        assert_eq!(slots.in_use(), 1);
    }

    #[test]
    fn test_concurrent_inserts_keep_addresses_unique() {
        let slots = Arc::new(SlotAllocator::new(16));
        let table = ConnectionTable::new(16);
        let inserted = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(|| {
                        let (record, device) = entry(&slots, 0xd);
                        table.insert(record, device).is_ok()
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|ok| *ok)
                .count()
        });
        assert_eq!(inserted, 1);
        assert_eq!(table.count(), 1);
        assert_eq!(slots.in_use(), 1);
    }
}
