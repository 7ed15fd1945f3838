use std::sync::Arc;

use arc_swap::ArcSwap;
use bthid_common::config::BusSettings;
use bthid_common::events::BusEvent;
use bthid_common::RemoteAddress;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

use crate::child::ChildDevice;
use crate::connection::ConnectionRecord;
use crate::error::{Result, TableError};
use crate::router::{DispatchOutcome, ForwardedRequest, IoRequest, RequestRouter};
use crate::slots::SlotAllocator;
use crate::table::ConnectionTable;
use crate::transport::RadioTransport;

pub const PARENT_QUEUE_DEPTH: usize = 32;
const EVENT_QUEUE_DEPTH: usize = 64;

/// Bus root: owns the slots, the connection table and the router.
pub struct Bus {
    pub(crate) slots: Arc<SlotAllocator>,
    pub(crate) table: ConnectionTable,
    pub(crate) transport: Arc<dyn RadioTransport>,
    settings: ArcSwap<BusSettings>,
    router: RequestRouter,
    events: broadcast::Sender<BusEvent>,
}

impl Bus {
    /// Returns the bus and the receiving end of its parent request queue.
    pub fn new(
        settings: BusSettings,
        transport: Arc<dyn RadioTransport>,
    ) -> (Arc<Self>, mpsc::Receiver<ForwardedRequest>) {
        let settings = settings.sanitized();
        let capacity = settings.capacity;
        let (parent_tx, parent_rx) = mpsc::channel(PARENT_QUEUE_DEPTH);
        let (events, _) = broadcast::channel(EVENT_QUEUE_DEPTH);
        info!("Bus up with {} slots", capacity);

        let bus = Arc::new(Self {
            slots: Arc::new(SlotAllocator::new(capacity)),
            table: ConnectionTable::new(capacity),
            router: RequestRouter::new(transport.clone(), parent_tx),
            transport,
            settings: ArcSwap::from_pointee(settings),
            events,
        });
        (bus, parent_rx)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.events.subscribe()
    }

    pub(crate) fn publish(&self, event: BusEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub fn settings(&self) -> Arc<BusSettings> {
        self.settings.load_full()
    }

    /// Replace the settings. Existing children keep the options they were
    /// created with; capacity changes apply on the next start.
    pub fn update_settings(&self, settings: BusSettings) {
        let settings = settings.sanitized();
        if settings.capacity != self.slots.capacity() {
            debug!(
                "Capacity change to {} ignored until restart",
                settings.capacity
            );
        }
        self.settings.store(Arc::new(settings));
    }

    pub fn find_by_address(&self, address: RemoteAddress) -> Result<Arc<ConnectionRecord>, TableError> {
        self.table.find_by_address(address)
    }

    pub fn child(&self, address: RemoteAddress) -> Result<ChildDevice, TableError> {
        self.table.device_by_address(address)
    }

    pub fn children(&self) -> Vec<ChildDevice> {
        self.table.devices()
    }

    pub fn count(&self) -> usize {
        self.table.count()
    }

    pub fn slots(&self) -> &Arc<SlotAllocator> {
        &self.slots
    }

    pub fn transport(&self) -> &Arc<dyn RadioTransport> {
        &self.transport
    }

    pub fn dispatch(&self, device: &ChildDevice, request: IoRequest) -> DispatchOutcome {
        self.router.dispatch(device, request)
    }

    /// Dispatch to the child at `address`, resolved through the table.
    pub fn dispatch_to(&self, address: RemoteAddress, request: IoRequest) -> Result<DispatchOutcome, TableError> {
        let device = self.table.device_by_address(address)?;
        Ok(self.dispatch(&device, request))
    }
}
