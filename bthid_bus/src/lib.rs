mod bus;
mod channel;
mod child;
mod connection;
mod error;
pub mod loopback;
pub mod router;
mod slots;
mod table;
mod transport;

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use bthid_common::events::RemovalReason;

pub use crate::bus::{Bus, PARENT_QUEUE_DEPTH};
pub use crate::channel::{Channel, DisconnectStart, Transfer, TransferError, TransferOutput};
pub use crate::child::{ChildDevice, ChildProperties, OpenHandle, WeakChildDevice};
pub use crate::connection::ConnectionRecord;
pub use crate::error::{BusError, ChannelError, Result, SlotError, TableError};
pub use crate::router::{DispatchOutcome, ForwardedRequest, IoCompletion, IoRequest, IoStatus};
pub use crate::slots::{Serial, SlotAllocator, SlotLease};
pub use crate::table::{ConnectionTable, TableEntry};
pub use crate::transport::{RadioTransport, TransportEvent};

/// Drive the bus from transport indications until `cancel` fires or the
/// transport goes away. Every child still present on exit is destroyed.
///
/// Requests forwarded to the parent queue are not handled by anything below
/// the bus and complete with `NotSupported`.
pub async fn run_bus(
    bus: Arc<Bus>,
    mut indications: mpsc::Receiver<TransportEvent>,
    mut parent_queue: mpsc::Receiver<ForwardedRequest>,
    cancel: CancellationToken,
) {
    let mut tasks = JoinSet::new();
    info!("run_bus: entering main loop");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Bus cancelled");
                break;
            }
            indication = indications.recv() => match indication {
                Some(indication) => handle_indication(&bus, &mut tasks, indication),
                None => {
                    info!("Transport indication channel closed");
                    break;
                }
            },
            Some(request) = parent_queue.recv() => {
                debug!(
                    "Parent request 0x{:08x} from {} not handled",
                    request.request.code,
                    request.address
                );
                request.complete(IoCompletion::failed(IoStatus::NotSupported));
            }
            Some(result) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = result {
                    warn!("Bus task failed: {}", e);
                }
            }
        }
    }

    // Forced disconnects below would otherwise wait on a queue nobody drains.
    indications.close();
    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            warn!("Bus task failed: {}", e);
        }
    }
    for device in bus.children() {
        if let Err(e) = bus.destroy_child_device(&device, RemovalReason::Shutdown).await {
            debug!("Shutdown of {}: {}", device.address(), e);
        }
    }
    info!("Bus main loop ended");
}

fn handle_indication(bus: &Arc<Bus>, tasks: &mut JoinSet<()>, indication: TransportEvent) {
    debug!("Transport indication: {:?}", indication);
    match indication {
        TransportEvent::RemoteConnect {
            address,
            device_type,
            name,
        } => {
            // Created here rather than in the task so a disconnect that
            // follows always finds the child.
            let device = match bus.create_child_device(address, device_type, &name) {
                Ok(device) => device,
                Err(e) => {
                    warn!("Not enumerating {} ({}): {}", address, device_type, e);
                    return;
                }
            };
            let bus = bus.clone();
            tasks.spawn(async move {
                if let Err(e) = bus.connect_channels(&device).await {
                    warn!("Connecting channels of {} failed: {}", address, e);
                    if let Err(e) = bus
                        .destroy_child_device(&device, RemovalReason::ChannelFailure)
                        .await
                    {
                        debug!("Teardown of {}: {}", address, e);
                    }
                }
            });
        }
        TransportEvent::RemoteDisconnect { address } => {
            spawn_destroy(bus, tasks, address, RemovalReason::RemoteDisconnect);
        }
        TransportEvent::ChannelClosed { address, channel } => {
            info!("Remote {} closed its {} channel", address, channel);
            spawn_destroy(bus, tasks, address, RemovalReason::ChannelFailure);
        }
    }
}

fn spawn_destroy(
    bus: &Arc<Bus>,
    tasks: &mut JoinSet<()>,
    address: bthid_common::RemoteAddress,
    reason: RemovalReason,
) {
    let device = match bus.child(address) {
        Ok(device) => device,
        Err(e) => {
            debug!("Ignoring {:?} for {}: {}", reason, address, e);
            return;
        }
    };
    let bus = bus.clone();
    tasks.spawn(async move {
        if let Err(e) = bus.destroy_child_device(&device, reason).await {
            debug!("Removal of {}: {}", address, e);
        }
    });
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bthid_common::config::{BusSettings, ChildOptions};
    use bthid_common::events::{BusEvent, ChannelKind, ChannelState};
    use bthid_common::{DeviceType, RemoteAddress};
    use tokio::sync::broadcast;

    use super::*;
    use crate::loopback::LoopbackTransport;

    fn addr(n: u64) -> RemoteAddress {
        RemoteAddress::new(0x0019_c100_0000 + n)
    }

    fn settings(capacity: usize) -> BusSettings {
        BusSettings {
            capacity,
            ..Default::default()
        }
    }

    async fn wait_event(
        rx: &mut broadcast::Receiver<BusEvent>,
        mut pred: impl FnMut(&BusEvent) -> bool,
    ) -> BusEvent {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let event = rx.recv().await.unwrap();
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for bus event")
    }

    struct Harness {
        bus: Arc<Bus>,
        transport: Arc<LoopbackTransport>,
        events: broadcast::Receiver<BusEvent>,
        cancel: CancellationToken,
        task: tokio::task::JoinHandle<()>,
    }

    fn start(settings: BusSettings) -> Harness {
        let (ind_tx, ind_rx) = mpsc::channel(16);
        let transport = Arc::new(LoopbackTransport::new(ind_tx));
        let (bus, parent) = Bus::new(settings, transport.clone());
        let events = bus.subscribe();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_bus(bus.clone(), ind_rx, parent, cancel.clone()));
        Harness {
            bus,
            transport,
            events,
            cancel,
            task,
        }
    }

    #[tokio::test]
    async fn four_slots_then_exhausted_then_reuse_lowest() {
        let (bus, _parent) = Bus::new(settings(4), Arc::new(LoopbackTransport::detached()));

        for n in 1..=4 {
            let device = bus
                .create_child_device(addr(n), DeviceType::Sixaxis, "PLAYSTATION(R)3 Controller")
                .unwrap();
            assert_eq!(device.serial().get(), n as u32);
        }
        assert!(matches!(
            bus.create_child_device(addr(5), DeviceType::Sixaxis, ""),
            Err(BusError::Slot(SlotError::Exhausted))
        ));
        assert_eq!(bus.slots().acquire(), Err(SlotError::Exhausted));
        assert_eq!(bus.count(), 4);

        bus.unplug(addr(2)).await.unwrap();
        assert_eq!(bus.find_by_address(addr(2)).unwrap_err(), TableError::NotFound(addr(2)));

        let e = bus.create_child_device(addr(5), DeviceType::Sixaxis, "").unwrap();
        assert_eq!(e.serial().get(), 2);
    }

    #[tokio::test]
    async fn serial_waits_for_the_last_handle() {
        let (bus, _parent) = Bus::new(settings(4), Arc::new(LoopbackTransport::detached()));

        let a = bus.create_child_device(addr(1), DeviceType::Motion, "").unwrap();
        let held = a.clone();
        bus.destroy_child_device(&a, RemovalReason::Unplug).await.unwrap();
        drop(a);

        // Still referenced, so serial 1 is not handed out again.
        let b = bus.create_child_device(addr(2), DeviceType::Motion, "").unwrap();
        assert_eq!(b.serial().get(), 2);
        assert!(bus.slots().is_allocated(Serial::from_index(0)));
        assert_eq!(held.record().address(), addr(1));

        drop(held);
        let c = bus.create_child_device(addr(3), DeviceType::Motion, "").unwrap();
        assert_eq!(c.serial().get(), 1);
    }

    #[tokio::test]
    async fn second_destroy_reports_removed() {
        let (bus, _parent) = Bus::new(settings(4), Arc::new(LoopbackTransport::detached()));
        let device = bus.create_child_device(addr(1), DeviceType::Navigation, "").unwrap();

        bus.destroy_child_device(&device, RemovalReason::Unplug).await.unwrap();
        assert!(matches!(
            bus.destroy_child_device(&device, RemovalReason::Unplug).await,
            Err(BusError::DeviceRemoved)
        ));
        assert!(matches!(
            bus.unplug(addr(1)).await,
            Err(BusError::Table(TableError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn duplicate_and_unsupported_leave_no_trace() {
        let mut s = settings(4);
        s.supported.wireless = false;
        let (bus, _parent) = Bus::new(s, Arc::new(LoopbackTransport::detached()));

        let _a = bus.create_child_device(addr(1), DeviceType::Sixaxis, "").unwrap();
        assert!(matches!(
            bus.create_child_device(addr(1), DeviceType::Navigation, ""),
            Err(BusError::AlreadyExists(a)) if a == addr(1)
        ));
        assert!(matches!(
            bus.create_child_device(addr(2), DeviceType::Wireless, ""),
            Err(BusError::UnsupportedDeviceType(DeviceType::Wireless))
        ));
        assert_eq!(bus.slots().in_use(), 1);
        assert_eq!(bus.count(), 1);
    }

    #[tokio::test]
    async fn access_policy_follows_options() {
        let mut s = settings(4);
        s.set_override(
            addr(2),
            ChildOptions {
                admin_only: true,
                exclusive: false,
                ..Default::default()
            },
        );
        let (bus, _parent) = Bus::new(s, Arc::new(LoopbackTransport::detached()));

        let exclusive = bus.create_child_device(addr(1), DeviceType::Sixaxis, "").unwrap();
        let first = exclusive.open(false).unwrap();
        assert!(matches!(exclusive.open(true), Err(BusError::SharingViolation)));
        drop(first);
        let _again = exclusive.open(false).unwrap();

        let admin = bus.create_child_device(addr(2), DeviceType::Sixaxis, "").unwrap();
        assert!(matches!(admin.open(false), Err(BusError::AccessDenied)));
        let h1 = admin.open(true).unwrap();
        let h2 = admin.open(true).unwrap();
        assert_eq!(admin.open_count(), 2);
        drop((h1, h2));
        assert_eq!(admin.open_count(), 0);

        bus.destroy_child_device(&admin, RemovalReason::Unplug).await.unwrap();
        assert!(matches!(admin.open(true), Err(BusError::DeviceRemoved)));
    }

    #[tokio::test]
    async fn properties_describe_the_child() {
        let (bus, _parent) = Bus::new(settings(4), Arc::new(LoopbackTransport::detached()));
        let device = bus
            .create_child_device(
                RemoteAddress::new(0x001b_dc0f_a231),
                DeviceType::Navigation,
                "Navigation Controller",
            )
            .unwrap();

        let props = device.properties();
        assert_eq!(props.device_id, "BTHPS3BUS\\NAVIGATION");
        assert_eq!(props.hardware_id, props.device_id);
        assert_eq!(props.instance_id, "1BDC0FA231");
        assert_eq!((props.vendor_id, props.product_id), (0x054c, 0x042f));
        assert_eq!(props.remote_name, "Navigation Controller");
        assert_eq!(props.serial, 1);
        assert_eq!(props.options, ChildOptions::default());
    }

    #[tokio::test]
    async fn remote_connect_and_disconnect() {
        let mut h = start(settings(8));

        h.transport
            .remote_connect(addr(1), DeviceType::Sixaxis, "PLAYSTATION(R)3 Controller")
            .await
            .unwrap();
        let arrived = wait_event(&mut h.events, |e| matches!(e, BusEvent::ChildArrived { .. })).await;
        assert_eq!(
            arrived,
            BusEvent::ChildArrived {
                address: addr(1),
                serial: 1,
                device_type: DeviceType::Sixaxis
            }
        );
        wait_event(&mut h.events, |e| {
            matches!(
                e,
                BusEvent::ChannelChanged {
                    channel: ChannelKind::Interrupt,
                    state: ChannelState::Connected,
                    ..
                }
            )
        })
        .await;
        let record = h.bus.find_by_address(addr(1)).unwrap();
        assert!(record.is_ready());
        assert!(h.transport.is_open(addr(1), ChannelKind::Control));
        drop(record);

        h.transport.remote_disconnect(addr(1)).await.unwrap();
        let removed = wait_event(&mut h.events, |e| matches!(e, BusEvent::ChildRemoved { .. })).await;
        assert!(matches!(
            removed,
            BusEvent::ChildRemoved {
                reason: RemovalReason::RemoteDisconnect,
                ..
            }
        ));
        assert_eq!(h.bus.count(), 0);
        assert!(h.transport.forced_disconnects().is_empty());

        // A repeated indication is harmless.
        h.transport.remote_disconnect(addr(1)).await.unwrap();

        h.cancel.cancel();
        h.task.await.unwrap();
        assert_eq!(h.bus.slots().in_use(), 0);
    }

    #[tokio::test]
    async fn failed_channel_connect_tears_down() {
        let mut h = start(settings(8));
        h.transport.fail_open(addr(1), ChannelKind::Interrupt);

        h.transport
            .remote_connect(addr(1), DeviceType::Motion, "Motion Controller")
            .await
            .unwrap();
        let removed = wait_event(&mut h.events, |e| matches!(e, BusEvent::ChildRemoved { .. })).await;
        assert_eq!(
            removed,
            BusEvent::ChildRemoved {
                address: addr(1),
                serial: 1,
                reason: RemovalReason::ChannelFailure,
            }
        );
        assert_eq!(h.bus.count(), 0);
        assert!(!h.transport.is_open(addr(1), ChannelKind::Control));
        assert_eq!(h.transport.forced_disconnects(), vec![addr(1)]);

        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn remote_closing_a_channel_removes_the_child() {
        let mut h = start(settings(8));

        h.transport
            .remote_connect(addr(3), DeviceType::Wireless, "Wireless Controller")
            .await
            .unwrap();
        wait_event(&mut h.events, |e| {
            matches!(
                e,
                BusEvent::ChannelChanged {
                    channel: ChannelKind::Interrupt,
                    state: ChannelState::Connected,
                    ..
                }
            )
        })
        .await;

        h.transport
            .remote_close_channel(addr(3), ChannelKind::Control)
            .await
            .unwrap();
        wait_event(&mut h.events, |e| matches!(e, BusEvent::ChildRemoved { .. })).await;
        assert!(h.bus.child(addr(3)).is_err());

        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn parent_requests_are_not_supported() {
        let mut h = start(settings(8));
        h.transport
            .remote_connect(addr(1), DeviceType::Sixaxis, "")
            .await
            .unwrap();
        wait_event(&mut h.events, |e| matches!(e, BusEvent::ChildArrived { .. })).await;

        let request = IoRequest {
            code: 0x000b_0193,
            input: Vec::new(),
            output_capacity: 4,
        };
        let completion = h.bus.dispatch_to(addr(1), request).unwrap().wait().await;
        assert_eq!(completion.status, IoStatus::NotSupported);

        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn cancel_destroys_remaining_children() {
        let mut h = start(settings(8));
        for n in 1..=3 {
            h.transport
                .remote_connect(addr(n), DeviceType::Sixaxis, "")
                .await
                .unwrap();
            wait_event(&mut h.events, |e| matches!(e, BusEvent::ChildArrived { .. })).await;
        }

        h.cancel.cancel();
        h.task.await.unwrap();
        assert_eq!(h.bus.count(), 0);
        assert_eq!(h.bus.slots().in_use(), 0);
        let mut forced = h.transport.forced_disconnects();
        forced.sort();
        assert_eq!(forced, vec![addr(1), addr(2), addr(3)]);
    }

    #[tokio::test]
    async fn idle_child_is_disconnected() {
        let mut s = settings(8);
        s.child.idle_timeout_ms = 50;
        let mut h = start(s);

        h.transport
            .remote_connect(addr(1), DeviceType::Sixaxis, "")
            .await
            .unwrap();
        wait_event(&mut h.events, |e| matches!(e, BusEvent::ChildArrived { .. })).await;

        let removed = wait_event(&mut h.events, |e| matches!(e, BusEvent::ChildRemoved { .. })).await;
        assert_eq!(
            removed,
            BusEvent::ChildRemoved {
                address: addr(1),
                serial: 1,
                reason: RemovalReason::Unplug,
            }
        );
        assert_eq!(h.transport.forced_disconnects(), vec![addr(1)]);

        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn idle_disconnect_echo_is_an_unplug() {
        let transport = Arc::new(LoopbackTransport::detached());
        let (bus, _parent) = Bus::new(settings(4), transport.clone());
        let mut events = bus.subscribe();
        let device = bus.create_child_device(addr(1), DeviceType::Sixaxis, "").unwrap();
        bus.connect_channels(&device).await.unwrap();

        bus.notify_idle(&device).await.unwrap();
        assert!(device.idle_requested());
        assert_eq!(transport.forced_disconnects(), vec![addr(1)]);

        // The transport reports the link loss the idle request caused.
        bus.destroy_by_address(addr(1), RemovalReason::RemoteDisconnect)
            .await
            .unwrap();
        let removed = wait_event(&mut events, |e| matches!(e, BusEvent::ChildRemoved { .. })).await;
        assert_eq!(
            removed,
            BusEvent::ChildRemoved {
                address: addr(1),
                serial: 1,
                reason: RemovalReason::Unplug,
            }
        );
        assert_eq!(transport.forced_disconnects(), vec![addr(1)]);
    }

    #[tokio::test]
    async fn destroy_while_control_connect_is_pending() {
        let transport = Arc::new(LoopbackTransport::detached());
        transport.hold_open(addr(1), ChannelKind::Control);
        let (bus, _parent) = Bus::new(settings(4), transport.clone());
        let device = bus.create_child_device(addr(1), DeviceType::Sixaxis, "").unwrap();

        let connect = tokio::spawn({
            let (bus, device) = (bus.clone(), device.clone());
            async move { bus.connect_channels(&device).await }
        });
        device
            .record()
            .channel(ChannelKind::Control)
            .subscribe()
            .wait_for(|s| *s == ChannelState::Connecting)
            .await
            .unwrap();

        bus.destroy_child_device(&device, RemovalReason::Unplug).await.unwrap();
        transport.release_open(addr(1), ChannelKind::Control);

        let result = connect.await.expect("connect task panicked");
        assert!(matches!(
            result,
            Err(BusError::Channel(ChannelError::NotConnected(ChannelKind::Control)))
        ));
        let record = device.record();
        assert_eq!(record.channel(ChannelKind::Control).state(), ChannelState::Disconnected);
        assert_eq!(record.channel(ChannelKind::Interrupt).state(), ChannelState::Uninitialized);
        assert!(!transport.is_open(addr(1), ChannelKind::Control));
        assert!(!transport.is_open(addr(1), ChannelKind::Interrupt));

        drop(device);
        assert_eq!(bus.slots().in_use(), 0);
    }

    #[tokio::test]
    async fn activity_defers_idle() {
        let mut s = settings(8);
        s.child.idle_timeout_ms = 200;
        let transport = Arc::new(LoopbackTransport::detached());
        let (bus, _parent) = Bus::new(s, transport.clone());
        let device = bus.create_child_device(addr(1), DeviceType::Sixaxis, "").unwrap();
        bus.connect_channels(&device).await.unwrap();

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            bus.dispatch(&device, IoRequest::write(ChannelKind::Control, vec![1]))
                .wait()
                .await;
        }
        assert!(transport.forced_disconnects().is_empty());
        assert!(!device.is_removed());
    }
}
