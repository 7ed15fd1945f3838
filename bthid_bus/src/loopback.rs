//! In-memory radio transport.
//!
//! Stands in for the radio stack. Inbound frames are queued with
//! `push_inbound` and outbound frames are recorded. Failures can be injected
//! per channel to exercise the error paths of the bus.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use bthid_common::device::remote_name;
use bthid_common::events::ChannelKind;
use bthid_common::{DeviceType, RemoteAddress};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace};

use crate::transport::{RadioTransport, TransportEvent};

type ChannelKey = (RemoteAddress, ChannelKind);

struct InboundQueue {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>,
}

impl InboundQueue {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
        }
    }
}

#[derive(Default)]
struct LoopbackState {
    open: HashSet<ChannelKey>,
    inbound: HashMap<ChannelKey, InboundQueue>,
    outbound: Vec<(RemoteAddress, ChannelKind, Vec<u8>)>,
    fail_open: HashSet<ChannelKey>,
    held_opens: HashSet<ChannelKey>,
    fail_send: HashSet<ChannelKey>,
    forced_disconnects: Vec<RemoteAddress>,
}

pub struct LoopbackTransport {
    state: Mutex<LoopbackState>,
    open_gate: Notify,
    indications: Option<mpsc::Sender<TransportEvent>>,
}

impl LoopbackTransport {
    /// Transport that reports remote activity on `indications`.
    pub fn new(indications: mpsc::Sender<TransportEvent>) -> Self {
        Self {
            state: Default::default(),
            open_gate: Notify::new(),
            indications: Some(indications),
        }
    }

    /// Transport without an indication sink.
    pub fn detached() -> Self {
        Self {
            state: Default::default(),
            open_gate: Notify::new(),
            indications: None,
        }
    }

    async fn indicate(&self, event: TransportEvent) -> Result<()> {
        match &self.indications {
            Some(tx) => tx
                .send(event)
                .await
                .map_err(|_| anyhow!("indication receiver closed")),
            None => Ok(()),
        }
    }

    /// Simulate a remote controller establishing a link.
    pub async fn remote_connect(
        &self,
        address: RemoteAddress,
        device_type: DeviceType,
        name: &str,
    ) -> Result<()> {
        self.indicate(TransportEvent::RemoteConnect {
            address,
            device_type,
            name: remote_name(name),
        })
        .await
    }

    /// Simulate the remote dropping the link.
    pub async fn remote_disconnect(&self, address: RemoteAddress) -> Result<()> {
        self.drop_link(address);
        self.indicate(TransportEvent::RemoteDisconnect { address })
            .await
    }

    /// Simulate the remote closing one channel.
    pub async fn remote_close_channel(
        &self,
        address: RemoteAddress,
        channel: ChannelKind,
    ) -> Result<()> {
        self.state.lock().open.remove(&(address, channel));
        self.indicate(TransportEvent::ChannelClosed { address, channel })
            .await
    }

    /// Queue a frame the remote "sent" on a channel.
    pub fn push_inbound(&self, address: RemoteAddress, channel: ChannelKind, frame: Vec<u8>) {
        let mut state = self.state.lock();
        let queue = state
            .inbound
            .entry((address, channel))
            .or_insert_with(InboundQueue::new);
        // The receiver half lives in the same entry, so this cannot fail.
        let _ = queue.tx.send(frame);
    }

    pub fn fail_open(&self, address: RemoteAddress, channel: ChannelKind) {
        self.state.lock().fail_open.insert((address, channel));
    }

    /// Opens of this channel stay pending until `release_open`.
    pub fn hold_open(&self, address: RemoteAddress, channel: ChannelKind) {
        self.state.lock().held_opens.insert((address, channel));
    }

    pub fn release_open(&self, address: RemoteAddress, channel: ChannelKind) {
        self.state.lock().held_opens.remove(&(address, channel));
        self.open_gate.notify_waiters();
    }

    pub fn fail_send(&self, address: RemoteAddress, channel: ChannelKind, fail: bool) {
        let mut state = self.state.lock();
        if fail {
            state.fail_send.insert((address, channel));
        } else {
            state.fail_send.remove(&(address, channel));
        }
    }

    pub fn is_open(&self, address: RemoteAddress, channel: ChannelKind) -> bool {
        self.state.lock().open.contains(&(address, channel))
    }

    pub fn sent_frames(&self) -> Vec<(RemoteAddress, ChannelKind, Vec<u8>)> {
        self.state.lock().outbound.clone()
    }

    pub fn forced_disconnects(&self) -> Vec<RemoteAddress> {
        self.state.lock().forced_disconnects.clone()
    }

    fn drop_link(&self, address: RemoteAddress) {
        let mut state = self.state.lock();
        state.open.retain(|(a, _)| *a != address);
        state.inbound.retain(|(a, _), _| *a != address);
    }
}

impl RadioTransport for LoopbackTransport {
    fn open_channel<'a>(
        &'a self,
        address: RemoteAddress,
        channel: ChannelKind,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            // Let a racing disconnect interleave with the open.
            tokio::task::yield_now().await;
            loop {
                let released = self.open_gate.notified();
                if !self.state.lock().held_opens.contains(&(address, channel)) {
                    break;
                }
                released.await;
            }
            let mut state = self.state.lock();
            if state.fail_open.contains(&(address, channel)) {
                return Err(anyhow!("{} refused {} channel", address, channel));
            }
            state.open.insert((address, channel));
            debug!("Loopback opened {} channel for {}", channel, address);
            Ok(())
        })
    }

    fn close_channel<'a>(
        &'a self,
        address: RemoteAddress,
        channel: ChannelKind,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut state = self.state.lock();
            if state.open.remove(&(address, channel)) {
                debug!("Loopback closed {} channel for {}", channel, address);
            }
            Ok(())
        })
    }

    fn send<'a>(
        &'a self,
        address: RemoteAddress,
        channel: ChannelKind,
        data: Vec<u8>,
    ) -> BoxFuture<'a, Result<usize>> {
        Box::pin(async move {
            let mut state = self.state.lock();
            if !state.open.contains(&(address, channel)) {
                return Err(anyhow!("{} channel for {} is closed", channel, address));
            }
            if state.fail_send.contains(&(address, channel)) {
                return Err(anyhow!("send on {} channel for {} failed", channel, address));
            }
            let len = data.len();
            trace!("Loopback {} {} <- {:02x?}", address, channel, data);
            state.outbound.push((address, channel, data));
            Ok(len)
        })
    }

    fn recv<'a>(
        &'a self,
        address: RemoteAddress,
        channel: ChannelKind,
        capacity: usize,
    ) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(async move {
            let rx = {
                let mut state = self.state.lock();
                if !state.open.contains(&(address, channel)) {
                    return Err(anyhow!("{} channel for {} is closed", channel, address));
                }
                state
                    .inbound
                    .entry((address, channel))
                    .or_insert_with(InboundQueue::new)
                    .rx
                    .clone()
            };
            let mut frame = rx
                .lock()
                .await
                .recv()
                .await
                .ok_or_else(|| anyhow!("inbound queue for {} closed", address))?;
            frame.truncate(capacity);
            Ok(frame)
        })
    }

    fn disconnect<'a>(&'a self, address: RemoteAddress) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            debug!("Loopback forcing disconnect of {}", address);
            self.state.lock().forced_disconnects.push(address);
            self.drop_link(address);
            if self
                .indicate(TransportEvent::RemoteDisconnect { address })
                .await
                .is_err()
            {
                debug!("Nobody listening for the disconnect of {}", address);
            }
            Ok(())
        })
    }
}
