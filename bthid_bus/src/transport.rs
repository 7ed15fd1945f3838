use bthid_common::events::ChannelKind;
use bthid_common::{DeviceType, RemoteAddress, RemoteName};
use futures::future::BoxFuture;

/// Object-safe view of the radio stack below the bus.
///
/// Async methods return `BoxFuture` so the bus can hold an `Arc<dyn RadioTransport>`.
pub trait RadioTransport: Send + Sync {
    /// Open (accept) one logical channel of a remote device.
    fn open_channel<'a>(
        &'a self,
        address: RemoteAddress,
        channel: ChannelKind,
    ) -> BoxFuture<'a, anyhow::Result<()>>;

    /// Close one logical channel. Closing an already closed channel succeeds.
    fn close_channel<'a>(
        &'a self,
        address: RemoteAddress,
        channel: ChannelKind,
    ) -> BoxFuture<'a, anyhow::Result<()>>;

    /// Send a frame, resolves to the number of bytes accepted.
    fn send<'a>(
        &'a self,
        address: RemoteAddress,
        channel: ChannelKind,
        data: Vec<u8>,
    ) -> BoxFuture<'a, anyhow::Result<usize>>;

    /// Receive the next frame, at most `capacity` bytes of it.
    fn recv<'a>(
        &'a self,
        address: RemoteAddress,
        channel: ChannelKind,
        capacity: usize,
    ) -> BoxFuture<'a, anyhow::Result<Vec<u8>>>;

    /// Force the baseband link to the remote down.
    fn disconnect<'a>(&'a self, address: RemoteAddress) -> BoxFuture<'a, anyhow::Result<()>>;
}

/// Indications raised by the radio stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    RemoteConnect {
        address: RemoteAddress,
        device_type: DeviceType,
        name: RemoteName,
    },
    RemoteDisconnect {
        address: RemoteAddress,
    },
    /// The remote closed a single channel.
    ChannelClosed {
        address: RemoteAddress,
        channel: ChannelKind,
    },
}
