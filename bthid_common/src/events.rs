use crate::{DeviceType, RemoteAddress};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Control,
    Interrupt,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Uninitialized,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// Why a child left the bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RemovalReason {
    RemoteDisconnect,
    /// Administrative unplug, also used once an idle disconnect comes back.
    Unplug,
    ChannelFailure,
    Shutdown,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BusEvent {
    ChildArrived {
        address: RemoteAddress,
        serial: u32,
        device_type: DeviceType,
    },
    ChildRemoved {
        address: RemoteAddress,
        serial: u32,
        reason: RemovalReason,
    },
    ChannelChanged {
        address: RemoteAddress,
        channel: ChannelKind,
        state: ChannelState,
    },
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelKind::Control => f.write_str("control"),
            ChannelKind::Interrupt => f.write_str("interrupt"),
        }
    }
}
