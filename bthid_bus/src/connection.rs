use bthid_common::events::ChannelKind;
use bthid_common::{DeviceType, RemoteAddress, RemoteName};
use tracing::trace;

use crate::channel::Channel;
use crate::slots::Serial;

/// State of one connected remote controller.
pub struct ConnectionRecord {
    address: RemoteAddress,
    device_type: DeviceType,
    remote_name: RemoteName,
    serial: Serial,
    control: Channel,
    interrupt: Channel,
}

impl ConnectionRecord {
    pub fn new(
        address: RemoteAddress,
        device_type: DeviceType,
        remote_name: RemoteName,
        serial: Serial,
    ) -> Self {
        Self {
            address,
            device_type,
            remote_name,
            serial,
            control: Channel::new(address, ChannelKind::Control),
            interrupt: Channel::new(address, ChannelKind::Interrupt),
        }
    }

    pub fn address(&self) -> RemoteAddress {
        self.address
    }

    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    pub fn remote_name(&self) -> &str {
        &self.remote_name
    }

    pub fn serial(&self) -> Serial {
        self.serial
    }

    pub fn channel(&self, kind: ChannelKind) -> &Channel {
        match kind {
            ChannelKind::Control => &self.control,
            ChannelKind::Interrupt => &self.interrupt,
        }
    }

    /// Both channels fully connected.
    pub fn is_ready(&self) -> bool {
        self.control.is_connected() && self.interrupt.is_connected()
    }
}

impl Drop for ConnectionRecord {
    fn drop(&mut self) {
        trace!("Connection record {} ({}) freed", self.address, self.serial);
    }
}

impl std::fmt::Debug for ConnectionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRecord")
            .field("address", &self.address)
            .field("device_type", &self.device_type)
            .field("remote_name", &self.remote_name.as_str())
            .field("serial", &self.serial)
            .field("control", &self.control.state())
            .field("interrupt", &self.interrupt.state())
            .finish()
    }
}
