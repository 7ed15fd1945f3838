use bthid_common::events::{ChannelKind, ChannelState};
use bthid_common::{DeviceType, RemoteAddress};
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SlotError {
    #[error("no more entries")]
    Exhausted,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TableError {
    #[error("a connection for {0} already exists")]
    Duplicate(RemoteAddress),
    #[error("no connection for {0}")]
    NotFound(RemoteAddress),
    #[error("table slot {0} is already occupied")]
    SlotOccupied(u32),
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ChannelError {
    #[error("{0} channel has a request in flight")]
    AlreadyInProgress(ChannelKind),
    #[error("{0} channel is not connected")]
    NotConnected(ChannelKind),
    #[error("{channel} channel cannot do that in state {state:?}")]
    InvalidState {
        channel: ChannelKind,
        state: ChannelState,
    },
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error(transparent)]
    Slot(#[from] SlotError),
    #[error(transparent)]
    Table(#[from] TableError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("child device for {0} already exists")]
    AlreadyExists(RemoteAddress),
    #[error("device type {0} is disabled")]
    UnsupportedDeviceType(DeviceType),
    #[error("child device was removed")]
    DeviceRemoved,
    #[error("access denied")]
    AccessDenied,
    #[error("child device is already open")]
    SharingViolation,
    #[error("transport failure: {0:#}")]
    Transport(anyhow::Error),
}

pub type Result<T, E = BusError> = std::result::Result<T, E>;
