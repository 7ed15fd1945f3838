//! Routing of I/O requests issued against child devices.
//!
//! Channel reads and writes go to the bound record's channels. Everything else
//! is handed to the parent queue unmodified and the router moves on; whoever
//! drains that queue completes the request.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bthid_common::events::ChannelKind;
use bthid_common::RemoteAddress;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::channel::{Transfer, TransferError, TransferOutput};
use crate::child::ChildDevice;
use crate::slots::Serial;
use crate::transport::RadioTransport;

pub const FILE_DEVICE_BUS_EXTENDER: u32 = 0x0000_002a;
const METHOD_BUFFERED: u32 = 0;
const FILE_ANY_ACCESS: u32 = 0;

pub const fn ctl_code(device_type: u32, function: u32, method: u32, access: u32) -> u32 {
    (device_type << 16) | (access << 14) | (function << 2) | method
}

pub const IOCTL_BTHID_CONTROL_READ: u32 =
    ctl_code(FILE_DEVICE_BUS_EXTENDER, 0x800, METHOD_BUFFERED, FILE_ANY_ACCESS);
pub const IOCTL_BTHID_CONTROL_WRITE: u32 =
    ctl_code(FILE_DEVICE_BUS_EXTENDER, 0x801, METHOD_BUFFERED, FILE_ANY_ACCESS);
pub const IOCTL_BTHID_INTERRUPT_READ: u32 =
    ctl_code(FILE_DEVICE_BUS_EXTENDER, 0x802, METHOD_BUFFERED, FILE_ANY_ACCESS);
pub const IOCTL_BTHID_INTERRUPT_WRITE: u32 =
    ctl_code(FILE_DEVICE_BUS_EXTENDER, 0x803, METHOD_BUFFERED, FILE_ANY_ACCESS);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoRequest {
    pub code: u32,
    pub input: Vec<u8>,
    pub output_capacity: usize,
}

impl IoRequest {
    pub fn read(channel: ChannelKind, capacity: usize) -> Self {
        let code = match channel {
            ChannelKind::Control => IOCTL_BTHID_CONTROL_READ,
            ChannelKind::Interrupt => IOCTL_BTHID_INTERRUPT_READ,
        };
        Self {
            code,
            input: Vec::new(),
            output_capacity: capacity,
        }
    }

    pub fn write(channel: ChannelKind, data: Vec<u8>) -> Self {
        let code = match channel {
            ChannelKind::Control => IOCTL_BTHID_CONTROL_WRITE,
            ChannelKind::Interrupt => IOCTL_BTHID_INTERRUPT_WRITE,
        };
        Self {
            code,
            input: data,
            output_capacity: 0,
        }
    }

    fn channel_transfer(&self) -> Option<(ChannelKind, Transfer)> {
        let read = |kind| {
            Some((
                kind,
                Transfer::Read {
                    capacity: self.output_capacity,
                },
            ))
        };
        let write = |kind| Some((kind, Transfer::Write(self.input.clone())));
        match self.code {
            IOCTL_BTHID_CONTROL_READ => read(ChannelKind::Control),
            IOCTL_BTHID_CONTROL_WRITE => write(ChannelKind::Control),
            IOCTL_BTHID_INTERRUPT_READ => read(ChannelKind::Interrupt),
            IOCTL_BTHID_INTERRUPT_WRITE => write(ChannelKind::Interrupt),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoStatus {
    Success,
    DeviceNotConnected,
    Cancelled,
    DeviceRemoved,
    InvalidParameter,
    BufferTooSmall,
    NotSupported,
    InsufficientResources,
    TransportFailure(String),
}

impl IoStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, IoStatus::Success)
    }
}

impl std::fmt::Display for IoStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IoStatus::Success => f.write_str("success"),
            IoStatus::DeviceNotConnected => f.write_str("device not connected"),
            IoStatus::Cancelled => f.write_str("cancelled"),
            IoStatus::DeviceRemoved => f.write_str("device removed"),
            IoStatus::InvalidParameter => f.write_str("invalid parameter"),
            IoStatus::BufferTooSmall => f.write_str("buffer too small"),
            IoStatus::NotSupported => f.write_str("not supported"),
            IoStatus::InsufficientResources => f.write_str("insufficient resources"),
            IoStatus::TransportFailure(msg) => write!(f, "transport failure: {msg}"),
        }
    }
}

/// Final status of a request, with the bytes transferred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoCompletion {
    pub status: IoStatus,
    pub information: usize,
    pub output: Vec<u8>,
}

impl IoCompletion {
    pub fn failed(status: IoStatus) -> Self {
        Self {
            status,
            information: 0,
            output: Vec::new(),
        }
    }

    pub fn written(bytes: usize) -> Self {
        Self {
            status: IoStatus::Success,
            information: bytes,
            output: Vec::new(),
        }
    }

    pub fn read(data: Vec<u8>) -> Self {
        Self {
            status: IoStatus::Success,
            information: data.len(),
            output: data,
        }
    }
}

impl From<Result<TransferOutput, TransferError>> for IoCompletion {
    fn from(result: Result<TransferOutput, TransferError>) -> Self {
        match result {
            Ok(TransferOutput::Read(data)) => IoCompletion::read(data),
            Ok(TransferOutput::Written(bytes)) => IoCompletion::written(bytes),
            Err(TransferError::Cancelled) => IoCompletion::failed(IoStatus::Cancelled),
            Err(TransferError::Transport(e)) => {
                IoCompletion::failed(IoStatus::TransportFailure(format!("{e:#}")))
            }
        }
    }
}

/// A request that was admitted and will complete later.
///
/// Resolves to `Cancelled` if whoever owns the request drops it without
/// completing it.
#[derive(Debug)]
pub struct PendingIo {
    rx: oneshot::Receiver<IoCompletion>,
}

impl Future for PendingIo {
    type Output = IoCompletion;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or_else(|_| IoCompletion::failed(IoStatus::Cancelled)))
    }
}

#[derive(Debug)]
pub enum DispatchOutcome {
    Pending(PendingIo),
    Completed(IoCompletion),
}

impl DispatchOutcome {
    pub fn is_pending(&self) -> bool {
        matches!(self, DispatchOutcome::Pending(_))
    }

    pub async fn wait(self) -> IoCompletion {
        match self {
            DispatchOutcome::Pending(pending) => pending.await,
            DispatchOutcome::Completed(completion) => completion,
        }
    }
}

/// A request handed to the parent queue. Dropping it completes the dispatched
/// request with `Cancelled`.
#[derive(Debug)]
pub struct ForwardedRequest {
    pub address: RemoteAddress,
    pub serial: Serial,
    pub request: IoRequest,
    completer: oneshot::Sender<IoCompletion>,
}

impl ForwardedRequest {
    pub fn complete(self, completion: IoCompletion) {
        // The dispatching caller may have stopped waiting.
        let _ = self.completer.send(completion);
    }
}

pub struct RequestRouter {
    transport: Arc<dyn RadioTransport>,
    parent: mpsc::Sender<ForwardedRequest>,
}

impl RequestRouter {
    pub fn new(transport: Arc<dyn RadioTransport>, parent: mpsc::Sender<ForwardedRequest>) -> Self {
        Self { transport, parent }
    }

    pub fn dispatch(&self, device: &ChildDevice, request: IoRequest) -> DispatchOutcome {
        if device.is_removed() {
            return DispatchOutcome::Completed(IoCompletion::failed(IoStatus::DeviceRemoved));
        }
        device.touch();

        let Some((kind, transfer)) = request.channel_transfer() else {
            return self.forward(device, request);
        };
        match &transfer {
            Transfer::Read { capacity: 0 } => {
                return DispatchOutcome::Completed(IoCompletion::failed(IoStatus::BufferTooSmall));
            }
            Transfer::Write(data) if data.is_empty() => {
                return DispatchOutcome::Completed(IoCompletion::failed(IoStatus::InvalidParameter));
            }
            _ => {}
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("Dispatch outside of a runtime");
            return DispatchOutcome::Completed(IoCompletion::failed(IoStatus::InsufficientResources));
        };

        let channel = device.record().channel(kind);
        let transfer = match channel.submit_data_transfer(self.transport.clone(), transfer) {
            Ok(transfer) => transfer,
            Err(e) => {
                debug!("Request 0x{:08x} for {}: {}", request.code, device.address(), e);
                return DispatchOutcome::Completed(IoCompletion::failed(IoStatus::DeviceNotConnected));
            }
        };

        let (tx, rx) = oneshot::channel();
        let device = device.clone();
        runtime.spawn(async move {
            let completion = IoCompletion::from(transfer.await);
            if let IoStatus::TransportFailure(msg) = &completion.status {
                warn!("{} transfer for {} failed: {}", kind, device.address(), msg);
            }
            // The request's hold on the device ends before its caller hears back.
            drop(device);
            let _ = tx.send(completion);
        });
        DispatchOutcome::Pending(PendingIo { rx })
    }

    fn forward(&self, device: &ChildDevice, request: IoRequest) -> DispatchOutcome {
        let code = request.code;
        let (completer, rx) = oneshot::channel();
        let forwarded = ForwardedRequest {
            address: device.address(),
            serial: device.serial(),
            request,
            completer,
        };
        match self.parent.try_send(forwarded) {
            Ok(()) => {
                trace!("Forwarded request 0x{:08x} from {}", code, device.address());
                DispatchOutcome::Pending(PendingIo { rx })
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Parent queue full, failing request 0x{:08x}", code);
                DispatchOutcome::Completed(IoCompletion::failed(IoStatus::InsufficientResources))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Parent queue closed, failing request 0x{:08x}", code);
                DispatchOutcome::Completed(IoCompletion::failed(IoStatus::DeviceRemoved))
            }
        }
    }
}
