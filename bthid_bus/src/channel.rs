//! Connect/disconnect state machine of one logical channel.
//!
//! ```text
//! Uninitialized -> Connecting -> Connected -> Disconnecting -> Disconnected
//!                      |                          ^                |
//!                      +--------------------------+   Connecting <-+
//! ```
//!
//! At most one connect or disconnect request is in flight per channel. A
//! disconnect issued while a connect is in flight takes the slot over; the late
//! connect completion is then ignored so the disconnect is never lost.

use std::sync::Arc;

use bthid_common::events::{ChannelKind, ChannelState};
use bthid_common::RemoteAddress;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::{BusError, ChannelError};
use crate::transport::RadioTransport;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transfer {
    Read { capacity: usize },
    Write(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutput {
    Read(Vec<u8>),
    Written(usize),
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("channel left the connected state")]
    Cancelled,
    #[error("transport failure: {0:#}")]
    Transport(anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Request {
    Connect,
    Disconnect,
}

#[derive(Debug)]
struct Inner {
    state: ChannelState,
    in_flight: Option<Request>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectStart {
    /// The caller owns the disconnect and must complete it.
    Started,
    AlreadyDisconnected,
}

pub struct Channel {
    address: RemoteAddress,
    kind: ChannelKind,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<ChannelState>,
}

impl Channel {
    pub fn new(address: RemoteAddress, kind: ChannelKind) -> Self {
        let (state_tx, _) = watch::channel(ChannelState::Uninitialized);
        Self {
            address,
            kind,
            inner: Mutex::new(Inner {
                state: ChannelState::Uninitialized,
                in_flight: None,
            }),
            state_tx,
        }
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn state(&self) -> ChannelState {
        self.inner.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    pub fn subscribe(&self) -> watch::Receiver<ChannelState> {
        self.state_tx.subscribe()
    }

    /// Resolves once the channel is disconnected. Never-connected channels count.
    pub async fn wait_disconnected(&self) {
        let mut rx = self.state_tx.subscribe();
        let _ = rx
            .wait_for(|s| matches!(s, ChannelState::Disconnected | ChannelState::Uninitialized))
            .await;
    }

    // Called with the channel lock held so watchers see transitions in order.
    fn transition(&self, inner: &mut Inner, state: ChannelState) {
        debug!(
            "{} {} channel: {:?} -> {:?}",
            self.address, self.kind, inner.state, state
        );
        inner.state = state;
        self.state_tx.send_replace(state);
    }

    pub fn begin_connect(&self) -> Result<(), ChannelError> {
        let mut inner = self.inner.lock();
        if inner.in_flight.is_some() {
            return Err(ChannelError::AlreadyInProgress(self.kind));
        }
        match inner.state {
            ChannelState::Uninitialized | ChannelState::Disconnected => {
                inner.in_flight = Some(Request::Connect);
                self.transition(&mut inner, ChannelState::Connecting);
                Ok(())
            }
            state => Err(ChannelError::InvalidState {
                channel: self.kind,
                state,
            }),
        }
    }

    /// Returns the state the channel ended up in.
    pub fn complete_connect(&self, success: bool) -> ChannelState {
        let mut inner = self.inner.lock();
        match (inner.in_flight, inner.state) {
            (Some(Request::Connect), ChannelState::Connecting) => {
                inner.in_flight = None;
                let next = if success {
                    ChannelState::Connected
                } else {
                    ChannelState::Disconnected
                };
                self.transition(&mut inner, next);
            }
            // A disconnect took the request over, and may already be done.
            (in_flight, state) => {
                debug!(
                    "{} {} channel: connect completion superseded ({:?}, {:?})",
                    self.address, self.kind, in_flight, state
                );
            }
        }
        inner.state
    }

    pub fn begin_disconnect(&self) -> Result<DisconnectStart, ChannelError> {
        let mut inner = self.inner.lock();
        match inner.state {
            ChannelState::Connected | ChannelState::Connecting => {
                // A pending connect is cancelled by taking over its slot.
                inner.in_flight = Some(Request::Disconnect);
                self.transition(&mut inner, ChannelState::Disconnecting);
                Ok(DisconnectStart::Started)
            }
            ChannelState::Disconnecting => Err(ChannelError::AlreadyInProgress(self.kind)),
            ChannelState::Uninitialized | ChannelState::Disconnected => {
                Ok(DisconnectStart::AlreadyDisconnected)
            }
        }
    }

    pub fn complete_disconnect(&self) -> Result<(), ChannelError> {
        let mut inner = self.inner.lock();
        if inner.in_flight != Some(Request::Disconnect) {
            return Err(ChannelError::InvalidState {
                channel: self.kind,
                state: inner.state,
            });
        }
        inner.in_flight = None;
        self.transition(&mut inner, ChannelState::Disconnected);
        Ok(())
    }

    /// Full connect cycle against the transport.
    ///
    /// A disconnect issued meanwhile abandons the open. Whatever the transport
    /// may have opened is closed again before returning `NotConnected`.
    pub async fn connect(&self, transport: &dyn RadioTransport) -> Result<(), BusError> {
        self.begin_connect()?;
        let mut state_rx = self.state_tx.subscribe();
        let opened = tokio::select! {
            biased;
            _ = state_rx.wait_for(|s| *s != ChannelState::Connecting) => None,
            result = transport.open_channel(self.address, self.kind) => Some(result),
        };

        let (success, result) = match opened {
            Some(result) => (result.is_ok(), result),
            None => {
                debug!("{} {} channel: open abandoned", self.address, self.kind);
                (false, Ok(()))
            }
        };
        match (self.complete_connect(success), result) {
            (ChannelState::Connected, _) => Ok(()),
            (_, Err(e)) => Err(BusError::Transport(e)),
            (_, Ok(())) => {
                if let Err(e) = transport.close_channel(self.address, self.kind).await {
                    warn!(
                        "{} {} channel: closing superseded open failed: {:#}",
                        self.address, self.kind, e
                    );
                }
                Err(ChannelError::NotConnected(self.kind).into())
            }
        }
    }

    /// Full disconnect cycle. The channel ends up disconnected even if the
    /// transport reports a failure closing it.
    pub async fn disconnect(&self, transport: &dyn RadioTransport) -> Result<(), BusError> {
        if self.begin_disconnect()? == DisconnectStart::AlreadyDisconnected {
            return Ok(());
        }
        let result = transport.close_channel(self.address, self.kind).await;
        self.complete_disconnect()?;
        result.map_err(BusError::Transport)
    }

    /// Admit a data transfer. The returned future performs it and resolves to
    /// `Cancelled` as soon as the channel leaves `Connected`.
    pub fn submit_data_transfer(
        &self,
        transport: Arc<dyn RadioTransport>,
        transfer: Transfer,
    ) -> Result<BoxFuture<'static, Result<TransferOutput, TransferError>>, ChannelError> {
        let mut state_rx = {
            let inner = self.inner.lock();
            if inner.state != ChannelState::Connected {
                return Err(ChannelError::NotConnected(self.kind));
            }
            self.state_tx.subscribe()
        };
        let (address, kind) = (self.address, self.kind);

        let io = async move {
            match transfer {
                Transfer::Read { capacity } => transport
                    .recv(address, kind, capacity)
                    .await
                    .map(TransferOutput::Read),
                Transfer::Write(data) => transport
                    .send(address, kind, data)
                    .await
                    .map(TransferOutput::Written),
            }
        };

        Ok(async move {
            tokio::select! {
                biased;
                _ = state_rx.wait_for(|s| *s != ChannelState::Connected) => {
                    Err(TransferError::Cancelled)
                }
                result = io => result.map_err(TransferError::Transport),
            }
        }
        .boxed())
    }
}
