//! Radio transport boundary.
//!
//! The PHY itself (registers, channel, modulation) lives outside this crate.
//! What the gateway needs from it: hand over one encoded frame at a time,
//! observe a busy/ready state, and receive decoded inbound frames through a
//! channel. Each outbound frame is owned by the transport from `submit` until
//! the transmission completes; no other component keeps a reference.

use crate::error::GatewayError;
use crate::packet::Frame;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{trace, warn};

/// PHY state as exposed by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioState {
    Rx,
    Preamble,
    Tx,
    Payload,
}

impl RadioState {
    /// `Tx` and `Preamble` refuse new sends; callers retry on the next tick.
    pub fn is_busy(self) -> bool {
        matches!(self, RadioState::Tx | RadioState::Preamble)
    }
}

impl Default for RadioState {
    fn default() -> Self {
        RadioState::Rx
    }
}

/// One outbound transmission request.
#[derive(Debug, Clone, PartialEq)]
pub struct TxRequest {
    pub frame: Frame,
    /// Long preamble wakes sleeping peers; used for the pairing broadcasts.
    pub long_preamble: bool,
    /// Quiet period the radio should hold after the frame so a just-woken
    /// peer gets a chance to answer.
    pub post_delay: Option<Duration>,
}

impl TxRequest {
    pub fn short(frame: Frame) -> Self {
        TxRequest {
            frame,
            long_preamble: false,
            post_delay: None,
        }
    }

    pub fn long(frame: Frame, post_delay: Duration) -> Self {
        TxRequest {
            frame,
            long_preamble: true,
            post_delay: Some(post_delay),
        }
    }
}

pub trait RadioTransport: Send {
    fn state(&self) -> RadioState;

    /// Hand a frame to the PHY. `Err(RadioBusy)` means nothing was sent and
    /// the caller owns the retry; a successful return transfers ownership of
    /// the request to the transport.
    fn submit(&mut self, tx: TxRequest) -> Result<(), GatewayError>;
}

/// Frame tunnel over UDP datagrams, one encoded frame per datagram. Stands
/// in for the PHY on the bench: a bridge process on the peer side feeds real
/// radio traffic into the same framing.
pub struct UdpRadio {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

impl UdpRadio {
    /// Bind locally and spawn the inbound pump. Datagrams that fail frame
    /// decoding are dropped with a log line, mirroring what the PHY does
    /// with CRC failures.
    pub async fn bind(
        bind: SocketAddr,
        peer: SocketAddr,
    ) -> Result<(Self, mpsc::Receiver<Frame>), GatewayError> {
        let socket = Arc::new(UdpSocket::bind(bind).await?);
        let (frames_tx, frames_rx) = mpsc::channel(64);
        let recv_socket = Arc::clone(&socket);
        tokio::spawn(async move {
            let mut buf = [0u8; 96];
            loop {
                match recv_socket.recv_from(&mut buf).await {
                    Ok((len, from)) => match Frame::decode(&buf[..len]) {
                        Ok(frame) => {
                            trace!(%from, cmd = ?frame.command, "frame received");
                            if frames_tx.send(frame).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => warn!(%from, %err, "dropping undecodable datagram"),
                    },
                    Err(err) => {
                        warn!(%err, "radio tunnel receive error");
                        break;
                    }
                }
            }
        });
        Ok((UdpRadio { socket, peer }, frames_rx))
    }
}

impl RadioTransport for UdpRadio {
    fn state(&self) -> RadioState {
        // The tunnel has no TX dwell time; it is always ready.
        RadioState::Rx
    }

    fn submit(&mut self, tx: TxRequest) -> Result<(), GatewayError> {
        let raw = tx.frame.encode()?;
        trace!(
            cmd = ?tx.frame.command,
            target = %tx.frame.target,
            long_preamble = tx.long_preamble,
            len = raw.len(),
            "frame sent"
        );
        self.socket.try_send_to(&raw, self.peer)?;
        Ok(())
    }
}

/// In-memory transport for tests and dry runs: records every submitted
/// request and refuses sends while the scripted state says busy.
#[derive(Default)]
pub struct MemoryRadio {
    state: RadioState,
    sent: Vec<TxRequest>,
}

impl MemoryRadio {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_state(&mut self, state: RadioState) {
        self.state = state;
    }

    pub fn sent(&self) -> &[TxRequest] {
        &self.sent
    }

    pub fn take_sent(&mut self) -> Vec<TxRequest> {
        std::mem::take(&mut self.sent)
    }
}

impl RadioTransport for MemoryRadio {
    fn state(&self) -> RadioState {
        self.state
    }

    fn submit(&mut self, tx: TxRequest) -> Result<(), GatewayError> {
        if self.state.is_busy() {
            return Err(GatewayError::RadioBusy(self.state));
        }
        self.sent.push(tx);
        Ok(())
    }
}
