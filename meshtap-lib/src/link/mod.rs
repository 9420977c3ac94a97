//! Direct peer links: UDP datagram I/O with fragmentation and the secure
//! packet codec, and TCP stream I/O with the password handshake. Link tasks
//! own only codec state; everything they learn flows back to the
//! coordinator as [`LinkNotice`]s tagged with the link generation, so
//! events from a torn-down link are recognizably stale.

pub mod tcp;
pub mod udp;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::proto::dataproto::DataPacket;
use crate::PeerId;

/// Capacity of the writer channel a sink drains into.
pub const LINK_SEND_CHANNEL: usize = 64;

pub trait IoStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> IoStream for T {}
pub type BoxedStream = Box<dyn IoStream>;

#[derive(Debug)]
pub enum LinkEvent {
    /// A decoded DataProto packet arrived on the link.
    Packet(DataPacket),
    /// The OTP send seed approaches exhaustion; the session layer should
    /// rotate.
    OtpSendWarning,
    /// First packet under a pending receive seed was accepted; confirm it.
    OtpRecvSeedReady(u16),
    /// Transport fault; the link is unusable and must be torn down.
    Error,
}

/// Link-task report to the coordinator.
#[derive(Debug)]
pub struct LinkNotice {
    pub peer: PeerId,
    pub gen: u64,
    pub event: LinkEvent,
}

pub enum SendCtrl {
    SetKey(Vec<u8>),
    SetSendSeed(u16),
}

pub enum RecvCtrl {
    SetKey(Vec<u8>),
    AddRecvSeed(u16),
}

/// Coordinator-side handle to one live link. Dropping it cancels the link
/// tasks, which is the only teardown path.
pub struct LinkHandle {
    gen: u64,
    data_tx: mpsc::Sender<Bytes>,
    send_ctrl: Option<mpsc::UnboundedSender<SendCtrl>>,
    recv_ctrl: Option<mpsc::UnboundedSender<RecvCtrl>>,
    adopt_tx: Option<oneshot::Sender<BoxedStream>>,
    token: CancellationToken,
    _tasks: Vec<JoinHandle<()>>,
}

impl LinkHandle {
    pub fn gen(&self) -> u64 {
        self.gen
    }

    /// Sender the per-link sink writes encoded packets into.
    pub fn data_sender(&self) -> mpsc::Sender<Bytes> {
        self.data_tx.clone()
    }

    /// Installs the symmetric encryption key on both directions.
    pub fn set_encryption_key(&self, key: Vec<u8>) {
        if let Some(tx) = &self.send_ctrl {
            let _ = tx.send(SendCtrl::SetKey(key.clone()));
        }
        if let Some(tx) = &self.recv_ctrl {
            let _ = tx.send(RecvCtrl::SetKey(key));
        }
    }

    /// Activates a confirmed OTP send seed.
    pub fn set_otp_send_seed(&self, seed_id: u16) {
        if let Some(tx) = &self.send_ctrl {
            let _ = tx.send(SendCtrl::SetSendSeed(seed_id));
        }
    }

    /// Registers a pending OTP receive seed.
    pub fn add_otp_recv_seed(&self, seed_id: u16) {
        if let Some(tx) = &self.recv_ctrl {
            let _ = tx.send(RecvCtrl::AddRecvSeed(seed_id));
        }
    }

    /// Hands an accepted (password-authenticated) stream to a listening TCP
    /// link. Valid once.
    pub fn adopt_stream(&mut self, stream: BoxedStream) -> bool {
        match self.adopt_tx.take() {
            Some(tx) => tx.send(stream).is_ok(),
            None => false,
        }
    }
}

impl Drop for LinkHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
