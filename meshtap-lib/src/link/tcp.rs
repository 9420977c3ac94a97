//! Stream peer I/O: length-framed DataProto packets over TCP, optionally
//! inside TLS. The connecting side opens with the 8-byte little-endian
//! password it was offered; the listening side adopts a stream that the
//! password listener already authenticated.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use rustls_pki_types::ServerName;
use socket2::SockRef;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::link::{BoxedStream, LinkEvent, LinkHandle, LinkNotice, LINK_SEND_CHANNEL};
use crate::proto::dataproto::DataPacket;
use crate::PeerId;

/// TLS material for the connecting side of a peer link.
pub struct PeerTlsClient {
    pub connector: Arc<TlsConnector>,
    pub server_name: ServerName<'static>,
}

pub struct ConnectTarget {
    pub addr: SocketAddr,
    pub password: u64,
    pub tls: Option<PeerTlsClient>,
    /// SO_SNDBUF for the peer socket; `None` leaves the OS default.
    pub sndbuf: Option<usize>,
}

/// Slave side: connect, present the password, then run framed I/O.
pub fn spawn_connect(
    target: ConnectTarget,
    max_packet: usize,
    peer: PeerId,
    gen: u64,
    notice_tx: mpsc::Sender<LinkNotice>,
) -> LinkHandle {
    let (data_tx, data_rx) = mpsc::channel(LINK_SEND_CHANNEL);
    let token = CancellationToken::new();
    let task_token = token.clone();
    let task = tokio::spawn(async move {
        let notice = Notice { peer, gen, tx: notice_tx };
        tokio::select! {
            _ = task_token.cancelled() => {}
            stream = establish(target) => match stream {
                Ok(stream) => run_io(stream, max_packet, data_rx, &notice, task_token.clone()).await,
                Err(e) => {
                    debug!(peer, error = %e, "peer connect failed");
                    notice.send(LinkEvent::Error).await;
                }
            }
        }
    });
    LinkHandle {
        gen,
        data_tx,
        send_ctrl: None,
        recv_ctrl: None,
        adopt_tx: None,
        token,
        _tasks: vec![task],
    }
}

/// Master side: the link waits for the password listener to hand over an
/// authenticated stream via [`LinkHandle::adopt_stream`].
pub fn spawn_listen(
    max_packet: usize,
    peer: PeerId,
    gen: u64,
    notice_tx: mpsc::Sender<LinkNotice>,
) -> LinkHandle {
    let (data_tx, data_rx) = mpsc::channel(LINK_SEND_CHANNEL);
    let (adopt_tx, adopt_rx) = oneshot::channel::<BoxedStream>();
    let token = CancellationToken::new();
    let task_token = token.clone();
    let task = tokio::spawn(async move {
        let notice = Notice { peer, gen, tx: notice_tx };
        tokio::select! {
            _ = task_token.cancelled() => {}
            adopted = adopt_rx => match adopted {
                Ok(stream) => run_io(stream, max_packet, data_rx, &notice, task_token.clone()).await,
                Err(_) => {}
            }
        }
    });
    LinkHandle {
        gen,
        data_tx,
        send_ctrl: None,
        recv_ctrl: None,
        adopt_tx: Some(adopt_tx),
        token,
        _tasks: vec![task],
    }
}

async fn establish(target: ConnectTarget) -> std::io::Result<BoxedStream> {
    let stream = TcpStream::connect(target.addr).await?;
    if let Some(sndbuf) = target.sndbuf {
        SockRef::from(&stream).set_send_buffer_size(sndbuf)?;
    }
    let mut stream: BoxedStream = match target.tls {
        Some(tls) => {
            let tls_stream = tls
                .connector
                .connect(tls.server_name, stream)
                .await?;
            Box::new(tls_stream)
        }
        None => Box::new(stream),
    };
    stream.write_all(&target.password.to_le_bytes()).await?;
    stream.flush().await?;
    Ok(stream)
}

struct Notice {
    peer: PeerId,
    gen: u64,
    tx: mpsc::Sender<LinkNotice>,
}

impl Notice {
    async fn send(&self, event: LinkEvent) {
        let _ = self
            .tx
            .send(LinkNotice { peer: self.peer, gen: self.gen, event })
            .await;
    }
}

async fn run_io(
    stream: BoxedStream,
    max_packet: usize,
    data_rx: mpsc::Receiver<Bytes>,
    notice: &Notice,
    token: CancellationToken,
) {
    let (read_half, write_half) = tokio::io::split(stream);
    tokio::select! {
        _ = token.cancelled() => {}
        _ = read_loop(read_half, max_packet, notice) => {}
        _ = write_loop(write_half, data_rx) => {
            notice.send(LinkEvent::Error).await;
        }
    }
}

/// Reads length-framed packets until EOF or error, which is a link fault.
async fn read_loop(mut read: ReadHalf<BoxedStream>, max_packet: usize, notice: &Notice) {
    loop {
        let mut len_buf = [0u8; 2];
        if read.read_exact(&mut len_buf).await.is_err() {
            notice.send(LinkEvent::Error).await;
            return;
        }
        let len = u16::from_le_bytes(len_buf) as usize;
        if len > max_packet {
            debug!(peer = notice.peer, len, "oversized packet on stream link");
            notice.send(LinkEvent::Error).await;
            return;
        }
        let mut buf = vec![0u8; len];
        if read.read_exact(&mut buf).await.is_err() {
            notice.send(LinkEvent::Error).await;
            return;
        }
        if let Some(pkt) = DataPacket::decode(Bytes::from(buf)) {
            notice.send(LinkEvent::Packet(pkt)).await;
        }
    }
}

/// Writes length-framed packets; returning signals a write fault.
async fn write_loop(mut write: WriteHalf<BoxedStream>, mut data_rx: mpsc::Receiver<Bytes>) {
    while let Some(packet) = data_rx.recv().await {
        debug_assert!(packet.len() <= u16::MAX as usize);
        let len = (packet.len() as u16).to_le_bytes();
        if write.write_all(&len).await.is_err() {
            return;
        }
        if write.write_all(&packet).await.is_err() {
            return;
        }
        if write.flush().await.is_err() {
            return;
        }
    }
}
