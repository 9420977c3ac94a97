//! Datagram peer I/O.
//!
//! Send path: DataProto packets → fragmentation → secure-packet codec →
//! socket. Receive path mirrors it. A master binds and learns the remote
//! address from the first authenticated datagram; a slave connects straight
//! to the offered address.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::link::{
    LinkEvent, LinkHandle, LinkNotice, RecvCtrl, SendCtrl, LINK_SEND_CHANNEL,
};
use crate::proto::dataproto::DataPacket;
use crate::proto::fragment::{Assembler, Disassembler};
use crate::proto::spp::{EncodeError, SecurityParams, SppDecoder, SppEncoder};
use crate::PeerId;

#[derive(Clone, Copy)]
pub struct UdpLinkConfig {
    pub params: SecurityParams,
    /// Largest DataProto packet carried (fragmentation input bound).
    pub data_mtu: usize,
    /// Datagram budget on the wire.
    pub udp_mtu: usize,
    /// How long a partially filled datagram may wait for more frames.
    pub fragmentation_latency: Duration,
    pub assembler_frames: usize,
}

/// Binds a nonblocking UDP socket; used by the master's port-range walk.
pub fn try_bind(addr: SocketAddr) -> std::io::Result<std::net::UdpSocket> {
    let socket = std::net::UdpSocket::bind(addr)?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Master side: socket already bound, remote address learned from the first
/// authenticated datagram.
pub fn spawn_bound(
    socket: std::net::UdpSocket,
    cfg: UdpLinkConfig,
    peer: PeerId,
    gen: u64,
    notice_tx: mpsc::Sender<LinkNotice>,
) -> std::io::Result<LinkHandle> {
    let socket = UdpSocket::from_std(socket)?;
    Ok(spawn(socket, None, cfg, peer, gen, notice_tx))
}

/// Slave side: fresh ephemeral socket connected to the offered address.
pub fn spawn_connected(
    remote: SocketAddr,
    cfg: UdpLinkConfig,
    peer: PeerId,
    gen: u64,
    notice_tx: mpsc::Sender<LinkNotice>,
) -> std::io::Result<LinkHandle> {
    let any: SocketAddr = if remote.is_ipv4() {
        "0.0.0.0:0".parse().expect("valid address")
    } else {
        "[::]:0".parse().expect("valid address")
    };
    let socket = std::net::UdpSocket::bind(any)?;
    socket.connect(remote)?;
    socket.set_nonblocking(true)?;
    let socket = UdpSocket::from_std(socket)?;
    Ok(spawn(socket, Some(remote), cfg, peer, gen, notice_tx))
}

fn spawn(
    socket: UdpSocket,
    remote: Option<SocketAddr>,
    cfg: UdpLinkConfig,
    peer: PeerId,
    gen: u64,
    notice_tx: mpsc::Sender<LinkNotice>,
) -> LinkHandle {
    let socket = Arc::new(socket);
    let (data_tx, data_rx) = mpsc::channel(LINK_SEND_CHANNEL);
    let (send_ctrl_tx, send_ctrl_rx) = mpsc::unbounded_channel();
    let (recv_ctrl_tx, recv_ctrl_rx) = mpsc::unbounded_channel();
    let (addr_tx, addr_rx) = watch::channel(remote);
    let token = CancellationToken::new();

    let send_task = tokio::spawn(send_task(
        socket.clone(),
        cfg,
        connectedness(remote),
        data_rx,
        send_ctrl_rx,
        addr_rx,
        Notice { peer, gen, tx: notice_tx.clone() },
        token.clone(),
    ));
    let recv_task = tokio::spawn(recv_task(
        socket,
        cfg,
        connectedness(remote),
        recv_ctrl_rx,
        addr_tx,
        Notice { peer, gen, tx: notice_tx },
        token.clone(),
    ));

    LinkHandle {
        gen,
        data_tx,
        send_ctrl: Some(send_ctrl_tx),
        recv_ctrl: Some(recv_ctrl_tx),
        adopt_tx: None,
        token,
        _tasks: vec![send_task, recv_task],
    }
}

fn connectedness(remote: Option<SocketAddr>) -> bool {
    remote.is_some()
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

#[allow(clippy::too_many_arguments)]
async fn send_task(
    socket: Arc<UdpSocket>,
    cfg: UdpLinkConfig,
    connected: bool,
    mut data_rx: mpsc::Receiver<Bytes>,
    mut ctrl_rx: mpsc::UnboundedReceiver<SendCtrl>,
    addr_rx: watch::Receiver<Option<SocketAddr>>,
    notice: Notice,
    token: CancellationToken,
) {
    let payload_mtu = cfg.params.payload_mtu(cfg.udp_mtu);
    let mut dis = Disassembler::new(payload_mtu, None);
    let mut enc = SppEncoder::new(cfg.params);
    let mut out: Vec<Bytes> = Vec::new();

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => return,
            Some(ctrl) = ctrl_rx.recv() => apply_send_ctrl(&mut enc, ctrl),
            frame = data_rx.recv() => {
                let Some(frame) = frame else { return };
                dis.push_frame(&frame, &mut out);
                while let Ok(more) = data_rx.try_recv() {
                    dis.push_frame(&more, &mut out);
                }
                if !emit(&socket, connected, &addr_rx, &mut enc, &mut out, &notice).await {
                    return;
                }
                if dis.has_pending()
                    && !linger(
                        &socket, cfg, connected, &mut data_rx, &addr_rx, &mut dis, &mut enc,
                        &mut out, &notice,
                    )
                    .await
                {
                    return;
                }
            }
        }
    }
}

/// Waits up to the fragmentation latency for more frames to coalesce into
/// the open datagram, then flushes. Returns false on transport failure.
#[allow(clippy::too_many_arguments)]
async fn linger(
    socket: &UdpSocket,
    cfg: UdpLinkConfig,
    connected: bool,
    data_rx: &mut mpsc::Receiver<Bytes>,
    addr_rx: &watch::Receiver<Option<SocketAddr>>,
    dis: &mut Disassembler,
    enc: &mut SppEncoder,
    out: &mut Vec<Bytes>,
    notice: &Notice,
) -> bool {
    while dis.has_pending() {
        if cfg.fragmentation_latency.is_zero() {
            out.extend(dis.flush());
            return emit(socket, connected, addr_rx, enc, out, notice).await;
        }
        match timeout(cfg.fragmentation_latency, data_rx.recv()).await {
            Ok(Some(frame)) => {
                dis.push_frame(&frame, out);
                while let Ok(more) = data_rx.try_recv() {
                    dis.push_frame(&more, out);
                }
                if !emit(socket, connected, addr_rx, enc, out, notice).await {
                    return false;
                }
            }
            Ok(None) => return false,
            Err(_) => {
                out.extend(dis.flush());
                return emit(socket, connected, addr_rx, enc, out, notice).await;
            }
        }
    }
    true
}

fn apply_send_ctrl(enc: &mut SppEncoder, ctrl: SendCtrl) {
    match ctrl {
        SendCtrl::SetKey(key) => enc.set_key(key),
        SendCtrl::SetSendSeed(id) => enc.set_send_seed(id),
    }
}

/// Encodes and transmits every packed datagram. Returns false on transport
/// failure (the error notice has been sent).
async fn emit(
    socket: &UdpSocket,
    connected: bool,
    addr_rx: &watch::Receiver<Option<SocketAddr>>,
    enc: &mut SppEncoder,
    out: &mut Vec<Bytes>,
    notice: &Notice,
) -> bool {
    for packet in out.drain(..) {
        let encoded = match enc.encode(&packet) {
            Ok(e) => e,
            Err(EncodeError::OtpExhausted) => {
                trace!("send seed exhausted, dropping datagram");
                continue;
            }
            Err(EncodeError::NoKey) => {
                trace!("no encryption key yet, dropping datagram");
                continue;
            }
        };
        if encoded.seed_warning {
            notice.send(LinkEvent::OtpSendWarning).await;
        }
        let result = if connected {
            socket.send(&encoded.packet).await
        } else {
            let addr = *addr_rx.borrow();
            match addr {
                Some(addr) => socket.send_to(&encoded.packet, addr).await,
                // remote not learned yet, nowhere to send
                None => continue,
            }
        };
        if let Err(e) = result {
            debug!(error = %e, "udp send failed");
            notice.send(LinkEvent::Error).await;
            return false;
        }
    }
    true
}

async fn recv_task(
    socket: Arc<UdpSocket>,
    cfg: UdpLinkConfig,
    connected: bool,
    mut ctrl_rx: mpsc::UnboundedReceiver<RecvCtrl>,
    addr_tx: watch::Sender<Option<SocketAddr>>,
    notice: Notice,
    token: CancellationToken,
) {
    let mut dec = SppDecoder::new(cfg.params);
    let mut asm = Assembler::new(cfg.assembler_frames, cfg.data_mtu);
    let mut buf = vec![0u8; 65536];

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => return,
            Some(ctrl) = ctrl_rx.recv() => match ctrl {
                RecvCtrl::SetKey(key) => dec.set_key(key),
                RecvCtrl::AddRecvSeed(id) => dec.add_recv_seed(id),
            },
            res = socket.recv_from(&mut buf) => {
                let (n, from) = match res {
                    Ok(pair) => pair,
                    Err(e) => {
                        debug!(error = %e, "udp recv failed");
                        notice.send(LinkEvent::Error).await;
                        return;
                    }
                };
                // transient packet faults drop silently
                let Some(decoded) = dec.decode(&buf[..n]) else {
                    continue;
                };
                if !connected {
                    addr_tx.send_if_modified(|cur| {
                        if *cur != Some(from) {
                            *cur = Some(from);
                            true
                        } else {
                            false
                        }
                    });
                }
                if let Some(seed_id) = decoded.seed_ready {
                    notice.send(LinkEvent::OtpRecvSeedReady(seed_id)).await;
                }
                let mut frames = Vec::new();
                asm.input(&decoded.payload, &mut frames);
                for frame in frames {
                    if let Some(pkt) = DataPacket::decode(frame) {
                        notice.send(LinkEvent::Packet(pkt)).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::dataproto::FLAG_RECEIVED_DATA;

    fn link_cfg() -> UdpLinkConfig {
        UdpLinkConfig {
            params: SecurityParams::default(),
            data_mtu: 2048,
            udp_mtu: 1472,
            fragmentation_latency: Duration::ZERO,
            assembler_frames: 8,
        }
    }

    async fn recv_packet(rx: &mut mpsc::Receiver<LinkNotice>) -> DataPacket {
        loop {
            let notice = rx.recv().await.expect("notice");
            if let LinkEvent::Packet(pkt) = notice.event {
                return pkt;
            }
        }
    }

    #[tokio::test]
    async fn test_bound_and_connected_links_exchange_packets() {
        let master_socket = try_bind("127.0.0.1:0".parse().unwrap()).expect("bind");
        let master_addr = master_socket.local_addr().expect("addr");

        let (master_tx, mut master_rx) = mpsc::channel(64);
        let master = spawn_bound(master_socket, link_cfg(), 2, 1, master_tx).expect("spawn");

        let (slave_tx, mut slave_rx) = mpsc::channel(64);
        let slave =
            spawn_connected(master_addr, link_cfg(), 1, 1, slave_tx).expect("connect");

        // slave speaks first so the master learns its address
        let hello = DataPacket {
            flags: FLAG_RECEIVED_DATA,
            from: 2,
            dests: vec![1],
            payload: Bytes::from_static(b"hello"),
        };
        slave.data_sender().send(hello.encode()).await.expect("send");
        let got = recv_packet(&mut master_rx).await;
        assert_eq!(got.payload, Bytes::from_static(b"hello"));

        // now the master can answer
        let reply = DataPacket {
            flags: 0,
            from: 1,
            dests: vec![2],
            payload: Bytes::from_static(b"reply"),
        };
        master.data_sender().send(reply.encode()).await.expect("send");
        let got = recv_packet(&mut slave_rx).await;
        assert_eq!(got.payload, Bytes::from_static(b"reply"));
        drop(master);
        drop(slave);
    }

    #[tokio::test]
    async fn test_encrypted_link_with_otp_reports_seed_ready() {
        use crate::crypto::otp::OtpParams;
        use crate::crypto::CipherMode;

        let params = SecurityParams {
            cipher: Some(CipherMode::Aes),
            hash: None,
            otp: Some(OtpParams { cipher: CipherMode::Aes, num: 64, num_warn: 8 }),
        };
        let cfg = UdpLinkConfig { params, ..link_cfg() };

        let master_socket = try_bind("127.0.0.1:0".parse().unwrap()).expect("bind");
        let master_addr = master_socket.local_addr().expect("addr");
        let (master_tx, mut master_rx) = mpsc::channel(64);
        let master = spawn_bound(master_socket, cfg, 2, 1, master_tx).expect("spawn");

        let (slave_tx, _slave_rx) = mpsc::channel(64);
        let slave = spawn_connected(master_addr, cfg, 1, 1, slave_tx).expect("connect");

        let key = vec![9u8; 16];
        master.set_encryption_key(key.clone());
        slave.set_encryption_key(key);
        master.add_otp_recv_seed(0);
        slave.set_otp_send_seed(0);

        let pkt = DataPacket {
            flags: 0,
            from: 2,
            dests: vec![1],
            payload: Bytes::from_static(b"sealed"),
        };
        slave.data_sender().send(pkt.encode()).await.expect("send");

        let mut saw_seed_ready = false;
        let mut saw_packet = false;
        while !(saw_seed_ready && saw_packet) {
            let notice = master_rx.recv().await.expect("notice");
            match notice.event {
                LinkEvent::OtpRecvSeedReady(0) => saw_seed_ready = true,
                LinkEvent::Packet(p) => {
                    assert_eq!(p.payload, Bytes::from_static(b"sealed"));
                    saw_packet = true;
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        drop(master);
        drop(slave);
    }
}
