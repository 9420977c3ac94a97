//! Rendezvous server channel.
//!
//! The core consumes a small contract: ready / new-client / end-client /
//! message events in, `send(peer_id, bytes)` out. The transport is a
//! length-framed message stream over TCP, optionally inside TLS:
//! `len:u16 LE | type:u16 LE | body`.
//!
//! Outgoing signalling is fair-queued: every peer owns a bounded producer
//! flow; a flow whose peer is removed while packets are still queued is
//! marked dying and freed only once it drains, so no message is cut short.

use std::collections::{HashMap, VecDeque};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use ahash::RandomState;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use rustls_pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::consts::{SC_KEEPALIVE_INTERVAL, SC_MAX_MSGLEN};
use crate::error::{EndpointError, Result};
use crate::link::BoxedStream;
use crate::PeerId;

const SC_KEEPALIVE: u16 = 0;
const SC_CLIENTHELLO: u16 = 1;
const SC_SERVERHELLO: u16 = 2;
const SC_NEWCLIENT: u16 = 3;
const SC_ENDCLIENT: u16 = 4;
const SC_OUTMSG: u16 = 5;
const SC_INMSG: u16 = 6;

const SC_VERSION: u16 = 1;

/// Events the coordinator consumes.
#[derive(Debug)]
pub enum ServerEvent {
    Ready { my_id: PeerId, ext_ip: Option<Ipv4Addr> },
    NewClient { id: PeerId, flags: u16, cert: Vec<u8> },
    EndClient { id: PeerId },
    Message { from: PeerId, data: Bytes },
    /// Channel failure; the endpoint terminates.
    Error,
}

pub struct ServerChannel {
    pub events: mpsc::Receiver<ServerEvent>,
    pub out_tx: mpsc::Sender<(PeerId, Bytes)>,
    _tasks: Vec<JoinHandle<()>>,
}

/// Connects to the rendezvous server and performs the hello exchange; the
/// `Ready` event arrives on the event stream.
pub async fn connect(
    addr: SocketAddr,
    tls: Option<(Arc<TlsConnector>, ServerName<'static>)>,
    token: CancellationToken,
) -> Result<ServerChannel> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| EndpointError::Server(format!("connect failed: {e}")))?;
    let stream: BoxedStream = match tls {
        Some((connector, name)) => Box::new(
            connector
                .connect(name, stream)
                .await
                .map_err(|e| EndpointError::Server(format!("tls handshake failed: {e}")))?,
        ),
        None => Box::new(stream),
    };
    let (read_half, mut write_half) = tokio::io::split(stream);

    let mut hello = BytesMut::new();
    hello.put_u16_le(SC_CLIENTHELLO);
    hello.put_u16_le(SC_VERSION);
    write_frame(&mut write_half, &hello)
        .await
        .map_err(|e| EndpointError::Server(format!("hello failed: {e}")))?;

    let (event_tx, events) = mpsc::channel(64);
    let (out_tx, out_rx) = mpsc::channel::<(PeerId, Bytes)>(64);

    let reader = tokio::spawn(read_task(read_half, event_tx.clone(), token.clone()));
    let writer = tokio::spawn(write_task(write_half, out_rx, event_tx, token));

    Ok(ServerChannel { events, out_tx, _tasks: vec![reader, writer] })
}

async fn write_frame(
    write: &mut WriteHalf<BoxedStream>,
    body: &[u8],
) -> std::io::Result<()> {
    debug_assert!(body.len() <= u16::MAX as usize);
    write.write_all(&(body.len() as u16).to_le_bytes()).await?;
    write.write_all(body).await?;
    write.flush().await
}

async fn read_task(
    mut read: ReadHalf<BoxedStream>,
    event_tx: mpsc::Sender<ServerEvent>,
    token: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = token.cancelled() => return,
            res = read_frame(&mut read) => res,
        };
        let mut frame = match frame {
            Ok(f) => f,
            Err(e) => {
                debug!(error = %e, "server channel read failed");
                let _ = event_tx.send(ServerEvent::Error).await;
                return;
            }
        };
        if frame.remaining() < 2 {
            let _ = event_tx.send(ServerEvent::Error).await;
            return;
        }
        let msg_type = frame.get_u16_le();
        let event = match parse_message(msg_type, frame) {
            Ok(Some(event)) => event,
            Ok(None) => continue,
            Err(()) => {
                warn!(msg_type, "malformed server message");
                let _ = event_tx.send(ServerEvent::Error).await;
                return;
            }
        };
        if event_tx.send(event).await.is_err() {
            return;
        }
    }
}

fn parse_message(msg_type: u16, mut body: Bytes) -> std::result::Result<Option<ServerEvent>, ()> {
    match msg_type {
        SC_KEEPALIVE => Ok(None),
        SC_SERVERHELLO => {
            if body.remaining() != 6 {
                return Err(());
            }
            let my_id = body.get_u16_le();
            let mut ip = [0u8; 4];
            body.copy_to_slice(&mut ip);
            let ext_ip = (ip != [0u8; 4]).then(|| Ipv4Addr::from(ip));
            Ok(Some(ServerEvent::Ready { my_id, ext_ip }))
        }
        SC_NEWCLIENT => {
            if body.remaining() < 4 {
                return Err(());
            }
            let id = body.get_u16_le();
            let flags = body.get_u16_le();
            Ok(Some(ServerEvent::NewClient { id, flags, cert: body.to_vec() }))
        }
        SC_ENDCLIENT => {
            if body.remaining() != 2 {
                return Err(());
            }
            Ok(Some(ServerEvent::EndClient { id: body.get_u16_le() }))
        }
        SC_INMSG => {
            if body.remaining() < 2 {
                return Err(());
            }
            let from = body.get_u16_le();
            if body.remaining() > SC_MAX_MSGLEN {
                return Err(());
            }
            Ok(Some(ServerEvent::Message { from, data: body }))
        }
        _ => {
            // unknown message types are skipped, not fatal
            debug!(msg_type, "unknown server message type");
            Ok(None)
        }
    }
}

async fn read_frame(read: &mut ReadHalf<BoxedStream>) -> std::io::Result<Bytes> {
    let mut len_buf = [0u8; 2];
    read.read_exact(&mut len_buf).await?;
    let len = u16::from_le_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    read.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}

async fn write_task(
    mut write: WriteHalf<BoxedStream>,
    mut out_rx: mpsc::Receiver<(PeerId, Bytes)>,
    event_tx: mpsc::Sender<ServerEvent>,
    token: CancellationToken,
) {
    let mut keepalive = tokio::time::interval(SC_KEEPALIVE_INTERVAL);
    keepalive.reset();
    loop {
        let result = tokio::select! {
            _ = token.cancelled() => return,
            _ = keepalive.tick() => {
                let mut body = BytesMut::new();
                body.put_u16_le(SC_KEEPALIVE);
                write_frame(&mut write, &body).await
            }
            item = out_rx.recv() => {
                let Some((peer, data)) = item else { return };
                let mut body = BytesMut::with_capacity(4 + data.len());
                body.put_u16_le(SC_OUTMSG);
                body.put_u16_le(peer);
                body.extend_from_slice(&data);
                write_frame(&mut write, &body).await
            }
        };
        if let Err(e) = result {
            debug!(error = %e, "server channel write failed");
            let _ = event_tx.send(ServerEvent::Error).await;
            return;
        }
    }
}

struct SignalFlow {
    queue: VecDeque<Bytes>,
    dying: bool,
}

/// Fair queue of per-peer signalling flows feeding the server writer.
pub struct SignalQueue {
    out_tx: mpsc::Sender<(PeerId, Bytes)>,
    capacity: usize,
    flows: HashMap<PeerId, SignalFlow, RandomState>,
    rotation: VecDeque<PeerId>,
}

impl SignalQueue {
    pub fn new(out_tx: mpsc::Sender<(PeerId, Bytes)>, capacity: usize) -> SignalQueue {
        SignalQueue {
            out_tx,
            capacity,
            flows: HashMap::default(),
            rotation: VecDeque::new(),
        }
    }

    pub fn add_flow(&mut self, peer: PeerId) {
        // a dying flow from an earlier incarnation of the same id keeps its
        // queue; the id routes to the same place either way
        if let Some(flow) = self.flows.get_mut(&peer) {
            flow.dying = false;
            return;
        }
        self.flows.insert(peer, SignalFlow { queue: VecDeque::new(), dying: false });
        self.rotation.push_back(peer);
    }

    /// Queues a message toward `peer`. Overflow is a configuration error and
    /// terminates the endpoint.
    pub fn push(&mut self, peer: PeerId, msg: Bytes) -> Result<()> {
        let Some(flow) = self.flows.get_mut(&peer) else {
            return Ok(());
        };
        if flow.dying {
            return Ok(());
        }
        if flow.queue.len() >= self.capacity {
            return Err(EndpointError::SignalOverflow);
        }
        flow.queue.push_back(msg);
        self.drain();
        Ok(())
    }

    /// Removes a peer's flow. A flow with queued packets still in flight is
    /// marked dying and freed once the queue drains.
    pub fn remove_flow(&mut self, peer: PeerId) {
        let Some(flow) = self.flows.get_mut(&peer) else {
            return;
        };
        if flow.queue.is_empty() {
            self.flows.remove(&peer);
            self.rotation.retain(|p| *p != peer);
        } else {
            flow.dying = true;
        }
    }

    /// Round-robin drain into the writer channel; dying flows are freed as
    /// they empty.
    pub fn drain(&mut self) {
        let out_tx = self.out_tx.clone();
        let mut finished: Vec<PeerId> = Vec::new();
        for _ in 0..self.rotation.len() {
            let Some(peer) = self.rotation.pop_front() else {
                break;
            };
            self.rotation.push_back(peer);
            let Some(flow) = self.flows.get_mut(&peer) else {
                continue;
            };
            let mut blocked = false;
            while let Some(msg) = flow.queue.front() {
                match out_tx.try_send((peer, msg.clone())) {
                    Ok(()) => {
                        flow.queue.pop_front();
                    }
                    Err(_) => {
                        blocked = true;
                        break;
                    }
                }
            }
            if flow.queue.is_empty() && flow.dying {
                finished.push(peer);
            }
            if blocked {
                break;
            }
        }
        for peer in finished {
            self.flows.remove(&peer);
            self.rotation.retain(|p| *p != peer);
        }
    }

    pub fn has_flow(&self, peer: PeerId) -> bool {
        self.flows.contains_key(&peer)
    }

    pub fn is_dying(&self, peer: PeerId) -> bool {
        self.flows.get(&peer).map(|f| f.dying).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fair_queue_round_robin() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut q = SignalQueue::new(tx, 8);
        q.add_flow(1);
        q.add_flow(2);
        // stuff both flows before draining by saturating the writer first
        q.push(1, Bytes::from_static(b"a1")).unwrap();
        q.push(1, Bytes::from_static(b"a2")).unwrap();
        q.push(2, Bytes::from_static(b"b1")).unwrap();

        let mut got = Vec::new();
        while let Ok((p, m)) = rx.try_recv() {
            got.push((p, m));
        }
        assert_eq!(got.len(), 3);
        // per-flow FIFO holds
        let first_a = got.iter().position(|(p, _)| *p == 1).unwrap();
        let second_a = got.iter().rposition(|(p, _)| *p == 1).unwrap();
        assert_eq!(got[first_a].1, Bytes::from_static(b"a1"));
        assert_eq!(got[second_a].1, Bytes::from_static(b"a2"));
    }

    #[test]
    fn test_overflow_is_fatal() {
        let (tx, _rx) = mpsc::channel(1);
        let mut q = SignalQueue::new(tx, 2);
        q.add_flow(1);
        // one goes into the writer, two fill the flow, the next overflows
        q.push(1, Bytes::from_static(b"1")).unwrap();
        q.push(1, Bytes::from_static(b"2")).unwrap();
        q.push(1, Bytes::from_static(b"3")).unwrap();
        assert!(matches!(
            q.push(1, Bytes::from_static(b"4")),
            Err(EndpointError::SignalOverflow)
        ));
    }

    #[test]
    fn test_dying_flow_drains_then_frees() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut q = SignalQueue::new(tx, 8);
        q.add_flow(1);
        // writer holds one message; the second stays queued in the flow
        q.push(1, Bytes::from_static(b"first")).unwrap();
        q.push(1, Bytes::from_static(b"confirmseed")).unwrap();

        // peer goes away while a message is still queued
        q.remove_flow(1);
        assert!(q.has_flow(1), "busy flow must not be freed immediately");
        assert!(q.is_dying(1));

        // pushes to a dying flow are ignored, not queued
        q.push(1, Bytes::from_static(b"late")).unwrap();

        // writer drains, making room; the queued message goes out intact
        assert_eq!(rx.try_recv().unwrap().1, Bytes::from_static(b"first"));
        q.drain();
        assert_eq!(rx.try_recv().unwrap().1, Bytes::from_static(b"confirmseed"));
        assert!(!q.has_flow(1), "drained dying flow is freed");
        assert!(rx.try_recv().is_err(), "nothing sent after the flow died");
    }

    #[test]
    fn test_remove_idle_flow_frees_immediately() {
        let (tx, _rx) = mpsc::channel(4);
        let mut q = SignalQueue::new(tx, 8);
        q.add_flow(1);
        q.remove_flow(1);
        assert!(!q.has_flow(1));
    }
}
