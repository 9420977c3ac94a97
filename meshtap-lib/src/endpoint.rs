//! Endpoint coordinator: owns the peer table, the relay registry, the
//! waiting-for-relay list, the frame decider, all flows and sinks, the
//! signalling queue and the device endpoints. Every state transition runs
//! on the coordinator task; I/O tasks only feed it events over channels.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use ahash::RandomState;
use bytes::Bytes;
use rustls_pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, ExtAddrSpec, TransportMode};
use crate::consts::{
    CLIENT_FLAG_RELAY_CLIENT, CLIENT_UDP_MTU, DATAPROTO_MAX_OVERHEAD, MAX_PEERS,
    PEER_KEEPALIVE_INTERVAL, PEER_KEEPALIVE_RECEIVE_TIMER, PEER_RELAY_FLOW_INACTIVITY_TIME,
    PEER_UDP_ASSEMBLER_NUM_FRAMES, SC_MAX_MSGLEN, SERVER_BUFFER_MIN_PACKETS, TICK_INTERVAL,
};
use crate::decider::{FrameDecider, ETHERNET_HEADER_LEN};
use crate::device::{spawn_device, DeviceEvent};
use crate::error::{EndpointError, Result};
use crate::flows::flow::DataProtoFlow;
use crate::flows::receive::ReceiveDevice;
use crate::flows::sink::{DataProtoSink, LinkSignal};
use crate::flows::source::group_destinations;
use crate::flows::FlowKey;
use crate::link::udp::UdpLinkConfig;
use crate::link::{LinkEvent, LinkHandle, LinkNotice};
use crate::listener::{AcceptedClient, PasswordRegistry};
use crate::peer::Peer;
use crate::proto::dataproto::DataPacket;
use crate::proto::signal::{PeerMessage, ScopedAddr};
use crate::server::{self, ServerEvent, SignalQueue};
use crate::tls::{build_tls_acceptor, build_tls_connector, extract_common_name};
use crate::PeerId;

/// One configured bind address with its external addresses, server-reported
/// entries resolved at ready.
pub(crate) struct ResolvedBindAddr {
    pub addr: SocketAddr,
    pub num_ports: u16,
    pub ext_addrs: Vec<ResolvedExtAddr>,
}

pub(crate) struct ResolvedExtAddr {
    pub scope: String,
    pub spec: ExtAddrSpec,
    pub addr: Option<SocketAddr>,
}

impl ResolvedBindAddr {
    pub fn usable_ext_addrs(&self) -> Vec<ScopedAddr> {
        self.ext_addrs
            .iter()
            .filter_map(|e| {
                e.addr.map(|addr| ScopedAddr { scope: e.scope.clone(), addr })
            })
            .collect()
    }
}

pub(crate) struct Core {
    pub(crate) cfg: Arc<Config>,
    pub(crate) ready: bool,
    pub(crate) my_id: PeerId,
    pub(crate) data_mtu: usize,
    pub(crate) bind_addrs: Vec<ResolvedBindAddr>,
    pub(crate) peers: HashMap<PeerId, Peer, RandomState>,
    pub(crate) relays: Vec<PeerId>,
    pub(crate) waiting_relay: Vec<PeerId>,
    pub(crate) decider: FrameDecider,
    pub(crate) flows: HashMap<FlowKey, DataProtoFlow, RandomState>,
    pub(crate) sinks: HashMap<PeerId, DataProtoSink, RandomState>,
    pub(crate) receive: ReceiveDevice,
    pub(crate) signals: SignalQueue,
    pub(crate) passwords: PasswordRegistry,
    pub(crate) link_tx: mpsc::Sender<LinkNotice>,
    pub(crate) connector: Option<Arc<TlsConnector>>,
    pub(crate) next_gen: u64,
}

impl Core {
    pub(crate) fn new(
        cfg: Arc<Config>,
        link_tx: mpsc::Sender<LinkNotice>,
        tap_tx: mpsc::Sender<Bytes>,
        server_out: mpsc::Sender<(PeerId, Bytes)>,
        connector: Option<Arc<TlsConnector>>,
        now: Instant,
    ) -> Core {
        let bind_addrs = cfg
            .bind_addrs
            .iter()
            .map(|b| ResolvedBindAddr {
                addr: b.addr,
                num_ports: b.num_ports,
                ext_addrs: b
                    .ext_addrs
                    .iter()
                    .map(|e| ResolvedExtAddr {
                        scope: e.scope.clone(),
                        addr: match e.spec {
                            ExtAddrSpec::Fixed(addr) => Some(addr),
                            ExtAddrSpec::ServerReported { .. } => None,
                        },
                        spec: e.spec.clone(),
                    })
                    .collect(),
            })
            .collect();
        let data_mtu = DATAPROTO_MAX_OVERHEAD + ETHERNET_HEADER_LEN + cfg.mtu;
        Core {
            ready: false,
            my_id: 0,
            data_mtu,
            bind_addrs,
            peers: HashMap::default(),
            relays: Vec::new(),
            waiting_relay: Vec::new(),
            decider: FrameDecider::new(cfg.decider),
            flows: HashMap::default(),
            sinks: HashMap::default(),
            receive: ReceiveDevice::new(
                tap_tx,
                cfg.send_buffer_relay_size,
                PEER_RELAY_FLOW_INACTIVITY_TIME,
            ),
            signals: SignalQueue::new(server_out, SERVER_BUFFER_MIN_PACKETS),
            passwords: PasswordRegistry::new(),
            link_tx,
            connector,
            next_gen: 0,
            cfg,
        }
    }

    pub(crate) fn alloc_gen(&mut self) -> u64 {
        self.next_gen += 1;
        self.next_gen
    }

    pub(crate) fn udp_link_config(&self) -> UdpLinkConfig {
        UdpLinkConfig {
            params: self.cfg.security,
            data_mtu: self.data_mtu,
            udp_mtu: CLIENT_UDP_MTU,
            fragmentation_latency: self.cfg.fragmentation_latency,
            assembler_frames: PEER_UDP_ASSEMBLER_NUM_FRAMES,
        }
    }

    pub(crate) fn send_signal(&mut self, peer_id: PeerId, msg: &PeerMessage) -> Result<()> {
        self.signals.push(peer_id, msg.encode())
    }

    pub(crate) fn peer_tls_server_name(
        &self,
        peer_id: PeerId,
        addr: SocketAddr,
    ) -> ServerName<'static> {
        self.peers
            .get(&peer_id)
            .and_then(|p| p.common_name.clone())
            .and_then(|cn| ServerName::try_from(cn).ok())
            .unwrap_or_else(|| ServerName::IpAddress(addr.ip().into()))
    }

    /// Builds and sends the YOUCONNECT offer for one bound address, with
    /// external ports shifted by the bind offset that succeeded.
    pub(crate) fn send_connect_offer(
        &mut self,
        peer_id: PeerId,
        addr_index: usize,
        port_add: u16,
        key: Option<Vec<u8>>,
        password: Option<u64>,
    ) -> Result<()> {
        let addrs: Vec<ScopedAddr> = self.bind_addrs[addr_index]
            .usable_ext_addrs()
            .into_iter()
            .map(|mut a| {
                a.addr.set_port(a.addr.port().wrapping_add(port_add));
                a
            })
            .collect();
        self.send_signal(peer_id, &PeerMessage::YouConnect { addrs, key, password })
    }

    /// Wires a fresh link into the peer: sink, local flow attachment and
    /// per-link OTP state.
    pub(crate) fn install_link(&mut self, peer_id: PeerId, handle: LinkHandle) {
        let now = Instant::now();
        let mut sink = DataProtoSink::new(
            peer_id,
            handle.data_sender(),
            PEER_KEEPALIVE_INTERVAL,
            PEER_KEEPALIVE_RECEIVE_TIMER,
            now,
        );
        sink.add_flow(FlowKey::Local(peer_id));
        self.sinks.insert(peer_id, sink);
        if let Some(flow) = self.flows.get_mut(&FlowKey::Local(peer_id)) {
            flow.attach(peer_id);
        }
        if let Some(peer) = self.peers.get_mut(&peer_id) {
            peer.link = Some(handle);
            peer.sendseed_next_id = 0;
            peer.sendseed_sent = None;
            peer.pending_recvseed_id = None;
            peer.check_disposition();
        }
        self.drain_sink(peer_id, now);
    }

    /// Tears the link down: sink, attachments, relay flows toward this peer
    /// and any outstanding listener password.
    pub(crate) fn peer_free_link(&mut self, peer_id: PeerId) {
        let Some(peer) = self.peers.get_mut(&peer_id) else {
            return;
        };
        debug_assert!(!peer.is_relay, "relay providers are disabled before link teardown");
        let password = peer.listen_password.take();
        // dropping the handle cancels the link tasks
        peer.link = None;
        if let Some(password) = password {
            self.passwords.remove_entry(password);
        }
        if let Some(flow) = self.flows.get_mut(&FlowKey::Local(peer_id)) {
            if flow.attached() == Some(peer_id) {
                flow.detach();
            }
        }
        self.sinks.remove(&peer_id);
        let stale: Vec<FlowKey> = self
            .flows
            .keys()
            .filter(|k| matches!(k, FlowKey::Relay { dst, .. } if *dst == peer_id))
            .copied()
            .collect();
        for key in stale {
            self.flows.remove(&key);
        }
    }

    // ---- server plane ----

    pub(crate) fn handle_server_event(&mut self, event: ServerEvent, now: Instant) -> Result<()> {
        match event {
            ServerEvent::Ready { my_id, ext_ip } => self.handle_ready(my_id, ext_ip),
            ServerEvent::NewClient { id, flags, cert } => {
                self.handle_new_client(id, flags, cert, now)
            }
            ServerEvent::EndClient { id } => {
                self.handle_end_client(id);
                Ok(())
            }
            ServerEvent::Message { from, data } => self.handle_peer_message(from, data),
            ServerEvent::Error => {
                Err(EndpointError::Server("server connection failed".into()))
            }
        }
    }

    fn handle_ready(&mut self, my_id: PeerId, ext_ip: Option<std::net::Ipv4Addr>) -> Result<()> {
        if self.ready {
            warn!("server: duplicate ready");
            return Ok(());
        }
        self.my_id = my_id;
        self.ready = true;
        for bind in &mut self.bind_addrs {
            for ext in &mut bind.ext_addrs {
                if let ExtAddrSpec::ServerReported { port } = ext.spec {
                    let Some(ip) = ext_ip else {
                        return Err(EndpointError::Server(
                            "server did not provide our external address".into(),
                        ));
                    };
                    let addr = SocketAddr::new(ip.into(), port);
                    info!(%addr, scope = %ext.scope, "external address: server reported");
                    ext.addr = Some(addr);
                }
            }
        }
        info!(id = my_id, "server: ready");
        Ok(())
    }

    fn handle_new_client(
        &mut self,
        id: PeerId,
        flags: u16,
        cert: Vec<u8>,
        now: Instant,
    ) -> Result<()> {
        if !self.ready {
            warn!(peer = id, "server: newclient before ready");
            return Ok(());
        }
        if id == self.my_id {
            warn!(peer = id, "server: newclient: peer has our id");
            return Ok(());
        }
        if self.peers.contains_key(&id) {
            warn!(peer = id, "server: newclient: peer already known");
            return Ok(());
        }
        if self.peers.len() >= MAX_PEERS {
            warn!(peer = id, "server: newclient: no space for new peer");
            return Ok(());
        }
        if self.cfg.tls.is_none() && !cert.is_empty() {
            warn!(peer = id, "server: newclient: certificate supplied, but not using TLS");
            return Ok(());
        }
        let common_name = match (&self.cfg.tls, cert.is_empty()) {
            (Some(_), false) => {
                let cn = extract_common_name(&cert);
                if cn.is_none() {
                    warn!(peer = id, "certificate has no readable common name");
                }
                cn
            }
            _ => None,
        };

        self.signals.add_flow(id);
        self.flows
            .insert(FlowKey::Local(id), DataProtoFlow::new(self.cfg.send_buffer_size, now));
        self.decider.add_peer(id);
        self.peers.insert(id, Peer::new(id, flags, common_name.clone()));
        match common_name {
            Some(cn) => info!(peer = id, common_name = %cn, "initialized"),
            None => info!(peer = id, "initialized"),
        }
        self.peer_init(id)
    }

    fn handle_end_client(&mut self, id: PeerId) {
        if !self.peers.contains_key(&id) {
            warn!(peer = id, "server: endclient: peer not known");
            return;
        }
        self.peer_remove(id);
    }

    pub(crate) fn peer_remove(&mut self, peer_id: PeerId) {
        info!(peer = peer_id, "removing");
        let Some(peer) = self.peers.get(&peer_id) else {
            return;
        };
        if peer.has_link() {
            if peer.is_relay {
                self.peer_disable_relay_provider(peer_id);
            }
            self.peer_free_link(peer_id);
        } else if peer.relaying_through.is_some() {
            self.peer_free_relaying(peer_id);
        } else if peer.waiting_relay {
            self.peer_unregister_need_relay(peer_id);
        }

        self.decider.remove_peer(peer_id);
        self.receive.remove_peer(peer_id);
        self.flows.remove(&FlowKey::Local(peer_id));
        // relay traffic sourced by this peer dies with it
        let sourced: Vec<FlowKey> = self
            .flows
            .keys()
            .filter(|k| matches!(k, FlowKey::Relay { src, .. } if *src == peer_id))
            .copied()
            .collect();
        for key in sourced {
            if let FlowKey::Relay { dst, .. } = key {
                if let Some(sink) = self.sinks.get_mut(&dst) {
                    sink.remove_flow(key);
                }
            }
            self.flows.remove(&key);
        }
        // the signalling flow dies lazily if packets are still queued
        self.signals.remove_flow(peer_id);
        self.peers.remove(&peer_id);
    }

    fn handle_peer_message(&mut self, from: PeerId, data: Bytes) -> Result<()> {
        if data.len() > SC_MAX_MSGLEN {
            warn!(peer = from, "server: oversized message");
            return Ok(());
        }
        if !self.peers.contains_key(&from) {
            warn!(peer = from, "server: message: peer not known");
            return Ok(());
        }
        let Some(msg) = PeerMessage::decode(data) else {
            warn!(peer = from, "malformed peer message");
            return Ok(());
        };
        self.peer_handle_message(from, msg)
    }

    // ---- link plane ----

    pub(crate) fn handle_link_notice(&mut self, notice: LinkNotice, now: Instant) -> Result<()> {
        let current_gen = self
            .peers
            .get(&notice.peer)
            .and_then(|p| p.link.as_ref())
            .map(|l| l.gen());
        if current_gen != Some(notice.gen) {
            debug!(peer = notice.peer, gen = notice.gen, "stale link event");
            return Ok(());
        }
        match notice.event {
            LinkEvent::Error => {
                info!(peer = notice.peer, "connection failed");
                self.peer_reset(notice.peer)
            }
            LinkEvent::OtpSendWarning => self.peer_otp_warning(notice.peer),
            LinkEvent::OtpRecvSeedReady(seed_id) => {
                self.peer_otp_recv_seed_ready(notice.peer, seed_id)
            }
            LinkEvent::Packet(pkt) => {
                self.handle_data_packet(notice.peer, pkt, now);
                Ok(())
            }
        }
    }

    fn handle_data_packet(&mut self, link_peer: PeerId, pkt: DataPacket, now: Instant) {
        if let Some(sink) = self.sinks.get_mut(&link_peer) {
            if let Some(signal) = sink.on_packet(pkt.flags, now) {
                self.peer_dataproto_signal(link_peer, signal == LinkSignal::Up);
            }
        }
        if pkt.is_keepalive() {
            return;
        }
        let relay_client = self
            .peers
            .get(&link_peer)
            .map(|p| p.flags & CLIENT_FLAG_RELAY_CLIENT != 0)
            .unwrap_or(true);
        for dest in pkt.dests.clone() {
            if dest == self.my_id {
                if self.peers.contains_key(&pkt.from) {
                    self.decider.analyze_peer_frame(pkt.from, &pkt.payload, now);
                }
                self.receive.push(pkt.from, pkt.payload.clone(), now);
            } else if !relay_client {
                self.relay_packet(pkt.from, dest, pkt.payload.clone(), now);
            }
            // relay-client-only peers never have their traffic forwarded
        }
    }

    fn relay_packet(&mut self, src: PeerId, dst: PeerId, payload: Bytes, now: Instant) {
        let Some(dst_peer) = self.peers.get(&dst) else {
            return;
        };
        if !dst_peer.has_link() {
            return;
        }
        let key = FlowKey::Relay { src, dst };
        if !self.flows.contains_key(&key) {
            let mut flow = DataProtoFlow::new(self.cfg.send_buffer_relay_size, now);
            flow.attach(dst);
            self.flows.insert(key, flow);
            if let Some(sink) = self.sinks.get_mut(&dst) {
                sink.add_flow(key);
            }
        }
        let pkt = DataPacket { flags: 0, from: src, dests: vec![dst], payload };
        if let Some(flow) = self.flows.get_mut(&key) {
            flow.push(pkt, now);
        }
        self.drain_sink(dst, now);
    }

    // ---- device plane ----

    pub(crate) fn handle_device_frame(&mut self, frame: Bytes, now: Instant) {
        self.decider.analyze_device_frame(&frame, now);
        let dests = self.decider.decide(&frame, now);
        if dests.is_empty() {
            return;
        }
        let flows = &self.flows;
        let groups = group_destinations(&dests, |d| {
            flows.get(&FlowKey::Local(d)).and_then(|f| f.attached())
        });
        let mut touched: Vec<PeerId> = Vec::new();
        for group in groups {
            let key = FlowKey::Local(group.lead);
            let pkt = DataPacket {
                flags: 0,
                from: self.my_id,
                dests: group.dests,
                payload: frame.clone(),
            };
            if let Some(flow) = self.flows.get_mut(&key) {
                flow.push(pkt, now);
                if let Some(owner) = flow.attached() {
                    if !touched.contains(&owner) {
                        touched.push(owner);
                    }
                }
            }
        }
        for owner in touched {
            self.drain_sink(owner, now);
        }
    }

    /// Fair round-robin drain of a sink's attached flows into its link
    /// writer. One packet per flow per round; stops when the writer is
    /// saturated.
    pub(crate) fn drain_sink(&mut self, owner: PeerId, now: Instant) {
        let Some(sink) = self.sinks.get_mut(&owner) else {
            return;
        };
        loop {
            let mut sent = false;
            for _ in 0..sink.num_flows() {
                let Some(key) = sink.rotate() else {
                    break;
                };
                let Some(flow) = self.flows.get_mut(&key) else {
                    continue;
                };
                if let Some(mut pkt) = flow.pop() {
                    pkt.flags = sink.received_flag(now);
                    if sink.try_send(pkt.encode(), now) {
                        sent = true;
                    } else {
                        flow.push_front(pkt);
                        return;
                    }
                }
            }
            if !sent {
                return;
            }
        }
    }

    // ---- TCP accept plane ----

    pub(crate) fn handle_accepted(&mut self, client: AcceptedClient) {
        let Some(peer_id) = self.passwords.take(client.password) else {
            warn!("accepted connection quoted an unknown password");
            return;
        };
        let Some(peer) = self.peers.get_mut(&peer_id) else {
            return;
        };
        peer.listen_password = None;
        let Some(link) = peer.link.as_mut() else {
            warn!(peer = peer_id, "accepted connection but no listening link");
            return;
        };
        if link.adopt_stream(client.stream) {
            info!(peer = peer_id, "peer connected over TCP");
        } else {
            warn!(peer = peer_id, "link refused adopted stream");
        }
    }

    // ---- housekeeping ----

    pub(crate) fn handle_tick(&mut self, now: Instant) -> Result<()> {
        let owners: Vec<PeerId> = self.sinks.keys().copied().collect();
        for owner in &owners {
            let signal = self.sinks.get_mut(owner).and_then(|s| s.tick(self.my_id, now));
            if signal == Some(LinkSignal::Down) {
                self.peer_dataproto_signal(*owner, false);
            }
        }

        let due: Vec<PeerId> = self
            .peers
            .values()
            .filter(|p| p.reset_deadline.is_some_and(|d| d <= now))
            .map(|p| p.id)
            .collect();
        for peer_id in due {
            if let Some(peer) = self.peers.get_mut(&peer_id) {
                peer.reset_deadline = None;
            }
            self.peer_reset_timer_expired(peer_id)?;
        }

        self.decider.tick(now);
        self.receive.tick(now);
        self.receive.drain();

        let idle: Vec<FlowKey> = self
            .flows
            .iter()
            .filter(|(k, f)| {
                matches!(k, FlowKey::Relay { .. })
                    && f.is_empty()
                    && now.duration_since(f.last_activity()) >= PEER_RELAY_FLOW_INACTIVITY_TIME
            })
            .map(|(k, _)| *k)
            .collect();
        for key in idle {
            if let FlowKey::Relay { dst, .. } = key {
                if let Some(sink) = self.sinks.get_mut(&dst) {
                    sink.remove_flow(key);
                }
            }
            self.flows.remove(&key);
        }

        self.signals.drain();
        for owner in owners {
            self.drain_sink(owner, now);
        }
        Ok(())
    }

    /// Shutdown: every peer is torn down exactly as if the server ended it.
    pub(crate) fn shutdown(&mut self) {
        let ids: Vec<PeerId> = self.peers.keys().copied().collect();
        for id in ids {
            self.peer_remove(id);
        }
    }
}

/// The running endpoint: opens the device and the server channel, spawns the
/// listeners and drives the coordinator loop until shutdown or a fatal
/// error.
pub struct Endpoint {
    cfg: Config,
}

impl Endpoint {
    pub fn new(cfg: Config) -> Endpoint {
        Endpoint { cfg }
    }

    /// Opens the tap device and runs. Linux only; other targets must supply
    /// a device via [`run_with_device`](Self::run_with_device).
    #[cfg(target_os = "linux")]
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let device = crate::device::open_tap(&self.cfg.tap_name, self.cfg.mtu as i32)?;
        info!(device = %self.cfg.tap_name, mtu = self.cfg.mtu, "tap device open");
        self.run_with_device(device, shutdown).await
    }

    /// Runs the endpoint over an already-open frame device.
    pub async fn run_with_device<D>(
        self,
        device: D,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()>
    where
        D: AsyncRead + AsyncWrite + Send + 'static,
    {
        let cfg = Arc::new(self.cfg);
        let token = CancellationToken::new();

        let (connector, acceptor) = match &cfg.tls {
            Some(paths) => {
                let connector = build_tls_connector(paths)?;
                let acceptor = cfg.peer_tls.then(|| build_tls_acceptor(paths)).transpose()?;
                (Some(connector), acceptor)
            }
            None => (None, None),
        };

        let (device_tx, mut device_rx) = mpsc::channel(64);
        let (tap_tx, tap_rx) = mpsc::channel(64);
        let frame_buf = cfg.mtu + ETHERNET_HEADER_LEN;
        let _device_tasks = spawn_device(device, frame_buf, device_tx, tap_rx, token.clone());

        let server_tls = connector.clone().map(|c| {
            let name = ServerName::try_from(cfg.server_name.clone())
                .unwrap_or_else(|_| ServerName::IpAddress(cfg.server_addr.ip().into()));
            (c, name)
        });
        let server = server::connect(cfg.server_addr, server_tls, token.clone()).await?;
        info!(server = %cfg.server_addr, "server channel connected");

        let (accept_tx, mut accept_rx) = mpsc::channel(16);
        if cfg.transport == TransportMode::Tcp {
            for bind in &cfg.bind_addrs {
                let listener = tokio::net::TcpListener::bind(bind.addr)
                    .await
                    .map_err(|e| {
                        EndpointError::Config(format!(
                            "cannot listen on {}: {e}",
                            bind.addr
                        ))
                    })?;
                info!(addr = %bind.addr, "peer listener bound");
                let _ = crate::listener::spawn(
                    listener,
                    acceptor.clone(),
                    accept_tx.clone(),
                    token.clone(),
                );
            }
        }

        let (link_tx, mut link_rx) = mpsc::channel(256);
        let mut core = Core::new(
            cfg.clone(),
            link_tx,
            tap_tx,
            server.out_tx.clone(),
            connector,
            Instant::now(),
        );
        let mut server_events = server.events;
        let mut tick = tokio::time::interval(TICK_INTERVAL);

        info!("entering event loop");
        let result = loop {
            tokio::select! {
                _ = shutdown.changed() => break Ok(()),
                _ = tick.tick() => {
                    if let Err(e) = core.handle_tick(Instant::now()) {
                        break Err(e);
                    }
                }
                event = server_events.recv() => match event {
                    Some(event) => {
                        if let Err(e) = core.handle_server_event(event, Instant::now()) {
                            break Err(e);
                        }
                    }
                    None => break Err(EndpointError::Server("server channel closed".into())),
                },
                Some(notice) = link_rx.recv() => {
                    if let Err(e) = core.handle_link_notice(notice, Instant::now()) {
                        break Err(e);
                    }
                }
                event = device_rx.recv() => match event {
                    Some(DeviceEvent::Frame(frame)) => {
                        core.handle_device_frame(frame, Instant::now())
                    }
                    Some(DeviceEvent::Error) | None => {
                        break Err(EndpointError::Device("device failed".into()))
                    }
                },
                Some(client) = accept_rx.recv() => core.handle_accepted(client),
            }
        };

        info!("tearing down");
        core.shutdown();
        token.cancel();
        result
    }
}
