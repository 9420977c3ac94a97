//! Per-peer session state machine: role resolution, binding and
//! connecting, signalling message handling, OTP seed rotation, reset and
//! relay fallback. The state lives in [`Peer`]; the transitions are
//! methods on the endpoint [`Core`], which owns every peer.

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::TransportMode;
use crate::consts::{
    CLIENT_FLAG_RELAY_SERVER, PEER_DEFAULT_TCP_SOCKET_SNDBUF, PEER_RETRY_TIME,
};
use crate::crypto::random_bytes;
use crate::endpoint::Core;
use crate::error::Result;
use crate::flows::FlowKey;
use crate::link::tcp::{ConnectTarget, PeerTlsClient};
use crate::link::{udp, LinkHandle};
use crate::proto::signal::{PeerMessage, ScopedAddr};
use crate::PeerId;

/// A generated OTP send seed awaiting CONFIRMSEED.
pub(crate) struct SentSeed {
    pub id: u16,
    pub key: Vec<u8>,
    pub iv: Vec<u8>,
}

/// Everything the endpoint tracks about one other client.
pub(crate) struct Peer {
    pub id: PeerId,
    pub flags: u16,
    pub common_name: Option<String>,
    /// Direct link, when up. Exactly one of link / relaying_through /
    /// waiting_relay / idle holds.
    pub link: Option<LinkHandle>,
    pub relaying_through: Option<PeerId>,
    pub waiting_relay: bool,
    /// Registered as a relay provider.
    pub is_relay: bool,
    pub relay_users: Vec<PeerId>,
    /// Next bind address index while the binding sequence runs (master).
    pub binding_pos: Option<usize>,
    /// Master-side retry backoff.
    pub reset_deadline: Option<Instant>,
    pub sendseed_next_id: u16,
    pub sendseed_sent: Option<SentSeed>,
    pub pending_recvseed_id: Option<u16>,
    /// Outstanding listener password while offering a TCP endpoint.
    pub listen_password: Option<u64>,
}

impl Peer {
    pub fn new(id: PeerId, flags: u16, common_name: Option<String>) -> Peer {
        Peer {
            id,
            flags,
            common_name,
            link: None,
            relaying_through: None,
            waiting_relay: false,
            is_relay: false,
            relay_users: Vec::new(),
            binding_pos: None,
            reset_deadline: None,
            sendseed_next_id: 0,
            sendseed_sent: None,
            pending_recvseed_id: None,
            listen_password: None,
        }
    }

    pub fn has_link(&self) -> bool {
        self.link.is_some()
    }

    /// The four link dispositions are mutually exclusive.
    pub fn check_disposition(&self) {
        let states = [
            self.link.is_some(),
            self.relaying_through.is_some(),
            self.waiting_relay,
        ];
        debug_assert!(states.iter().filter(|s| **s).count() <= 1);
        if self.is_relay {
            debug_assert!(self.link.is_some() && !self.waiting_relay);
        }
    }
}

impl Core {
    pub(crate) fn peer_am_master(&self, peer_id: PeerId) -> bool {
        self.my_id > peer_id
    }

    /// Entry point after a peer record is created: the master drives the
    /// setup, the slave waits for YOUCONNECT.
    pub(crate) fn peer_init(&mut self, peer_id: PeerId) -> Result<()> {
        if self.peer_am_master(peer_id) {
            self.peer_start_binding(peer_id)?;
        }
        Ok(())
    }

    pub(crate) fn peer_start_binding(&mut self, peer_id: PeerId) -> Result<()> {
        if let Some(peer) = self.peers.get_mut(&peer_id) {
            peer.binding_pos = Some(0);
        }
        self.peer_bind(peer_id)
    }

    /// Walks the configured bind addresses until one binds or the list is
    /// exhausted.
    pub(crate) fn peer_bind(&mut self, peer_id: PeerId) -> Result<()> {
        loop {
            let Some(peer) = self.peers.get_mut(&peer_id) else {
                return Ok(());
            };
            let Some(pos) = peer.binding_pos else {
                return Ok(());
            };
            if pos >= self.bind_addrs.len() {
                break;
            }
            peer.binding_pos = Some(pos + 1);
            // an address with no external addresses cannot be offered
            if self.bind_addrs[pos].usable_ext_addrs().is_empty() {
                continue;
            }
            if self.peer_bind_one_address(peer_id, pos)? {
                return Ok(());
            }
        }

        debug!(peer = peer_id, "no more addresses to bind to");
        if let Some(peer) = self.peers.get_mut(&peer_id) {
            peer.binding_pos = None;
        }
        self.send_signal(peer_id, &PeerMessage::CannotBind)?;
        if !self.peer_am_master(peer_id) {
            let is_relay = self.peers.get(&peer_id).map(|p| p.is_relay).unwrap_or(false);
            if !is_relay {
                self.peer_need_relay(peer_id);
            }
        }
        Ok(())
    }

    /// Attempts one bind address; true means the link is set up and the
    /// connect offer went out.
    fn peer_bind_one_address(&mut self, peer_id: PeerId, addr_index: usize) -> Result<bool> {
        match self.cfg.transport {
            TransportMode::Udp => {
                let bind = &self.bind_addrs[addr_index];
                let mut bound = None;
                for port_add in 0..bind.num_ports {
                    let mut try_addr = bind.addr;
                    try_addr.set_port(try_addr.port().wrapping_add(port_add));
                    match udp::try_bind(try_addr) {
                        Ok(socket) => {
                            bound = Some((socket, port_add));
                            break;
                        }
                        Err(e) => {
                            debug!(addr = %try_addr, error = %e, "bind attempt failed")
                        }
                    }
                }
                let Some((socket, port_add)) = bound else {
                    debug!(peer = peer_id, addr_index, "failed to bind to any port");
                    return Ok(false);
                };

                self.peer_new_link(peer_id);
                let gen = self.alloc_gen();
                let handle = match udp::spawn_bound(
                    socket,
                    self.udp_link_config(),
                    peer_id,
                    gen,
                    self.link_tx.clone(),
                ) {
                    Ok(handle) => handle,
                    Err(e) => {
                        warn!(peer = peer_id, error = %e, "cannot get link");
                        self.peer_reset(peer_id)?;
                        return Ok(true);
                    }
                };

                let key = if let Some(cipher) = self.cfg.security.cipher {
                    let key = random_bytes(cipher.key_len());
                    handle.set_encryption_key(key.clone());
                    Some(key)
                } else {
                    None
                };
                self.install_link(peer_id, handle);

                self.send_connect_offer(peer_id, addr_index, port_add, key, None)?;
                if self.cfg.security.otp.is_some() {
                    self.peer_generate_and_send_seed(peer_id)?;
                }
                info!(peer = peer_id, addr_index, "bound, offered direct endpoint");
                Ok(true)
            }
            TransportMode::Tcp => {
                self.peer_new_link(peer_id);
                let gen = self.alloc_gen();
                let handle =
                    crate::link::tcp::spawn_listen(self.data_mtu, peer_id, gen, self.link_tx.clone());
                self.install_link(peer_id, handle);

                let password = self.passwords.add_entry(peer_id);
                if let Some(peer) = self.peers.get_mut(&peer_id) {
                    peer.listen_password = Some(password);
                }
                self.send_connect_offer(peer_id, addr_index, 0, None, Some(password))?;
                info!(peer = peer_id, addr_index, "listening, offered direct endpoint");
                Ok(true)
            }
        }
    }

    /// Slave side of YOUCONNECT: pick the first address in a known scope and
    /// connect to it.
    fn peer_connect(
        &mut self,
        peer_id: PeerId,
        addr: std::net::SocketAddr,
        key: Option<Vec<u8>>,
        password: Option<u64>,
    ) -> Result<()> {
        self.peer_new_link(peer_id);
        let gen = self.alloc_gen();
        match self.cfg.transport {
            TransportMode::Udp => {
                let handle = match udp::spawn_connected(
                    addr,
                    self.udp_link_config(),
                    peer_id,
                    gen,
                    self.link_tx.clone(),
                ) {
                    Ok(handle) => handle,
                    Err(e) => {
                        warn!(peer = peer_id, error = %e, "cannot get link");
                        return self.peer_reset(peer_id);
                    }
                };
                if let Some(key) = key {
                    handle.set_encryption_key(key);
                }
                self.install_link(peer_id, handle);
                if self.cfg.security.otp.is_some() {
                    self.peer_generate_and_send_seed(peer_id)?;
                }
            }
            TransportMode::Tcp => {
                let tls = if self.cfg.peer_tls {
                    let Some(connector) = self.connector.clone() else {
                        warn!(peer = peer_id, "peer TLS enabled but no connector");
                        return self.peer_reset(peer_id);
                    };
                    let name = self.peer_tls_server_name(peer_id, addr);
                    Some(PeerTlsClient { connector, server_name: name })
                } else {
                    None
                };
                // explicit 0 keeps the OS default, absent means our default
                let sndbuf = match self.cfg.peer_tcp_socket_sndbuf {
                    Some(0) => None,
                    Some(n) => Some(n),
                    None => Some(PEER_DEFAULT_TCP_SOCKET_SNDBUF),
                };
                let target = ConnectTarget {
                    addr,
                    password: password.unwrap_or(0),
                    tls,
                    sndbuf,
                };
                let handle = crate::link::tcp::spawn_connect(
                    target,
                    self.data_mtu,
                    peer_id,
                    gen,
                    self.link_tx.clone(),
                );
                self.install_link(peer_id, handle);
            }
        }
        Ok(())
    }

    /// Tears down whatever disposition the peer currently has, making room
    /// for a fresh link.
    pub(crate) fn peer_new_link(&mut self, peer_id: PeerId) {
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
    }

    /// Transport error or YOURETRY: drop the link; the master backs off and
    /// rebinds, the slave asks the master to restart.
    pub(crate) fn peer_reset(&mut self, peer_id: PeerId) -> Result<()> {
        info!(peer = peer_id, "resetting");
        if let Some(peer) = self.peers.get(&peer_id) {
            if peer.has_link() {
                if peer.is_relay {
                    self.peer_disable_relay_provider(peer_id);
                }
                self.peer_free_link(peer_id);
            }
        }
        if self.peer_am_master(peer_id) {
            if let Some(peer) = self.peers.get_mut(&peer_id) {
                peer.reset_deadline = Some(Instant::now() + PEER_RETRY_TIME);
            }
            Ok(())
        } else {
            self.send_signal(peer_id, &PeerMessage::YouRetry)
        }
    }

    /// Master retry backoff expired: restart the binding sequence.
    pub(crate) fn peer_reset_timer_expired(&mut self, peer_id: PeerId) -> Result<()> {
        debug_assert!(self.peer_am_master(peer_id));
        info!(peer = peer_id, "retry timer expired");
        self.peer_start_binding(peer_id)
    }

    // ---- signalling message handlers ----

    pub(crate) fn peer_handle_message(&mut self, peer_id: PeerId, msg: PeerMessage) -> Result<()> {
        match msg {
            PeerMessage::YouConnect { addrs, key, password } => {
                self.peer_msg_youconnect(peer_id, addrs, key, password)
            }
            PeerMessage::CannotConnect => self.peer_msg_cannotconnect(peer_id),
            PeerMessage::CannotBind => self.peer_msg_cannotbind(peer_id),
            PeerMessage::YouRetry => self.peer_msg_youretry(peer_id),
            PeerMessage::Seed { seed_id, key, iv } => {
                self.peer_msg_seed(peer_id, seed_id, key, iv)
            }
            PeerMessage::ConfirmSeed { seed_id } => self.peer_msg_confirmseed(peer_id, seed_id),
        }
    }

    fn peer_msg_youconnect(
        &mut self,
        peer_id: PeerId,
        addrs: Vec<ScopedAddr>,
        key: Option<Vec<u8>>,
        password: Option<u64>,
    ) -> Result<()> {
        let Some(chosen) = addrs.iter().find(|a| self.cfg.scope_known(&a.scope)) else {
            debug!(peer = peer_id, "youconnect: no usable addresses");
            return self.send_signal(peer_id, &PeerMessage::CannotConnect);
        };

        match self.cfg.transport {
            TransportMode::Udp => {
                if let Some(cipher) = self.cfg.security.cipher {
                    match &key {
                        None => {
                            warn!(peer = peer_id, "youconnect: no key");
                            return Ok(());
                        }
                        Some(k) if k.len() != cipher.key_len() => {
                            warn!(peer = peer_id, "youconnect: wrong key size");
                            return Ok(());
                        }
                        Some(_) => {}
                    }
                }
            }
            TransportMode::Tcp => {
                if password.is_none() {
                    warn!(peer = peer_id, "youconnect: no password");
                    return Ok(());
                }
            }
        }

        info!(peer = peer_id, scope = %chosen.scope, "connecting");
        self.peer_connect(peer_id, chosen.addr, key, password)
    }

    fn peer_msg_cannotconnect(&mut self, peer_id: PeerId) -> Result<()> {
        let binding = self
            .peers
            .get(&peer_id)
            .map(|p| p.binding_pos.is_some())
            .unwrap_or(false);
        if !binding {
            warn!(peer = peer_id, "cannotconnect: not binding");
            return Ok(());
        }
        info!(peer = peer_id, "peer could not connect");
        // continue with the next bind address
        self.peer_bind(peer_id)
    }

    fn peer_msg_cannotbind(&mut self, peer_id: PeerId) -> Result<()> {
        info!(peer = peer_id, "peer cannot bind");
        if !self.peer_am_master(peer_id) {
            self.peer_start_binding(peer_id)
        } else {
            let is_relay = self.peers.get(&peer_id).map(|p| p.is_relay).unwrap_or(false);
            if !is_relay {
                self.peer_need_relay(peer_id);
            }
            Ok(())
        }
    }

    fn peer_msg_youretry(&mut self, peer_id: PeerId) -> Result<()> {
        if !self.peer_am_master(peer_id) {
            warn!(peer = peer_id, "youretry: we are not master");
            return Ok(());
        }
        info!(peer = peer_id, "requests reset");
        self.peer_reset(peer_id)
    }

    fn peer_msg_seed(
        &mut self,
        peer_id: PeerId,
        seed_id: u16,
        key: Vec<u8>,
        iv: Vec<u8>,
    ) -> Result<()> {
        let Some(otp) = self.cfg.security.otp else {
            warn!(peer = peer_id, "seed: OTPs disabled");
            return Ok(());
        };
        if key.len() != otp.cipher.key_len() {
            warn!(peer = peer_id, "seed: wrong key length");
            return Ok(());
        }
        if iv.len() != otp.cipher.block_len() {
            warn!(peer = peer_id, "seed: wrong IV length");
            return Ok(());
        }
        let Some(peer) = self.peers.get_mut(&peer_id) else {
            return Ok(());
        };
        let Some(link) = &peer.link else {
            warn!(peer = peer_id, "seed: have no link");
            return Ok(());
        };
        debug!(peer = peer_id, seed_id, "received OTP receive seed");
        link.add_otp_recv_seed(seed_id);
        peer.pending_recvseed_id = Some(seed_id);
        Ok(())
    }

    fn peer_msg_confirmseed(&mut self, peer_id: PeerId, seed_id: u16) -> Result<()> {
        if self.cfg.security.otp.is_none() {
            warn!(peer = peer_id, "confirmseed: OTPs disabled");
            return Ok(());
        }
        let Some(peer) = self.peers.get_mut(&peer_id) else {
            return Ok(());
        };
        if peer.link.is_none() {
            warn!(peer = peer_id, "confirmseed: have no link");
            return Ok(());
        }
        let Some(sent) = &peer.sendseed_sent else {
            warn!(peer = peer_id, "confirmseed: no seed has been sent");
            return Ok(());
        };
        if sent.id != seed_id {
            warn!(
                peer = peer_id,
                expected = sent.id,
                received = seed_id,
                "confirmseed: unexpected seed id"
            );
            return Ok(());
        }
        debug!(peer = peer_id, seed_id, "OTP send seed confirmed");
        peer.sendseed_sent = None;
        if let Some(link) = &peer.link {
            link.set_otp_send_seed(seed_id);
        }
        Ok(())
    }

    // ---- OTP rotation ----

    /// The link's send counter is approaching the limit; generate a fresh
    /// seed and offer it, unless one is already in flight.
    pub(crate) fn peer_otp_warning(&mut self, peer_id: PeerId) -> Result<()> {
        let already_sent = self
            .peers
            .get(&peer_id)
            .map(|p| p.sendseed_sent.is_some())
            .unwrap_or(true);
        if !already_sent {
            self.peer_generate_and_send_seed(peer_id)?;
        }
        Ok(())
    }

    /// The link accepted the first packet under a pending receive seed.
    pub(crate) fn peer_otp_recv_seed_ready(&mut self, peer_id: PeerId, seed_id: u16) -> Result<()> {
        if let Some(peer) = self.peers.get_mut(&peer_id) {
            if peer.pending_recvseed_id == Some(seed_id) {
                peer.pending_recvseed_id = None;
            }
        }
        self.send_signal(peer_id, &PeerMessage::ConfirmSeed { seed_id })
    }

    pub(crate) fn peer_generate_and_send_seed(&mut self, peer_id: PeerId) -> Result<()> {
        let Some(otp) = self.cfg.security.otp else {
            return Ok(());
        };
        let Some(peer) = self.peers.get_mut(&peer_id) else {
            return Ok(());
        };
        debug_assert!(peer.has_link());
        debug_assert!(peer.sendseed_sent.is_none());
        let seed = SentSeed {
            id: peer.sendseed_next_id,
            key: random_bytes(otp.cipher.key_len()),
            iv: random_bytes(otp.cipher.block_len()),
        };
        peer.sendseed_next_id = peer.sendseed_next_id.wrapping_add(1);
        let msg = PeerMessage::Seed {
            seed_id: seed.id,
            key: seed.key.clone(),
            iv: seed.iv.clone(),
        };
        debug!(peer = peer_id, seed_id = seed.id, "sending OTP send seed");
        peer.sendseed_sent = Some(seed);
        self.send_signal(peer_id, &msg)
    }

    // ---- link liveness ----

    /// DataProto liveness edge from the sink. A link that comes up on a
    /// relay-capable peer enables it as a relay provider.
    pub(crate) fn peer_dataproto_signal(&mut self, peer_id: PeerId, up: bool) {
        let Some(peer) = self.peers.get(&peer_id) else {
            return;
        };
        if !peer.has_link() {
            return;
        }
        if up {
            info!(peer = peer_id, "up");
            if peer.flags & CLIENT_FLAG_RELAY_SERVER != 0 && !peer.is_relay {
                self.peer_enable_relay_provider(peer_id);
            }
        } else {
            info!(peer = peer_id, "down");
            if peer.is_relay {
                self.peer_disable_relay_provider(peer_id);
            }
        }
    }

    // ---- relay substrate ----

    pub(crate) fn peer_enable_relay_provider(&mut self, peer_id: PeerId) {
        let Some(peer) = self.peers.get_mut(&peer_id) else {
            return;
        };
        debug_assert!(peer.has_link() && !peer.is_relay);
        peer.is_relay = true;
        peer.relay_users.clear();
        peer.check_disposition();
        self.relays.push(peer_id);
        self.assign_relays();
    }

    pub(crate) fn peer_disable_relay_provider(&mut self, peer_id: PeerId) {
        let users = match self.peers.get_mut(&peer_id) {
            Some(peer) if peer.is_relay => {
                peer.is_relay = false;
                std::mem::take(&mut peer.relay_users)
            }
            _ => return,
        };
        for user in users {
            self.peer_free_relaying(user);
            self.peer_register_need_relay(user);
        }
        self.relays.retain(|p| *p != peer_id);
        self.assign_relays();
    }

    pub(crate) fn peer_install_relaying(&mut self, peer_id: PeerId, relay_id: PeerId) {
        info!(peer = peer_id, relay = relay_id, "installing relaying");
        if let Some(peer) = self.peers.get_mut(&peer_id) {
            debug_assert!(
                !peer.has_link() && !peer.waiting_relay && peer.relaying_through.is_none()
            );
            peer.relaying_through = Some(relay_id);
        }
        if let Some(relay) = self.peers.get_mut(&relay_id) {
            debug_assert!(relay.is_relay);
            relay.relay_users.push(peer_id);
        }
        if let Some(flow) = self.flows.get_mut(&FlowKey::Local(peer_id)) {
            flow.attach(relay_id);
        }
        if let Some(sink) = self.sinks.get_mut(&relay_id) {
            sink.add_flow(FlowKey::Local(peer_id));
        }
        // anything buffered while unattached drains through the relay now
        self.drain_sink(relay_id, Instant::now());
    }

    pub(crate) fn peer_free_relaying(&mut self, peer_id: PeerId) {
        let Some(peer) = self.peers.get_mut(&peer_id) else {
            return;
        };
        let Some(relay_id) = peer.relaying_through.take() else {
            return;
        };
        info!(peer = peer_id, relay = relay_id, "uninstalling relaying");
        if let Some(flow) = self.flows.get_mut(&FlowKey::Local(peer_id)) {
            flow.detach();
        }
        if let Some(sink) = self.sinks.get_mut(&relay_id) {
            sink.remove_flow(FlowKey::Local(peer_id));
        }
        if let Some(relay) = self.peers.get_mut(&relay_id) {
            relay.relay_users.retain(|p| *p != peer_id);
        }
    }

    /// The peer cannot get a direct link; queue it for a relay.
    pub(crate) fn peer_need_relay(&mut self, peer_id: PeerId) {
        let Some(peer) = self.peers.get(&peer_id) else {
            return;
        };
        debug_assert!(!peer.is_relay);
        if peer.waiting_relay {
            return;
        }
        if peer.has_link() {
            self.peer_free_link(peer_id);
        } else if peer.relaying_through.is_some() {
            self.peer_free_relaying(peer_id);
        }
        self.peer_register_need_relay(peer_id);
        self.assign_relays();
    }

    pub(crate) fn peer_register_need_relay(&mut self, peer_id: PeerId) {
        if let Some(peer) = self.peers.get_mut(&peer_id) {
            debug_assert!(
                !peer.waiting_relay && !peer.has_link() && peer.relaying_through.is_none()
            );
            peer.waiting_relay = true;
            self.waiting_relay.push(peer_id);
        }
    }

    pub(crate) fn peer_unregister_need_relay(&mut self, peer_id: PeerId) {
        if let Some(peer) = self.peers.get_mut(&peer_id) {
            debug_assert!(peer.waiting_relay);
            peer.waiting_relay = false;
            self.waiting_relay.retain(|p| *p != peer_id);
        }
    }

    /// Pairs every waiting peer with a relay provider, as long as one
    /// exists.
    pub(crate) fn assign_relays(&mut self) {
        while let Some(&peer_id) = self.waiting_relay.first() {
            let Some(&relay_id) = self.relays.first() else {
                debug!("no relays");
                return;
            };
            self.peer_unregister_need_relay(peer_id);
            self.peer_install_relaying(peer_id, relay_id);
        }
    }
}
