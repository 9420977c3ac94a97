//! Protocol constants and tunable defaults.

use std::time::Duration;

/// How often a link sends a keepalive when it has nothing else to say.
pub const PEER_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// How long a link may go without a received-data acknowledgement before it
/// is reported down.
pub const PEER_KEEPALIVE_RECEIVE_TIMER: Duration = Duration::from_secs(30);

/// Master-side backoff before restarting the binding sequence after a
/// failure.
pub const PEER_RETRY_TIME: Duration = Duration::from_secs(5);

/// Idle time after which a relay receive buffer for a source peer is evicted.
pub const PEER_RELAY_FLOW_INACTIVITY_TIME: Duration = Duration::from_secs(60);

/// Reassembly slots kept per UDP link.
pub const PEER_UDP_ASSEMBLER_NUM_FRAMES: usize = 8;

/// Default bound on a peer's outbound flow buffer, in packets.
pub const PEER_DEFAULT_SEND_BUFFER_SIZE: usize = 32;

/// Default bound on relay flow buffers, in packets.
pub const PEER_DEFAULT_SEND_BUFFER_RELAY_SIZE: usize = 32;

/// Default SO_SNDBUF for peer TCP sockets when the flag is not given.
pub const PEER_DEFAULT_TCP_SOCKET_SNDBUF: usize = 1024 * 1024;

pub const PEER_DEFAULT_MAX_MACS: usize = 4096;
pub const PEER_DEFAULT_MAX_GROUPS: usize = 256;

pub const DEFAULT_IGMP_GROUP_MEMBERSHIP_INTERVAL: Duration = Duration::from_secs(260);
pub const DEFAULT_IGMP_LAST_MEMBER_QUERY_TIME: Duration = Duration::from_secs(2);

/// Payload budget for one UDP datagram toward a peer, after IP/UDP headers.
pub const CLIENT_UDP_MTU: usize = 1472;

/// Largest signalling message accepted on the server channel.
pub const SC_MAX_MSGLEN: usize = 16384;

/// Per-peer signalling producer buffer, in messages.
pub const SERVER_BUFFER_MIN_PACKETS: usize = 32;

/// Keepalive interval on the server channel itself.
pub const SC_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

pub const MAX_PEERS: usize = 256;
pub const MAX_BIND_ADDRS: usize = 8;
pub const MAX_EXT_ADDRS: usize = 8;
pub const MAX_SCOPES: usize = 8;

/// Destination ids one DataProto header may carry.
pub const DATAPROTO_MAX_PEER_IDS: usize = 4;

/// Fixed DataProto header bytes plus the largest destination list.
pub const DATAPROTO_MAX_OVERHEAD: usize = 4 + 2 * DATAPROTO_MAX_PEER_IDS;

/// Coordinator housekeeping tick driving keepalive, liveness, retry and
/// IGMP deadlines.
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Peer capability flags carried by the server's new-client notification.
pub const CLIENT_FLAG_RELAY_SERVER: u16 = 1 << 0;
pub const CLIENT_FLAG_RELAY_CLIENT: u16 = 1 << 1;
