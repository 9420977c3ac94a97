//! Command-line surface and validated configuration.
//!
//! There is no configuration file; the endpoint keeps no persistent state.
//! The cross-flag constraints (UDP implies encryption/hash selection, OTP
//! implies UDP, peer TLS implies TLS over TCP, ...) are enforced in
//! [`Config::from_cli`] so the rest of the code can rely on them.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::consts::{
    DEFAULT_IGMP_GROUP_MEMBERSHIP_INTERVAL, DEFAULT_IGMP_LAST_MEMBER_QUERY_TIME, MAX_BIND_ADDRS,
    MAX_EXT_ADDRS, MAX_SCOPES, PEER_DEFAULT_MAX_GROUPS, PEER_DEFAULT_MAX_MACS,
    PEER_DEFAULT_SEND_BUFFER_RELAY_SIZE, PEER_DEFAULT_SEND_BUFFER_SIZE,
};
use crate::crypto::otp::OtpParams;
use crate::crypto::{CipherMode, HashMode};
use crate::decider::DeciderConfig;
use crate::error::{EndpointError, Result};
use crate::proto::spp::SecurityParams;
use crate::tls::TlsPaths;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TransportMode {
    Udp,
    Tcp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EncryptionArg {
    None,
    Blowfish,
    Aes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum HashArg {
    None,
    Md5,
    Sha1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OtpCipherArg {
    Blowfish,
    Aes,
}

/// An external address offered to peers, tagged with its scope. The address
/// may be the `{server_reported}:PORT` placeholder, filled in when the
/// server reports our address at ready.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtAddr {
    pub spec: ExtAddrSpec,
    pub scope: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtAddrSpec {
    Fixed(SocketAddr),
    ServerReported { port: u16 },
}

/// One local bind address: `ADDR[,ports=N][,ext=ADDR@SCOPE]...`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindAddrSpec {
    pub addr: SocketAddr,
    pub num_ports: Option<u16>,
    pub ext_addrs: Vec<ExtAddr>,
}

impl FromStr for BindAddrSpec {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<BindAddrSpec, String> {
        let mut parts = s.split(',');
        let addr = parts
            .next()
            .ok_or("empty bind address")?
            .parse::<SocketAddr>()
            .map_err(|e| format!("bad bind address: {e}"))?;
        let mut spec = BindAddrSpec { addr, num_ports: None, ext_addrs: Vec::new() };
        for part in parts {
            if let Some(n) = part.strip_prefix("ports=") {
                let n: u16 = n.parse().map_err(|e| format!("bad ports count: {e}"))?;
                spec.num_ports = Some(n);
            } else if let Some(ext) = part.strip_prefix("ext=") {
                let (addr_part, scope) = ext
                    .rsplit_once('@')
                    .ok_or("external address needs @SCOPE")?;
                if scope.is_empty() {
                    return Err("empty scope name".into());
                }
                let spec_part = if let Some(port) = addr_part.strip_prefix("{server_reported}:")
                {
                    let port: u16 =
                        port.parse().map_err(|e| format!("bad server-reported port: {e}"))?;
                    ExtAddrSpec::ServerReported { port }
                } else {
                    ExtAddrSpec::Fixed(
                        addr_part
                            .parse()
                            .map_err(|e| format!("bad external address: {e}"))?,
                    )
                };
                spec.ext_addrs.push(ExtAddr { spec: spec_part, scope: scope.to_string() });
            } else {
                return Err(format!("unknown bind address option: {part}"));
            }
        }
        Ok(spec)
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Peer-to-peer VPN endpoint")]
pub struct Cli {
    /// Rendezvous server address
    #[arg(long)]
    pub server_addr: SocketAddr,

    /// Override the server name used for TLS verification (defaults to the
    /// server address)
    #[arg(long)]
    pub server_name: Option<String>,

    /// Tap device name; empty lets the kernel pick one
    #[arg(long, default_value = "")]
    pub tapdev: String,

    /// Tap device MTU
    #[arg(long, default_value_t = 1500)]
    pub mtu: usize,

    /// Transport used for peer links
    #[arg(long, value_enum)]
    pub transport_mode: TransportMode,

    /// Packet encryption cipher (UDP mode; required there)
    #[arg(long, value_enum)]
    pub encryption_mode: Option<EncryptionArg>,

    /// Packet hash (UDP mode; required there)
    #[arg(long, value_enum)]
    pub hash_mode: Option<HashArg>,

    /// One-time sequence cipher (UDP mode only)
    #[arg(long, value_enum)]
    pub otp_mode: Option<OtpCipherArg>,

    /// Packets per OTP seed
    #[arg(long, default_value_t = 4096)]
    pub otp_num: u16,

    /// Remaining packets at which seed rotation starts
    #[arg(long, default_value_t = 1024)]
    pub otp_num_warn: u16,

    /// How long a partially filled datagram may wait for more frames, in
    /// milliseconds (UDP mode only)
    #[arg(long)]
    pub fragmentation_latency: Option<u64>,

    /// Enable TLS toward the server (requires cert, key and CA paths)
    #[arg(long)]
    pub tls: bool,

    /// PEM certificate presented to the server and to peers
    #[arg(long)]
    pub tls_cert: Option<String>,

    /// PEM private key for the certificate
    #[arg(long)]
    pub tls_key: Option<String>,

    /// PEM CA bundle that signed the server and all peers
    #[arg(long)]
    pub tls_ca: Option<String>,

    /// Run TLS on peer stream links too (TCP mode, requires --tls)
    #[arg(long)]
    pub peer_tls: bool,

    /// SO_SNDBUF for peer TCP sockets; 0 keeps the OS default (TCP mode)
    #[arg(long)]
    pub peer_tcp_socket_sndbuf: Option<usize>,

    /// Address scope this endpoint can reach; repeatable
    #[arg(long = "scope")]
    pub scopes: Vec<String>,

    /// Local bind address spec `ADDR[,ports=N][,ext=ADDR@SCOPE]...`;
    /// repeatable
    #[arg(long = "bind-addr")]
    pub bind_addrs: Vec<BindAddrSpec>,

    /// Outbound flow buffer, in packets
    #[arg(long, default_value_t = PEER_DEFAULT_SEND_BUFFER_SIZE)]
    pub send_buffer_size: usize,

    /// Relay flow buffer, in packets
    #[arg(long, default_value_t = PEER_DEFAULT_SEND_BUFFER_RELAY_SIZE)]
    pub send_buffer_relay_size: usize,

    /// Learned MAC table bound
    #[arg(long, default_value_t = PEER_DEFAULT_MAX_MACS)]
    pub max_macs: usize,

    /// Total IGMP group membership bound
    #[arg(long, default_value_t = PEER_DEFAULT_MAX_GROUPS)]
    pub max_groups: usize,

    /// IGMP group membership interval, in milliseconds
    #[arg(long)]
    pub igmp_group_membership_interval: Option<u64>,

    /// IGMP last member query time, in milliseconds
    #[arg(long)]
    pub igmp_last_member_query_time: Option<u64>,
}

/// One resolved bind address.
#[derive(Debug, Clone)]
pub struct BindAddr {
    pub addr: SocketAddr,
    pub num_ports: u16,
    pub ext_addrs: Vec<ExtAddr>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub transport: TransportMode,
    pub security: SecurityParams,
    pub server_addr: SocketAddr,
    pub server_name: String,
    pub tap_name: String,
    pub mtu: usize,
    pub tls: Option<TlsPaths>,
    pub peer_tls: bool,
    pub peer_tcp_socket_sndbuf: Option<usize>,
    pub bind_addrs: Vec<BindAddr>,
    pub scopes: Vec<String>,
    pub send_buffer_size: usize,
    pub send_buffer_relay_size: usize,
    pub decider: DeciderConfig,
    pub fragmentation_latency: Duration,
}

impl Config {
    pub fn from_cli(cli: Cli) -> Result<Config> {
        let udp = cli.transport_mode == TransportMode::Udp;

        if udp != cli.encryption_mode.is_some() {
            return Err(config_err("UDP transport requires --encryption-mode, TCP forbids it"));
        }
        if udp != cli.hash_mode.is_some() {
            return Err(config_err("UDP transport requires --hash-mode, TCP forbids it"));
        }
        if cli.otp_mode.is_some() && !udp {
            return Err(config_err("--otp-mode requires UDP transport"));
        }
        if cli.fragmentation_latency.is_some() && !udp {
            return Err(config_err("--fragmentation-latency requires UDP transport"));
        }
        if cli.peer_tcp_socket_sndbuf.is_some() && udp {
            return Err(config_err("--peer-tcp-socket-sndbuf requires TCP transport"));
        }
        if cli.tls != (cli.tls_cert.is_some() && cli.tls_key.is_some() && cli.tls_ca.is_some()) {
            return Err(config_err("--tls requires --tls-cert, --tls-key and --tls-ca"));
        }
        if cli.peer_tls && !(cli.tls && !udp) {
            return Err(config_err("--peer-tls requires --tls and TCP transport"));
        }
        if cli.otp_mode.is_some() {
            if cli.otp_num == 0 {
                return Err(config_err("--otp-num must be positive"));
            }
            if cli.otp_num_warn == 0 || cli.otp_num_warn > cli.otp_num {
                return Err(config_err("--otp-num-warn must be in 1..=otp-num"));
            }
        }
        if cli.scopes.len() > MAX_SCOPES {
            return Err(config_err("too many scopes"));
        }
        if cli.bind_addrs.len() > MAX_BIND_ADDRS {
            return Err(config_err("too many bind addresses"));
        }

        let mut bind_addrs = Vec::with_capacity(cli.bind_addrs.len());
        for spec in &cli.bind_addrs {
            if spec.ext_addrs.len() > MAX_EXT_ADDRS {
                return Err(config_err("too many external addresses"));
            }
            let num_ports = match (udp, spec.num_ports) {
                (true, Some(n)) if n > 0 => n,
                (true, _) => {
                    return Err(config_err("UDP bind addresses need ports=N with N > 0"))
                }
                (false, None) => 1,
                (false, Some(_)) => {
                    return Err(config_err("ports=N is only valid with UDP transport"))
                }
            };
            bind_addrs.push(BindAddr {
                addr: spec.addr,
                num_ports,
                ext_addrs: spec.ext_addrs.clone(),
            });
        }

        let cipher = match cli.encryption_mode {
            Some(EncryptionArg::Aes) => Some(CipherMode::Aes),
            Some(EncryptionArg::Blowfish) => Some(CipherMode::Blowfish),
            Some(EncryptionArg::None) | None => None,
        };
        let hash = match cli.hash_mode {
            Some(HashArg::Md5) => Some(HashMode::Md5),
            Some(HashArg::Sha1) => Some(HashMode::Sha1),
            Some(HashArg::None) | None => None,
        };
        let otp = cli.otp_mode.map(|mode| OtpParams {
            cipher: match mode {
                OtpCipherArg::Aes => CipherMode::Aes,
                OtpCipherArg::Blowfish => CipherMode::Blowfish,
            },
            num: cli.otp_num,
            num_warn: cli.otp_num_warn,
        });

        let tls = cli.tls.then(|| TlsPaths {
            cert_path: cli.tls_cert.clone().expect("checked above"),
            key_path: cli.tls_key.clone().expect("checked above"),
            ca_path: cli.tls_ca.clone().expect("checked above"),
        });

        let server_name = cli
            .server_name
            .clone()
            .unwrap_or_else(|| cli.server_addr.ip().to_string());

        Ok(Config {
            transport: cli.transport_mode,
            security: SecurityParams { cipher, hash, otp },
            server_addr: cli.server_addr,
            server_name,
            tap_name: cli.tapdev,
            mtu: cli.mtu,
            tls,
            peer_tls: cli.peer_tls,
            peer_tcp_socket_sndbuf: cli.peer_tcp_socket_sndbuf,
            bind_addrs,
            scopes: cli.scopes,
            send_buffer_size: cli.send_buffer_size,
            send_buffer_relay_size: cli.send_buffer_relay_size,
            decider: DeciderConfig {
                max_macs: cli.max_macs,
                max_groups: cli.max_groups,
                igmp_group_membership_interval: cli
                    .igmp_group_membership_interval
                    .map(Duration::from_millis)
                    .unwrap_or(DEFAULT_IGMP_GROUP_MEMBERSHIP_INTERVAL),
                igmp_last_member_query_time: cli
                    .igmp_last_member_query_time
                    .map(Duration::from_millis)
                    .unwrap_or(DEFAULT_IGMP_LAST_MEMBER_QUERY_TIME),
            },
            fragmentation_latency: Duration::from_millis(
                cli.fragmentation_latency.unwrap_or(0),
            ),
        })
    }

    /// True when this endpoint knows the named scope, i.e. can connect to
    /// addresses in it.
    pub fn scope_known(&self, name: &str) -> bool {
        self.scopes.iter().any(|s| s == name)
    }
}

fn config_err(msg: &str) -> EndpointError {
    EndpointError::Config(msg.to_string())
}
