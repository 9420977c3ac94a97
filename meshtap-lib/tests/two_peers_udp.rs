//! Two endpoints against a minimal rendezvous server: direct UDP link
//! negotiation and tap-to-tap frame delivery in both directions.

use std::collections::HashMap;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use meshtap_lib::config::{BindAddr, Config, ExtAddr, ExtAddrSpec, TransportMode};
use meshtap_lib::crypto::CipherMode;
use meshtap_lib::decider::DeciderConfig;
use meshtap_lib::proto::spp::SecurityParams;
use meshtap_lib::Endpoint;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

const SC_CLIENTHELLO: u16 = 1;
const SC_SERVERHELLO: u16 = 2;
const SC_NEWCLIENT: u16 = 3;
const SC_OUTMSG: u16 = 5;
const SC_INMSG: u16 = 6;

async fn read_frame(stream: &mut (impl AsyncReadExt + Unpin)) -> std::io::Result<Bytes> {
    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let mut buf = vec![0u8; u16::from_le_bytes(len_buf) as usize];
    stream.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}

async fn write_frame(
    stream: &mut (impl AsyncWriteExt + Unpin),
    body: &[u8],
) -> std::io::Result<()> {
    stream.write_all(&(body.len() as u16).to_le_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await
}

/// Minimal rendezvous server: assigns ids in accept order, announces every
/// pair of clients to each other and forwards outmsg as inmsg.
async fn run_server(listener: TcpListener, num_clients: u16) {
    let (broker_tx, mut broker_rx) = mpsc::channel::<(u16, Bytes)>(64);
    let mut writers: HashMap<u16, mpsc::Sender<Bytes>> = HashMap::new();

    for id in 1..=num_clients {
        let (stream, _) = listener.accept().await.expect("accept client");
        let (mut read, mut write) = stream.into_split();
        let (writer_tx, mut writer_rx) = mpsc::channel::<Bytes>(64);
        writers.insert(id, writer_tx);
        tokio::spawn(async move {
            while let Some(body) = writer_rx.recv().await {
                if write_frame(&mut write, &body).await.is_err() {
                    return;
                }
            }
        });
        let broker_tx = broker_tx.clone();
        tokio::spawn(async move {
            loop {
                match read_frame(&mut read).await {
                    Ok(frame) => {
                        if broker_tx.send((id, frame)).await.is_err() {
                            return;
                        }
                    }
                    Err(_) => return,
                }
            }
        });
    }

    let mut hellod: Vec<u16> = Vec::new();
    while let Some((from, mut frame)) = broker_rx.recv().await {
        if frame.remaining() < 2 {
            continue;
        }
        match frame.get_u16_le() {
            SC_CLIENTHELLO => {
                let mut hello = BytesMut::new();
                hello.put_u16_le(SC_SERVERHELLO);
                hello.put_u16_le(from);
                hello.put_slice(&[127, 0, 0, 1]);
                let _ = writers[&from].send(hello.freeze()).await;
                for other in hellod.iter().copied().collect::<Vec<_>>() {
                    for (a, b) in [(from, other), (other, from)] {
                        let mut nc = BytesMut::new();
                        nc.put_u16_le(SC_NEWCLIENT);
                        nc.put_u16_le(b);
                        nc.put_u16_le(0); // flags
                        let _ = writers[&a].send(nc.freeze()).await;
                    }
                }
                hellod.push(from);
            }
            SC_OUTMSG => {
                if frame.remaining() < 2 {
                    continue;
                }
                let dest = frame.get_u16_le();
                let mut inmsg = BytesMut::new();
                inmsg.put_u16_le(SC_INMSG);
                inmsg.put_u16_le(from);
                inmsg.put_slice(&frame);
                if let Some(w) = writers.get(&dest) {
                    let _ = w.send(inmsg.freeze()).await;
                }
            }
            _ => {}
        }
    }
}

fn endpoint_config(server_addr: std::net::SocketAddr, data_port: u16) -> Config {
    Config {
        transport: TransportMode::Udp,
        security: SecurityParams {
            cipher: Some(CipherMode::Aes),
            hash: None,
            otp: None,
        },
        server_addr,
        server_name: "test-server".into(),
        tap_name: String::new(),
        mtu: 1500,
        tls: None,
        peer_tls: false,
        peer_tcp_socket_sndbuf: None,
        bind_addrs: vec![BindAddr {
            addr: format!("127.0.0.1:{data_port}").parse().unwrap(),
            num_ports: 1,
            ext_addrs: vec![ExtAddr {
                spec: ExtAddrSpec::Fixed(format!("127.0.0.1:{data_port}").parse().unwrap()),
                scope: "local".into(),
            }],
        }],
        scopes: vec!["local".into()],
        send_buffer_size: 32,
        send_buffer_relay_size: 32,
        decider: DeciderConfig {
            max_macs: 64,
            max_groups: 16,
            igmp_group_membership_interval: Duration::from_secs(260),
            igmp_last_member_query_time: Duration::from_secs(2),
        },
        fragmentation_latency: Duration::ZERO,
    }
}

fn eth_frame(dst_last: u8, src_last: u8, marker: &[u8]) -> Vec<u8> {
    let mut frame = Vec::new();
    frame.extend_from_slice(&[0xaa, 0, 0, 0, 0, dst_last]);
    frame.extend_from_slice(&[0xaa, 0, 0, 0, 0, src_last]);
    frame.extend_from_slice(&[0x08, 0x00]);
    frame.extend_from_slice(marker);
    frame.resize(60, 0);
    frame
}

/// Repeatedly injects `frame` into `tap_far` until `marker` shows up on the
/// other endpoint's tap.
async fn pump_until_seen(
    tap_far: &mut tokio::io::DuplexStream,
    other_far: &mut tokio::io::DuplexStream,
    frame: &[u8],
    marker: &[u8],
) -> bool {
    let mut seen = Vec::new();
    for _ in 0..50 {
        if tap_far.write_all(frame).await.is_err() {
            return false;
        }
        let mut buf = [0u8; 4096];
        match timeout(Duration::from_millis(200), other_far.read(&mut buf)).await {
            Ok(Ok(n)) if n > 0 => {
                seen.extend_from_slice(&buf[..n]);
                if seen.windows(marker.len()).any(|w| w == marker) {
                    return true;
                }
            }
            _ => {}
        }
    }
    false
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_peers_exchange_frames_over_udp() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind server");
    let server_addr = listener.local_addr().expect("addr");
    tokio::spawn(run_server(listener, 2));

    // a free port for the master's data socket, released before use
    let probe = std::net::UdpSocket::bind("127.0.0.1:0").expect("probe");
    let data_port = probe.local_addr().expect("addr").port();
    drop(probe);

    let (tap_a, mut tap_a_far) = tokio::io::duplex(1 << 16);
    let (tap_b, mut tap_b_far) = tokio::io::duplex(1 << 16);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // endpoint A connects first and gets id 1; B gets id 2 and is master
    let a = Endpoint::new(endpoint_config(server_addr, data_port));
    let a_task = tokio::spawn(a.run_with_device(tap_a, shutdown_rx.clone()));
    tokio::time::sleep(Duration::from_millis(100)).await;
    let b = Endpoint::new(endpoint_config(server_addr, data_port));
    let b_task = tokio::spawn(b.run_with_device(tap_b, shutdown_rx.clone()));

    // give the link negotiation a moment
    tokio::time::sleep(Duration::from_millis(300)).await;

    // A's host sends toward B's MAC: unknown unicast floods and arrives
    let a_to_b = eth_frame(2, 1, b"frame-from-a");
    assert!(
        pump_until_seen(&mut tap_a_far, &mut tap_b_far, &a_to_b, b"frame-from-a").await,
        "frame from A never reached B's tap"
    );

    // B replies; A's source MAC was learned from the flooded traffic
    let b_to_a = eth_frame(1, 2, b"frame-from-b");
    assert!(
        pump_until_seen(&mut tap_b_far, &mut tap_a_far, &b_to_a, b"frame-from-b").await,
        "frame from B never reached A's tap"
    );

    let _ = shutdown_tx.send(true);
    let _ = timeout(Duration::from_secs(5), a_task).await;
    let _ = timeout(Duration::from_secs(5), b_task).await;
}
