//! Password listener for TCP transport mode.
//!
//! A master registers a random 64-bit password before offering an external
//! address. An incoming connection (after the optional TLS handshake) must
//! quote the password as its first 8 bytes, little-endian; the coordinator
//! matches it against the registry, consumes the entry and hands the stream
//! to the peer session that registered it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ahash::RandomState;
use rand::RngCore;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::link::BoxedStream;
use crate::PeerId;

/// Concurrent handshakes one listener will hold open.
const MAX_PENDING_CLIENTS: usize = 50;

/// How long an accepted connection may take to present its password.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// An accepted connection that quoted some password; the coordinator decides
/// whether the password is live.
pub struct AcceptedClient {
    pub password: u64,
    pub stream: BoxedStream,
}

/// Outstanding passwords, each bound to the peer session that registered it.
#[derive(Default)]
pub struct PasswordRegistry {
    entries: HashMap<u64, PeerId, RandomState>,
}

impl PasswordRegistry {
    pub fn new() -> PasswordRegistry {
        PasswordRegistry::default()
    }

    /// Allocates a fresh password for `peer`, retrying the astronomically
    /// rare collision.
    pub fn add_entry(&mut self, peer: PeerId) -> u64 {
        loop {
            let password = rand::rng().next_u64();
            if !self.entries.contains_key(&password) {
                self.entries.insert(password, peer);
                return password;
            }
        }
    }

    pub fn remove_entry(&mut self, password: u64) {
        self.entries.remove(&password);
    }

    /// Matches and consumes an entry.
    pub fn take(&mut self, password: u64) -> Option<PeerId> {
        self.entries.remove(&password)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Runs the accept loop. Each connection performs the optional TLS server
/// handshake, reads the 8-byte password and is forwarded to the
/// coordinator. Handshake failures drop the connection and nothing else.
pub fn spawn(
    listener: TcpListener,
    acceptor: Option<Arc<TlsAcceptor>>,
    accept_tx: mpsc::Sender<AcceptedClient>,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let pending = Arc::new(Semaphore::new(MAX_PENDING_CLIENTS));
        loop {
            let (stream, addr) = tokio::select! {
                _ = token.cancelled() => return,
                res = listener.accept() => match res {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "failed to accept peer connection");
                        continue;
                    }
                },
            };
            let Ok(permit) = pending.clone().try_acquire_owned() else {
                warn!(%addr, "too many pending peer handshakes, dropping");
                continue;
            };
            info!(%addr, "peer connection accepted");
            let acceptor = acceptor.clone();
            let accept_tx = accept_tx.clone();
            let conn_token = token.clone();
            tokio::spawn(async move {
                let _permit = permit;
                tokio::select! {
                    _ = conn_token.cancelled() => {}
                    res = timeout(HANDSHAKE_TIMEOUT, handshake(stream, acceptor)) => {
                        match res {
                            Ok(Ok(client)) => {
                                let _ = accept_tx.send(client).await;
                            }
                            Ok(Err(e)) => {
                                debug!(%addr, error = %e, "peer handshake failed");
                            }
                            Err(_) => {
                                debug!(%addr, "peer handshake timed out");
                            }
                        }
                    }
                }
            });
        }
    })
}

async fn handshake(
    stream: tokio::net::TcpStream,
    acceptor: Option<Arc<TlsAcceptor>>,
) -> std::io::Result<AcceptedClient> {
    let mut stream: BoxedStream = match acceptor {
        Some(acceptor) => Box::new(acceptor.accept(stream).await?),
        None => Box::new(stream),
    };
    let mut pw = [0u8; 8];
    stream.read_exact(&mut pw).await?;
    Ok(AcceptedClient { password: u64::from_le_bytes(pw), stream })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    #[test]
    fn test_registry_allocates_unique_and_consumes() {
        let mut reg = PasswordRegistry::new();
        let a = reg.add_entry(1);
        let b = reg.add_entry(2);
        assert_ne!(a, b);
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.take(a), Some(1));
        assert_eq!(reg.take(a), None, "entry is consumed");
        reg.remove_entry(b);
        assert!(reg.is_empty());
    }

    #[tokio::test]
    async fn test_listener_reads_password_and_forwards() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (accept_tx, mut accept_rx) = mpsc::channel(4);
        let token = CancellationToken::new();
        let handle = spawn(listener, None, accept_tx, token.clone());

        let mut sock = TcpStream::connect(addr).await.expect("connect");
        sock.write_all(&0xdead_beef_1234_5678u64.to_le_bytes())
            .await
            .expect("password");

        let client = accept_rx.recv().await.expect("accepted client");
        assert_eq!(client.password, 0xdead_beef_1234_5678);

        token.cancel();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn test_silent_connection_never_forwarded() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (accept_tx, mut accept_rx) = mpsc::channel(4);
        let token = CancellationToken::new();
        let _handle = spawn(listener, None, accept_tx, token.clone());

        // connect and close without sending a password
        let sock = TcpStream::connect(addr).await.expect("connect");
        drop(sock);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(accept_rx.try_recv().is_err());
        token.cancel();
    }
}
