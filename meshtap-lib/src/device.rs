//! Layer-2 tap device contract. The core consumes any frame-granular
//! `AsyncRead + AsyncWrite` stream plus an MTU; on Linux the real device is
//! opened through tokio-tun. Tests substitute an in-memory duplex stream.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::{EndpointError, Result};

#[derive(Debug)]
pub enum DeviceEvent {
    /// One Ethernet frame read from the tap.
    Frame(Bytes),
    /// The device failed; the endpoint terminates.
    Error,
}

/// Opens the named tap device, or a kernel-named one when `name` is empty.
#[cfg(target_os = "linux")]
pub fn open_tap(name: &str, mtu: i32) -> Result<tokio_tun::Tun> {
    tokio_tun::Tun::builder()
        .name(name)
        .tap(true)
        .mtu(mtu)
        .up()
        .try_build()
        .map_err(|e| EndpointError::Device(format!("failed to open tap device: {e}")))
}

/// Spawns the device reader and writer tasks. Each read yields one frame;
/// each queued frame is written whole.
pub fn spawn_device<D>(
    device: D,
    mtu: usize,
    event_tx: mpsc::Sender<DeviceEvent>,
    mut write_rx: mpsc::Receiver<Bytes>,
    token: CancellationToken,
) -> Vec<JoinHandle<()>>
where
    D: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut read_half, mut write_half) = tokio::io::split(device);

    let read_token = token.clone();
    let reader = tokio::spawn(async move {
        let mut buf = vec![0u8; mtu.max(64)];
        loop {
            tokio::select! {
                _ = read_token.cancelled() => return,
                res = read_half.read(&mut buf) => match res {
                    Ok(0) => {
                        error!("device closed");
                        let _ = event_tx.send(DeviceEvent::Error).await;
                        return;
                    }
                    Ok(n) => {
                        let frame = Bytes::copy_from_slice(&buf[..n]);
                        if event_tx.send(DeviceEvent::Frame(frame)).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "device read failed");
                        let _ = event_tx.send(DeviceEvent::Error).await;
                        return;
                    }
                },
            }
        }
    });

    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                frame = write_rx.recv() => {
                    let Some(frame) = frame else { return };
                    if let Err(e) = write_half.write_all(&frame).await {
                        debug!(error = %e, "device write failed");
                        return;
                    }
                }
            }
        }
    });

    vec![reader, writer]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_flow_both_ways_over_duplex() {
        let (ours, theirs) = tokio::io::duplex(4096);
        let (event_tx, mut event_rx) = mpsc::channel(8);
        let (write_tx, write_rx) = mpsc::channel::<Bytes>(8);
        let token = CancellationToken::new();
        let tasks = spawn_device(ours, 1500, event_tx, write_rx, token.clone());

        let (mut far_read, mut far_write) = tokio::io::split(theirs);

        // host writes a frame into the tap
        far_write.write_all(b"inbound frame").await.expect("write");
        match event_rx.recv().await.expect("event") {
            DeviceEvent::Frame(f) => assert_eq!(f, Bytes::from_static(b"inbound frame")),
            DeviceEvent::Error => panic!("unexpected device error"),
        }

        // endpoint writes a frame toward the host
        write_tx.send(Bytes::from_static(b"outbound frame")).await.expect("send");
        let mut buf = [0u8; 14];
        far_read.read_exact(&mut buf).await.expect("read");
        assert_eq!(&buf, b"outbound frame");

        token.cancel();
        for t in tasks {
            let _ = t.await;
        }
    }

    #[tokio::test]
    async fn test_device_close_reports_error() {
        let (ours, theirs) = tokio::io::duplex(64);
        let (event_tx, mut event_rx) = mpsc::channel(8);
        let (_write_tx, write_rx) = mpsc::channel::<Bytes>(8);
        let token = CancellationToken::new();
        let _tasks = spawn_device(ours, 1500, event_tx, write_rx, token.clone());

        drop(theirs);
        match event_rx.recv().await.expect("event") {
            DeviceEvent::Error => {}
            DeviceEvent::Frame(_) => panic!("expected error"),
        }
        token.cancel();
    }
}
