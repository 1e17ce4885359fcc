//! Bidirectional relay between a local byte stream and a framed remote channel.
//!
//! Used on both ends of an agent tunnel: the local side is a Unix socket (a
//! client connecting to the forwarder, or the real agent), the remote side is
//! a message channel whose frames each carry one chunk of bytes.

use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use std::pin::pin;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Maximum bytes forwarded per frame.
pub const RELAY_BUFFER_SIZE: usize = 2048;

/// Upper bound on closing each side once the session is over.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Bytes moved in each direction during one session.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub local_to_remote: u64,
    pub remote_to_local: u64,
}

/// Relay until either direction ends, then close both sides.
///
/// Every non-empty local read becomes one frame on `remote_tx`; every frame
/// from `remote_rx` is written to `local` in full. A read error, an empty
/// read or frame, end of stream, or a write error ends that direction.
pub async fn relay<L, Tx, Rx, E>(local: L, remote_tx: Tx, remote_rx: Rx) -> RelayStats
where
    L: AsyncRead + AsyncWrite,
    Tx: Sink<Bytes>,
    Tx::Error: Display,
    Rx: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    let (mut local_rd, mut local_wr) = tokio::io::split(local);
    let mut remote_tx = pin!(remote_tx);
    let mut remote_rx = pin!(remote_rx);

    let mut stats = RelayStats::default();
    let sent = &mut stats.local_to_remote;
    let received = &mut stats.remote_to_local;

    let outbound = async {
        let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
        loop {
            let n = match local_rd.read(&mut buf).await {
                Ok(0) => {
                    debug!("Local side closed");
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    debug!("Local read failed: {}", e);
                    break;
                }
            };
            if let Err(e) = remote_tx.send(Bytes::copy_from_slice(&buf[..n])).await {
                debug!("Remote write failed: {}", e);
                break;
            }
            *sent += n as u64;
        }
    };

    let inbound = async {
        while let Some(frame) = remote_rx.next().await {
            let chunk = match frame {
                Ok(chunk) if chunk.is_empty() => break,
                Ok(chunk) => chunk,
                Err(e) => {
                    debug!("Remote read failed: {}", e);
                    break;
                }
            };
            if let Err(e) = local_wr.write_all(&chunk).await {
                debug!("Local write failed: {}", e);
                break;
            }
            *received += chunk.len() as u64;
        }
        debug!("Remote side closed");
    };

    tokio::select! {
        _ = outbound => {}
        _ = inbound => {}
    }

    let _ = tokio::time::timeout(CLOSE_TIMEOUT, remote_tx.close()).await;
    let _ = tokio::time::timeout(CLOSE_TIMEOUT, local_wr.shutdown()).await;

    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc;
    use std::convert::Infallible;
    use tokio::io::duplex;
    use tokio::time::timeout;

    /// Remote end backed by in-memory channels.
    fn remote() -> (
        mpsc::Sender<Bytes>,
        mpsc::Receiver<Bytes>,
        mpsc::Sender<Bytes>,
        impl Stream<Item = Result<Bytes, Infallible>>,
    ) {
        let (to_relay_tx, to_relay_rx) = mpsc::channel::<Bytes>(16);
        let (from_relay_tx, from_relay_rx) = mpsc::channel::<Bytes>(16);
        (to_relay_tx, from_relay_rx, from_relay_tx, to_relay_rx.map(Ok))
    }

    #[tokio::test]
    async fn test_bytes_flow_both_ways() {
        let (mut local, relay_end) = duplex(64 * 1024);
        let (mut remote_in, mut remote_out, sink, stream) = remote();

        let session = tokio::spawn(relay(relay_end, sink, stream));

        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        local.write_all(&payload).await.unwrap();

        let mut forwarded = Vec::new();
        while forwarded.len() < payload.len() {
            let frame = remote_out.next().await.unwrap();
            assert!(!frame.is_empty());
            assert!(frame.len() <= RELAY_BUFFER_SIZE);
            forwarded.extend_from_slice(&frame);
        }
        assert_eq!(forwarded, payload);

        remote_in.send(Bytes::from_static(b"reply")).await.unwrap();
        let mut reply = [0u8; 5];
        local.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"reply");

        drop(local);
        let stats = timeout(Duration::from_secs(5), session).await.unwrap().unwrap();
        assert_eq!(stats.local_to_remote, payload.len() as u64);
        assert_eq!(stats.remote_to_local, 5);
    }

    #[tokio::test]
    async fn test_remote_close_ends_session() {
        let (mut local, relay_end) = duplex(1024);
        let (remote_in, _remote_out, sink, stream) = remote();

        let session = tokio::spawn(relay(relay_end, sink, stream));
        drop(remote_in);

        timeout(Duration::from_secs(5), session).await.unwrap().unwrap();

        // Local side sees EOF once the relay has shut it down.
        let mut rest = Vec::new();
        timeout(Duration::from_secs(5), local.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_local_close_closes_remote() {
        let (local, relay_end) = duplex(1024);
        let (_remote_in, mut remote_out, sink, stream) = remote();

        let session = tokio::spawn(relay(relay_end, sink, stream));
        drop(local);

        timeout(Duration::from_secs(5), session).await.unwrap().unwrap();
        assert_eq!(remote_out.next().await, None);
    }

    #[tokio::test]
    async fn test_empty_frame_ends_session() {
        let (_local, relay_end) = duplex(1024);
        let (mut remote_in, _remote_out, sink, stream) = remote();

        let session = tokio::spawn(relay(relay_end, sink, stream));
        remote_in.send(Bytes::new()).await.unwrap();

        let stats = timeout(Duration::from_secs(5), session).await.unwrap().unwrap();
        assert_eq!(stats, RelayStats::default());
    }
}
