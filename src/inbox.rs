//! Router inbox — the TCP listener every remote peer connects to.
//!
//! Each accepted connection must open with the remote's raw 16-byte UUID
//! (the routing identity); after that every frame is one encoded ZRE
//! message. Decoded messages are forwarded to the node runtime tagged with
//! the sender's UUID. A frame that fails to decode is dropped silently; the
//! connection lives on. EOF or an IO error forwards a closed note so the
//! runtime can retire the peer.

use anyhow::{anyhow, Context, Result};
use log::{debug, trace, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::node::NetInput;
use crate::protocol::{read_frame, ZreMsg};

/// Accept peer connections until cancelled.
pub async fn run_inbox(
    listener: TcpListener,
    net_tx: mpsc::Sender<NetInput>,
    cancel: CancellationToken,
) {
    debug!("inbox listening on {:?}", listener.local_addr().ok());

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer_addr)) => {
                        trace!("inbox accepted connection from {}", peer_addr);
                        let tx = net_tx.clone();
                        let ct = cancel.child_token();
                        tokio::spawn(async move {
                            if let Err(e) = peer_session(stream, tx, ct).await {
                                debug!("inbox session from {} ended: {:#}", peer_addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        warn!("inbox accept error: {}", e);
                    }
                }
            }
        }
    }

    debug!("inbox stopped");
}

/// Read the identity envelope, then pump decoded messages to the runtime.
async fn peer_session(
    mut stream: TcpStream,
    net_tx: mpsc::Sender<NetInput>,
    cancel: CancellationToken,
) -> Result<()> {
    let identity = read_frame(&mut stream)
        .await
        .context("reading identity frame")?;
    let uuid = Uuid::from_slice(&identity)
        .map_err(|_| anyhow!("identity frame is {} bytes, want 16", identity.len()))?;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            frame = read_frame(&mut stream) => {
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(e) => {
                        // Connection closed or broken; tell the runtime.
                        let _ = net_tx.send(NetInput::Closed { uuid }).await;
                        return Err(anyhow::Error::from(e).context("reading peer frame"));
                    }
                };
                match ZreMsg::decode(&frame) {
                    Ok(msg) => {
                        tokio::select! {
                            _ = cancel.cancelled() => return Ok(()),
                            sent = net_tx.send(NetInput::Message { uuid, msg }) => {
                                if sent.is_err() {
                                    return Ok(());
                                }
                            }
                        }
                    }
                    Err(e) => {
                        trace!("dropping malformed frame from {}: {}", uuid, e);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::write_frame;
    use std::time::Duration;

    async fn recv_input(rx: &mut mpsc::Receiver<NetInput>) -> NetInput {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn session_demultiplexes_by_identity() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (net_tx, mut net_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        tokio::spawn(run_inbox(listener, net_tx, cancel.clone()));

        let remote = Uuid::new_v4();
        let mut stream = TcpStream::connect(addr).await.unwrap();
        write_frame(&mut stream, remote.as_bytes()).await.unwrap();
        write_frame(&mut stream, &ZreMsg::Ping { seq: 1 }.encode())
            .await
            .unwrap();
        // Garbage in the middle must be swallowed, not kill the session.
        write_frame(&mut stream, b"garbage").await.unwrap();
        write_frame(&mut stream, &ZreMsg::Ping { seq: 2 }.encode())
            .await
            .unwrap();

        match recv_input(&mut net_rx).await {
            NetInput::Message { uuid, msg } => {
                assert_eq!(uuid, remote);
                assert_eq!(msg, ZreMsg::Ping { seq: 1 });
            }
            other => panic!("unexpected input: {:?}", other),
        }
        match recv_input(&mut net_rx).await {
            NetInput::Message { uuid, msg } => {
                assert_eq!(uuid, remote);
                assert_eq!(msg, ZreMsg::Ping { seq: 2 });
            }
            other => panic!("unexpected input: {:?}", other),
        }

        // Dropping the connection yields a closed note for the same UUID.
        drop(stream);
        match recv_input(&mut net_rx).await {
            NetInput::Closed { uuid } => assert_eq!(uuid, remote),
            other => panic!("unexpected input: {:?}", other),
        }

        cancel.cancel();
    }

    #[tokio::test]
    async fn session_rejects_short_identity() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (net_tx, mut net_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        tokio::spawn(run_inbox(listener, net_tx, cancel.clone()));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        write_frame(&mut stream, b"short").await.unwrap();
        write_frame(&mut stream, &ZreMsg::Ping { seq: 1 }.encode())
            .await
            .unwrap();

        // Nothing may come through for a connection without a valid identity.
        let got = tokio::time::timeout(Duration::from_millis(300), net_rx.recv()).await;
        assert!(got.is_err(), "expected no input, got {:?}", got);

        cancel.cancel();
    }
}
