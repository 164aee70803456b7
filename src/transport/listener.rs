use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::codec::{Decoder, FramedRead};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{CodecError, JsonCodec, MsgpackCodec, TextCodec, WireCodec};
use crate::lifecycle::TaskError;
use crate::mailbox::Mailbox;
use crate::metric::Metric;

const ACCEPT_RETRY: Duration = Duration::from_millis(100);

/// Inbound socket for one wire codec.
///
/// Every accepted connection gets its own decode task feeding the mailbox.
/// At most `max_connections` are served at once; further peers wait in the
/// kernel backlog until a slot frees up.
pub struct Listener {
    codec: WireCodec,
    socket: TcpListener,
    permits: Arc<Semaphore>,
}

impl Listener {
    pub async fn bind(codec: WireCodec, addr: &str, max_connections: usize) -> io::Result<Self> {
        let socket = TcpListener::bind(addr).await?;
        Ok(Self {
            codec,
            socket,
            permits: Arc::new(Semaphore::new(max_connections.max(1))),
        })
    }

    pub fn codec(&self) -> WireCodec {
        self.codec
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Accept until cancelled. Connections already accepted keep running.
    pub async fn serve(self, mailbox: Mailbox, token: CancellationToken) -> Result<(), TaskError> {
        let codec = self.codec;
        if let Ok(addr) = self.local_addr() {
            info!(codec = %codec, addr = %addr, "listening");
        }

        loop {
            let permit = tokio::select! {
                _ = token.cancelled() => break,
                permit = Arc::clone(&self.permits).acquire_owned() => {
                    permit.map_err(|e| TaskError::new(format!("{} listener", codec), e))?
                }
            };

            let (stream, peer) = tokio::select! {
                _ = token.cancelled() => break,
                accepted = self.socket.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(codec = %codec, error = %e, "accept failed");
                        tokio::time::sleep(ACCEPT_RETRY).await;
                        continue;
                    }
                },
            };

            debug!(codec = %codec, peer = %peer, "connection accepted");
            let mailbox = mailbox.clone();
            tokio::spawn(async move {
                let _permit = permit;
                match receive(codec, stream, peer, &mailbox).await {
                    Ok(count) => debug!(codec = %codec, peer = %peer, count, "connection closed"),
                    Err(e) => warn!(codec = %codec, peer = %peer, error = %e, "connection dropped"),
                }
            });
        }

        info!(codec = %codec, "listener stopped");
        Ok(())
    }
}

async fn receive(codec: WireCodec, stream: TcpStream, peer: SocketAddr, mailbox: &Mailbox) -> Result<usize, CodecError> {
    let peer = peer.to_string();
    match codec {
        WireCodec::Text => pump(FramedRead::new(stream, TextCodec::new()), &peer, mailbox).await,
        WireCodec::Json => pump(FramedRead::new(stream, JsonCodec::default()), &peer, mailbox).await,
        WireCodec::Binary => {
            pump(FramedRead::new(stream, MsgpackCodec::<Metric>::new()), &peer, mailbox).await
        }
    }
}

/// Decode metrics one at a time into the mailbox until EOF or the first error
async fn pump<D>(mut frames: FramedRead<TcpStream, D>, peer: &str, mailbox: &Mailbox) -> Result<usize, CodecError>
where
    D: Decoder<Item = Metric, Error = CodecError>,
{
    let mut count = 0;
    while let Some(frame) = frames.next().await {
        let metric = frame?.with_default_source(peer);
        if mailbox.push(metric).await.is_err() {
            break;
        }
        count += 1;
    }
    Ok(count)
}
