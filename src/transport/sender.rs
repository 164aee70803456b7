use std::time::Duration;

use futures::SinkExt;
use tokio::net::TcpStream;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{CodecError, MsgpackCodec};
use crate::lifecycle::TaskError;
use crate::mailbox::Mailbox;
use crate::metric::Metric;

type Outbound = FramedWrite<TcpStream, MsgpackCodec<Metric>>;

/// Drains the shared mailbox into one upstream target.
///
/// Senders compete for metrics; a metric whose write fails goes back into
/// the mailbox and may be delivered by any sender later.
pub struct Sender {
    target: String,
    mailbox: Mailbox,
    backoff: Duration,
}

impl Sender {
    pub fn new(target: impl Into<String>, mailbox: Mailbox, backoff: Duration) -> Self {
        Self {
            target: target.into(),
            mailbox,
            backoff,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Dial, drain, redial after a failure; forever until cancelled
    pub async fn run(self, token: CancellationToken) -> Result<(), TaskError> {
        loop {
            let dialed = tokio::select! {
                _ = token.cancelled() => return Ok(()),
                dialed = TcpStream::connect(&self.target) => dialed,
            };
            match dialed {
                Ok(stream) => {
                    info!(upstream = %self.target, "connected upstream");
                    let mut sink = FramedWrite::new(stream, MsgpackCodec::new());
                    if !self.drain(&mut sink, &token).await {
                        return Ok(());
                    }
                }
                Err(e) => warn!(upstream = %self.target, error = %e, "connect upstream failed"),
            }

            debug!(upstream = %self.target, backoff = ?self.backoff, "waiting before redial");
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.backoff) => {}
            }
        }
    }

    /// Returns false when cancelled, true when the connection broke
    async fn drain(&self, sink: &mut Outbound, token: &CancellationToken) -> bool {
        loop {
            let metric = tokio::select! {
                _ = token.cancelled() => return false,
                popped = self.mailbox.pop() => match popped {
                    Ok(metric) => metric,
                    Err(_) => return false,
                },
            };

            let sent = tokio::select! {
                _ = token.cancelled() => {
                    self.requeue_now(metric);
                    return false;
                }
                sent = sink.send(metric.clone()) => sent,
            };
            match sent {
                Ok(()) => {}
                Err(CodecError::Encode(e)) => {
                    warn!(metric = %metric.name, error = %e, "cannot encode metric, dropping");
                }
                Err(e) => {
                    warn!(upstream = %self.target, metric = %metric.name, error = %e, "send upstream failed");
                    return self.requeue(metric, token).await;
                }
            }
        }
    }

    /// Put a metric back, waiting for room unless cancelled
    async fn requeue(&self, metric: Metric, token: &CancellationToken) -> bool {
        let name = metric.name.clone();
        tokio::select! {
            _ = token.cancelled() => {
                warn!(metric = %name, "shutting down, unsent metric lost");
                false
            }
            pushed = self.mailbox.push(metric) => pushed.is_ok(),
        }
    }

    fn requeue_now(&self, metric: Metric) {
        let name = metric.name.clone();
        if let Err(e) = self.mailbox.try_push(metric) {
            warn!(metric = %name, error = %e, "shutting down, unsent metric lost");
        }
    }
}
