use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use crate::metric::Metric;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MailboxError {
    #[error("mailbox closed")]
    Closed,
    #[error("mailbox full")]
    Full,
    #[error("mailbox empty")]
    Empty,
}

/// Bounded FIFO of metrics shared by every producer and consumer.
///
/// Producers (plugin runs, inbound connections) block in [`Mailbox::push`]
/// while the mailbox is full. Consumers (outbound senders, the store) compete
/// in [`Mailbox::pop`]: each metric goes to exactly one of them, whichever is
/// ready first. There is no partitioning by consumer.
#[derive(Clone)]
pub struct Mailbox {
    tx: mpsc::Sender<Metric>,
    rx: Arc<Mutex<mpsc::Receiver<Metric>>>,
}

impl Mailbox {
    /// Create a mailbox; a capacity below 1 is raised to 1
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// Insert a metric, waiting while the mailbox is full
    pub async fn push(&self, metric: Metric) -> Result<(), MailboxError> {
        self.tx.send(metric).await.map_err(|_| MailboxError::Closed)
    }

    /// Insert without waiting
    pub fn try_push(&self, metric: Metric) -> Result<(), MailboxError> {
        self.tx.try_send(metric).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => MailboxError::Full,
            mpsc::error::TrySendError::Closed(_) => MailboxError::Closed,
        })
    }

    /// Remove the next metric, waiting while the mailbox is empty
    pub async fn pop(&self) -> Result<Metric, MailboxError> {
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or(MailboxError::Closed)
    }

    /// Remove without waiting
    pub fn try_pop(&self) -> Result<Metric, MailboxError> {
        let mut rx = self.rx.try_lock().map_err(|_| MailboxError::Empty)?;
        rx.try_recv().map_err(|e| match e {
            mpsc::error::TryRecvError::Empty => MailboxError::Empty,
            mpsc::error::TryRecvError::Disconnected => MailboxError::Closed,
        })
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    /// Number of queued metrics
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
