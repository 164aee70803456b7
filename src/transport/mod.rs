//! Moves metrics between agents.
//!
//! [`Upstream`] binds one [`Listener`] per wire codec and, unless the cluster
//! runs in `storeOnly` mode, one [`Sender`] per configured upstream server.
//! Both sides share the agent's mailbox, so a forwarding agent is a relay hop.

pub mod listener;
pub mod sender;

pub use listener::Listener;
pub use sender::Sender;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::info;

use crate::codec::WireCodec;
use crate::config::AgentConfig;
use crate::lifecycle::{Component, Lifecycle, TaskError};
use crate::mailbox::Mailbox;

pub struct Upstream {
    config: Arc<AgentConfig>,
    mailbox: Mailbox,
    lifecycle: Lifecycle,
    started: AtomicBool,
    bound: Mutex<Vec<(WireCodec, SocketAddr)>>,
    senders: Mutex<Vec<String>>,
}

impl Upstream {
    pub fn new(config: Arc<AgentConfig>, mailbox: Mailbox) -> Self {
        Self {
            config,
            mailbox,
            lifecycle: Lifecycle::new(),
            started: AtomicBool::new(false),
            bound: Mutex::new(Vec::new()),
            senders: Mutex::new(Vec::new()),
        }
    }

    /// Addresses the listeners actually bound
    pub fn local_addrs(&self) -> Vec<(WireCodec, SocketAddr)> {
        self.bound.lock().unwrap().clone()
    }

    pub fn local_addr(&self, codec: WireCodec) -> Option<SocketAddr> {
        self.local_addrs()
            .into_iter()
            .find(|(c, _)| *c == codec)
            .map(|(_, addr)| addr)
    }

    /// Targets with a running sender
    pub fn sender_targets(&self) -> Vec<String> {
        self.senders.lock().unwrap().clone()
    }
}

#[async_trait]
impl Component for Upstream {
    fn name(&self) -> &str {
        "upstream"
    }

    /// Bind every listener first; a bind failure is fatal and nothing is started
    async fn start(&self) -> Result<(), TaskError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let listener_config = &self.config.listener;
        let mut listeners = Vec::with_capacity(WireCodec::ALL.len());
        for codec in WireCodec::ALL {
            let addr = listener_config.addr(codec);
            let listener = Listener::bind(codec, &addr, listener_config.max_connections)
                .await
                .map_err(|e| TaskError::new(format!("{} listener", codec), format!("bind {}: {}", addr, e)))?;
            listeners.push(listener);
        }

        for listener in listeners {
            let codec = listener.codec();
            if let Ok(addr) = listener.local_addr() {
                self.bound.lock().unwrap().push((codec, addr));
            }
            self.lifecycle.spawn(
                format!("{} listener", codec),
                listener.serve(self.mailbox.clone(), self.lifecycle.token()),
            );
        }

        let mode = self.config.cluster.mode;
        if !mode.forwards() {
            info!(mode = ?mode, "outbound forwarding disabled");
            return Ok(());
        }
        for target in self.config.upstream.server_list() {
            let sender = Sender::new(target.clone(), self.mailbox.clone(), self.config.upstream.backoff());
            self.lifecycle
                .spawn(format!("sender {}", target), sender.run(self.lifecycle.token()));
            self.senders.lock().unwrap().push(target);
        }
        info!(targets = self.senders.lock().unwrap().len(), "outbound senders started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), TaskError> {
        self.lifecycle.stop().await
    }
}
