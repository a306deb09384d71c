//! Member actor: the kernel plus its mailbox
//!
//! A `Member` owns one kernel and the receiving half of its mailbox. `run`
//! is the event loop for production use; `pump` drains whatever is already
//! queued, which lets tests step the actor deterministically.

use crate::config::MemberConfig;
use crate::error::{Error, Result};
use crate::event::{Mailbox, MemberEvent};
use crate::kernel::MemberKernel;
use crate::registration::Registry;
use crate::stats::MemberStats;
use crate::watchdog::TimerService;
use databus_protocol::{MemberReply, RouterEvent};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Single-threaded member actor
pub struct Member {
    kernel: MemberKernel,
    inbox: mpsc::UnboundedReceiver<MemberEvent>,
}

/// Cloneable address of a running member
#[derive(Debug, Clone)]
pub struct MemberHandle {
    mailbox: Mailbox,
}

impl MemberHandle {
    /// Deliver a router event
    pub fn dispatch(&self, event: RouterEvent) -> Result<()> {
        self.mailbox
            .send(MemberEvent::Router(event))
            .map_err(|_| Error::ChannelClosed)
    }

    /// Ask the event loop to stop after the events already queued
    pub fn shutdown(&self) -> Result<()> {
        self.mailbox
            .send(MemberEvent::Shutdown)
            .map_err(|_| Error::ChannelClosed)
    }

    pub fn mailbox(&self) -> Mailbox {
        self.mailbox.clone()
    }
}

impl Member {
    /// Create a member and the channel its replies leave on
    pub fn new(
        config: MemberConfig,
        registry: Registry,
        timers: Arc<dyn TimerService>,
    ) -> (Self, MemberHandle, mpsc::UnboundedReceiver<MemberReply>) {
        Self::with_stats(config, registry, timers, Arc::new(MemberStats::new()))
    }

    /// Like `new`, recording into shared counters
    pub fn with_stats(
        config: MemberConfig,
        registry: Registry,
        timers: Arc<dyn TimerService>,
        stats: Arc<MemberStats>,
    ) -> (Self, MemberHandle, mpsc::UnboundedReceiver<MemberReply>) {
        let (mailbox, inbox) = mpsc::unbounded_channel();
        let (replies_tx, replies_rx) = mpsc::unbounded_channel();
        let kernel = MemberKernel::new(
            config,
            registry,
            mailbox.clone(),
            replies_tx,
            timers,
            stats,
        );

        (Self { kernel, inbox }, MemberHandle { mailbox }, replies_rx)
    }

    pub fn kernel(&self) -> &MemberKernel {
        &self.kernel
    }

    pub fn kernel_mut(&mut self) -> &mut MemberKernel {
        &mut self.kernel
    }

    /// Process every event already in the mailbox, returning how many ran
    ///
    /// Events posted while pumping (responder answers, fired timers) are
    /// processed in the same call.
    pub fn pump(&mut self) -> usize {
        let mut processed = 0;
        while let Ok(event) = self.inbox.try_recv() {
            processed += 1;
            self.process(event);
        }
        processed
    }

    /// Run the event loop until a shutdown event arrives
    pub async fn run(mut self) {
        tracing::info!("[{}] Member started", self.kernel.name());

        while let Some(event) = self.inbox.recv().await {
            if matches!(event, MemberEvent::Shutdown) {
                break;
            }
            self.process(event);
        }

        tracing::info!("[{}] Member stopped", self.kernel.name());
    }

    fn process(&mut self, event: MemberEvent) {
        if let Err(e) = self.kernel.handle(event) {
            tracing::warn!("[{}] {}", self.kernel.name(), e);
        }
    }
}
