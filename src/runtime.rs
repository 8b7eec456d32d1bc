//! Event dispatch and background maintenance.
//!
//! One bounded worker pool pulls inbound events off a queue and runs them
//! through the engine; replies leave through the outbound pipeline. A sweep
//! task expires idle sessions and evicts stale suppressor/governor entries.
//! Everything is spawned into a `JoinSet` and observed — a worker that dies
//! is logged, and a shutdown signal drains the lot. No fire-and-forget.

use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;

use crate::channels::outbound::Outbound;
use crate::channels::{IncomingEvent, OutgoingReply};
use crate::config::FlowConfig;
use crate::db::Database;
use crate::flow::FlowEngine;

/// Capacity of the inbound event queue; inbound transports block (or shed)
/// beyond this, which is the correct backpressure toward the channel.
pub const EVENT_QUEUE_CAPACITY: usize = 1024;

pub fn event_queue() -> (mpsc::Sender<IncomingEvent>, mpsc::Receiver<IncomingEvent>) {
    mpsc::channel(EVENT_QUEUE_CAPACITY)
}

/// Owns the worker pool and sweeps for one service instance.
pub struct Runtime {
    engine: Arc<FlowEngine>,
    outbound: Arc<Outbound>,
    store: Arc<dyn Database>,
    flow: FlowConfig,
}

impl Runtime {
    pub fn new(
        engine: Arc<FlowEngine>,
        outbound: Arc<Outbound>,
        store: Arc<dyn Database>,
        flow: FlowConfig,
    ) -> Self {
        Self {
            engine,
            outbound,
            store,
            flow,
        }
    }

    /// Run until `shutdown` flips to true and the queue drains.
    pub async fn run(
        self: Arc<Self>,
        events: mpsc::Receiver<IncomingEvent>,
        shutdown: watch::Receiver<bool>,
    ) {
        let events = Arc::new(Mutex::new(events));
        let mut tasks = JoinSet::new();

        for worker_id in 0..self.flow.workers {
            let runtime = Arc::clone(&self);
            let events = Arc::clone(&events);
            let shutdown = shutdown.clone();
            tasks.spawn(async move {
                runtime.worker_loop(worker_id, events, shutdown).await;
            });
        }

        {
            let runtime = Arc::clone(&self);
            let shutdown = shutdown.clone();
            tasks.spawn(async move {
                runtime.sweep_loop(shutdown).await;
            });
        }

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "runtime task panicked");
            }
        }
        tracing::info!("runtime stopped");
    }

    async fn worker_loop(
        &self,
        worker_id: usize,
        events: Arc<Mutex<mpsc::Receiver<IncomingEvent>>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let event = {
                let mut rx = events.lock().await;
                tokio::select! {
                    _ = shutdown.wait_for(|stop| *stop) => break,
                    event = rx.recv() => event,
                }
            };
            let Some(event) = event else { break };

            tracing::debug!(worker_id, user_id = %event.user_id, "dispatching event");
            match self.engine.handle(&event).await {
                Ok(reply) => self.outbound.send_best_effort(reply).await,
                Err(e) => {
                    // Durable state failed closed; tell the user to retry
                    // instead of leaving them hanging.
                    tracing::error!(user_id = %event.user_id, error = %e, "event handling failed");
                    self.outbound
                        .send_best_effort(OutgoingReply::text(
                            event.conversation_id,
                            "Something went wrong on our side. Please resend that.",
                        ))
                        .await;
                }
            }
        }
        tracing::debug!(worker_id, "worker stopped");
    }

    async fn sweep_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.flow.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break,
                _ = ticker.tick() => {}
            }

            match self.store.expire_idle_sessions(self.flow.session_ttl).await {
                Ok(0) => {}
                Ok(evicted) => tracing::info!(evicted, "expired idle sessions"),
                Err(e) => tracing::warn!(error = %e, "session expiry sweep failed"),
            }

            let dropped = self.outbound.suppressor().evict_expired().await;
            if dropped > 0 {
                tracing::debug!(dropped, "evicted duplicate-suppressor entries");
            }
            let idle = self.outbound.governor().evict_idle_conversations().await;
            if idle > 0 {
                tracing::debug!(idle, "evicted idle conversation windows");
            }
        }
        tracing::debug!("sweep loop stopped");
    }
}
