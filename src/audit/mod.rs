// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Security Audit Emitter
//!
//! Every security decision can record a [`SecurityEvent`]. Recording must
//! never block or fail the decision it describes, so [`AuditEmitter::record`]
//! only pushes onto a bounded queue with `try_send`. A dedicated
//! [`AuditWorker`] task drains the queue:
//!
//! 1. persist the event to the [`EventSink`] under a deadline,
//! 2. for `High`/`Critical` severity, also notify the [`AlertChannel`]
//!    under a deadline.
//!
//! Both steps fail open: errors and timeouts are logged locally and counted
//! in [`AuditStats`], never propagated. A full queue drops the event, logs a
//! warning and increments `dropped`, so backpressure is visible rather than
//! silent.

mod event;
pub mod file_sink;

pub use event::{redact_secrets, EventKind, SecurityEvent, Severity};
pub use file_sink::JsonlFileSink;

use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::error::{sanitize_error_details, PortError};
use crate::ports::{AlertChannel, EventSink};

#[derive(Debug, Default)]
struct Counters {
    recorded: AtomicU64,
    dropped: AtomicU64,
    persisted: AtomicU64,
    persist_failures: AtomicU64,
    alerts_sent: AtomicU64,
    alert_failures: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> AuditStats {
        AuditStats {
            recorded: self.recorded.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            persisted: self.persisted.load(Ordering::Relaxed),
            persist_failures: self.persist_failures.load(Ordering::Relaxed),
            alerts_sent: self.alerts_sent.load(Ordering::Relaxed),
            alert_failures: self.alert_failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time audit counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AuditStats {
    /// Events accepted onto the queue.
    pub recorded: u64,
    /// Events rejected because the queue was full or closed.
    pub dropped: u64,
    pub persisted: u64,
    pub persist_failures: u64,
    pub alerts_sent: u64,
    pub alert_failures: u64,
}

/// Cloneable, non-blocking handle for recording security events.
#[derive(Debug, Clone)]
pub struct AuditEmitter {
    tx: mpsc::Sender<SecurityEvent>,
    counters: Arc<Counters>,
}

impl AuditEmitter {
    /// Create an emitter and the raw receiving end of its queue.
    ///
    /// Most callers want [`AuditEmitter::spawn`]; the raw receiver is for
    /// components tested without a runtime.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<SecurityEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                counters: Arc::new(Counters::default()),
            },
            rx,
        )
    }

    /// Create an emitter and spawn its worker on the current tokio runtime.
    pub fn spawn(
        capacity: usize,
        sink: Arc<dyn EventSink>,
        alerts: Arc<dyn AlertChannel>,
        deadline: Duration,
    ) -> (Self, AuditWorker) {
        let (emitter, rx) = Self::channel(capacity);
        let worker = AuditWorker::spawn(rx, Arc::clone(&emitter.counters), sink, alerts, deadline);
        (emitter, worker)
    }

    /// Queue `event` for persistence. Never blocks, never fails.
    pub fn record(&self, event: SecurityEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {
                self.counters.recorded.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(event)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    target: "audit",
                    event = "AUDIT_QUEUE_FULL",
                    kind = %event.kind(),
                    severity = %event.severity(),
                    "Audit queue full, event dropped: {}",
                    event.to_log_line()
                );
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    target: "audit",
                    event = "AUDIT_QUEUE_CLOSED",
                    "Audit worker stopped, event dropped: {}",
                    event.to_log_line()
                );
            }
        }
    }

    pub fn stats(&self) -> AuditStats {
        self.counters.snapshot()
    }
}

/// Background task that drains the audit queue.
///
/// The task exits once every [`AuditEmitter`] clone is dropped and the
/// queue is empty, or when [`AuditWorker::shutdown`] closes the queue.
#[derive(Debug)]
pub struct AuditWorker {
    handle: JoinHandle<()>,
    counters: Arc<Counters>,
    stop: oneshot::Sender<()>,
}

impl AuditWorker {
    fn spawn(
        mut rx: mpsc::Receiver<SecurityEvent>,
        counters: Arc<Counters>,
        sink: Arc<dyn EventSink>,
        alerts: Arc<dyn AlertChannel>,
        deadline: Duration,
    ) -> Self {
        let (stop, mut stop_rx) = oneshot::channel::<()>();
        let task_counters = Arc::clone(&counters);
        let handle = tokio::spawn(async move {
            // Set once the stop sender is gone without firing; the receiver
            // must not be polled again after it completes.
            let mut detached = false;
            loop {
                tokio::select! {
                    received = rx.recv() => match received {
                        Some(event) => {
                            deliver(&event, &task_counters, sink.as_ref(), alerts.as_ref(), deadline).await;
                        }
                        None => break,
                    },
                    stopped = &mut stop_rx, if !detached => {
                        if stopped.is_err() {
                            detached = true;
                            continue;
                        }
                        // Later record() calls see a closed queue; buffered events still drain.
                        rx.close();
                        while let Some(event) = rx.recv().await {
                            deliver(&event, &task_counters, sink.as_ref(), alerts.as_ref(), deadline).await;
                        }
                        break;
                    }
                }
            }
            tracing::debug!(target: "audit", "Audit worker drained and stopped");
        });
        Self {
            handle,
            counters,
            stop,
        }
    }

    /// Wait for every emitter to be dropped and the queue to drain, then
    /// return the final counters.
    pub async fn join(self) -> AuditStats {
        let Self {
            handle,
            counters,
            stop,
        } = self;
        Self::wait(handle).await;
        drop(stop);
        counters.snapshot()
    }

    /// Close the queue, deliver what is already buffered, and return the
    /// final counters. Emitters still alive afterwards drop their events.
    pub async fn shutdown(self) -> AuditStats {
        let Self {
            handle,
            counters,
            stop,
        } = self;
        // An already finished worker has dropped the receiver.
        let _ = stop.send(());
        Self::wait(handle).await;
        counters.snapshot()
    }

    async fn wait(handle: JoinHandle<()>) {
        if let Err(e) = handle.await {
            tracing::error!(target: "audit", event = "AUDIT_WORKER_PANIC", "Audit worker ended abnormally: {}", e);
        }
    }
}

async fn with_deadline<F>(deadline: Duration, call: F) -> Result<(), PortError>
where
    F: std::future::Future<Output = Result<(), PortError>>,
{
    match timeout(deadline, call).await {
        Ok(result) => result,
        Err(_) => Err(PortError::Timeout(deadline.as_millis() as u64)),
    }
}

async fn deliver(
    event: &SecurityEvent,
    counters: &Counters,
    sink: &dyn EventSink,
    alerts: &dyn AlertChannel,
    deadline: Duration,
) {
    tracing::info!(target: "audit", "{}", event.to_log_line());

    match with_deadline(deadline, sink.persist(event)).await {
        Ok(()) => {
            counters.persisted.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            counters.persist_failures.fetch_add(1, Ordering::Relaxed);
            tracing::error!(
                target: "audit",
                event = "AUDIT_PERSIST_FAILED",
                kind = %event.kind(),
                error = %sanitize_error_details(&e.to_string()),
                "Failed to persist security event"
            );
        }
    }

    if !event.severity().requires_alert() {
        return;
    }

    let title = format!("[{}] {}", event.severity(), event.kind());
    let message = event.to_log_line();
    let data = serde_json::to_value(event).unwrap_or(Value::Null);
    match with_deadline(deadline, alerts.notify(&title, &message, &data)).await {
        Ok(()) => {
            counters.alerts_sent.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            counters.alert_failures.fetch_add(1, Ordering::Relaxed);
            tracing::error!(
                target: "audit",
                event = "AUDIT_ALERT_FAILED",
                kind = %event.kind(),
                error = %sanitize_error_details(&e.to_string()),
                "Failed to dispatch security alert"
            );
        }
    }
}
