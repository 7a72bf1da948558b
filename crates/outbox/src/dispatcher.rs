use std::time::{Duration, Instant};

use events::{EventPublisher, PublishReport};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{OutboxRecord, Result, store::OutboxStore};

/// Leases fetched batches to one worker so several dispatchers can share a table.
#[derive(Debug, Clone)]
pub struct ClaimSettings {
    pub worker_id: String,
    pub lease: Duration,
}

/// What to do when the publisher succeeds but some handlers fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandlerFailurePolicy {
    /// Mark the event processed anyway; failures are only logged.
    #[default]
    Acknowledge,
    /// Count a failed attempt so the event is delivered again.
    Retry,
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub max_attempts: u32,
    /// `None` reads with plain [`OutboxStore::fetch_pending`]; only safe with a
    /// single dispatcher.
    pub claim: Option<ClaimSettings>,
    pub handler_failures: HandlerFailurePolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            batch_size: 50,
            max_attempts: 10,
            claim: None,
            handler_failures: HandlerFailurePolicy::default(),
        }
    }
}

/// Counts for a single polling pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub fetched: usize,
    pub delivered: usize,
    pub failed: usize,
    /// Records whose failure in this tick used up their last attempt.
    pub dead_lettered: usize,
}

/// Polls the outbox and hands each pending event to the publisher.
///
/// Delivery is at-least-once: a crash between publish and
/// [`OutboxStore::mark_processed`] republishes the event on the next tick.
/// Records are processed one by one in fetch order, so a failure never
/// blocks the rest of the batch.
pub struct OutboxDispatcher<S, P> {
    store: S,
    publisher: P,
    config: DispatcherConfig,
}

impl<S, P> OutboxDispatcher<S, P>
where
    S: OutboxStore,
    P: EventPublisher,
{
    pub fn new(store: S, publisher: P, config: DispatcherConfig) -> Self {
        Self {
            store,
            publisher,
            config,
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Runs one polling pass.
    ///
    /// An error here means the batch could not be read at all; per-record
    /// failures are counted in the report instead.
    #[tracing::instrument(skip(self))]
    pub async fn tick(&self) -> Result<TickReport> {
        let started = Instant::now();
        let batch = match &self.config.claim {
            Some(claim) => {
                self.store
                    .claim_pending(
                        &claim.worker_id,
                        self.config.batch_size,
                        self.config.max_attempts,
                        claim.lease,
                    )
                    .await?
            }
            None => {
                self.store
                    .fetch_pending(self.config.batch_size, self.config.max_attempts)
                    .await?
            }
        };

        let mut report = TickReport {
            fetched: batch.len(),
            ..TickReport::default()
        };

        for record in batch {
            self.dispatch(record, &mut report).await;
        }

        metrics::histogram!("outbox_tick_duration_seconds").record(started.elapsed().as_secs_f64());
        if report.fetched > 0 {
            tracing::debug!(
                fetched = report.fetched,
                delivered = report.delivered,
                failed = report.failed,
                "Outbox tick finished"
            );
        }
        Ok(report)
    }

    async fn dispatch(&self, record: OutboxRecord, report: &mut TickReport) {
        let event = match record.to_event() {
            Ok(event) => event,
            Err(e) => {
                self.record_failure(&record, &format!("undecodable payload: {e}"), report)
                    .await;
                return;
            }
        };

        let reason = match self.publisher.publish(&event).await {
            Ok(published) if published.is_clean() => None,
            Ok(published) => {
                let summary = summarize_failures(&published);
                match self.config.handler_failures {
                    HandlerFailurePolicy::Acknowledge => {
                        tracing::warn!(
                            event_id = %record.id,
                            event_type = %record.event_type,
                            failures = %summary,
                            "Handlers failed; event acknowledged without retry"
                        );
                        None
                    }
                    HandlerFailurePolicy::Retry => Some(summary),
                }
            }
            Err(e) => Some(e.to_string()),
        };

        match reason {
            None => match self.store.mark_processed(record.id).await {
                Ok(()) => {
                    report.delivered += 1;
                    metrics::counter!(
                        "outbox_dispatch_succeeded_total",
                        "event_type" => record.event_type.clone()
                    )
                    .increment(1);
                }
                Err(e) => {
                    // Left unprocessed; the next tick publishes it again.
                    report.failed += 1;
                    tracing::warn!(
                        event_id = %record.id,
                        error = %e,
                        "Published event could not be marked processed"
                    );
                }
            },
            Some(reason) => self.record_failure(&record, &reason, report).await,
        }
    }

    async fn record_failure(&self, record: &OutboxRecord, reason: &str, report: &mut TickReport) {
        report.failed += 1;
        metrics::counter!(
            "outbox_dispatch_failed_total",
            "event_type" => record.event_type.clone()
        )
        .increment(1);

        match self.store.increment_attempt(record.id, Some(reason)).await {
            Ok(attempt) if attempt >= self.config.max_attempts => {
                report.dead_lettered += 1;
                metrics::counter!(
                    "outbox_dead_lettered_total",
                    "event_type" => record.event_type.clone()
                )
                .increment(1);
                tracing::warn!(
                    event_id = %record.id,
                    event_type = %record.event_type,
                    attempt,
                    error = reason,
                    "Outbox event exhausted its attempts and will not be retried"
                );
            }
            Ok(attempt) => {
                tracing::warn!(
                    event_id = %record.id,
                    event_type = %record.event_type,
                    attempt,
                    error = reason,
                    "Outbox dispatch failed, will retry"
                );
            }
            Err(e) => {
                tracing::warn!(
                    event_id = %record.id,
                    error = %e,
                    "Failed to record outbox attempt"
                );
            }
        }
    }

    /// Polls until `shutdown` is cancelled.
    ///
    /// A tick that cannot read the outbox is logged and the loop carries on.
    /// Cancellation is observed between ticks and during the sleep; a tick in
    /// progress finishes first.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            max_attempts = self.config.max_attempts,
            "Outbox dispatcher started"
        );

        while !shutdown.is_cancelled() {
            if let Err(e) = self.tick().await {
                tracing::warn!(error = %e, "Outbox tick aborted");
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        tracing::info!("Outbox dispatcher stopped");
    }
}

impl<S, P> OutboxDispatcher<S, P>
where
    S: OutboxStore + 'static,
    P: EventPublisher + 'static,
{
    /// Moves the dispatcher onto its own task.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }
}

fn summarize_failures(report: &PublishReport) -> String {
    report
        .failures
        .iter()
        .map(|f| {
            if f.panicked {
                format!("{} panicked: {}", f.handler, f.error)
            } else {
                format!("{}: {}", f.handler, f.error)
            }
        })
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DispatcherConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.max_attempts, 10);
        assert!(config.claim.is_none());
        assert_eq!(config.handler_failures, HandlerFailurePolicy::Acknowledge);
    }

    #[test]
    fn test_summarize_failures() {
        let report = PublishReport {
            event_id: crate::EventId::new(),
            event_type: "order.created".to_string(),
            handlers_invoked: 3,
            failures: vec![
                events::HandlerFailure {
                    handler: "mailer".to_string(),
                    error: "smtp down".to_string(),
                    panicked: false,
                },
                events::HandlerFailure {
                    handler: "ledger".to_string(),
                    error: "index out of bounds".to_string(),
                    panicked: true,
                },
            ],
        };

        assert_eq!(
            summarize_failures(&report),
            "mailer: smtp down; ledger panicked: index out of bounds"
        );
    }
}
