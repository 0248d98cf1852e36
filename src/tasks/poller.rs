use anyhow::{Context, Result};
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::core::state::AppState;
use crate::progress::events::{event_kind_label, QueueEventKind};
use crate::services::queue::{QueueMessage, QueueService};

/// Consecutive fetch-failure counter. Once the threshold is reached the
/// poller stops issuing fetches until the process restarts: a visible hard
/// stop instead of hammering a misconfigured queue endpoint forever.
#[derive(Debug)]
pub(crate) struct FailureBreaker {
    failures: u32,
    threshold: u32,
}

impl FailureBreaker {
    pub(crate) fn new(threshold: u32) -> Self {
        Self { failures: 0, threshold }
    }

    pub(crate) fn record_success(&mut self) {
        self.failures = 0;
    }

    pub(crate) fn record_failure(&mut self) -> u32 {
        self.failures += 1;
        self.failures
    }

    pub(crate) fn is_open(&self) -> bool {
        self.failures >= self.threshold
    }

    pub(crate) fn failures(&self) -> u32 {
        self.failures
    }
}

/// Polls the queue on a fixed cadence until shutdown. Ticks never overlap;
/// a tick still running when the next is due skips it.
pub(crate) async fn run(state: AppState, queue: QueueService, mut shutdown: watch::Receiver<bool>) {
    let sqs = state.settings().sqs().clone();
    tracing::info!(queue_url = %queue.queue_url(), "Queue poller started");

    let mut tick = interval(Duration::from_secs(sqs.poll_interval_seconds));
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut breaker = FailureBreaker::new(sqs.max_consecutive_failures);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tick.tick() => {}
        }

        if breaker.is_open() {
            tracing::error!(
                failures = breaker.failures(),
                "SQS polling suspended after consecutive failures; restart to resume"
            );
            continue;
        }

        match queue.fetch_batch(sqs.max_messages, sqs.wait_time_seconds).await {
            Ok(messages) => {
                breaker.record_success();
                if !messages.is_empty() {
                    tracing::info!(count = messages.len(), "Fetched queue messages");
                }
                drain_batch(&state, &queue, messages).await;
            }
            Err(err) => {
                let failures = breaker.record_failure();
                tracing::error!(
                    error = %err,
                    failures,
                    threshold = sqs.max_consecutive_failures,
                    "Failed to poll SQS"
                );
            }
        }
    }

    tracing::info!("Queue poller stopped");
}

/// Messages are applied in delivery order and acked individually; a failed
/// message stays unacked for redelivery without blocking the rest of the
/// batch. Downstream dedup makes redelivery safe.
async fn drain_batch(state: &AppState, queue: &QueueService, messages: Vec<QueueMessage>) {
    for message in messages {
        match process_message(state, &message.body).await {
            Ok(()) => {
                metrics::counter!("queue_messages_total", "outcome" => "processed").increment(1);
                if let Err(err) = queue.ack(&message.receipt_handle).await {
                    tracing::error!(error = %err, "Failed to ack processed message");
                }
            }
            Err(err) => {
                metrics::counter!("queue_messages_total", "outcome" => "failed").increment(1);
                tracing::error!(
                    error = %err,
                    body = %message.body,
                    "Failed to process queue message"
                );
            }
        }
    }
}

pub(crate) async fn process_message(state: &AppState, body: &str) -> Result<()> {
    let raw: Value = serde_json::from_str(body).context("Queue message body is not valid JSON")?;
    let label = event_kind_label(&raw).to_string();

    match QueueEventKind::parse(&label) {
        QueueEventKind::StudentIdRecognition | QueueEventKind::QuestionRecognition => {
            handle_recognition(state, raw).await
        }
        QueueEventKind::AttendanceUpload => {
            tracing::info!(
                exam_code = raw.get("examCode").and_then(|v| v.as_str()).unwrap_or("-"),
                download_url = raw.get("downloadUrl").and_then(|v| v.as_str()).unwrap_or("-"),
                "Attendance file uploaded"
            );
            Ok(())
        }
        QueueEventKind::Error => {
            tracing::error!(
                message = raw.get("message").and_then(|v| v.as_str()).unwrap_or("-"),
                "Error event received from recognition worker"
            );
            if let Some(exam_code) = raw.get("examCode").and_then(Value::as_str) {
                state.broadcaster().send(exam_code, "error_occurred", raw.clone());
            }
            Ok(())
        }
        QueueEventKind::Unknown => {
            tracing::warn!(kind = %label, "Dropped queue message of unknown kind");
            Ok(())
        }
    }
}

async fn handle_recognition(state: &AppState, raw: Value) -> Result<()> {
    let Some(applied) = state.aggregator().apply(raw).await? else {
        return Ok(());
    };

    let exam_code = applied.snapshot.exam_code.clone();
    state
        .broadcaster()
        .update_progress(&exam_code, applied.snapshot.index, applied.snapshot.total)
        .await;
    state.broadcaster().send(&exam_code, "recognition_update", applied.payload);

    Ok(())
}
