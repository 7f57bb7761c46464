//! Queue consumer loop and dead-letter routing.
//!
//! Messages are pulled in small batches with long polling and processed
//! strictly one at a time. A message leaves the source queue only on a
//! terminal disposition: acknowledged after `Processed`, `Skipped` or
//! `NotFound`, or copied to the dead-letter queue with a reason attached
//! and then deleted. Transport errors never stop the loop.

use std::time::Duration;

use aws_sdk_sqs::types::{Message, MessageAttributeValue};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::QueueConfig;
use crate::error::{truncate_reason, Result, WorkerError};
use crate::message::{decode, MessageBody};
use crate::processor::{JobProcessor, Outcome};
use crate::status::StatusStore;
use crate::storage::ObjectStore;

/// Pause after a failed receive before polling again
const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_secs(2);

/// Message attribute carrying the dead-letter reason
const DEAD_LETTER_REASON_ATTRIBUTE: &str = "deadLetterReason";

/// What to do with a message after decoding and processing
#[derive(Debug, PartialEq, Eq)]
enum Disposition {
    Ack,
    DeadLetter(String),
}

fn disposition_for(result: Result<Outcome>) -> Disposition {
    match result {
        Ok(_) => Disposition::Ack,
        Err(e) => Disposition::DeadLetter(truncate_reason(&e.to_string())),
    }
}

/// Consumes job notifications and routes each to its disposition
pub struct QueueConsumer<S: ObjectStore, T: StatusStore> {
    sqs: aws_sdk_sqs::Client,
    config: QueueConfig,
    processor: JobProcessor<S, T>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<S: ObjectStore, T: StatusStore> QueueConsumer<S, T> {
    pub fn new(
        sqs: aws_sdk_sqs::Client,
        config: QueueConfig,
        processor: JobProcessor<S, T>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            sqs,
            config,
            processor,
            shutdown_rx,
        }
    }

    /// Run until the shutdown signal flips
    pub async fn run(&mut self) -> Result<()> {
        info!(queue = %self.config.queue_url, "Starting consumer loop");

        loop {
            tokio::select! {
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping consumer");
                        break;
                    }
                }

                result = self.sqs
                    .receive_message()
                    .queue_url(&self.config.queue_url)
                    .max_number_of_messages(self.config.max_messages)
                    .wait_time_seconds(self.config.wait_time_secs)
                    .send() => {
                    match result {
                        Ok(output) => {
                            if let Some(messages) = output.messages {
                                for message in messages {
                                    // Unprocessed messages stay invisible until
                                    // the visibility timeout redelivers them.
                                    if *self.shutdown_rx.borrow() {
                                        info!("Shutdown signal received mid-batch");
                                        break;
                                    }
                                    self.handle_message(message).await;
                                }
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to receive messages, backing off");
                            tokio::time::sleep(RECEIVE_ERROR_BACKOFF).await;
                        }
                    }
                }
            }
        }

        info!("Consumer stopped");
        Ok(())
    }

    /// Decode and process one message, then settle it with the queue
    async fn handle_message(&self, message: Message) {
        let receipt_handle = match message.receipt_handle() {
            Some(handle) => handle.to_string(),
            None => {
                error!("Message has no receipt handle, cannot settle it");
                return;
            }
        };
        let body = message.body().unwrap_or_default().to_string();

        match self.dispose(&body).await {
            Disposition::Ack => {
                if let Err(e) = self.ack(&receipt_handle).await {
                    error!(error = %e, "Failed to acknowledge message, it will redeliver");
                }
            }
            Disposition::DeadLetter(reason) => match self.dead_letter(&body, &reason).await {
                Ok(()) => {
                    if let Err(e) = self.ack(&receipt_handle).await {
                        error!(error = %e, "Failed to remove dead-lettered message from source queue");
                    }
                }
                // Leave the message in place: the visibility timeout
                // redelivers it and dead-lettering gets another try.
                Err(e) => error!(error = %e, "Failed to route message to dead-letter queue"),
            },
        }
    }

    /// Map one message body to its terminal disposition
    async fn dispose(&self, body: &str) -> Disposition {
        let request = match decode(MessageBody::Text(body.to_string())) {
            Ok(request) => request,
            Err(e) => {
                error!(error = %e, "Failed to decode message body");
                return disposition_for(Err(e));
            }
        };

        let result = self.processor.process(&request).await;
        match &result {
            Ok(Outcome::Processed { thumb_url, .. }) => {
                info!(thumb_url = %thumb_url, "Message processed");
            }
            Ok(Outcome::Skipped(reason)) => warn!(reason = %reason, "Message skipped"),
            Ok(Outcome::NotFound) => {}
            Err(e) => error!(error = %e, "Processing failed, dead-lettering message"),
        }

        disposition_for(result)
    }

    async fn ack(&self, receipt_handle: &str) -> Result<()> {
        self.sqs
            .delete_message()
            .queue_url(&self.config.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| WorkerError::Transport(format!("Failed to delete message: {e}")))?;
        Ok(())
    }

    /// Copy the message body to the dead-letter queue with the reason
    /// attached as a message attribute.
    async fn dead_letter(&self, body: &str, reason: &str) -> Result<()> {
        let reason_attribute = MessageAttributeValue::builder()
            .data_type("String")
            .string_value(reason)
            .build()
            .map_err(|e| {
                WorkerError::Transport(format!("Failed to build reason attribute: {e}"))
            })?;

        self.sqs
            .send_message()
            .queue_url(&self.config.dead_letter_url)
            .message_body(body)
            .message_attributes(DEAD_LETTER_REASON_ATTRIBUTE, reason_attribute)
            .send()
            .await
            .map_err(|e| {
                WorkerError::Transport(format!("Failed to send to dead-letter queue: {e}"))
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::SkipReason;

    #[test]
    fn test_successful_outcomes_are_acknowledged() {
        let outcomes = [
            Outcome::Processed {
                thumb_url: "https://cdn.test/thumbnails/cat.png.thumb.jpg".to_string(),
                thumb2x_url: None,
            },
            Outcome::Skipped(SkipReason::ForeignContainer),
            Outcome::NotFound,
        ];
        for outcome in outcomes {
            assert_eq!(disposition_for(Ok(outcome)), Disposition::Ack);
        }
    }

    #[test]
    fn test_errors_are_dead_lettered_with_reason() {
        let result = disposition_for(Err(WorkerError::Processing("decode blew up".to_string())));
        match result {
            Disposition::DeadLetter(reason) => assert!(reason.contains("decode blew up")),
            other => panic!("expected dead-letter, got {other:?}"),
        }
    }

    #[test]
    fn test_dead_letter_reason_is_truncated() {
        let long = "x".repeat(1000);
        match disposition_for(Err(WorkerError::Processing(long))) {
            Disposition::DeadLetter(reason) => {
                assert_eq!(reason.chars().count(), crate::error::MAX_REASON_LEN);
            }
            other => panic!("expected dead-letter, got {other:?}"),
        }
    }
}
