use crate::batch_runner::{BatchResponse, BatchRunner};
use crate::config::KafkaConfig;
use crate::event::EventBatch;
use crate::record::PipelineKind;
use anyhow::{Context, Result};
use futures::StreamExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Topic name → pipeline kind, one topic per pipeline
pub fn topic_routes(config: &KafkaConfig) -> HashMap<String, PipelineKind> {
    HashMap::from([
        (config.audio_topic.clone(), PipelineKind::Audio),
        (config.image_topic.clone(), PipelineKind::Image),
        (config.finalize_topic.clone(), PipelineKind::Finalize),
    ])
}

/// Decode one message payload into a storage-event batch
pub fn decode_batch(payload: Option<&[u8]>) -> Result<EventBatch> {
    let payload = payload.context("Message has no payload")?;
    serde_json::from_slice(payload).context("Failed to deserialize storage event batch")
}

/// Kafka consumer feeding storage-event batches to the batch runner.
///
/// Each message carries one batch. Offsets are committed once the batch has
/// been processed, whatever its record outcomes; failures are reported
/// through logs and metrics, not by redelivery.
pub struct BatchKafkaConsumer {
    consumer: StreamConsumer,
    runner: Arc<BatchRunner>,
    routes: HashMap<String, PipelineKind>,
}

impl BatchKafkaConsumer {
    /// Create a new Kafka consumer subscribed to every pipeline topic
    pub async fn new(config: &KafkaConfig, runner: Arc<BatchRunner>) -> Result<Self> {
        let mut client_config = ClientConfig::new();

        client_config
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("group.id", &config.consumer_group)
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("enable.auto.commit", "false")
            .set("session.timeout.ms", config.session_timeout_ms.to_string())
            .set("max.poll.interval.ms", config.max_poll_interval_ms.to_string());

        // Configure SSL if enabled
        if config.ssl_enabled {
            client_config.set("security.protocol", "SASL_SSL");
            if let Some(ref ca_location) = config.ssl_ca_location {
                client_config.set("ssl.ca.location", ca_location);
            }
        }

        // Configure SASL if credentials provided
        if let (Some(ref username), Some(ref password)) =
            (&config.sasl_username, &config.sasl_password)
        {
            client_config
                .set("sasl.mechanisms", "PLAIN")
                .set("sasl.username", username)
                .set("sasl.password", password);
        }

        let consumer: StreamConsumer = client_config
            .create()
            .context("Failed to create Kafka consumer")?;

        let routes = topic_routes(config);
        let topics: Vec<&str> = routes.keys().map(String::as_str).collect();
        consumer
            .subscribe(&topics)
            .context("Failed to subscribe to storage event topics")?;

        info!(
            topics = ?topics,
            group = %config.consumer_group,
            "Subscribed to Kafka topics"
        );

        Ok(Self {
            consumer,
            runner,
            routes,
        })
    }

    /// Consume until `shutdown` is cancelled
    #[instrument(skip_all)]
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!("Starting storage event consumer");

        let mut message_stream = self.consumer.stream();

        loop {
            let message_result = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Consumer shutdown requested");
                    break;
                }
                next = message_stream.next() => match next {
                    Some(result) => result,
                    None => break,
                },
            };

            match message_result {
                Ok(message) => {
                    match self.process_message(&message).await {
                        Ok(response) => {
                            debug!(
                                succeeded = response.succeeded(),
                                failed = response.failed(),
                                "Batch message handled"
                            );
                            metrics::counter!("postprod.messages.processed").increment(1);
                        }
                        Err(e) => {
                            error!(
                                error = %e,
                                topic = message.topic(),
                                partition = message.partition(),
                                offset = message.offset(),
                                "Discarding unprocessable message"
                            );
                            metrics::counter!("postprod.messages.failed").increment(1);
                        }
                    }

                    // Committed either way; a malformed batch will not improve on redelivery
                    if let Err(e) = self.consumer.commit_message(&message, CommitMode::Async) {
                        warn!(error = %e, "Failed to commit offset");
                    }
                }
                Err(e) => {
                    error!(error = %e, "Kafka consumer error");
                    metrics::counter!("postprod.kafka.errors").increment(1);
                }
            }
        }

        Ok(())
    }

    /// Process a single Kafka message
    #[instrument(skip(self, message), fields(topic = message.topic(), partition = message.partition(), offset = message.offset()))]
    async fn process_message(&self, message: &BorrowedMessage<'_>) -> Result<BatchResponse> {
        let kind = *self
            .routes
            .get(message.topic())
            .with_context(|| format!("No pipeline for topic {}", message.topic()))?;

        let batch = decode_batch(message.payload())?;

        debug!(pipeline = %kind, records = batch.len(), "Received storage event batch");

        let response = self.runner.run(kind, &batch).await?;
        Ok(response)
    }
}
