//! Kafka transport: request-topic consumer, result-topic producer, retry
//! redelivery with an attempt header, dead-letter routing.

use std::time::Duration;

use async_trait::async_trait;
use rdkafka::Message;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Header, Headers, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use tracing::{debug, warn};

use crate::config::QueueSettings;
use crate::domain::RenderReplyEnvelope;

use super::{Delivery, QueueTransport, RetryOutcome, TransportError};

const RETRY_ATTEMPT_HEADER: &str = "x-retry-attempt";
const FAILURE_REASON_HEADER: &str = "x-failure-reason";

pub struct KafkaTransport {
    consumer: StreamConsumer,
    producer: FutureProducer,
    settings: QueueSettings,
}

impl KafkaTransport {
    pub fn new(settings: &QueueSettings) -> Result<Self, TransportError> {
        let mut common = ClientConfig::new();
        common.set("bootstrap.servers", settings.bootstrap_servers.as_str());
        if let Some(protocol) = settings.security_protocol.as_deref() {
            common.set("security.protocol", protocol);
        }
        if let Some(mechanism) = settings.sasl_mechanism.as_deref() {
            common.set("sasl.mechanism", mechanism);
        }
        if let Some(username) = settings.sasl_username.as_deref() {
            common.set("sasl.username", username);
        }
        if let Some(password) = settings.sasl_password.as_deref() {
            common.set("sasl.password", password);
        }

        let consumer: StreamConsumer = {
            let mut consumer_config = common.clone();
            consumer_config
                .set("group.id", settings.consumer_group_id.as_str())
                .set("enable.auto.commit", "true")
                .set("auto.offset.reset", "earliest");
            consumer_config
                .create()
                .map_err(|err| TransportError::Configuration(err.to_string()))?
        };
        consumer
            .subscribe(&[settings.request_topic.as_str()])
            .map_err(|err| TransportError::Configuration(err.to_string()))?;

        let producer: FutureProducer = common
            .create()
            .map_err(|err| TransportError::Configuration(err.to_string()))?;

        Ok(Self {
            consumer,
            producer,
            settings: settings.clone(),
        })
    }
}

#[async_trait]
impl QueueTransport for KafkaTransport {
    async fn receive(&self) -> Result<Option<Delivery>, TransportError> {
        match self.consumer.recv().await {
            Ok(message) => {
                let payload = message.payload().map(<[u8]>::to_vec).unwrap_or_default();
                let key = message
                    .key()
                    .map(|key| String::from_utf8_lossy(key).into_owned());
                let attempt = attempt_of(&message);
                Ok(Some(Delivery {
                    payload,
                    key,
                    attempt,
                }))
            }
            Err(err) => Err(TransportError::Consume(err.to_string())),
        }
    }

    async fn publish_reply(&self, reply: &RenderReplyEnvelope) -> Result<(), TransportError> {
        let payload = serde_json::to_vec(reply)
            .map_err(|err| TransportError::Publish(err.to_string()))?;
        let key = reply.correlation_id.to_string();
        produce(
            &self.producer,
            &self.settings.result_topic,
            Some(&key),
            &payload,
            OwnedHeaders::new(),
            self.settings.poll_timeout,
        )
        .await
    }

    async fn retry(
        &self,
        delivery: Delivery,
        reason: &str,
    ) -> Result<RetryOutcome, TransportError> {
        if delivery.attempt > self.settings.max_retries {
            self.dead_letter(delivery, reason).await?;
            return Ok(RetryOutcome::Exhausted);
        }

        let delay = retry_backoff(self.settings.retry_delay, delivery.attempt);
        let next_attempt = delivery.attempt + 1;
        debug!(
            target: "platen::transport",
            attempt = delivery.attempt,
            delay_ms = delay.as_millis() as u64,
            reason,
            "republishing for retry"
        );

        let producer = self.producer.clone();
        let topic = self.settings.request_topic.clone();
        let send_timeout = self.settings.poll_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let attempt_text = next_attempt.to_string();
            let headers = OwnedHeaders::new().insert(Header {
                key: RETRY_ATTEMPT_HEADER,
                value: Some(&attempt_text),
            });
            let outcome = produce(
                &producer,
                &topic,
                delivery.key.as_deref(),
                &delivery.payload,
                headers,
                send_timeout,
            )
            .await;
            if let Err(err) = outcome {
                warn!(target: "platen::transport", error = %err, "retry republish failed");
            }
        });

        Ok(RetryOutcome::Scheduled { next_attempt })
    }

    async fn complete(&self, _delivery: Delivery) -> Result<(), TransportError> {
        // Offsets are committed by the consumer; replies and on-disk
        // writes are idempotent under redelivery.
        Ok(())
    }

    async fn dead_letter(
        &self,
        delivery: Delivery,
        reason: &str,
    ) -> Result<(), TransportError> {
        warn!(
            target: "platen::transport",
            attempt = delivery.attempt,
            reason,
            "routing message to the dead letter"
        );
        let attempt_text = delivery.attempt.to_string();
        let headers = OwnedHeaders::new()
            .insert(Header {
                key: RETRY_ATTEMPT_HEADER,
                value: Some(&attempt_text),
            })
            .insert(Header {
                key: FAILURE_REASON_HEADER,
                value: Some(reason),
            });
        produce(
            &self.producer,
            &self.settings.dead_letter_topic,
            delivery.key.as_deref(),
            &delivery.payload,
            headers,
            self.settings.poll_timeout,
        )
        .await
    }
}

async fn produce(
    producer: &FutureProducer,
    topic: &str,
    key: Option<&str>,
    payload: &[u8],
    headers: OwnedHeaders,
    queue_timeout: Duration,
) -> Result<(), TransportError> {
    let mut record: FutureRecord<'_, str, [u8]> =
        FutureRecord::to(topic).payload(payload).headers(headers);
    if let Some(key) = key {
        record = record.key(key);
    }
    producer
        .send(record, queue_timeout)
        .await
        .map(|_| ())
        .map_err(|(err, _message)| TransportError::Publish(err.to_string()))
}

fn attempt_of(message: &BorrowedMessage<'_>) -> u32 {
    message
        .headers()
        .and_then(|headers| {
            headers
                .iter()
                .find(|header| header.key == RETRY_ATTEMPT_HEADER)
                .and_then(|header| header.value)
                .and_then(|value| std::str::from_utf8(value).ok())
                .and_then(|text| text.parse().ok())
        })
        .unwrap_or(1)
}

fn retry_backoff(retry_delay: Duration, failed_attempt: u32) -> Duration {
    retry_delay * 2u32.saturating_pow(failed_attempt.saturating_sub(1))
}
