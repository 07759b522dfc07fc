//! In-process transport over tokio channels.
//!
//! Implements the full retry/dead-letter contract so the dispatcher can be
//! exercised without a broker; tests and local development use it.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::domain::{RenderReplyEnvelope, RenderRequestEnvelope};

use super::{Delivery, QueueTransport, RetryOutcome, TransportError};

pub struct ChannelTransport {
    max_retries: u32,
    retry_delay: Duration,
    sender: Mutex<Option<mpsc::UnboundedSender<Delivery>>>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<Delivery>>,
    replies: Mutex<Vec<RenderReplyEnvelope>>,
    dead_letters: Mutex<Vec<(Delivery, String)>>,
    completed: AtomicUsize,
}

impl ChannelTransport {
    pub fn new(max_retries: u32, retry_delay: Duration) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            max_retries,
            retry_delay,
            sender: Mutex::new(Some(sender)),
            receiver: tokio::sync::Mutex::new(receiver),
            replies: Mutex::new(Vec::new()),
            dead_letters: Mutex::new(Vec::new()),
            completed: AtomicUsize::new(0),
        }
    }

    /// Enqueue a raw payload as a first delivery.
    pub fn push_bytes(&self, payload: Vec<u8>, key: Option<String>) {
        self.send(Delivery::first(payload, key));
    }

    /// Enqueue a request envelope as a first delivery.
    pub fn push_request(&self, envelope: &RenderRequestEnvelope) {
        let payload = serde_json::to_vec(envelope).unwrap_or_default();
        let key = Some(envelope.correlation_id.to_string());
        self.push_bytes(payload, key);
    }

    /// Close the inbound stream; `receive` drains what is queued and then
    /// reports end of stream.
    pub fn close(&self) {
        self.sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }

    pub fn replies(&self) -> Vec<RenderReplyEnvelope> {
        self.replies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn dead_letters(&self) -> Vec<(Delivery, String)> {
        self.dead_letters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn completed_count(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    fn send(&self, delivery: Delivery) {
        if let Some(sender) = self
            .sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
        {
            let _ = sender.send(delivery);
        }
    }

    fn backoff(&self, failed_attempt: u32) -> Duration {
        self.retry_delay * 2u32.saturating_pow(failed_attempt.saturating_sub(1))
    }
}

#[async_trait]
impl QueueTransport for ChannelTransport {
    async fn receive(&self) -> Result<Option<Delivery>, TransportError> {
        Ok(self.receiver.lock().await.recv().await)
    }

    async fn publish_reply(&self, reply: &RenderReplyEnvelope) -> Result<(), TransportError> {
        self.replies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(reply.clone());
        Ok(())
    }

    async fn retry(
        &self,
        delivery: Delivery,
        reason: &str,
    ) -> Result<RetryOutcome, TransportError> {
        if delivery.attempt > self.max_retries {
            self.dead_letter(delivery, reason).await?;
            return Ok(RetryOutcome::Exhausted);
        }

        let delay = self.backoff(delivery.attempt);
        let next_attempt = delivery.attempt + 1;
        debug!(
            target: "platen::transport",
            attempt = delivery.attempt,
            delay_ms = delay.as_millis() as u64,
            reason,
            "scheduling redelivery"
        );

        let redelivery = Delivery {
            attempt: next_attempt,
            ..delivery
        };
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(sender) = sender {
                let _ = sender.send(redelivery);
            }
        });

        Ok(RetryOutcome::Scheduled { next_attempt })
    }

    async fn complete(&self, _delivery: Delivery) -> Result<(), TransportError> {
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn dead_letter(
        &self,
        delivery: Delivery,
        reason: &str,
    ) -> Result<(), TransportError> {
        debug!(target: "platen::transport", attempt = delivery.attempt, reason, "dead-lettering message");
        self.dead_letters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((delivery, reason.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn messages_arrive_in_order() {
        let transport = ChannelTransport::new(0, Duration::from_millis(10));
        transport.push_bytes(b"one".to_vec(), None);
        transport.push_bytes(b"two".to_vec(), None);

        let first = transport.receive().await.expect("receive").expect("some");
        let second = transport.receive().await.expect("receive").expect("some");
        assert_eq!(first.payload, b"one");
        assert_eq!(second.payload, b"two");
        assert_eq!(first.attempt, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn closing_drains_then_ends_the_stream() {
        let transport = ChannelTransport::new(0, Duration::from_millis(10));
        transport.push_bytes(b"last".to_vec(), None);
        transport.close();

        assert!(transport.receive().await.expect("receive").is_some());
        assert!(transport.receive().await.expect("receive").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn retry_backs_off_exponentially() {
        let transport = ChannelTransport::new(3, Duration::from_millis(100));
        let delivery = Delivery::first(b"job".to_vec(), None);

        let started = Instant::now();
        let outcome = transport.retry(delivery, "boom").await.expect("retry");
        assert_eq!(outcome, RetryOutcome::Scheduled { next_attempt: 2 });

        let redelivered = transport.receive().await.expect("receive").expect("some");
        assert_eq!(redelivered.attempt, 2);
        assert!(started.elapsed() >= Duration::from_millis(100));

        // Second failure doubles the delay.
        let started = Instant::now();
        transport.retry(redelivered, "boom").await.expect("retry");
        let redelivered = transport.receive().await.expect("receive").expect("some");
        assert_eq!(redelivered.attempt, 3);
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_budget_routes_to_the_dead_letter() {
        let transport = ChannelTransport::new(1, Duration::from_millis(10));
        let exhausted = Delivery {
            attempt: 2,
            ..Delivery::first(b"job".to_vec(), None)
        };

        let outcome = transport.retry(exhausted, "still failing").await.expect("retry");
        assert_eq!(outcome, RetryOutcome::Exhausted);

        let parked = transport.dead_letters();
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].1, "still failing");
    }

    #[tokio::test(start_paused = true)]
    async fn zero_retry_budget_exhausts_immediately() {
        let transport = ChannelTransport::new(0, Duration::from_millis(10));
        let delivery = Delivery::first(b"job".to_vec(), None);

        let outcome = transport.retry(delivery, "boom").await.expect("retry");
        assert_eq!(outcome, RetryOutcome::Exhausted);
    }
}
