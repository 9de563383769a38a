//! UDP transport with acknowledgement tracking
//!
//! Every outbound command that expects an ack becomes a [`PendingSend`] in the
//! [`RetryQueue`]. The record is resolved when a datagram carrying a matching
//! `ackMessageId` arrives, or fails with [`DeliveryError::Expired`] once its
//! viability deadline passes. Until then the identical payload is resent on a
//! fixed interval. A record leaves the queue exactly once, so the caller's
//! completion fires at most once.

use crate::envelope::{IncomingMessage, OutgoingMessage};
use crate::error::{DeliveryError, ProtocolError};
use crate::message::MessageKind;
use crate::{DEFAULT_VIABILITY, MAX_DATAGRAM_SIZE, MIN_TIMER_PERIOD};
use log::{debug, error, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

pub type DeliveryResult = Result<IncomingMessage, DeliveryError>;

/// Outbound command waiting for its ack
#[derive(Debug)]
pub struct PendingSend {
    message_id: Uuid,
    kind: MessageKind,
    addr: SocketAddr,
    payload: Vec<u8>,
    deadline: Instant,
    next_attempt: Instant,
    attempts: u32,
    completion: oneshot::Sender<DeliveryResult>,
}

impl PendingSend {
    pub fn message_id(&self) -> Uuid {
        self.message_id
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Hands the ack to whoever is waiting. A dropped waiter is not an error.
    pub fn resolve(self, response: IncomingMessage) {
        let _ = self.completion.send(Ok(response));
    }

    pub fn fail(self, error: DeliveryError) {
        let _ = self.completion.send(Err(error));
    }
}

/// Caller's handle on a tracked send
#[derive(Debug)]
pub struct Delivery {
    message_id: Uuid,
    receiver: oneshot::Receiver<DeliveryResult>,
}

impl Delivery {
    pub fn message_id(&self) -> Uuid {
        self.message_id
    }

    /// Resolves with the ack, or the reason none will come.
    pub async fn wait(self) -> DeliveryResult {
        let message_id = self.message_id;
        self.receiver
            .await
            .unwrap_or(Err(DeliveryError::Abandoned { message_id }))
    }
}

/// Pending-send table, driven by an explicit clock
#[derive(Debug)]
pub struct RetryQueue {
    interval: Duration,
    pending: HashMap<Uuid, PendingSend>,
}

impl RetryQueue {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            pending: HashMap::new(),
        }
    }

    /// Records a send that has just gone out for the first time.
    pub fn track(
        &mut self,
        message_id: Uuid,
        kind: MessageKind,
        addr: SocketAddr,
        payload: Vec<u8>,
        viability: Duration,
        now: Instant,
    ) -> Delivery {
        let (completion, receiver) = oneshot::channel();
        let record = PendingSend {
            message_id,
            kind,
            addr,
            payload,
            deadline: now + viability,
            next_attempt: now + self.interval,
            attempts: 1,
            completion,
        };

        if let Some(previous) = self.pending.insert(message_id, record) {
            warn!("Message {} tracked twice, abandoning earlier record", message_id);
            previous.fail(DeliveryError::Abandoned { message_id });
        }

        Delivery {
            message_id,
            receiver,
        }
    }

    /// Removes the record an inbound ack refers to.
    pub fn take(&mut self, message_id: &Uuid) -> Option<PendingSend> {
        self.pending.remove(message_id)
    }

    /// Expires records whose deadline has passed, then returns the payloads
    /// due for another attempt.
    pub fn poll(&mut self, now: Instant) -> Vec<(SocketAddr, Vec<u8>)> {
        let expired: Vec<Uuid> = self
            .pending
            .values()
            .filter(|record| now >= record.deadline)
            .map(|record| record.message_id)
            .collect();

        for message_id in expired {
            if let Some(record) = self.pending.remove(&message_id) {
                debug!(
                    "{} {} expired after {} attempt(s)",
                    record.kind, message_id, record.attempts
                );
                let attempts = record.attempts;
                record.fail(DeliveryError::Expired {
                    message_id,
                    attempts,
                });
            }
        }

        let mut due = Vec::new();
        for record in self.pending.values_mut() {
            if now >= record.next_attempt {
                record.attempts += 1;
                record.next_attempt = now + self.interval;
                due.push((record.addr, record.payload.clone()));
            }
        }
        due
    }

    /// Fails every outstanding record.
    pub fn close(&mut self) {
        for (message_id, record) in self.pending.drain() {
            record.fail(DeliveryError::Abandoned { message_id });
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Datagram socket plus the retry queue for everything sent through it
#[derive(Clone)]
pub struct Transport {
    socket: Arc<UdpSocket>,
    retries: Arc<Mutex<RetryQueue>>,
    resend_interval: Duration,
}

impl Transport {
    pub async fn bind(addr: &str, resend_interval: Duration) -> Result<Self, ProtocolError> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self::from_socket(socket, resend_interval))
    }

    /// A zero `resend_interval` is raised to [`MIN_TIMER_PERIOD`].
    pub fn from_socket(socket: UdpSocket, resend_interval: Duration) -> Self {
        let resend_interval = resend_interval.max(MIN_TIMER_PERIOD);
        Self {
            socket: Arc::new(socket),
            retries: Arc::new(Mutex::new(RetryQueue::new(resend_interval))),
            resend_interval,
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ProtocolError> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn recv_from(&self, buffer: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buffer).await
    }

    /// Serializes and sends `message`.
    ///
    /// Commands that expect an ack get a fresh `messageId` when they have none
    /// and a default viability, and are tracked before the first datagram
    /// leaves. Returns the delivery handle for tracked sends.
    pub async fn send(
        &self,
        addr: SocketAddr,
        mut message: OutgoingMessage,
    ) -> Result<Option<Delivery>, ProtocolError> {
        if message.expects_ack {
            if message.message_id.is_none() {
                message.message_id = Some(Uuid::new_v4());
            }
            if message.viability.is_none() {
                message.viability = Some(DEFAULT_VIABILITY.as_millis() as u64);
            }
        }

        let payload = message.encode()?;
        if payload.len() > MAX_DATAGRAM_SIZE {
            return Err(ProtocolError::InvalidArgument(format!(
                "{} encodes to {} bytes, limit is {}",
                message.kind(),
                payload.len(),
                MAX_DATAGRAM_SIZE
            )));
        }

        let tracked = match (message.expects_ack, message.message_id) {
            (true, Some(message_id)) => {
                let viability = Duration::from_millis(message.viability.unwrap_or_default());
                let delivery = self.retries.lock().await.track(
                    message_id,
                    message.kind(),
                    addr,
                    payload.clone(),
                    viability,
                    Instant::now(),
                );
                Some(delivery)
            }
            _ => None,
        };

        if let Err(e) = self.socket.send_to(&payload, addr).await {
            if let Some(delivery) = &tracked {
                self.retries.lock().await.take(&delivery.message_id());
            }
            return Err(e.into());
        }

        Ok(tracked)
    }

    pub async fn take_pending(&self, message_id: &Uuid) -> Option<PendingSend> {
        self.retries.lock().await.take(message_id)
    }

    /// Runs one retry pass. Returns how many datagrams were resent.
    pub async fn resend_due(&self, now: Instant) -> usize {
        let due = self.retries.lock().await.poll(now);
        let mut resent = 0;

        for (addr, payload) in due {
            match self.socket.send_to(&payload, addr).await {
                Ok(_) => resent += 1,
                Err(e) => error!("Failed to resend to {}: {}", addr, e),
            }
        }
        resent
    }

    /// Drives [`resend_due`](Self::resend_due) at the resend interval until
    /// the task is aborted.
    pub fn spawn_retry_loop(&self) -> JoinHandle<()> {
        let transport = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(transport.resend_interval);
            loop {
                ticker.tick().await;
                let resent = transport.resend_due(Instant::now()).await;
                if resent > 0 {
                    debug!("Resent {} unacknowledged message(s)", resent);
                }
            }
        })
    }

    pub async fn pending_count(&self) -> usize {
        self.retries.lock().await.len()
    }

    pub async fn close(&self) {
        self.retries.lock().await.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::RawEnvelope;
    use crate::message::{ChatMessage, MessageData};
    use std::net::{IpAddr, Ipv4Addr};
    use tokio_test::{assert_err, assert_ok};

    fn addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9000)
    }

    fn ack(message_id: Uuid) -> IncomingMessage {
        IncomingMessage {
            created_at: 1,
            message_id: None,
            ack_message_id: Some(message_id),
            key: String::new(),
            data: MessageData::Empty,
            success: Some(true),
            viability: None,
        }
    }

    fn track(queue: &mut RetryQueue, now: Instant, viability_ms: u64) -> Delivery {
        queue.track(
            Uuid::new_v4(),
            MessageKind::CommandChat,
            addr(),
            b"payload".to_vec(),
            Duration::from_millis(viability_ms),
            now,
        )
    }

    #[tokio::test]
    async fn test_ack_resolves_and_prevents_expiry() {
        let t0 = Instant::now();
        let mut queue = RetryQueue::new(Duration::from_millis(500));
        let delivery = track(&mut queue, t0, 2000);
        let id = delivery.message_id();

        let record = queue.take(&id).unwrap();
        record.resolve(ack(id));

        assert!(queue.poll(t0 + Duration::from_secs(10)).is_empty());
        assert!(queue.take(&id).is_none());

        let response = assert_ok!(delivery.wait().await);
        assert_eq!(response.ack_message_id, Some(id));
    }

    #[tokio::test]
    async fn test_expiry_prevents_late_ack() {
        let t0 = Instant::now();
        let mut queue = RetryQueue::new(Duration::from_millis(500));
        let delivery = track(&mut queue, t0, 1200);
        let id = delivery.message_id();

        queue.poll(t0 + Duration::from_millis(1200));
        assert!(queue.take(&id).is_none());
        assert!(queue.is_empty());

        let error = assert_err!(delivery.wait().await);
        assert!(matches!(error, DeliveryError::Expired { message_id, .. } if message_id == id));
    }

    #[test]
    fn test_resend_schedule_until_deadline() {
        let t0 = Instant::now();
        let mut queue = RetryQueue::new(Duration::from_millis(500));
        let _delivery = track(&mut queue, t0, 1800);

        assert!(queue.poll(t0 + Duration::from_millis(499)).is_empty());

        let due = queue.poll(t0 + Duration::from_millis(500));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0], (addr(), b"payload".to_vec()));

        // Next attempt is scheduled from the previous resend
        assert!(queue.poll(t0 + Duration::from_millis(900)).is_empty());
        assert_eq!(queue.poll(t0 + Duration::from_millis(1000)).len(), 1);
        assert_eq!(queue.poll(t0 + Duration::from_millis(1500)).len(), 1);

        // Deadline reached: expired rather than resent
        assert!(queue.poll(t0 + Duration::from_millis(2000)).is_empty());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_expired_attempt_count() {
        let t0 = Instant::now();
        let mut queue = RetryQueue::new(Duration::from_millis(100));
        let delivery = track(&mut queue, t0, 350);

        for step in 1..=3 {
            queue.poll(t0 + Duration::from_millis(100 * step));
        }
        queue.poll(t0 + Duration::from_millis(350));

        match delivery.wait().await {
            Err(DeliveryError::Expired { attempts, .. }) => assert_eq!(attempts, 4),
            other => panic!("Unexpected delivery result {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_close_abandons_outstanding() {
        let mut queue = RetryQueue::new(Duration::from_millis(100));
        let delivery = track(&mut queue, Instant::now(), 5000);

        queue.close();

        assert!(queue.is_empty());
        assert!(matches!(
            delivery.wait().await,
            Err(DeliveryError::Abandoned { .. })
        ));
    }

    #[test]
    fn test_dropped_waiter_does_not_block_ack() {
        let mut queue = RetryQueue::new(Duration::from_millis(100));
        let delivery = track(&mut queue, Instant::now(), 5000);
        let id = delivery.message_id();
        drop(delivery);

        // Caller gave up, the record is still cleaned up by the ack
        let record = queue.take(&id).unwrap();
        record.resolve(ack(id));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_loopback_tracked_send() {
        let sender = Transport::bind("127.0.0.1:0", Duration::from_millis(50))
            .await
            .unwrap();
        let receiver = Transport::bind("127.0.0.1:0", Duration::from_millis(50))
            .await
            .unwrap();

        let message = OutgoingMessage::command(MessageData::CommandChat(ChatMessage {
            text: "over the wire".into(),
            from: None,
        }))
        .key("k")
        .expect_ack(Duration::from_secs(2))
        .build();

        let delivery = sender
            .send(receiver.local_addr().unwrap(), message)
            .await
            .unwrap()
            .expect("tracked send returns a delivery");
        assert_eq!(sender.pending_count().await, 1);

        let mut buffer = [0u8; MAX_DATAGRAM_SIZE];
        let (len, from) = receiver.recv_from(&mut buffer).await.unwrap();
        let raw = RawEnvelope::decode(&buffer[..len]).unwrap();
        assert_eq!(raw.message_id, Some(delivery.message_id()));
        assert_eq!(raw.viability, Some(2000));
        assert_eq!(from, sender.local_addr().unwrap());

        let record = sender.take_pending(&delivery.message_id()).await.unwrap();
        record.resolve(ack(delivery.message_id()));

        let response = assert_ok!(delivery.wait().await);
        assert!(response.is_success());
        assert_eq!(sender.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_zero_resend_interval_keeps_retry_loop_alive() {
        let transport = Transport::bind("127.0.0.1:0", Duration::ZERO).await.unwrap();
        let retry_loop = transport.spawn_retry_loop();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!retry_loop.is_finished());
        retry_loop.abort();
    }

    #[tokio::test]
    async fn test_untracked_send_has_no_delivery() {
        let transport = Transport::bind("127.0.0.1:0", Duration::from_millis(50))
            .await
            .unwrap();
        let target = transport.local_addr().unwrap();

        let message = OutgoingMessage::command(MessageData::CommandHeartbeat)
            .key("k")
            .build();
        let delivery = transport.send(target, message).await.unwrap();

        assert!(delivery.is_none());
        assert_eq!(transport.pending_count().await, 0);
    }
}
