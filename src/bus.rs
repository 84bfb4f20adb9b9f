use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Mutex, mpsc};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub channel: String,
    pub sender_id: String,
    pub chat_id: String,
    pub content: String,
    pub timestamp: DateTime<Local>,
    pub media: Vec<String>,
    pub metadata: Map<String, Value>,
}

impl InboundMessage {
    pub fn new(
        channel: impl Into<String>,
        sender_id: impl Into<String>,
        chat_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            sender_id: sender_id.into(),
            chat_id: chat_id.into(),
            content: content.into(),
            timestamp: Local::now(),
            media: Vec::new(),
            metadata: Map::new(),
        }
    }

    pub fn session_key(&self) -> String {
        format!("{}:{}", self.channel, self.chat_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub channel: String,
    pub chat_id: String,
    pub content: String,
    pub reply_to: Option<String>,
    pub media: Vec<String>,
    pub metadata: Map<String, Value>,
}

impl OutboundMessage {
    pub fn new(
        channel: impl Into<String>,
        chat_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            chat_id: chat_id.into(),
            content: content.into(),
            reply_to: None,
            media: Vec::new(),
            metadata: Map::new(),
        }
    }

    /// Sets `metadata.type`, the discriminator transports switch on
    /// (`message`, `chunk`, `typing`, `stop_typing`, `tool_execution`, ...).
    pub fn with_type(mut self, event_type: &str) -> Self {
        self.metadata
            .insert("type".to_string(), Value::String(event_type.to_string()));
        self
    }
}

/// Inbound is a single shared queue (every message goes to the one
/// orchestrator). Outbound is per-sink: each registered channel name gets its
/// own bounded `mpsc` queue, so a slow or dead channel's `send()` only stalls
/// its own queue rather than head-of-line-blocking every other channel.
/// Messages addressed to a channel with no registered sink fall into a
/// shared default queue drained by [`Self::consume_outbound`], preserving
/// single-queue behavior for callers (CLI, cron delivery) that never
/// register a dedicated sink.
pub struct MessageBus {
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound_rx: Mutex<mpsc::Receiver<InboundMessage>>,
    outbound_capacity: usize,
    sinks: Mutex<HashMap<String, mpsc::Sender<OutboundMessage>>>,
    default_tx: mpsc::Sender<OutboundMessage>,
    default_rx: Mutex<mpsc::Receiver<OutboundMessage>>,
    inbound_size: AtomicUsize,
    outbound_size: AtomicUsize,
}

impl MessageBus {
    pub fn new(capacity: usize) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (default_tx, default_rx) = mpsc::channel(capacity);
        Self {
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            outbound_capacity: capacity,
            sinks: Mutex::new(HashMap::new()),
            default_tx,
            default_rx: Mutex::new(default_rx),
            inbound_size: AtomicUsize::new(0),
            outbound_size: AtomicUsize::new(0),
        }
    }

    pub fn inbound_sender(&self) -> mpsc::Sender<InboundMessage> {
        self.inbound_tx.clone()
    }

    pub fn outbound_sender(&self) -> mpsc::Sender<OutboundMessage> {
        self.default_tx.clone()
    }

    /// Registers a dedicated outbound queue for `name`, returning its
    /// receiver end. The caller (one dispatch task per channel adapter)
    /// owns draining it in parallel with every other sink's dispatch task.
    /// Re-registering the same name replaces the previous queue.
    pub async fn register_sink(&self, name: &str) -> mpsc::Receiver<OutboundMessage> {
        let (tx, rx) = mpsc::channel(self.outbound_capacity);
        self.sinks.lock().await.insert(name.to_string(), tx);
        rx
    }

    pub async fn publish_inbound(&self, msg: InboundMessage) -> anyhow::Result<()> {
        self.inbound_size.fetch_add(1, Ordering::Relaxed);
        if let Err(err) = self.inbound_tx.send(msg).await {
            self.inbound_size.fetch_sub(1, Ordering::Relaxed);
            return Err(anyhow::anyhow!("failed to publish inbound message: {err}"));
        }
        Ok(())
    }

    pub async fn consume_inbound(&self) -> Option<InboundMessage> {
        let mut rx = self.inbound_rx.lock().await;
        let msg = rx.recv().await;
        if msg.is_some() {
            self.inbound_size.fetch_sub(1, Ordering::Relaxed);
        }
        msg
    }

    /// Routes to the sink registered for `msg.channel`, or the shared
    /// default queue if no sink was registered for it.
    pub async fn publish_outbound(&self, msg: OutboundMessage) -> anyhow::Result<()> {
        let sink = self.sinks.lock().await.get(&msg.channel).cloned();
        self.outbound_size.fetch_add(1, Ordering::Relaxed);
        let sent = match sink {
            Some(tx) => tx.send(msg).await.map_err(|e| anyhow::anyhow!(e.to_string())),
            None => self
                .default_tx
                .send(msg)
                .await
                .map_err(|e| anyhow::anyhow!(e.to_string())),
        };
        if sent.is_err() {
            self.outbound_size.fetch_sub(1, Ordering::Relaxed);
        }
        sent
    }

    /// Drains the shared default queue only. Messages routed to a
    /// registered per-sink queue must be drained via the receiver returned
    /// from [`Self::register_sink`].
    pub async fn consume_outbound(&self) -> Option<OutboundMessage> {
        let mut rx = self.default_rx.lock().await;
        let msg = rx.recv().await;
        if msg.is_some() {
            self.outbound_size.fetch_sub(1, Ordering::Relaxed);
        }
        msg
    }

    pub fn inbound_size(&self) -> usize {
        self.inbound_size.load(Ordering::Relaxed)
    }

    pub fn outbound_size(&self) -> usize {
        self.outbound_size.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn per_sink_queue_is_independent_of_default_queue() {
        let bus = MessageBus::new(8);
        let mut rx = bus.register_sink("telegram").await;

        bus.publish_outbound(OutboundMessage::new("telegram", "c1", "hi"))
            .await
            .unwrap();
        bus.publish_outbound(OutboundMessage::new("unregistered", "c2", "stray"))
            .await
            .unwrap();

        let via_sink = rx.recv().await.unwrap();
        assert_eq!(via_sink.channel, "telegram");

        let via_default = bus.consume_outbound().await.unwrap();
        assert_eq!(via_default.channel, "unregistered");
    }

    #[tokio::test]
    async fn slow_sink_does_not_block_other_sinks() {
        let bus = MessageBus::new(1);
        let mut fast_rx = bus.register_sink("fast").await;
        let _slow_rx = bus.register_sink("slow").await;

        bus.publish_outbound(OutboundMessage::new("slow", "c1", "one"))
            .await
            .unwrap();

        tokio::time::timeout(
            std::time::Duration::from_millis(500),
            bus.publish_outbound(OutboundMessage::new("fast", "c2", "two")),
        )
        .await
        .expect("publishing to the fast sink must not wait on the slow sink's queue")
        .unwrap();

        assert_eq!(fast_rx.recv().await.unwrap().channel, "fast");
    }
}
