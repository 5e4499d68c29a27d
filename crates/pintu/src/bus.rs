//! In-process message bus
//!
//! One broadcast channel per [`Topic`]. Publishing never blocks: a
//! subscriber that falls more than the channel capacity behind loses the
//! oldest messages, and the loss is counted and logged rather than pushed
//! back onto the publisher. A networked broker would sit behind the same
//! `publish`/`subscribe` surface.

use bytes::Bytes;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::{
    decode_message, encode_message, frame_from_bytes, frame_to_bytes, Clock, Envelope, Frame,
    PipelineError, SystemClock, Topic,
};

/// Per-topic counters (returned as a snapshot from atomic counters)
#[derive(Debug, Clone, Serialize)]
pub struct TopicStats {
    pub topic: Topic,
    pub name: String,
    pub published: u64,
    /// Messages lost by lagging subscribers
    pub dropped: u64,
    pub subscribers: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BusStats {
    pub camera: String,
    pub topics: Vec<TopicStats>,
}

impl BusStats {
    pub fn topic(&self, topic: Topic) -> Option<&TopicStats> {
        self.topics.iter().find(|t| t.topic == topic)
    }
}

struct TopicChannel {
    name: String,
    tx: broadcast::Sender<Envelope>,
    /// Next sequence number; held across send so sequence order is send order
    next_sequence: Mutex<u64>,
    published: AtomicU64,
    dropped: AtomicU64,
}

struct BusInner {
    camera: String,
    topics: HashMap<Topic, TopicChannel>,
    clock: Arc<dyn Clock>,
}

/// Handle to the bus. Cheap to clone.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Bus {
    /// Create a bus for one camera with `capacity` messages of headroom per topic
    pub fn new(camera: impl Into<String>, capacity: usize) -> Self {
        Self::with_clock(camera, capacity, Arc::new(SystemClock))
    }

    pub fn with_clock(camera: impl Into<String>, capacity: usize, clock: Arc<dyn Clock>) -> Self {
        let camera = camera.into();
        let capacity = capacity.max(1);
        let topics = Topic::ALL
            .into_iter()
            .map(|topic| {
                let (tx, _) = broadcast::channel(capacity);
                let channel = TopicChannel {
                    name: topic.name(&camera),
                    tx,
                    next_sequence: Mutex::new(0),
                    published: AtomicU64::new(0),
                    dropped: AtomicU64::new(0),
                };
                (topic, channel)
            })
            .collect();

        Self {
            inner: Arc::new(BusInner {
                camera,
                topics,
                clock,
            }),
        }
    }

    pub fn camera(&self) -> &str {
        &self.inner.camera
    }

    /// Full topic name, e.g. `pintu/doorcam/frames`
    pub fn topic_name(&self, topic: Topic) -> &str {
        &self.channel(topic).name
    }

    fn channel(&self, topic: Topic) -> &TopicChannel {
        // Every topic is created in `with_clock`
        &self.inner.topics[&topic]
    }

    /// Publish raw bytes. Returns the sequence assigned to the message.
    ///
    /// Having no subscribers is normal and not an error.
    pub fn publish(&self, topic: Topic, payload: Bytes) -> u64 {
        let channel = self.channel(topic);
        let mut next = channel.next_sequence.lock();
        let sequence = *next;
        *next += 1;

        let envelope = Envelope {
            topic,
            sequence,
            timestamp_us: self.inner.clock.now_us(),
            payload,
        };
        if channel.tx.send(envelope).is_err() {
            debug!("No subscribers on {}", channel.name);
        }
        channel.published.fetch_add(1, Ordering::Relaxed);
        sequence
    }

    /// Encode and publish a MessagePack message
    pub fn publish_message<T: Serialize>(&self, topic: Topic, message: &T) -> Result<u64, PipelineError> {
        let payload = encode_message(message)?;
        Ok(self.publish(topic, payload))
    }

    /// Publish a frame on the frames topic using the binary frame codec
    pub fn publish_frame(&self, frame: &Frame) -> u64 {
        self.publish(Topic::Frames, frame_to_bytes(frame))
    }

    /// Subscribe to a topic. Only messages published after this call are seen.
    pub fn subscribe(&self, topic: Topic) -> Subscription {
        Subscription {
            topic,
            rx: self.channel(topic).tx.subscribe(),
            bus: self.clone(),
            dropped: 0,
        }
    }

    /// Get current bus statistics
    pub fn stats(&self) -> BusStats {
        BusStats {
            camera: self.inner.camera.clone(),
            topics: Topic::ALL
                .into_iter()
                .map(|topic| {
                    let channel = self.channel(topic);
                    TopicStats {
                        topic,
                        name: channel.name.clone(),
                        published: channel.published.load(Ordering::Relaxed),
                        dropped: channel.dropped.load(Ordering::Relaxed),
                        subscribers: channel.tx.receiver_count(),
                    }
                })
                .collect(),
        }
    }
}

/// A subscriber's view of one topic
pub struct Subscription {
    topic: Topic,
    rx: broadcast::Receiver<Envelope>,
    bus: Bus,
    dropped: u64,
}

impl Subscription {
    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Messages this subscriber has lost to lag
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn record_lag(&mut self, missed: u64) {
        let channel = self.bus.channel(self.topic);
        warn!("Subscriber on {} lagged, missed {} messages", channel.name, missed);
        self.dropped += missed;
        channel.dropped.fetch_add(missed, Ordering::Relaxed);
    }

    /// Wait for the next message. Returns `None` only once the bus is gone.
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            match self.rx.recv().await {
                Ok(envelope) => return Some(envelope),
                Err(broadcast::error::RecvError::Lagged(n)) => self.record_lag(n),
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Take the next message if one is already queued
    pub fn try_recv(&mut self) -> Option<Envelope> {
        loop {
            match self.rx.try_recv() {
                Ok(envelope) => return Some(envelope),
                Err(broadcast::error::TryRecvError::Lagged(n)) => self.record_lag(n),
                Err(_) => return None,
            }
        }
    }

    /// Wait for the next message that decodes as `T`, skipping undecodable ones
    pub async fn recv_message<T: DeserializeOwned>(&mut self) -> Option<T> {
        loop {
            let envelope = self.recv().await?;
            match decode_message(&envelope.payload) {
                Ok(message) => return Some(message),
                Err(e) => warn!("Skipping undecodable message on {}: {}", self.topic, e),
            }
        }
    }

    /// Wait for the next frame, skipping undecodable ones
    pub async fn recv_frame(&mut self) -> Option<Frame> {
        loop {
            let envelope = self.recv().await?;
            match frame_from_bytes(envelope.payload) {
                Ok(frame) => return Some(frame),
                Err(e) => warn!("Skipping undecodable frame: {}", e),
            }
        }
    }
}
