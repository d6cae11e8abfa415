//! Topic-routed event bus connecting the scheduler, gateway, bridge, and
//! heartbeat driver. Subscribers receive only the topics they ask for;
//! publishing to a topic with no subscribers is a no-op.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use clawdbot_schema::{BusMessage, Topic};
use tokio::sync::{mpsc, Mutex};

struct Subscriptions {
    by_topic: HashMap<Topic, Vec<mpsc::Sender<BusMessage>>>,
}

#[derive(Clone)]
pub struct EventBus {
    capacity: usize,
    subs: Arc<Mutex<Subscriptions>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            subs: Arc::new(Mutex::new(Subscriptions {
                by_topic: HashMap::new(),
            })),
        }
    }

    /// Subscribe to one topic. Each subscriber gets its own channel.
    pub async fn subscribe(&self, topic: Topic) -> mpsc::Receiver<BusMessage> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let mut subs = self.subs.lock().await;
        subs.by_topic.entry(topic).or_default().push(tx);
        rx
    }

    pub fn publisher(&self) -> BusPublisher {
        BusPublisher {
            subs: self.subs.clone(),
        }
    }

    pub async fn publish(&self, msg: BusMessage) -> Result<()> {
        self.publisher().publish(msg).await
    }
}

/// Clonable publishing handle. Dead subscribers are pruned on publish.
#[derive(Clone)]
pub struct BusPublisher {
    subs: Arc<Mutex<Subscriptions>>,
}

impl BusPublisher {
    pub async fn publish(&self, msg: BusMessage) -> Result<()> {
        let topic = msg.topic();
        let mut subs = self.subs.lock().await;
        let Some(senders) = subs.by_topic.get_mut(&topic) else {
            return Ok(());
        };

        let mut dead = Vec::new();
        for (idx, tx) in senders.iter().enumerate() {
            if tx.send(msg.clone()).await.is_err() {
                dead.push(idx);
            }
        }
        for idx in dead.into_iter().rev() {
            senders.swap_remove(idx);
            tracing::debug!(?topic, "pruned closed bus subscriber");
        }
        Ok(())
    }
}
