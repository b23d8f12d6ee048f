//! An in-process [`EventBus`] for tests that don't need a live Redis.

use async_trait::async_trait;
use pixelflow_core::PhotoRecord;
use tokio::sync::{broadcast, mpsc};

use crate::{BusResult, EventBus, Subscription};

pub struct InMemoryEventBus {
    tx: broadcast::Sender<PhotoRecord>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(256);
        Self { tx }
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, record: &PhotoRecord) -> BusResult<()> {
        // No subscribers is not an error: at-least-once delivery only
        // applies to subscribers that exist at publish time.
        let _ = self.tx.send(record.clone());
        Ok(())
    }

    async fn subscribe(&self) -> BusResult<Subscription> {
        let mut rx = self.tx.subscribe();
        let (fwd_tx, fwd_rx) = mpsc::channel(256);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(record) => {
                        if fwd_tx.send(record).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(Subscription { rx: fwd_rx })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_own_publishes() {
        let bus = InMemoryEventBus::new();
        let mut sub = bus.subscribe().await.unwrap();

        let record = PhotoRecord::new("p1", 1, "http://x/a.jpg");
        bus.publish(&record).await.unwrap();

        let received = sub.recv().await.unwrap();
        assert_eq!(received, record);
    }

    #[tokio::test]
    async fn multiple_subscribers_all_see_the_notification() {
        let bus = InMemoryEventBus::new();
        let mut sub_a = bus.subscribe().await.unwrap();
        let mut sub_b = bus.subscribe().await.unwrap();

        let record = PhotoRecord::new("p1", 1, "http://x/a.jpg");
        bus.publish(&record).await.unwrap();

        assert_eq!(sub_a.recv().await.unwrap(), record);
        assert_eq!(sub_b.recv().await.unwrap(), record);
    }
}
