//! In-memory queue used by tests

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use super::{Delivery, JobQueue, QueueError};

#[derive(Debug, Default)]
struct QueueState {
    /// Published at the front, consumed from the back
    ready: HashMap<String, VecDeque<String>>,
    unacked: Vec<Unacked>,
    rejected: HashMap<String, Vec<String>>,
}

#[derive(Debug)]
struct Unacked {
    delivery: Delivery,
    abandoned: bool,
}

/// Queue kept in process memory
#[derive(Debug, Default)]
pub struct MemoryQueue {
    state: Mutex<QueueState>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ready_len(&self, queue: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.ready.get(queue).map_or(0, VecDeque::len)
    }

    pub fn unacked_len(&self) -> usize {
        self.state.lock().unwrap().unacked.len()
    }

    pub fn rejected(&self, queue: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state.rejected.get(queue).cloned().unwrap_or_default()
    }

    /// Treats every current delivery as held by a dead consumer
    pub fn abandon_unacked(&self) {
        let mut state = self.state.lock().unwrap();
        for entry in &mut state.unacked {
            entry.abandoned = true;
        }
    }

    fn take_unacked(state: &mut QueueState, delivery: &Delivery) -> bool {
        match state.unacked.iter().position(|u| &u.delivery == delivery) {
            Some(index) => {
                state.unacked.remove(index);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn next(&self, queue: &str) -> Result<Option<Delivery>, QueueError> {
        let mut state = self.state.lock().unwrap();
        let payload = state.ready.get_mut(queue).and_then(VecDeque::pop_back);

        Ok(payload.map(|payload| {
            let delivery = Delivery {
                queue: queue.to_string(),
                payload,
            };
            state.unacked.push(Unacked {
                delivery: delivery.clone(),
                abandoned: false,
            });
            delivery
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        Self::take_unacked(&mut state, delivery);
        Ok(())
    }

    async fn reject(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        if Self::take_unacked(&mut state, delivery) {
            state
                .rejected
                .entry(delivery.queue.clone())
                .or_default()
                .push(delivery.payload.clone());
        }
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap();
        state
            .ready
            .entry(queue.to_string())
            .or_default()
            .push_front(payload.to_string());
        Ok(())
    }

    async fn heartbeat(&self) -> Result<(), QueueError> {
        Ok(())
    }

    async fn reclaim(&self, queues: &[&str]) -> Result<usize, QueueError> {
        let mut state = self.state.lock().unwrap();
        let (abandoned, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.unacked)
            .into_iter()
            .partition(|u| u.abandoned && queues.contains(&u.delivery.queue.as_str()));
        state.unacked = kept;

        let count = abandoned.len();
        for entry in abandoned {
            state
                .ready
                .entry(entry.delivery.queue)
                .or_default()
                .push_front(entry.delivery.payload);
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fifo_with_prefetch() {
        let queue = MemoryQueue::new();
        queue.publish("ansible", "first").await.unwrap();
        queue.publish("ansible", "second").await.unwrap();

        let delivery = queue.next("ansible").await.unwrap().unwrap();
        assert_eq!(delivery.payload, "first");
        assert_eq!(queue.unacked_len(), 1);

        queue.ack(&delivery).await.unwrap();
        assert_eq!(queue.unacked_len(), 0);
        assert_eq!(queue.ready_len("ansible"), 1);
        assert!(queue.next("terraform").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reject_moves_to_rejected() {
        let queue = MemoryQueue::new();
        queue.publish("terraform", "{not json").await.unwrap();

        let delivery = queue.next("terraform").await.unwrap().unwrap();
        queue.reject(&delivery).await.unwrap();

        assert_eq!(queue.rejected("terraform"), vec!["{not json"]);
        assert_eq!(queue.unacked_len(), 0);
    }

    #[tokio::test]
    async fn test_reclaim_only_abandoned() {
        let queue = MemoryQueue::new();
        queue.publish("ansible", "lost").await.unwrap();
        queue.next("ansible").await.unwrap().unwrap();
        queue.abandon_unacked();

        queue.publish("ansible", "live").await.unwrap();
        queue.next("ansible").await.unwrap().unwrap();

        assert_eq!(queue.reclaim(&["ansible"]).await.unwrap(), 1);
        assert_eq!(queue.unacked_len(), 1);
        assert_eq!(queue.next("ansible").await.unwrap().unwrap().payload, "lost");
    }
}
