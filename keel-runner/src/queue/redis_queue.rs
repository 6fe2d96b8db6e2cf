//! Redis queue backend
//!
//! Each queue is a set of lists:
//! - `keel::queue::<name>::ready` holds published payloads
//! - `keel::connection::<tag>::queue::<name>::unacked` holds payloads taken by
//!   one runner connection and not yet acknowledged
//! - `keel::queue::<name>::rejected` holds undecodable payloads
//!
//! Every runner connection registers its tag in `keel::connections` and keeps
//! `keel::connection::<tag>::heartbeat` alive with a TTL. Unacked payloads of a
//! connection whose heartbeat expired are moved back to ready by any other
//! runner.

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Delivery, JobQueue, QueueError};

const CONNECTIONS_KEY: &str = "keel::connections";

fn ready_key(queue: &str) -> String {
    format!("keel::queue::{}::ready", queue)
}

fn rejected_key(queue: &str) -> String {
    format!("keel::queue::{}::rejected", queue)
}

fn unacked_key(tag: &str, queue: &str) -> String {
    format!("keel::connection::{}::queue::{}::unacked", tag, queue)
}

fn heartbeat_key(tag: &str) -> String {
    format!("keel::connection::{}::heartbeat", tag)
}

/// Queue backed by Redis lists
pub struct RedisQueue {
    conn: MultiplexedConnection,
    tag: String,
    heartbeat_ttl: Duration,
}

impl RedisQueue {
    /// Connects and registers a new connection tag
    ///
    /// # Arguments
    /// * `url` - Redis connection string
    /// * `heartbeat_ttl` - How long the connection counts as alive after a heartbeat
    pub async fn connect(url: &str, heartbeat_ttl: Duration) -> Result<Self, QueueError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        let tag = format!("runner-{}", Uuid::new_v4().simple());

        let queue = Self {
            conn,
            tag,
            heartbeat_ttl,
        };
        queue.heartbeat().await?;

        info!("Connected to queue backend as {}", queue.tag);
        Ok(queue)
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    async fn is_alive(&self, tag: &str) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        let alive: bool = conn.exists(heartbeat_key(tag)).await?;
        Ok(alive)
    }
}

#[async_trait]
impl JobQueue for RedisQueue {
    async fn next(&self, queue: &str) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = conn
            .rpoplpush(ready_key(queue), unacked_key(&self.tag, queue))
            .await?;

        Ok(payload.map(|payload| Delivery {
            queue: queue.to_string(),
            payload,
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let removed: usize = conn
            .lrem(unacked_key(&self.tag, &delivery.queue), 1, &delivery.payload)
            .await?;
        if removed == 0 {
            warn!("Acked delivery was not in the unacked list of {}", delivery.queue);
        }
        Ok(())
    }

    async fn reject(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .lrem(unacked_key(&self.tag, &delivery.queue), 1, &delivery.payload)
            .ignore()
            .lpush(rejected_key(&delivery.queue), &delivery.payload)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: usize = conn.lpush(ready_key(queue), payload).await?;
        Ok(())
    }

    async fn heartbeat(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let ttl = self.heartbeat_ttl.as_secs().max(1);

        let _: () = redis::pipe()
            .cmd("SET")
            .arg(heartbeat_key(&self.tag))
            .arg(1)
            .arg("EX")
            .arg(ttl)
            .ignore()
            .sadd(CONNECTIONS_KEY, &self.tag)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn reclaim(&self, queues: &[&str]) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        let tags: Vec<String> = conn.smembers(CONNECTIONS_KEY).await?;

        let mut moved = 0;
        for tag in tags.iter().filter(|t| **t != self.tag) {
            if self.is_alive(tag).await? {
                continue;
            }

            for queue in queues {
                loop {
                    let payload: Option<String> = conn
                        .rpoplpush(unacked_key(tag, queue), ready_key(queue))
                        .await?;
                    if payload.is_none() {
                        break;
                    }
                    moved += 1;
                }
            }

            let _: usize = conn.srem(CONNECTIONS_KEY, tag).await?;
            debug!("Removed dead queue connection {}", tag);
        }

        Ok(moved)
    }
}
