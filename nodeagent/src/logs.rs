//! Streams instance stdout/stderr into `vm_logs`.
//!
//! One task per running instance; lines gather in a bounded buffer that is
//! flushed at 100 lines or every five seconds, whichever comes first. Logs
//! are best-effort: a failed insert drops the batch and the stream goes on.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use sqlx::PgPool;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;
use zeitwork_common::ids::new_id;

use crate::runtime::LogLines;

pub const BATCH_CAPACITY: usize = 100;
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Buffered lines for one instance.
#[derive(Debug, Default)]
pub struct Batch {
    lines: Vec<String>,
}

impl Batch {
    pub fn push(&mut self, line: String) {
        self.lines.push(line);
    }

    pub fn is_full(&self) -> bool {
        self.lines.len() >= BATCH_CAPACITY
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn take(&mut self) -> Vec<String> {
        std::mem::take(&mut self.lines)
    }
}

async fn flush(pool: &PgPool, vm_id: Uuid, batch: &mut Batch) {
    if batch.is_empty() {
        return;
    }
    let lines = batch.take();

    let mut builder =
        sqlx::QueryBuilder::new("INSERT INTO vm_logs (id, vm_id, level, message) ");
    builder.push_values(&lines, |mut row, line| {
        row.push_bind(new_id())
            .push_bind(vm_id)
            .push_bind("info")
            .push_bind(line);
    });

    if let Err(error) = builder.build().execute(pool).await {
        warn!(
            vm = %vm_id,
            dropped = lines.len(),
            error = &error as &dyn std::error::Error,
            "dropping log batch"
        );
    }
}

/// Pump one instance's log stream into the database until the stream ends or
/// the token is cancelled. Flushes whatever is buffered on the way out.
pub async fn pump(pool: PgPool, vm_id: Uuid, mut lines: LogLines, cancel: CancellationToken) {
    let mut batch = Batch::default();
    let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => flush(&pool, vm_id, &mut batch).await,
            line = lines.next() => match line {
                Some(Ok(line)) => {
                    batch.push(line);
                    if batch.is_full() {
                        flush(&pool, vm_id, &mut batch).await;
                    }
                }
                Some(Err(error)) => {
                    debug!(vm = %vm_id, %error, "log stream error");
                }
                None => break,
            }
        }
    }

    flush(&pool, vm_id, &mut batch).await;
    debug!(vm = %vm_id, "log stream closed");
}

/// Tracks which instances already have a pump so the agent never attaches
/// two, and so `Stop` can cancel the stream before the runtime is told to
/// stop the instance.
#[derive(Clone, Default)]
pub struct StreamRegistry {
    active: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
}

impl StreamRegistry {
    /// Claim a slot for an instance. Returns the pump's token, or None if a
    /// pump is already attached.
    pub async fn register(&self, vm_id: Uuid) -> Option<CancellationToken> {
        let mut active = self.active.lock().await;
        if active.contains_key(&vm_id) {
            return None;
        }
        let token = CancellationToken::new();
        active.insert(vm_id, token.clone());
        Some(token)
    }

    pub async fn cancel(&self, vm_id: Uuid) {
        if let Some(token) = self.active.lock().await.remove(&vm_id) {
            token.cancel();
        }
    }

    pub async fn release(&self, vm_id: Uuid) {
        self.active.lock().await.remove(&vm_id);
    }

    pub async fn cancel_all(&self) {
        for (_, token) in self.active.lock().await.drain() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_fills_at_capacity() {
        let mut batch = Batch::default();
        for i in 0..BATCH_CAPACITY - 1 {
            batch.push(format!("line {i}"));
            assert!(!batch.is_full());
        }
        batch.push("last".into());
        assert!(batch.is_full());

        let taken = batch.take();
        assert_eq!(taken.len(), BATCH_CAPACITY);
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn registry_rejects_duplicate_streams() {
        let registry = StreamRegistry::default();
        let vm = Uuid::from_u128(1);

        let token = registry.register(vm).await;
        assert!(token.is_some());
        assert!(registry.register(vm).await.is_none());

        registry.cancel(vm).await;
        assert!(token.unwrap().is_cancelled());

        // slot is free again after cancel
        assert!(registry.register(vm).await.is_some());
    }

    #[tokio::test]
    async fn cancel_all_empties_the_registry() {
        let registry = StreamRegistry::default();
        let first = registry.register(Uuid::from_u128(1)).await.unwrap();
        let second = registry.register(Uuid::from_u128(2)).await.unwrap();

        registry.cancel_all().await;
        assert!(first.is_cancelled());
        assert!(second.is_cancelled());
        assert!(registry.register(Uuid::from_u128(1)).await.is_some());
    }
}
