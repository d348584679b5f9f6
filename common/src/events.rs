use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("failed to connect to the message bus: {0}")]
    Connect(#[from] async_nats::ConnectError),
    #[error("failed to publish: {0}")]
    Publish(#[from] async_nats::PublishError),
    #[error("failed to subscribe: {0}")]
    Subscribe(#[from] async_nats::SubscribeError),
    #[error("failed to flush: {0}")]
    Flush(#[from] async_nats::client::FlushError),
    #[error("malformed event payload: {0}")]
    Payload(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Updated,
}

/// Payload of every change event: just the row id. Consumers re-read the row,
/// so replayed or stale events are harmless.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ChangePayload {
    pub id: Uuid,
}

/// Subject for a row change, e.g. `deployments` + `Created` → `deployment.created`.
pub fn change_subject(table: &str, kind: ChangeKind) -> String {
    let entity = table.strip_suffix('s').unwrap_or(table);
    format!("{entity}.{kind}")
}

/// Thin wrapper around the NATS client. Delivery is at-least-once and ordered
/// per table only; every consumer must be idempotent.
#[derive(Clone)]
pub struct Bus {
    client: async_nats::Client,
}

impl Bus {
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let client = async_nats::connect(url).await?;
        Ok(Self { client })
    }

    pub async fn publish_change(
        &self,
        table: &str,
        kind: ChangeKind,
        id: Uuid,
    ) -> Result<(), BusError> {
        let subject = change_subject(table, kind);
        let payload = serde_json::to_vec(&ChangePayload { id })?;
        self.client
            .publish(subject, Bytes::from(payload))
            .await?;
        Ok(())
    }

    /// Competing-consumer subscription: every message goes to exactly one
    /// member of `group`.
    pub async fn queue_subscribe(
        &self,
        subject: &str,
        group: &str,
    ) -> Result<async_nats::Subscriber, BusError> {
        let subscriber = self
            .client
            .queue_subscribe(subject.to_string(), group.to_string())
            .await?;
        Ok(subscriber)
    }

    pub async fn flush(&self) -> Result<(), BusError> {
        self.client.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subjects_are_singular() {
        assert_eq!(change_subject("deployments", ChangeKind::Created), "deployment.created");
        assert_eq!(change_subject("vms", ChangeKind::Updated), "vm.updated");
        assert_eq!(change_subject("builds", ChangeKind::Updated), "build.updated");
    }

    #[test]
    fn payload_round_trips_as_json() {
        let id = Uuid::from_u128(42);
        let bytes = serde_json::to_vec(&ChangePayload { id }).unwrap();
        let back: ChangePayload = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.id, id);
    }
}
