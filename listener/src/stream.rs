use std::time::Duration;

use chrono::Utc;
use postgres_protocol::message::backend::Message;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeitwork_common::events::{Bus, ChangeKind};

use crate::args::Args;
use crate::connection::{ConnectConfig, ReplicationClient};
use crate::pgoutput::{
    self, decode_frame, encode_standby_status, LogicalMessage, RelationMap, ReplicationFrame,
};
use crate::ListenerError;

/// Microseconds between the Unix and Postgres (2000-01-01) epochs.
const PG_EPOCH_OFFSET_MICROS: i64 = 946_684_800_000_000;

const STANDBY_STATUS_INTERVAL: Duration = Duration::from_secs(10);

fn pg_clock_micros() -> i64 {
    Utc::now().timestamp_micros() - PG_EPOCH_OFFSET_MICROS
}

/// Decide what (if anything) a decoded message publishes, updating the
/// relation map on the way. Deletes are ignored: rows are only ever
/// soft-deleted, which arrives as an update.
fn apply(
    relations: &mut RelationMap,
    message: LogicalMessage,
) -> Option<(String, ChangeKind, Uuid)> {
    match message {
        LogicalMessage::Relation(relation) => {
            debug!(
                relation = %relation.name,
                columns = relation.columns.len(),
                "relation layout received"
            );
            relations.insert(relation);
            None
        }
        LogicalMessage::Insert { relation_id, new } => {
            publishable(relations, relation_id, &new, ChangeKind::Created)
        }
        LogicalMessage::Update {
            relation_id, new, ..
        } => publishable(relations, relation_id, &new, ChangeKind::Updated),
        LogicalMessage::Begin { .. }
        | LogicalMessage::Commit { .. }
        | LogicalMessage::Delete { .. }
        | LogicalMessage::Ignored => None,
    }
}

fn publishable(
    relations: &RelationMap,
    relation_id: u32,
    tuple: &pgoutput::TupleData,
    kind: ChangeKind,
) -> Option<(String, ChangeKind, Uuid)> {
    let Some((table, id)) = relations.id_column(relation_id, tuple) else {
        warn!(relation_id, "row change for a relation without a usable id column");
        return None;
    };
    match id.parse::<Uuid>() {
        Ok(id) => Some((table.to_string(), kind, id)),
        Err(_) => {
            warn!(%table, %id, "id column is not a uuid, skipping");
            None
        }
    }
}

/// Make sure the publication exists and covers exactly the configured tables.
async fn ensure_publication(
    pool: &PgPool,
    publication: &str,
    tables: &[String],
) -> Result<(), ListenerError> {
    for name in std::iter::once(&publication.to_string()).chain(tables.iter()) {
        if !name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(ListenerError::Config(format!(
                "invalid identifier {name:?} in publication configuration"
            )));
        }
    }
    let table_list = tables.join(", ");

    let exists: Option<(i32,)> =
        sqlx::query_as("SELECT 1 FROM pg_publication WHERE pubname = $1")
            .bind(publication)
            .fetch_optional(pool)
            .await?;

    if exists.is_some() {
        sqlx::query(&format!(
            "ALTER PUBLICATION \"{publication}\" SET TABLE {table_list}"
        ))
        .execute(pool)
        .await?;
    } else {
        sqlx::query(&format!(
            "CREATE PUBLICATION \"{publication}\" FOR TABLE {table_list}"
        ))
        .execute(pool)
        .await?;
    }

    info!(%publication, tables = %table_list, "publication is in place");
    Ok(())
}

/// Run the listener until shutdown or the first stream error. Errors
/// propagate so that the process exits non-zero and the supervisor restarts
/// it; the temporary slot is cleaned up by the server on disconnect and the
/// next run replays from a fresh consistent point.
pub async fn run(args: Args, shutdown: CancellationToken) -> Result<(), ListenerError> {
    let pool = zeitwork_common::db::connect(&args.database_url).await?;
    ensure_publication(&pool, &args.publication, &args.tables).await?;

    let bus = Bus::connect(&args.nats_url).await?;

    let config = ConnectConfig::from_url(&args.database_url)?;
    let mut client = ReplicationClient::connect(&config).await?;

    let flushed = client.identify_system().await?;
    info!(position = %crate::connection::format_lsn(flushed), "connected to the WAL sender");

    let start = client.create_temporary_slot(&args.slot).await?;
    client
        .start_replication(&args.slot, &args.publication, start)
        .await?;
    info!(slot = %args.slot, position = %crate::connection::format_lsn(start), "streaming");

    let mut relations = RelationMap::default();
    let mut applied = start;
    let mut status_interval = tokio::time::interval(STANDBY_STATUS_INTERVAL);
    status_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("listener draining");
                bus.flush().await?;
                return Ok(());
            }
            _ = status_interval.tick() => {
                client
                    .send_standby_status(encode_standby_status(applied, pg_clock_micros(), false))
                    .await?;
            }
            message = client.recv() => match message? {
                Message::CopyData(body) => {
                    match decode_frame(&body.into_bytes())? {
                        ReplicationFrame::XLogData { wal_end, payload, .. } => {
                            applied = applied.max(wal_end);
                            let decoded = pgoutput::decode(&payload)?;
                            if let Some((table, kind, id)) = apply(&mut relations, decoded) {
                                debug!(%table, %kind, %id, "publishing change");
                                bus.publish_change(&table, kind, id).await?;
                            }
                        }
                        ReplicationFrame::Keepalive { wal_end, reply_requested, .. } => {
                            applied = applied.max(wal_end);
                            if reply_requested {
                                client
                                    .send_standby_status(encode_standby_status(
                                        applied,
                                        pg_clock_micros(),
                                        false,
                                    ))
                                    .await?;
                            }
                        }
                    }
                }
                Message::CopyDone => {
                    return Err(ListenerError::Protocol("the server ended the stream".into()));
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::pgoutput::{ColumnValue, Relation, RelationColumn, TupleData};

    fn deployments_relation() -> Relation {
        Relation {
            id: 77,
            namespace: "public".into(),
            name: "deployments".into(),
            replica_identity: b'f',
            columns: vec![
                RelationColumn {
                    flags: 1,
                    name: "id".into(),
                    type_oid: 2950,
                    type_modifier: -1,
                },
                RelationColumn {
                    flags: 0,
                    name: "status".into(),
                    type_oid: 25,
                    type_modifier: -1,
                },
            ],
        }
    }

    fn row(id: &str, status: &str) -> TupleData {
        TupleData {
            columns: vec![
                ColumnValue::Text(id.into()),
                ColumnValue::Text(status.into()),
            ],
        }
    }

    #[test]
    fn insert_publishes_created() {
        let mut relations = RelationMap::default();
        relations.insert(deployments_relation());

        let id = Uuid::from_u128(9);
        let out = apply(
            &mut relations,
            LogicalMessage::Insert {
                relation_id: 77,
                new: row(&id.to_string(), "pending"),
            },
        );

        assert_eq!(out, Some(("deployments".into(), ChangeKind::Created, id)));
    }

    #[test]
    fn update_publishes_updated() {
        let mut relations = RelationMap::default();
        relations.insert(deployments_relation());

        let id = Uuid::from_u128(10);
        let out = apply(
            &mut relations,
            LogicalMessage::Update {
                relation_id: 77,
                old: None,
                new: row(&id.to_string(), "running"),
            },
        );

        assert_eq!(out, Some(("deployments".into(), ChangeKind::Updated, id)));
    }

    #[test]
    fn delete_is_ignored() {
        let mut relations = RelationMap::default();
        relations.insert(deployments_relation());

        let out = apply(
            &mut relations,
            LogicalMessage::Delete {
                relation_id: 77,
                old: row(&Uuid::from_u128(1).to_string(), "failed"),
            },
        );

        assert_eq!(out, None);
    }

    #[test]
    fn unknown_relation_is_skipped() {
        let mut relations = RelationMap::default();

        let out = apply(
            &mut relations,
            LogicalMessage::Insert {
                relation_id: 12345,
                new: row(&Uuid::from_u128(1).to_string(), "pending"),
            },
        );

        assert_eq!(out, None);
    }

    #[test]
    fn non_uuid_id_is_skipped() {
        let mut relations = RelationMap::default();
        relations.insert(deployments_relation());

        let out = apply(
            &mut relations,
            LogicalMessage::Insert {
                relation_id: 77,
                new: row("not-a-uuid", "pending"),
            },
        );

        assert_eq!(out, None);
    }

    #[test]
    fn replaying_the_same_change_yields_the_same_event() {
        let mut relations = RelationMap::default();
        relations.insert(deployments_relation());

        let id = Uuid::from_u128(3);
        let message = || LogicalMessage::Update {
            relation_id: 77,
            old: None,
            new: row(&id.to_string(), "running"),
        };

        let first = apply(&mut relations, message());
        let second = apply(&mut relations, message());
        assert_eq!(first, second);
    }
}
