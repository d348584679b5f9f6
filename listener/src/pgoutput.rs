//! Decoder for the `pgoutput` logical-replication plugin and for the
//! replication frames (XLogData / keepalive / standby status) that carry it.
//!
//! Protocol version 1 only; tuple values arrive in text format because the
//! published tables use `REPLICA IDENTITY FULL`.

use std::collections::HashMap;

use bytes::BufMut;
use bytes::BytesMut;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("message truncated")]
    Truncated,
    #[error("string is not valid utf-8")]
    Utf8,
    #[error("unknown message tag {0:#04x}")]
    UnknownTag(u8),
    #[error("unknown tuple column tag {0:#04x}")]
    UnknownColumnTag(u8),
}

/// One message from the pgoutput stream.
#[derive(Debug, Clone, PartialEq)]
pub enum LogicalMessage {
    Begin {
        final_lsn: u64,
        commit_timestamp: i64,
        xid: u32,
    },
    Commit {
        commit_lsn: u64,
        end_lsn: u64,
    },
    Relation(Relation),
    Insert {
        relation_id: u32,
        new: TupleData,
    },
    Update {
        relation_id: u32,
        old: Option<TupleData>,
        new: TupleData,
    },
    Delete {
        relation_id: u32,
        old: TupleData,
    },
    /// Origin, Type and Truncate are received and skipped.
    Ignored,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Relation {
    pub id: u32,
    pub namespace: String,
    pub name: String,
    pub replica_identity: u8,
    pub columns: Vec<RelationColumn>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelationColumn {
    pub flags: u8,
    pub name: String,
    pub type_oid: u32,
    pub type_modifier: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Null,
    UnchangedToast,
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TupleData {
    pub columns: Vec<ColumnValue>,
}

/// Relation-id → column layout, maintained from `Relation` messages. The
/// server always sends the `Relation` for a table before the first row change
/// that references it (and again whenever the layout changes).
#[derive(Debug, Default)]
pub struct RelationMap {
    relations: HashMap<u32, Relation>,
}

impl RelationMap {
    pub fn insert(&mut self, relation: Relation) {
        self.relations.insert(relation.id, relation);
    }

    pub fn get(&self, id: u32) -> Option<&Relation> {
        self.relations.get(&id)
    }

    /// The text value of the `id` column of a row, if the relation is known
    /// and the column is present and non-null.
    pub fn id_column(&self, relation_id: u32, tuple: &TupleData) -> Option<(&str, String)> {
        let relation = self.relations.get(&relation_id)?;
        let position = relation.columns.iter().position(|c| c.name == "id")?;
        match tuple.columns.get(position)? {
            ColumnValue::Text(value) => Some((relation.name.as_str(), value.clone())),
            _ => None,
        }
    }
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.buf.len() < n {
            return Err(DecodeError::Truncated);
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn i32(&mut self) -> Result<i32, DecodeError> {
        Ok(i32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn i64(&mut self) -> Result<i64, DecodeError> {
        Ok(i64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn cstr(&mut self) -> Result<String, DecodeError> {
        let end = self
            .buf
            .iter()
            .position(|&b| b == 0)
            .ok_or(DecodeError::Truncated)?;
        let raw = self.take(end)?;
        self.take(1)?;
        String::from_utf8(raw.to_vec()).map_err(|_| DecodeError::Utf8)
    }
}

/// Decode one pgoutput message (the payload of an XLogData frame).
pub fn decode(payload: &[u8]) -> Result<LogicalMessage, DecodeError> {
    let mut r = Reader::new(payload);
    match r.u8()? {
        b'B' => Ok(LogicalMessage::Begin {
            final_lsn: r.u64()?,
            commit_timestamp: r.i64()?,
            xid: r.u32()?,
        }),
        b'C' => {
            let _flags = r.u8()?;
            Ok(LogicalMessage::Commit {
                commit_lsn: r.u64()?,
                end_lsn: {
                    let end = r.u64()?;
                    let _timestamp = r.i64()?;
                    end
                },
            })
        }
        b'R' => {
            let id = r.u32()?;
            let namespace = r.cstr()?;
            let name = r.cstr()?;
            let replica_identity = r.u8()?;
            let count = r.u16()?;
            let mut columns = Vec::with_capacity(count as usize);
            for _ in 0..count {
                columns.push(RelationColumn {
                    flags: r.u8()?,
                    name: r.cstr()?,
                    type_oid: r.u32()?,
                    type_modifier: r.i32()?,
                });
            }
            Ok(LogicalMessage::Relation(Relation {
                id,
                namespace,
                name,
                replica_identity,
                columns,
            }))
        }
        b'I' => {
            let relation_id = r.u32()?;
            match r.u8()? {
                b'N' => Ok(LogicalMessage::Insert {
                    relation_id,
                    new: decode_tuple(&mut r)?,
                }),
                tag => Err(DecodeError::UnknownTag(tag)),
            }
        }
        b'U' => {
            let relation_id = r.u32()?;
            let mut old = None;
            let tag = r.u8()?;
            let tag = match tag {
                b'K' | b'O' => {
                    old = Some(decode_tuple(&mut r)?);
                    r.u8()?
                }
                other => other,
            };
            match tag {
                b'N' => Ok(LogicalMessage::Update {
                    relation_id,
                    old,
                    new: decode_tuple(&mut r)?,
                }),
                tag => Err(DecodeError::UnknownTag(tag)),
            }
        }
        b'D' => {
            let relation_id = r.u32()?;
            match r.u8()? {
                b'K' | b'O' => Ok(LogicalMessage::Delete {
                    relation_id,
                    old: decode_tuple(&mut r)?,
                }),
                tag => Err(DecodeError::UnknownTag(tag)),
            }
        }
        b'O' | b'Y' | b'T' => Ok(LogicalMessage::Ignored),
        tag => Err(DecodeError::UnknownTag(tag)),
    }
}

fn decode_tuple(r: &mut Reader<'_>) -> Result<TupleData, DecodeError> {
    let count = r.u16()?;
    let mut columns = Vec::with_capacity(count as usize);
    for _ in 0..count {
        match r.u8()? {
            b'n' => columns.push(ColumnValue::Null),
            b'u' => columns.push(ColumnValue::UnchangedToast),
            b't' => {
                let len = r.u32()? as usize;
                let raw = r.take(len)?;
                columns.push(ColumnValue::Text(
                    String::from_utf8(raw.to_vec()).map_err(|_| DecodeError::Utf8)?,
                ));
            }
            tag => return Err(DecodeError::UnknownColumnTag(tag)),
        }
    }
    Ok(TupleData { columns })
}

/// One frame of the COPY-both replication stream (the payload of a CopyData
/// message from the server).
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicationFrame {
    XLogData {
        wal_start: u64,
        wal_end: u64,
        timestamp: i64,
        payload: Vec<u8>,
    },
    Keepalive {
        wal_end: u64,
        timestamp: i64,
        reply_requested: bool,
    },
}

pub fn decode_frame(data: &[u8]) -> Result<ReplicationFrame, DecodeError> {
    let mut r = Reader::new(data);
    match r.u8()? {
        b'w' => {
            let wal_start = r.u64()?;
            let wal_end = r.u64()?;
            let timestamp = r.i64()?;
            Ok(ReplicationFrame::XLogData {
                wal_start,
                wal_end,
                timestamp,
                payload: r.buf.to_vec(),
            })
        }
        b'k' => Ok(ReplicationFrame::Keepalive {
            wal_end: r.u64()?,
            timestamp: r.i64()?,
            reply_requested: r.u8()? != 0,
        }),
        tag => Err(DecodeError::UnknownTag(tag)),
    }
}

/// Encode a standby status update acknowledging everything up to `lsn`.
pub fn encode_standby_status(lsn: u64, clock_micros: i64, reply_requested: bool) -> BytesMut {
    let mut buf = BytesMut::with_capacity(34);
    buf.put_u8(b'r');
    buf.put_u64(lsn);
    buf.put_u64(lsn);
    buf.put_u64(lsn);
    buf.put_i64(clock_micros);
    buf.put_u8(u8::from(reply_requested));
    buf
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn cstr(s: &str) -> Vec<u8> {
        let mut v = s.as_bytes().to_vec();
        v.push(0);
        v
    }

    fn text_column(s: &str) -> Vec<u8> {
        let mut v = vec![b't'];
        v.extend_from_slice(&(s.len() as u32).to_be_bytes());
        v.extend_from_slice(s.as_bytes());
        v
    }

    #[test]
    fn decodes_begin() {
        let mut buf = vec![b'B'];
        buf.extend_from_slice(&0x0000_0001_0000_0a00u64.to_be_bytes());
        buf.extend_from_slice(&715_000_123i64.to_be_bytes());
        buf.extend_from_slice(&42u32.to_be_bytes());

        assert_eq!(
            decode(&buf).unwrap(),
            LogicalMessage::Begin {
                final_lsn: 0x0000_0001_0000_0a00,
                commit_timestamp: 715_000_123,
                xid: 42
            }
        );
    }

    #[test]
    fn decodes_commit() {
        let mut buf = vec![b'C', 0];
        buf.extend_from_slice(&10u64.to_be_bytes());
        buf.extend_from_slice(&20u64.to_be_bytes());
        buf.extend_from_slice(&30i64.to_be_bytes());

        assert_eq!(
            decode(&buf).unwrap(),
            LogicalMessage::Commit {
                commit_lsn: 10,
                end_lsn: 20
            }
        );
    }

    fn relation_message() -> Vec<u8> {
        let mut buf = vec![b'R'];
        buf.extend_from_slice(&16385u32.to_be_bytes());
        buf.extend_from_slice(&cstr("public"));
        buf.extend_from_slice(&cstr("deployments"));
        buf.push(b'f');
        buf.extend_from_slice(&2u16.to_be_bytes());
        // column: id
        buf.push(1);
        buf.extend_from_slice(&cstr("id"));
        buf.extend_from_slice(&2950u32.to_be_bytes()); // uuid oid
        buf.extend_from_slice(&(-1i32).to_be_bytes());
        // column: status
        buf.push(0);
        buf.extend_from_slice(&cstr("status"));
        buf.extend_from_slice(&25u32.to_be_bytes()); // text oid
        buf.extend_from_slice(&(-1i32).to_be_bytes());
        buf
    }

    #[test]
    fn decodes_relation() {
        let message = decode(&relation_message()).unwrap();

        let LogicalMessage::Relation(relation) = message else {
            panic!("expected a relation, got {message:?}");
        };
        assert_eq!(relation.id, 16385);
        assert_eq!(relation.namespace, "public");
        assert_eq!(relation.name, "deployments");
        assert_eq!(relation.replica_identity, b'f');
        assert_eq!(relation.columns.len(), 2);
        assert_eq!(relation.columns[0].name, "id");
        assert_eq!(relation.columns[0].type_oid, 2950);
        assert_eq!(relation.columns[1].name, "status");
    }

    #[test]
    fn decodes_insert_and_extracts_id() {
        let mut buf = vec![b'I'];
        buf.extend_from_slice(&16385u32.to_be_bytes());
        buf.push(b'N');
        buf.extend_from_slice(&2u16.to_be_bytes());
        buf.extend_from_slice(&text_column("0188a914-5d6e-7c7a-b4a2-47e6b26a11fe"));
        buf.extend_from_slice(&text_column("pending"));

        let mut relations = RelationMap::default();
        let LogicalMessage::Relation(relation) = decode(&relation_message()).unwrap() else {
            unreachable!()
        };
        relations.insert(relation);

        let LogicalMessage::Insert { relation_id, new } = decode(&buf).unwrap() else {
            panic!("expected an insert");
        };
        let (table, id) = relations.id_column(relation_id, &new).unwrap();
        assert_eq!(table, "deployments");
        assert_eq!(id, "0188a914-5d6e-7c7a-b4a2-47e6b26a11fe");
    }

    #[test]
    fn decodes_update_with_old_tuple() {
        let mut buf = vec![b'U'];
        buf.extend_from_slice(&16385u32.to_be_bytes());
        buf.push(b'O');
        buf.extend_from_slice(&1u16.to_be_bytes());
        buf.extend_from_slice(&text_column("before"));
        buf.push(b'N');
        buf.extend_from_slice(&1u16.to_be_bytes());
        buf.extend_from_slice(&text_column("after"));

        assert_eq!(
            decode(&buf).unwrap(),
            LogicalMessage::Update {
                relation_id: 16385,
                old: Some(TupleData {
                    columns: vec![ColumnValue::Text("before".into())]
                }),
                new: TupleData {
                    columns: vec![ColumnValue::Text("after".into())]
                },
            }
        );
    }

    #[test]
    fn decodes_null_and_toast_columns() {
        let mut buf = vec![b'I'];
        buf.extend_from_slice(&7u32.to_be_bytes());
        buf.push(b'N');
        buf.extend_from_slice(&3u16.to_be_bytes());
        buf.push(b'n');
        buf.push(b'u');
        buf.extend_from_slice(&text_column("x"));

        let LogicalMessage::Insert { new, .. } = decode(&buf).unwrap() else {
            panic!("expected an insert");
        };
        assert_eq!(
            new.columns,
            vec![
                ColumnValue::Null,
                ColumnValue::UnchangedToast,
                ColumnValue::Text("x".into())
            ]
        );
    }

    #[test]
    fn truncated_messages_do_not_panic() {
        let mut buf = vec![b'B'];
        buf.extend_from_slice(&1u64.to_be_bytes());
        assert_eq!(decode(&buf), Err(DecodeError::Truncated));

        assert_eq!(decode(&[b'I', 0, 0]), Err(DecodeError::Truncated));
        assert_eq!(decode(&[]), Err(DecodeError::Truncated));
    }

    #[test]
    fn origin_type_truncate_are_skipped() {
        assert_eq!(decode(&[b'O', 1, 2, 3]).unwrap(), LogicalMessage::Ignored);
        assert_eq!(decode(&[b'Y']).unwrap(), LogicalMessage::Ignored);
        assert_eq!(decode(&[b'T', 9]).unwrap(), LogicalMessage::Ignored);
    }

    #[test]
    fn decodes_xlogdata_frame() {
        let mut buf = vec![b'w'];
        buf.extend_from_slice(&100u64.to_be_bytes());
        buf.extend_from_slice(&200u64.to_be_bytes());
        buf.extend_from_slice(&300i64.to_be_bytes());
        buf.extend_from_slice(b"payload");

        assert_eq!(
            decode_frame(&buf).unwrap(),
            ReplicationFrame::XLogData {
                wal_start: 100,
                wal_end: 200,
                timestamp: 300,
                payload: b"payload".to_vec(),
            }
        );
    }

    #[test]
    fn decodes_keepalive_frame() {
        let mut buf = vec![b'k'];
        buf.extend_from_slice(&555u64.to_be_bytes());
        buf.extend_from_slice(&666i64.to_be_bytes());
        buf.push(1);

        assert_eq!(
            decode_frame(&buf).unwrap(),
            ReplicationFrame::Keepalive {
                wal_end: 555,
                timestamp: 666,
                reply_requested: true,
            }
        );
    }

    #[test]
    fn standby_status_layout() {
        let buf = encode_standby_status(0x0102_0304_0506_0708, 99, true);

        assert_eq!(buf.len(), 34);
        assert_eq!(buf[0], b'r');
        // written, flushed and applied all carry the same position
        assert_eq!(&buf[1..9], &0x0102_0304_0506_0708u64.to_be_bytes());
        assert_eq!(&buf[9..17], &0x0102_0304_0506_0708u64.to_be_bytes());
        assert_eq!(&buf[17..25], &0x0102_0304_0506_0708u64.to_be_bytes());
        assert_eq!(&buf[25..33], &99i64.to_be_bytes());
        assert_eq!(buf[33], 1);
    }
}
