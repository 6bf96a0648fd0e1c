//! Journal records.
//!
//! Every record is framed as:
//!
//! ```text
//! +----------+----------+----------+----------+----------+----------+
//! | magic    | type     | flags    | reserved | length   | crc32c   |
//! | 4 bytes  | 1 byte   | 1 byte   | 2 bytes  | 4 bytes  | 4 bytes  |
//! +----------+----------+----------+----------+----------+----------+
//! | sequence            | payload (JSON encoded AuditEntry)         |
//! | 8 bytes             | length bytes                              |
//! +---------------------+-------------------------------------------+
//! ```
//!
//! All integers are big-endian.

use crate::error::JournalError;
use crate::RECORD_HEADER_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Magic bytes opening every record: "SKJL".
pub const JOURNAL_MAGIC: [u8; 4] = *b"SKJL";

/// Maximum payload size of a single record (1 MiB).
pub const MAX_RECORD_SIZE: usize = 1024 * 1024;

/// Kind of state change a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum EntryType {
    /// The subject entered the machine at its initial state.
    Enter = 1,
    /// The subject moved from one state to another (or refreshed its state).
    Transition = 2,
}

impl TryFrom<u8> for EntryType {
    type Error = JournalError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(EntryType::Enter),
            2 => Ok(EntryType::Transition),
            other => Err(JournalError::InvalidHeader {
                offset: 0,
                reason: format!("unknown entry type: {}", other),
            }),
        }
    }
}

/// One audited state change of a subject attribute.
///
/// Entries are immutable once written. `from_state` is absent when the
/// subject first enters the machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    /// Subject type.
    pub model: String,
    /// Serialized subject primary key.
    pub model_pk: String,
    /// Machine name.
    pub machine: String,
    /// Storage name of the controlled attribute.
    pub attribute: String,
    /// Acting identity, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    /// Label of the event that caused the change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default)]
    pub from_state: Option<String>,
    pub to_state: String,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    /// Returns the record type this entry is framed with.
    pub fn entry_type(&self) -> EntryType {
        if self.from_state.is_some() {
            EntryType::Transition
        } else {
            EntryType::Enter
        }
    }

    /// Returns true if this entry belongs to the given subject attribute.
    pub fn concerns(&self, model: &str, model_pk: &str, attribute: Option<&str>) -> bool {
        self.model == model
            && self.model_pk == model_pk
            && attribute.map_or(true, |attr| self.attribute == attr)
    }
}

/// Decoded record header.
#[derive(Debug, Clone)]
pub struct RecordHeader {
    pub entry_type: EntryType,
    pub flags: u8,
    pub payload_len: u32,
    pub crc32c: u32,
    pub sequence: u64,
}

/// A framed journal record.
#[derive(Debug, Clone)]
pub struct JournalRecord {
    pub header: RecordHeader,
    pub payload: Bytes,
}

impl JournalRecord {
    /// Frames an audit entry under the given sequence number.
    pub fn from_entry(entry: &AuditEntry, sequence: u64) -> Result<Self, JournalError> {
        let payload = Bytes::from(serde_json::to_vec(entry)?);
        Ok(Self::new(entry.entry_type(), sequence, payload))
    }

    pub fn new(entry_type: EntryType, sequence: u64, payload: Bytes) -> Self {
        Self {
            header: RecordHeader {
                entry_type,
                flags: 0,
                payload_len: payload.len() as u32,
                crc32c: crc32c::crc32c(&payload),
                sequence,
            },
            payload,
        }
    }

    /// Deserializes the payload.
    pub fn entry(&self) -> Result<AuditEntry, JournalError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    pub fn encode(&self) -> Result<BytesMut, JournalError> {
        if self.payload.len() > MAX_RECORD_SIZE {
            return Err(JournalError::RecordTooLarge {
                size: self.payload.len(),
                max: MAX_RECORD_SIZE,
            });
        }

        let mut buf = BytesMut::with_capacity(self.disk_size());
        buf.put_slice(&JOURNAL_MAGIC);
        buf.put_u8(self.header.entry_type as u8);
        buf.put_u8(self.header.flags);
        buf.put_u16(0);
        buf.put_u32(self.header.payload_len);
        buf.put_u32(self.header.crc32c);
        buf.put_u64(self.header.sequence);
        buf.put_slice(&self.payload);
        Ok(buf)
    }

    /// Decodes the next record from the front of `buf`.
    ///
    /// Returns `Ok(None)` when `buf` holds less than a full record or only
    /// zero padding; the buffer is left untouched in that case.
    pub fn decode(buf: &mut BytesMut, offset: u64) -> Result<Option<Self>, JournalError> {
        if buf.len() < RECORD_HEADER_SIZE {
            return Ok(None);
        }

        let magic = [buf[0], buf[1], buf[2], buf[3]];
        if magic != JOURNAL_MAGIC {
            if magic == [0; 4] {
                return Ok(None);
            }
            return Err(JournalError::InvalidHeader {
                offset,
                reason: format!("invalid magic: {:?}", magic),
            });
        }

        let entry_type =
            EntryType::try_from(buf[4]).map_err(|_| JournalError::InvalidHeader {
                offset,
                reason: format!("unknown entry type: {}", buf[4]),
            })?;
        let flags = buf[5];
        let payload_len = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;
        let expected = u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]);
        let sequence = u64::from_be_bytes([
            buf[16], buf[17], buf[18], buf[19], buf[20], buf[21], buf[22], buf[23],
        ]);

        if payload_len > MAX_RECORD_SIZE {
            return Err(JournalError::RecordTooLarge {
                size: payload_len,
                max: MAX_RECORD_SIZE,
            });
        }
        if buf.len() < RECORD_HEADER_SIZE + payload_len {
            return Ok(None);
        }

        buf.advance(RECORD_HEADER_SIZE);
        let payload = buf.split_to(payload_len).freeze();

        let actual = crc32c::crc32c(&payload);
        if actual != expected {
            return Err(JournalError::ChecksumMismatch {
                offset,
                expected,
                actual,
            });
        }

        Ok(Some(Self {
            header: RecordHeader {
                entry_type,
                flags,
                payload_len: payload_len as u32,
                crc32c: expected,
                sequence,
            },
            payload,
        }))
    }

    /// Size of the framed record on disk.
    pub fn disk_size(&self) -> usize {
        RECORD_HEADER_SIZE + self.payload.len()
    }
}
