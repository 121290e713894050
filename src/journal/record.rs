//! Journal record formats.
//!
//! Every record is little-endian, length-prefixed, typed and timestamped:
//! a 16-byte header (`length:u32`, two ASCII type bytes, two reserved
//! bytes, `timestamp:u64`) followed by type-specific fields. Transaction
//! records carry a stream of inner operation records with a smaller 8-byte
//! sub-header.

use bytes::BufMut;

use crate::error::{PersistitError, Result};

/// Fixed outer record header length.
pub const RECORD_HEADER: usize = 16;
/// Fixed inner (transaction op) record header length.
pub const INNER_HEADER: usize = 8;

pub const TYPE_JH: [u8; 2] = *b"JH";
pub const TYPE_JE: [u8; 2] = *b"JE";
pub const TYPE_IV: [u8; 2] = *b"IV";
pub const TYPE_IT: [u8; 2] = *b"IT";
pub const TYPE_PA: [u8; 2] = *b"PA";
pub const TYPE_PM: [u8; 2] = *b"PM";
pub const TYPE_TM: [u8; 2] = *b"TM";
pub const TYPE_TX: [u8; 2] = *b"TX";
pub const TYPE_CP: [u8; 2] = *b"CP";

pub const INNER_SR: [u8; 2] = *b"SR";
pub const INNER_DR: [u8; 2] = *b"DR";
pub const INNER_DT: [u8; 2] = *b"DT";
pub const INNER_D0: [u8; 2] = *b"D0";
pub const INNER_D1: [u8; 2] = *b"D1";

/// Journal format version stamped into every JH record.
pub const JOURNAL_VERSION: u32 = 2;

/// JH payload length (includes trailing CRC).
pub const JH_PAYLOAD: usize = 52;
/// Offset of the page image inside a PA record.
pub const PA_IMAGE_OFFSET: usize = RECORD_HEADER + 16;

/// Decoded outer header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordHeader {
    pub length: u32,
    pub kind: [u8; 2],
    pub timestamp: u64,
}

impl RecordHeader {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < RECORD_HEADER {
            return Err(PersistitError::Corrupt("record header truncated".into()));
        }
        let length = u32::from_le_bytes(buf[0..4].try_into().expect("4 bytes"));
        let kind = [buf[4], buf[5]];
        let timestamp = u64::from_le_bytes(buf[8..16].try_into().expect("8 bytes"));
        Ok(Self {
            length,
            kind,
            timestamp,
        })
    }

    pub fn is_valid_type(&self) -> bool {
        matches!(
            self.kind,
            TYPE_JH | TYPE_JE | TYPE_IV | TYPE_IT | TYPE_PA | TYPE_PM | TYPE_TM | TYPE_TX
                | TYPE_CP
        )
    }
}

pub fn put_header(out: &mut impl BufMut, length: usize, kind: [u8; 2], timestamp: u64) {
    out.put_u32_le(length as u32);
    out.put_slice(&kind);
    out.put_u16_le(0);
    out.put_u64_le(timestamp);
}

/// JH: journal/file header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JournalHeader {
    pub version: u32,
    pub block_size: u64,
    pub base_address: u64,
    pub current_address: u64,
    pub journal_created: u64,
    pub file_created: u64,
}

impl JournalHeader {
    pub fn encode(&self, timestamp: u64, out: &mut impl BufMut) {
        put_header(out, RECORD_HEADER + JH_PAYLOAD, TYPE_JH, timestamp);
        let mut payload = Vec::with_capacity(JH_PAYLOAD);
        payload.extend_from_slice(&self.version.to_le_bytes());
        payload.extend_from_slice(&0u32.to_le_bytes());
        payload.extend_from_slice(&self.block_size.to_le_bytes());
        payload.extend_from_slice(&self.base_address.to_le_bytes());
        payload.extend_from_slice(&self.current_address.to_le_bytes());
        payload.extend_from_slice(&self.journal_created.to_le_bytes());
        payload.extend_from_slice(&self.file_created.to_le_bytes());
        let crc = crc32fast::hash(&payload);
        payload.extend_from_slice(&crc.to_le_bytes());
        out.put_slice(&payload);
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() < JH_PAYLOAD {
            return Err(PersistitError::Corrupt("JH record truncated".into()));
        }
        let stored_crc =
            u32::from_le_bytes(payload[JH_PAYLOAD - 4..JH_PAYLOAD].try_into().expect("4 bytes"));
        let computed = crc32fast::hash(&payload[..JH_PAYLOAD - 4]);
        if stored_crc != computed {
            return Err(PersistitError::Corrupt("JH checksum mismatch".into()));
        }
        Ok(Self {
            version: u32::from_le_bytes(payload[0..4].try_into().expect("4 bytes")),
            block_size: u64::from_le_bytes(payload[8..16].try_into().expect("8 bytes")),
            base_address: u64::from_le_bytes(payload[16..24].try_into().expect("8 bytes")),
            current_address: u64::from_le_bytes(payload[24..32].try_into().expect("8 bytes")),
            journal_created: u64::from_le_bytes(payload[32..40].try_into().expect("8 bytes")),
            file_created: u64::from_le_bytes(payload[40..48].try_into().expect("8 bytes")),
        })
    }
}

/// JE: clean end-of-journal marker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JournalEnd {
    pub current_address: u64,
    pub base_address: u64,
    pub journal_created: u64,
}

impl JournalEnd {
    pub fn encode(&self, timestamp: u64, out: &mut impl BufMut) {
        put_header(out, RECORD_HEADER + 24, TYPE_JE, timestamp);
        out.put_u64_le(self.current_address);
        out.put_u64_le(self.base_address);
        out.put_u64_le(self.journal_created);
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() < 24 {
            return Err(PersistitError::Corrupt("JE record truncated".into()));
        }
        Ok(Self {
            current_address: u64::from_le_bytes(payload[0..8].try_into().expect("8 bytes")),
            base_address: u64::from_le_bytes(payload[8..16].try_into().expect("8 bytes")),
            journal_created: u64::from_le_bytes(payload[16..24].try_into().expect("8 bytes")),
        })
    }
}

/// IV: volume identity (handle → name, id).
pub fn encode_iv(handle: i32, id: u64, name: &str, timestamp: u64, out: &mut impl BufMut) {
    let length = RECORD_HEADER + 4 + 8 + 2 + name.len();
    put_header(out, length, TYPE_IV, timestamp);
    out.put_i32_le(handle);
    out.put_u64_le(id);
    out.put_u16_le(name.len() as u16);
    out.put_slice(name.as_bytes());
}

pub fn decode_iv(payload: &[u8]) -> Result<(i32, u64, String)> {
    if payload.len() < 14 {
        return Err(PersistitError::Corrupt("IV record truncated".into()));
    }
    let handle = i32::from_le_bytes(payload[0..4].try_into().expect("4 bytes"));
    let id = u64::from_le_bytes(payload[4..12].try_into().expect("8 bytes"));
    let name_len = u16::from_le_bytes(payload[12..14].try_into().expect("2 bytes")) as usize;
    if payload.len() < 14 + name_len {
        return Err(PersistitError::Corrupt("IV name truncated".into()));
    }
    let name = String::from_utf8(payload[14..14 + name_len].to_vec())
        .map_err(|_| PersistitError::Corrupt("IV name not utf-8".into()))?;
    Ok((handle, id, name))
}

/// IT: tree identity (handle → volume handle, tree name).
pub fn encode_it(
    handle: i32,
    volume_handle: i32,
    name: &str,
    timestamp: u64,
    out: &mut impl BufMut,
) {
    let length = RECORD_HEADER + 4 + 4 + 2 + name.len();
    put_header(out, length, TYPE_IT, timestamp);
    out.put_i32_le(handle);
    out.put_i32_le(volume_handle);
    out.put_u16_le(name.len() as u16);
    out.put_slice(name.as_bytes());
}

pub fn decode_it(payload: &[u8]) -> Result<(i32, i32, String)> {
    if payload.len() < 10 {
        return Err(PersistitError::Corrupt("IT record truncated".into()));
    }
    let handle = i32::from_le_bytes(payload[0..4].try_into().expect("4 bytes"));
    let volume_handle = i32::from_le_bytes(payload[4..8].try_into().expect("4 bytes"));
    let name_len = u16::from_le_bytes(payload[8..10].try_into().expect("2 bytes")) as usize;
    if payload.len() < 10 + name_len {
        return Err(PersistitError::Corrupt("IT name truncated".into()));
    }
    let name = String::from_utf8(payload[10..10 + name_len].to_vec())
        .map_err(|_| PersistitError::Corrupt("IT name not utf-8".into()))?;
    Ok((handle, volume_handle, name))
}

/// PA: page image.
pub fn encode_pa(
    volume_handle: i32,
    page_address: u64,
    timestamp: u64,
    image: &[u8],
    out: &mut impl BufMut,
) {
    let length = PA_IMAGE_OFFSET + image.len();
    put_header(out, length, TYPE_PA, timestamp);
    out.put_i32_le(volume_handle);
    out.put_u32_le(0);
    out.put_u64_le(page_address);
    out.put_slice(image);
}

pub fn decode_pa(payload: &[u8]) -> Result<(i32, u64, &[u8])> {
    if payload.len() < 16 {
        return Err(PersistitError::Corrupt("PA record truncated".into()));
    }
    let volume_handle = i32::from_le_bytes(payload[0..4].try_into().expect("4 bytes"));
    let page_address = u64::from_le_bytes(payload[8..16].try_into().expect("8 bytes"));
    Ok((volume_handle, page_address, &payload[16..]))
}

/// One PM snapshot entry: a live page-image version.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageMapEntry {
    pub volume_handle: i32,
    pub page_address: u64,
    pub timestamp: u64,
    pub journal_address: u64,
}

const PM_ENTRY: usize = 28;

pub fn encode_pm(entries: &[PageMapEntry], timestamp: u64, out: &mut impl BufMut) {
    let payload_len = 4 + entries.len() * PM_ENTRY + 4;
    put_header(out, RECORD_HEADER + payload_len, TYPE_PM, timestamp);
    let mut payload = Vec::with_capacity(payload_len);
    payload.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    for entry in entries {
        payload.extend_from_slice(&entry.volume_handle.to_le_bytes());
        payload.extend_from_slice(&entry.page_address.to_le_bytes());
        payload.extend_from_slice(&entry.timestamp.to_le_bytes());
        payload.extend_from_slice(&entry.journal_address.to_le_bytes());
    }
    let crc = crc32fast::hash(&payload);
    payload.extend_from_slice(&crc.to_le_bytes());
    out.put_slice(&payload);
}

pub fn decode_pm(payload: &[u8]) -> Result<Vec<PageMapEntry>> {
    decode_checked(payload, "PM")?;
    let count = u32::from_le_bytes(payload[0..4].try_into().expect("4 bytes")) as usize;
    if payload.len() < 4 + count * PM_ENTRY + 4 {
        return Err(PersistitError::Corrupt("PM record truncated".into()));
    }
    let mut entries = Vec::with_capacity(count);
    for i in 0..count {
        let base = 4 + i * PM_ENTRY;
        entries.push(PageMapEntry {
            volume_handle: i32::from_le_bytes(payload[base..base + 4].try_into().expect("4 bytes")),
            page_address: u64::from_le_bytes(
                payload[base + 4..base + 12].try_into().expect("8 bytes"),
            ),
            timestamp: u64::from_le_bytes(
                payload[base + 12..base + 20].try_into().expect("8 bytes"),
            ),
            journal_address: u64::from_le_bytes(
                payload[base + 20..base + 28].try_into().expect("8 bytes"),
            ),
        });
    }
    Ok(entries)
}

/// One TM snapshot entry: a live transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TxMapEntry {
    pub start_timestamp: u64,
    pub commit_timestamp: u64,
    pub journal_address: u64,
    pub last_record_address: u64,
}

const TM_ENTRY: usize = 32;

pub fn encode_tm(entries: &[TxMapEntry], timestamp: u64, out: &mut impl BufMut) {
    let payload_len = 4 + entries.len() * TM_ENTRY + 4;
    put_header(out, RECORD_HEADER + payload_len, TYPE_TM, timestamp);
    let mut payload = Vec::with_capacity(payload_len);
    payload.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    for entry in entries {
        payload.extend_from_slice(&entry.start_timestamp.to_le_bytes());
        payload.extend_from_slice(&entry.commit_timestamp.to_le_bytes());
        payload.extend_from_slice(&entry.journal_address.to_le_bytes());
        payload.extend_from_slice(&entry.last_record_address.to_le_bytes());
    }
    let crc = crc32fast::hash(&payload);
    payload.extend_from_slice(&crc.to_le_bytes());
    out.put_slice(&payload);
}

pub fn decode_tm(payload: &[u8]) -> Result<Vec<TxMapEntry>> {
    decode_checked(payload, "TM")?;
    let count = u32::from_le_bytes(payload[0..4].try_into().expect("4 bytes")) as usize;
    if payload.len() < 4 + count * TM_ENTRY + 4 {
        return Err(PersistitError::Corrupt("TM record truncated".into()));
    }
    let mut entries = Vec::with_capacity(count);
    for i in 0..count {
        let base = 4 + i * TM_ENTRY;
        entries.push(TxMapEntry {
            start_timestamp: u64::from_le_bytes(
                payload[base..base + 8].try_into().expect("8 bytes"),
            ),
            commit_timestamp: u64::from_le_bytes(
                payload[base + 8..base + 16].try_into().expect("8 bytes"),
            ),
            journal_address: u64::from_le_bytes(
                payload[base + 16..base + 24].try_into().expect("8 bytes"),
            ),
            last_record_address: u64::from_le_bytes(
                payload[base + 24..base + 32].try_into().expect("8 bytes"),
            ),
        });
    }
    Ok(entries)
}

fn decode_checked(payload: &[u8], what: &str) -> Result<()> {
    if payload.len() < 8 {
        return Err(PersistitError::Corrupt(format!("{what} record truncated")));
    }
    let stored =
        u32::from_le_bytes(payload[payload.len() - 4..].try_into().expect("4 bytes"));
    let computed = crc32fast::hash(&payload[..payload.len() - 4]);
    if stored != computed {
        return Err(PersistitError::Corrupt(format!("{what} checksum mismatch")));
    }
    Ok(())
}

/// TX: one transaction chunk. `timestamp` in the header is the start
/// timestamp; the payload opens with the commit timestamp and the address
/// of the previous chunk (0 for the first).
pub fn encode_tx(
    start_timestamp: u64,
    commit_timestamp: u64,
    backchain: u64,
    ops: &[u8],
    out: &mut impl BufMut,
) {
    let length = RECORD_HEADER + 16 + ops.len();
    put_header(out, length, TYPE_TX, start_timestamp);
    out.put_u64_le(commit_timestamp);
    out.put_u64_le(backchain);
    out.put_slice(ops);
}

pub fn decode_tx(payload: &[u8]) -> Result<(u64, u64, &[u8])> {
    if payload.len() < 16 {
        return Err(PersistitError::Corrupt("TX record truncated".into()));
    }
    let commit = u64::from_le_bytes(payload[0..8].try_into().expect("8 bytes"));
    let backchain = u64::from_le_bytes(payload[8..16].try_into().expect("8 bytes"));
    Ok((commit, backchain, &payload[16..]))
}

/// CP: checkpoint. The payload names the checkpoint timestamp explicitly
/// so each file's prologue can replicate the last checkpoint while the
/// header timestamp stays monotone; `header_timestamp` equals the
/// checkpoint timestamp on the original record.
pub fn encode_cp(
    header_timestamp: u64,
    checkpoint_timestamp: u64,
    system_time_millis: u64,
    base_address: u64,
    out: &mut impl BufMut,
) {
    put_header(out, RECORD_HEADER + 24, TYPE_CP, header_timestamp);
    out.put_u64_le(checkpoint_timestamp);
    out.put_u64_le(system_time_millis);
    out.put_u64_le(base_address);
}

/// Returns (checkpoint timestamp, system time millis, base address).
pub fn decode_cp(payload: &[u8]) -> Result<(u64, u64, u64)> {
    if payload.len() < 24 {
        return Err(PersistitError::Corrupt("CP record truncated".into()));
    }
    Ok((
        u64::from_le_bytes(payload[0..8].try_into().expect("8 bytes")),
        u64::from_le_bytes(payload[8..16].try_into().expect("8 bytes")),
        u64::from_le_bytes(payload[16..24].try_into().expect("8 bytes")),
    ))
}

/// Decoded inner transaction operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TxOp {
    /// Store `key` → stored-value bytes in a tree.
    Store {
        tree_handle: i32,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    /// Delete the inclusive key range.
    DeleteRange {
        tree_handle: i32,
        key_low: Vec<u8>,
        key_high: Vec<u8>,
    },
    /// Delete a whole tree.
    DeleteTree { tree_handle: i32 },
    /// Accumulator delta (`D0` narrow / `D1` wide form).
    Delta {
        tree_handle: i32,
        index: u8,
        accumulator_type: u8,
        value: i64,
    },
}

pub fn encode_sr(tree_handle: i32, key: &[u8], value: &[u8], out: &mut impl BufMut) {
    let length = INNER_HEADER + 4 + 2 + key.len() + value.len();
    out.put_u32_le(length as u32);
    out.put_slice(&INNER_SR);
    out.put_u16_le(0);
    out.put_i32_le(tree_handle);
    out.put_u16_le(key.len() as u16);
    out.put_slice(key);
    out.put_slice(value);
}

pub fn encode_dr(tree_handle: i32, key_low: &[u8], key_high: &[u8], out: &mut impl BufMut) {
    let length = INNER_HEADER + 4 + 2 + 2 + key_low.len() + key_high.len();
    out.put_u32_le(length as u32);
    out.put_slice(&INNER_DR);
    out.put_u16_le(0);
    out.put_i32_le(tree_handle);
    out.put_u16_le(key_low.len() as u16);
    out.put_u16_le(key_high.len() as u16);
    out.put_slice(key_low);
    out.put_slice(key_high);
}

pub fn encode_dt(tree_handle: i32, out: &mut impl BufMut) {
    out.put_u32_le((INNER_HEADER + 4) as u32);
    out.put_slice(&INNER_DT);
    out.put_u16_le(0);
    out.put_i32_le(tree_handle);
}

pub fn encode_delta(
    tree_handle: i32,
    index: u8,
    accumulator_type: u8,
    value: i64,
    out: &mut impl BufMut,
) {
    if let Ok(narrow) = i32::try_from(value) {
        out.put_u32_le((INNER_HEADER + 4 + 1 + 1 + 4) as u32);
        out.put_slice(&INNER_D0);
        out.put_u16_le(0);
        out.put_i32_le(tree_handle);
        out.put_u8(index);
        out.put_u8(accumulator_type);
        out.put_i32_le(narrow);
    } else {
        out.put_u32_le((INNER_HEADER + 4 + 1 + 1 + 8) as u32);
        out.put_slice(&INNER_D1);
        out.put_u16_le(0);
        out.put_i32_le(tree_handle);
        out.put_u8(index);
        out.put_u8(accumulator_type);
        out.put_i64_le(value);
    }
}

/// Iterates decoded inner operations from a TX payload.
pub fn decode_ops(mut ops: &[u8]) -> Result<Vec<TxOp>> {
    let mut out = Vec::new();
    while !ops.is_empty() {
        if ops.len() < INNER_HEADER {
            return Err(PersistitError::Corrupt("inner record truncated".into()));
        }
        let length = u32::from_le_bytes(ops[0..4].try_into().expect("4 bytes")) as usize;
        if length < INNER_HEADER || length > ops.len() {
            return Err(PersistitError::Corrupt("inner record length invalid".into()));
        }
        let kind = [ops[4], ops[5]];
        let body = &ops[INNER_HEADER..length];
        match kind {
            INNER_SR => {
                if body.len() < 6 {
                    return Err(PersistitError::Corrupt("SR record truncated".into()));
                }
                let tree_handle = i32::from_le_bytes(body[0..4].try_into().expect("4 bytes"));
                let key_len =
                    u16::from_le_bytes(body[4..6].try_into().expect("2 bytes")) as usize;
                if body.len() < 6 + key_len {
                    return Err(PersistitError::Corrupt("SR key truncated".into()));
                }
                out.push(TxOp::Store {
                    tree_handle,
                    key: body[6..6 + key_len].to_vec(),
                    value: body[6 + key_len..].to_vec(),
                });
            }
            INNER_DR => {
                if body.len() < 8 {
                    return Err(PersistitError::Corrupt("DR record truncated".into()));
                }
                let tree_handle = i32::from_le_bytes(body[0..4].try_into().expect("4 bytes"));
                let low_len = u16::from_le_bytes(body[4..6].try_into().expect("2 bytes")) as usize;
                let high_len = u16::from_le_bytes(body[6..8].try_into().expect("2 bytes")) as usize;
                if body.len() < 8 + low_len + high_len {
                    return Err(PersistitError::Corrupt("DR keys truncated".into()));
                }
                out.push(TxOp::DeleteRange {
                    tree_handle,
                    key_low: body[8..8 + low_len].to_vec(),
                    key_high: body[8 + low_len..8 + low_len + high_len].to_vec(),
                });
            }
            INNER_DT => {
                if body.len() < 4 {
                    return Err(PersistitError::Corrupt("DT record truncated".into()));
                }
                out.push(TxOp::DeleteTree {
                    tree_handle: i32::from_le_bytes(body[0..4].try_into().expect("4 bytes")),
                });
            }
            INNER_D0 => {
                if body.len() < 10 {
                    return Err(PersistitError::Corrupt("D0 record truncated".into()));
                }
                out.push(TxOp::Delta {
                    tree_handle: i32::from_le_bytes(body[0..4].try_into().expect("4 bytes")),
                    index: body[4],
                    accumulator_type: body[5],
                    value: i32::from_le_bytes(body[6..10].try_into().expect("4 bytes")) as i64,
                });
            }
            INNER_D1 => {
                if body.len() < 14 {
                    return Err(PersistitError::Corrupt("D1 record truncated".into()));
                }
                out.push(TxOp::Delta {
                    tree_handle: i32::from_le_bytes(body[0..4].try_into().expect("4 bytes")),
                    index: body[4],
                    accumulator_type: body[5],
                    value: i64::from_le_bytes(body[6..14].try_into().expect("8 bytes")),
                });
            }
            _ => {
                return Err(PersistitError::Corrupt("unknown inner record type".into()));
            }
        }
        ops = &ops[length..];
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn journal_header_roundtrip() -> Result<()> {
        let header = JournalHeader {
            version: JOURNAL_VERSION,
            block_size: 1 << 20,
            base_address: 0,
            current_address: 1234,
            journal_created: 111,
            file_created: 222,
        };
        let mut buf = BytesMut::new();
        header.encode(9, &mut buf);
        let outer = RecordHeader::decode(&buf)?;
        assert_eq!(outer.kind, TYPE_JH);
        assert_eq!(outer.timestamp, 9);
        assert_eq!(outer.length as usize, buf.len());
        let decoded = JournalHeader::decode(&buf[RECORD_HEADER..])?;
        assert_eq!(decoded, header);
        Ok(())
    }

    #[test]
    fn corrupted_journal_header_fails_crc() {
        let header = JournalHeader {
            version: JOURNAL_VERSION,
            block_size: 1 << 20,
            base_address: 0,
            current_address: 0,
            journal_created: 1,
            file_created: 1,
        };
        let mut buf = BytesMut::new();
        header.encode(1, &mut buf);
        buf[RECORD_HEADER + 2] ^= 0xFF;
        assert!(JournalHeader::decode(&buf[RECORD_HEADER..]).is_err());
    }

    #[test]
    fn pm_tm_snapshots_roundtrip() -> Result<()> {
        let pages = vec![
            PageMapEntry {
                volume_handle: 1,
                page_address: 7,
                timestamp: 5,
                journal_address: 100,
            },
            PageMapEntry {
                volume_handle: 1,
                page_address: 9,
                timestamp: 6,
                journal_address: 160,
            },
        ];
        let mut buf = BytesMut::new();
        encode_pm(&pages, 6, &mut buf);
        assert_eq!(decode_pm(&buf[RECORD_HEADER..])?, pages);

        let txs = vec![TxMapEntry {
            start_timestamp: 10,
            commit_timestamp: 12,
            journal_address: 300,
            last_record_address: 300,
        }];
        let mut buf = BytesMut::new();
        encode_tm(&txs, 12, &mut buf);
        assert_eq!(decode_tm(&buf[RECORD_HEADER..])?, txs);
        Ok(())
    }

    #[test]
    fn snapshot_crc_detects_damage() {
        let pages = vec![PageMapEntry {
            volume_handle: 2,
            page_address: 3,
            timestamp: 4,
            journal_address: 5,
        }];
        let mut buf = BytesMut::new();
        encode_pm(&pages, 4, &mut buf);
        buf[RECORD_HEADER + 6] ^= 0x01;
        assert!(decode_pm(&buf[RECORD_HEADER..]).is_err());
    }

    #[test]
    fn tx_with_ops_roundtrip() -> Result<()> {
        let mut ops = BytesMut::new();
        encode_sr(3, b"key", b"value", &mut ops);
        encode_dr(3, b"a", b"z", &mut ops);
        encode_dt(4, &mut ops);
        encode_delta(3, 1, 0, 5, &mut ops);
        encode_delta(3, 2, 1, i64::MAX / 3, &mut ops);

        let mut buf = BytesMut::new();
        encode_tx(50, 60, 0, &ops, &mut buf);
        let header = RecordHeader::decode(&buf)?;
        assert_eq!(header.kind, TYPE_TX);
        assert_eq!(header.timestamp, 50);
        let (commit, backchain, inner) = decode_tx(&buf[RECORD_HEADER..])?;
        assert_eq!(commit, 60);
        assert_eq!(backchain, 0);
        let decoded = decode_ops(inner)?;
        assert_eq!(decoded.len(), 5);
        assert_eq!(
            decoded[0],
            TxOp::Store {
                tree_handle: 3,
                key: b"key".to_vec(),
                value: b"value".to_vec()
            }
        );
        assert_eq!(
            decoded[4],
            TxOp::Delta {
                tree_handle: 3,
                index: 2,
                accumulator_type: 1,
                value: i64::MAX / 3
            }
        );
        Ok(())
    }

    #[test]
    fn pa_image_offset_is_stable() {
        let mut buf = BytesMut::new();
        let image = vec![0xABu8; 64];
        encode_pa(7, 21, 33, &image, &mut buf);
        assert_eq!(&buf[PA_IMAGE_OFFSET..], &image[..]);
        let (handle, address, payload) = decode_pa(&buf[RECORD_HEADER..]).expect("decode");
        assert_eq!((handle, address), (7, 21));
        assert_eq!(payload, &image[..]);
    }
}
