//! Byte layout of sled entries.
//!
//! Keys are `partition_key 0x00 row_key` so that sled's byte order is the same as
//! [`EntityKey`] order and one partition is one key prefix. Values are the BSON
//! bytes of the record body.

use bson::{Document, de::deserialize_from_slice, ser::serialize_to_vec};

use dblayer_core::entity::{EntityKey, Record};

use crate::error::{Result, SledError};

const SEPARATOR: u8 = 0;

/// Returns the scan prefix covering every key of `partition_key`.
pub fn partition_prefix(partition_key: &str) -> Result<Vec<u8>> {
    if partition_key.as_bytes().contains(&SEPARATOR) {
        return Err(SledError::InvalidKey(format!(
            "partition key {partition_key:?} contains a NUL byte"
        )));
    }

    let mut prefix = Vec::with_capacity(partition_key.len() + 1);
    prefix.extend_from_slice(partition_key.as_bytes());
    prefix.push(SEPARATOR);
    Ok(prefix)
}

pub fn encode_key(key: &EntityKey) -> Result<Vec<u8>> {
    let mut bytes = partition_prefix(&key.partition_key)?;
    bytes.extend_from_slice(key.row_key.as_bytes());
    Ok(bytes)
}

pub fn decode_key(bytes: &[u8]) -> Result<EntityKey> {
    let corrupt = |message: String| SledError::Corrupt {
        key: String::from_utf8_lossy(bytes).into_owned(),
        message,
    };

    let split = bytes
        .iter()
        .position(|byte| *byte == SEPARATOR)
        .ok_or_else(|| corrupt("missing partition separator".to_string()))?;

    let partition_key =
        std::str::from_utf8(&bytes[..split]).map_err(|e| corrupt(e.to_string()))?;
    let row_key =
        std::str::from_utf8(&bytes[split + 1..]).map_err(|e| corrupt(e.to_string()))?;

    Ok(EntityKey::new(partition_key, row_key))
}

pub fn encode_value(body: &Document) -> Result<Vec<u8>> {
    serialize_to_vec(body).map_err(|e| SledError::Corrupt {
        key: String::new(),
        message: e.to_string(),
    })
}

pub fn decode_record(key: &[u8], value: &[u8]) -> Result<Record> {
    let key = decode_key(key)?;
    let body = deserialize_from_slice::<Document>(value).map_err(|e| SledError::Corrupt {
        key: key.to_string(),
        message: e.to_string(),
    })?;

    Ok(Record::new(key, body))
}
