//! CBOR wire messages.
//!
//! Every message is a CBOR map keyed by small integers (not strings), which
//! keeps the wire form compact and byte-stable across implementations. Key 1
//! is always the message type tag. Share targets travel in compact (nBits)
//! form.

use ciborium::value::Value;
use thiserror::Error;

use peerpool_types::constants::{MAX_COINBASE_TX_SIZE, MAX_MINER_ADDRESS_LEN};
use peerpool_types::hash::{compact_to_target, target_to_compact};
use peerpool_types::{Share, ShareHeader};

#[derive(Debug, Error)]
pub enum WireError {
    #[error("cbor decode error: {0}")]
    Decode(String),

    #[error("cbor encode error: {0}")]
    Encode(String),

    #[error("unknown message type {0}")]
    UnknownType(u64),

    #[error("expected message type {expected:?}, got {got:?}")]
    UnexpectedType {
        expected: MessageType,
        got: MessageType,
    },

    #[error("missing field {0}")]
    MissingField(u64),

    #[error("malformed field {0}")]
    MalformedField(u64),

    #[error("{what} too large: {size} bytes")]
    Oversized { what: &'static str, size: usize },
}

// =============================================================================
// Message Types
// =============================================================================

/// Wire message type tag (map key 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Share = 1,
    TipAnnounce = 2,
    /// Legacy batch sync request; codec kept for wire compatibility.
    ShareReq = 3,
    /// Legacy batch sync response; codec kept for wire compatibility.
    ShareResp = 4,
    LocatorReq = 5,
    LocatorResp = 6,
}

impl TryFrom<u64> for MessageType {
    type Error = WireError;

    fn try_from(v: u64) -> Result<Self, WireError> {
        match v {
            1 => Ok(MessageType::Share),
            2 => Ok(MessageType::TipAnnounce),
            3 => Ok(MessageType::ShareReq),
            4 => Ok(MessageType::ShareResp),
            5 => Ok(MessageType::LocatorReq),
            6 => Ok(MessageType::LocatorResp),
            other => Err(WireError::UnknownType(other)),
        }
    }
}

/// A share broadcast over gossip or carried in a sync response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShareMsg {
    // Header fields.
    pub version: i32,
    pub prev_block_hash: [u8; 32],
    pub merkle_root: [u8; 32],
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u32,

    // Sharechain fields.
    pub share_version: u32,
    pub prev_share_hash: [u8; 32],
    /// Compact representation of the share target.
    pub share_target_bits: u32,
    pub miner_address: String,
    pub coinbase_tx: Vec<u8>,
}

impl ShareMsg {
    pub fn from_share(share: &Share) -> Self {
        Self {
            version: share.header.version,
            prev_block_hash: share.header.prev_block_hash,
            merkle_root: share.header.merkle_root,
            timestamp: share.header.timestamp,
            bits: share.header.bits,
            nonce: share.header.nonce,
            share_version: share.share_version,
            prev_share_hash: share.prev_share_hash,
            share_target_bits: target_to_compact(&share.share_target),
            miner_address: share.miner_address.clone(),
            coinbase_tx: share.coinbase_tx.clone(),
        }
    }

    pub fn to_share(&self) -> Share {
        Share::new(
            ShareHeader {
                version: self.version,
                prev_block_hash: self.prev_block_hash,
                merkle_root: self.merkle_root,
                timestamp: self.timestamp,
                bits: self.bits,
                nonce: self.nonce,
            },
            self.share_version,
            self.prev_share_hash,
            compact_to_target(self.share_target_bits),
            self.miner_address.clone(),
            self.coinbase_tx.clone(),
        )
    }
}

/// Announces a node's current chain tip.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TipAnnounce {
    pub tip_hash: [u8; 32],
    pub height: i64,
    /// Cumulative work, big-endian bytes.
    pub total_work: Vec<u8>,
}

/// Legacy batch request: walk backwards from a hash.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShareRequest {
    pub start_hash: [u8; 32],
    pub count: u64,
}

/// Legacy batch response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShareResponse {
    pub shares: Vec<ShareMsg>,
}

/// Locator-based sync request: exponentially spaced hashes from the
/// client's tip.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShareLocatorReq {
    pub locators: Vec<[u8; 32]>,
    pub max_count: u64,
}

/// Locator-based sync response: shares after the fork point, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShareLocatorResp {
    pub shares: Vec<ShareMsg>,
    pub more: bool,
}

// =============================================================================
// Value Construction Helpers
// =============================================================================

fn kv(key: u64, value: Value) -> (Value, Value) {
    (Value::Integer(key.into()), value)
}

fn int_u(v: u64) -> Value {
    Value::Integer(v.into())
}

fn int_i(v: i64) -> Value {
    Value::Integer(v.into())
}

fn bytes(b: &[u8]) -> Value {
    Value::Bytes(b.to_vec())
}

fn to_bytes(value: &Value) -> Result<Vec<u8>, WireError> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf).map_err(|e| WireError::Encode(e.to_string()))?;
    Ok(buf)
}

fn share_msg_value(msg: &ShareMsg, with_type: bool) -> Value {
    let mut fields = Vec::with_capacity(12);
    if with_type {
        fields.push(kv(1, int_u(MessageType::Share as u64)));
    }
    fields.push(kv(2, int_i(msg.version as i64)));
    fields.push(kv(3, bytes(&msg.prev_block_hash)));
    fields.push(kv(4, bytes(&msg.merkle_root)));
    fields.push(kv(5, int_u(msg.timestamp as u64)));
    fields.push(kv(6, int_u(msg.bits as u64)));
    fields.push(kv(7, int_u(msg.nonce as u64)));
    fields.push(kv(8, int_u(msg.share_version as u64)));
    fields.push(kv(9, bytes(&msg.prev_share_hash)));
    fields.push(kv(10, int_u(msg.share_target_bits as u64)));
    fields.push(kv(11, Value::Text(msg.miner_address.clone())));
    fields.push(kv(12, bytes(&msg.coinbase_tx)));
    Value::Map(fields)
}

// =============================================================================
// Encoding
// =============================================================================

pub fn encode_share_msg(msg: &ShareMsg) -> Result<Vec<u8>, WireError> {
    to_bytes(&share_msg_value(msg, true))
}

pub fn encode_tip_announce(msg: &TipAnnounce) -> Result<Vec<u8>, WireError> {
    to_bytes(&Value::Map(vec![
        kv(1, int_u(MessageType::TipAnnounce as u64)),
        kv(2, bytes(&msg.tip_hash)),
        kv(3, int_i(msg.height)),
        kv(4, bytes(&msg.total_work)),
    ]))
}

pub fn encode_share_request(msg: &ShareRequest) -> Result<Vec<u8>, WireError> {
    to_bytes(&Value::Map(vec![
        kv(1, int_u(MessageType::ShareReq as u64)),
        kv(2, bytes(&msg.start_hash)),
        kv(3, int_u(msg.count)),
    ]))
}

pub fn encode_share_response(msg: &ShareResponse) -> Result<Vec<u8>, WireError> {
    let shares = msg
        .shares
        .iter()
        .map(|s| share_msg_value(s, true))
        .collect();
    to_bytes(&Value::Map(vec![
        kv(1, int_u(MessageType::ShareResp as u64)),
        kv(2, Value::Array(shares)),
    ]))
}

pub fn encode_locator_req(msg: &ShareLocatorReq) -> Result<Vec<u8>, WireError> {
    let locators = msg.locators.iter().map(|h| bytes(h)).collect();
    to_bytes(&Value::Map(vec![
        kv(1, int_u(MessageType::LocatorReq as u64)),
        kv(2, Value::Array(locators)),
        kv(3, int_u(msg.max_count)),
    ]))
}

pub fn encode_locator_resp(msg: &ShareLocatorResp) -> Result<Vec<u8>, WireError> {
    let shares = msg
        .shares
        .iter()
        .map(|s| share_msg_value(s, true))
        .collect();
    to_bytes(&Value::Map(vec![
        kv(1, int_u(MessageType::LocatorResp as u64)),
        kv(2, Value::Array(shares)),
        kv(3, Value::Bool(msg.more)),
    ]))
}

// =============================================================================
// Decoding
// =============================================================================

struct MapReader {
    fields: Vec<(Value, Value)>,
}

impl MapReader {
    fn parse(data: &[u8]) -> Result<Self, WireError> {
        let value: Value =
            ciborium::de::from_reader(data).map_err(|e| WireError::Decode(e.to_string()))?;
        match value {
            Value::Map(fields) => Ok(Self { fields }),
            _ => Err(WireError::Decode("expected a cbor map".into())),
        }
    }

    fn from_value(value: Value) -> Result<Self, WireError> {
        match value {
            Value::Map(fields) => Ok(Self { fields }),
            _ => Err(WireError::Decode("expected a cbor map".into())),
        }
    }

    fn get(&self, key: u64) -> Option<&Value> {
        self.fields.iter().find_map(|(k, v)| match k {
            Value::Integer(i) if i128::from(*i) == key as i128 => Some(v),
            _ => None,
        })
    }

    fn u64_field(&self, key: u64) -> Result<u64, WireError> {
        match self.get(key) {
            Some(Value::Integer(i)) => {
                u64::try_from(i128::from(*i)).map_err(|_| WireError::MalformedField(key))
            }
            Some(_) => Err(WireError::MalformedField(key)),
            None => Ok(0),
        }
    }

    fn i64_field(&self, key: u64) -> Result<i64, WireError> {
        match self.get(key) {
            Some(Value::Integer(i)) => {
                i64::try_from(i128::from(*i)).map_err(|_| WireError::MalformedField(key))
            }
            Some(_) => Err(WireError::MalformedField(key)),
            None => Ok(0),
        }
    }

    fn bool_field(&self, key: u64) -> Result<bool, WireError> {
        match self.get(key) {
            Some(Value::Bool(b)) => Ok(*b),
            Some(_) => Err(WireError::MalformedField(key)),
            None => Ok(false),
        }
    }

    fn bytes_field(&self, key: u64) -> Result<Vec<u8>, WireError> {
        match self.get(key) {
            Some(Value::Bytes(b)) => Ok(b.clone()),
            Some(_) => Err(WireError::MalformedField(key)),
            None => Ok(Vec::new()),
        }
    }

    fn hash_field(&self, key: u64) -> Result<[u8; 32], WireError> {
        let b = self.bytes_field(key)?;
        if b.is_empty() {
            return Ok([0u8; 32]);
        }
        b.try_into().map_err(|_| WireError::MalformedField(key))
    }

    fn text_field(&self, key: u64) -> Result<String, WireError> {
        match self.get(key) {
            Some(Value::Text(s)) => Ok(s.clone()),
            Some(_) => Err(WireError::MalformedField(key)),
            None => Ok(String::new()),
        }
    }

    fn array_field(&self, key: u64) -> Result<Vec<Value>, WireError> {
        match self.get(key) {
            Some(Value::Array(a)) => Ok(a.clone()),
            Some(_) => Err(WireError::MalformedField(key)),
            None => Ok(Vec::new()),
        }
    }

    fn message_type(&self) -> Result<MessageType, WireError> {
        let raw = match self.get(1) {
            Some(Value::Integer(i)) => {
                u64::try_from(i128::from(*i)).map_err(|_| WireError::MalformedField(1))?
            }
            _ => return Err(WireError::MissingField(1)),
        };
        MessageType::try_from(raw)
    }

    fn expect_type(&self, expected: MessageType) -> Result<(), WireError> {
        let got = self.message_type()?;
        if got != expected {
            return Err(WireError::UnexpectedType { expected, got });
        }
        Ok(())
    }
}

/// Read the type tag without fully decoding the message.
pub fn peek_message_type(data: &[u8]) -> Result<MessageType, WireError> {
    MapReader::parse(data)?.message_type()
}

fn share_msg_from_map(map: &MapReader) -> Result<ShareMsg, WireError> {
    let msg = ShareMsg {
        version: map.i64_field(2)? as i32,
        prev_block_hash: map.hash_field(3)?,
        merkle_root: map.hash_field(4)?,
        timestamp: map.u64_field(5)? as u32,
        bits: map.u64_field(6)? as u32,
        nonce: map.u64_field(7)? as u32,
        share_version: map.u64_field(8)? as u32,
        prev_share_hash: map.hash_field(9)?,
        share_target_bits: map.u64_field(10)? as u32,
        miner_address: map.text_field(11)?,
        coinbase_tx: map.bytes_field(12)?,
    };

    if msg.coinbase_tx.len() > MAX_COINBASE_TX_SIZE {
        return Err(WireError::Oversized {
            what: "coinbase tx",
            size: msg.coinbase_tx.len(),
        });
    }
    if msg.miner_address.len() > MAX_MINER_ADDRESS_LEN {
        return Err(WireError::Oversized {
            what: "miner address",
            size: msg.miner_address.len(),
        });
    }
    Ok(msg)
}

fn share_msgs_from_array(values: Vec<Value>) -> Result<Vec<ShareMsg>, WireError> {
    values
        .into_iter()
        .map(|v| share_msg_from_map(&MapReader::from_value(v)?))
        .collect()
}

pub fn decode_share_msg(data: &[u8]) -> Result<ShareMsg, WireError> {
    let map = MapReader::parse(data)?;
    map.expect_type(MessageType::Share)?;
    share_msg_from_map(&map)
}

pub fn decode_tip_announce(data: &[u8]) -> Result<TipAnnounce, WireError> {
    let map = MapReader::parse(data)?;
    map.expect_type(MessageType::TipAnnounce)?;
    Ok(TipAnnounce {
        tip_hash: map.hash_field(2)?,
        height: map.i64_field(3)?,
        total_work: map.bytes_field(4)?,
    })
}

pub fn decode_share_request(data: &[u8]) -> Result<ShareRequest, WireError> {
    let map = MapReader::parse(data)?;
    map.expect_type(MessageType::ShareReq)?;
    Ok(ShareRequest {
        start_hash: map.hash_field(2)?,
        count: map.u64_field(3)?,
    })
}

pub fn decode_share_response(data: &[u8]) -> Result<ShareResponse, WireError> {
    let map = MapReader::parse(data)?;
    map.expect_type(MessageType::ShareResp)?;
    Ok(ShareResponse {
        shares: share_msgs_from_array(map.array_field(2)?)?,
    })
}

pub fn decode_locator_req(data: &[u8]) -> Result<ShareLocatorReq, WireError> {
    let map = MapReader::parse(data)?;
    map.expect_type(MessageType::LocatorReq)?;

    let locators = map
        .array_field(2)?
        .into_iter()
        .map(|v| match v {
            Value::Bytes(b) => b.try_into().map_err(|_| WireError::MalformedField(2)),
            _ => Err(WireError::MalformedField(2)),
        })
        .collect::<Result<Vec<[u8; 32]>, _>>()?;

    Ok(ShareLocatorReq {
        locators,
        max_count: map.u64_field(3)?,
    })
}

pub fn decode_locator_resp(data: &[u8]) -> Result<ShareLocatorResp, WireError> {
    let map = MapReader::parse(data)?;
    map.expect_type(MessageType::LocatorResp)?;
    Ok(ShareLocatorResp {
        shares: share_msgs_from_array(map.array_field(2)?)?,
        more: map.bool_field(3)?,
    })
}
