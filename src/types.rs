//! Ethereum JSON-RPC types
//!
//! Type definitions for blocks and transactions returned from
//! `eth_getBlockByNumber`, in both the light (hashes only) and the
//! detailed (full transaction objects) shape.

use alloy_primitives::{Address, B256, U256};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Ethereum block, generic over the entries of its transaction list.
///
/// `T` is `B256` when the block was requested without full transaction
/// objects and [`Transaction`] when it was requested with them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block<T> {
    /// Block number (hex string in JSON, parsed to u64)
    #[serde(rename = "number", deserialize_with = "deserialize_hex_u64")]
    pub number: u64,

    /// Block hash (hex string in JSON)
    #[serde(rename = "hash", deserialize_with = "deserialize_hex_b256")]
    pub hash: B256,

    /// Parent block hash (hex string in JSON)
    #[serde(rename = "parentHash", deserialize_with = "deserialize_hex_b256")]
    pub parent_hash: B256,

    /// Block timestamp in Unix epoch seconds (hex string in JSON)
    #[serde(rename = "timestamp", deserialize_with = "deserialize_hex_u64")]
    pub timestamp: u64,

    /// Fee recipient (hex string in JSON)
    #[serde(rename = "miner", default, deserialize_with = "deserialize_hex_address_opt")]
    pub miner: Option<Address>,

    /// Gas limit (hex string in JSON)
    #[serde(rename = "gasLimit", deserialize_with = "deserialize_hex_u256")]
    pub gas_limit: U256,

    /// Gas used by all transactions in the block (hex string in JSON)
    #[serde(rename = "gasUsed", deserialize_with = "deserialize_hex_u256")]
    pub gas_used: U256,

    /// Base fee per gas (EIP-1559, hex string in JSON)
    #[serde(rename = "baseFeePerGas", default, deserialize_with = "deserialize_hex_u256_opt")]
    pub base_fee_per_gas: Option<U256>,

    /// Transactions in block order
    #[serde(rename = "transactions", default = "Vec::new")]
    pub transactions: Vec<T>,
}

/// Block carrying only transaction hashes.
pub type LightBlock = Block<B256>;

/// Block carrying full transaction objects.
pub type DetailedBlock = Block<Transaction>;

/// Anything the block fetcher can decode from an `eth_getBlockByNumber` result.
pub trait BlockLike: DeserializeOwned + Send + Sync + 'static {
    /// Height of the block.
    fn number(&self) -> u64;

    /// A zero height means the endpoint returned no block (not yet mined or unknown).
    fn is_empty(&self) -> bool {
        self.number() == 0
    }
}

impl<T> BlockLike for Block<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    fn number(&self) -> u64 {
        self.number
    }
}

/// Ethereum transaction.
///
/// Two transactions are equal only if every field is equal; a matching
/// hash alone is not enough.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Transaction hash (hex string in JSON)
    #[serde(rename = "hash", deserialize_with = "deserialize_hex_b256")]
    pub hash: B256,

    /// Hash of the containing block (hex string in JSON)
    #[serde(rename = "blockHash", deserialize_with = "deserialize_hex_b256")]
    pub block_hash: B256,

    /// Number of the containing block (hex string in JSON)
    #[serde(rename = "blockNumber", deserialize_with = "deserialize_hex_u64")]
    pub block_number: u64,

    /// Position within the block (hex string in JSON)
    #[serde(rename = "transactionIndex", deserialize_with = "deserialize_hex_u64")]
    pub transaction_index: u64,

    /// Sender address (hex string in JSON)
    #[serde(rename = "from", deserialize_with = "deserialize_hex_address")]
    pub from: Address,

    /// Recipient address (None for contract creation, hex string in JSON)
    #[serde(rename = "to", default, deserialize_with = "deserialize_hex_address_opt")]
    pub to: Option<Address>,

    /// Value transferred in wei (hex string in JSON)
    #[serde(rename = "value", deserialize_with = "deserialize_hex_u256")]
    pub value: U256,

    /// Gas limit (hex string in JSON)
    #[serde(rename = "gas", deserialize_with = "deserialize_hex_u256")]
    pub gas: U256,

    /// Gas price; zero when the endpoint omits it (hex string in JSON)
    #[serde(rename = "gasPrice", default, deserialize_with = "deserialize_hex_u256")]
    pub gas_price: U256,

    /// Transaction nonce (hex string in JSON)
    #[serde(rename = "nonce", deserialize_with = "deserialize_hex_u64")]
    pub nonce: u64,

    /// Transaction input data (hex string in JSON, "0x" for simple transfers)
    #[serde(
        rename = "input",
        default,
        deserialize_with = "deserialize_hex_bytes",
        serialize_with = "serialize_hex_bytes"
    )]
    pub input: Vec<u8>,
}

impl Transaction {
    /// Canonical key of the sender.
    pub fn from_key(&self) -> String {
        address_key(&self.from)
    }

    /// Canonical key of the recipient, if there is one.
    pub fn to_key(&self) -> Option<String> {
        self.to.as_ref().map(address_key)
    }

    /// Check if this is a contract creation transaction (to is None).
    pub fn is_contract_creation(&self) -> bool {
        self.to.is_none()
    }
}

/// Canonical string form of an address: `0x` followed by 40 lowercase hex digits.
pub fn address_key(addr: &Address) -> String {
    format!("0x{:x}", addr)
}

/// Bring a user-supplied address string into canonical key form.
///
/// Surrounding whitespace is dropped, hex digits are lowercased and a
/// missing `0x` prefix is added. The digits themselves are not validated.
pub fn normalize_address(address: &str) -> String {
    let address = address.trim().to_ascii_lowercase();
    if address.starts_with("0x") {
        address
    } else {
        format!("0x{}", address)
    }
}

// Hex (de)serialization helpers

/// Pad an odd-length hex string with a leading zero.
/// This handles cases where RPC returns hex strings without leading zeros.
fn pad_hex_string(s: &str) -> String {
    if s.len() % 2 == 1 {
        format!("0{}", s)
    } else {
        s.to_string()
    }
}

/// Parse a `0x`-prefixed (or bare) hex quantity into a u64.
pub(crate) fn parse_hex_u64(s: &str) -> Result<u64, std::num::ParseIntError> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(s, 16)
}

/// Decode a fixed-length hex value such as a hash or an address.
fn decode_fixed(s: &str, len: usize, what: &str) -> Result<Vec<u8>, String> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(pad_hex_string(s)).map_err(|e| e.to_string())?;
    if bytes.len() != len {
        return Err(format!("Expected {} bytes for {}, got {}", len, what, bytes.len()));
    }
    Ok(bytes)
}

fn deserialize_hex_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_hex_u64(&s).map_err(serde::de::Error::custom)
}

fn deserialize_hex_u256<'de, D>(deserializer: D) -> Result<U256, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(deserialize_hex_u256_opt(deserializer)?.unwrap_or(U256::ZERO))
}

fn deserialize_hex_u256_opt<'de, D>(deserializer: D) -> Result<Option<U256>, D::Error>
where
    D: Deserializer<'de>,
{
    let Some(s) = Option::<String>::deserialize(deserializer)? else {
        return Ok(None);
    };
    let s = s.strip_prefix("0x").unwrap_or(&s);
    if s.is_empty() {
        return Ok(Some(U256::ZERO));
    }
    let bytes = hex::decode(pad_hex_string(s)).map_err(serde::de::Error::custom)?;
    if bytes.len() > 32 {
        return Err(serde::de::Error::custom(format!(
            "Quantity does not fit in 256 bits: {} bytes",
            bytes.len()
        )));
    }
    Ok(Some(U256::from_be_slice(&bytes)))
}

fn deserialize_hex_b256<'de, D>(deserializer: D) -> Result<B256, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    let bytes = decode_fixed(&s, 32, "hash").map_err(serde::de::Error::custom)?;
    Ok(B256::from_slice(&bytes))
}

fn deserialize_hex_address<'de, D>(deserializer: D) -> Result<Address, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    let bytes = decode_fixed(&s, 20, "address").map_err(serde::de::Error::custom)?;
    Ok(Address::from_slice(&bytes))
}

fn deserialize_hex_address_opt<'de, D>(deserializer: D) -> Result<Option<Address>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        Some(s) if !s.trim_start_matches("0x").is_empty() => {
            let bytes = decode_fixed(&s, 20, "address").map_err(serde::de::Error::custom)?;
            Ok(Some(Address::from_slice(&bytes)))
        }
        _ => Ok(None),
    }
}

fn deserialize_hex_bytes<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let Some(s) = Option::<String>::deserialize(deserializer)? else {
        return Ok(Vec::new());
    };
    let s = s.strip_prefix("0x").unwrap_or(&s);
    if s.is_empty() {
        return Ok(Vec::new());
    }
    hex::decode(pad_hex_string(s)).map_err(serde::de::Error::custom)
}

fn serialize_hex_bytes<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format!("0x{}", hex::encode(bytes)))
}
