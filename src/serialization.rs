//! Wire format for transactions, headers and blocks
//!
//! Every fixed-width integer is big-endian. Lengths and counts use a compact
//! size prefix: one byte below 0xfd, otherwise a 0xfd/0xfe/0xff marker followed
//! by a u16/u32/u64. Encodings longer than necessary are rejected so that each
//! object has exactly one serialization and therefore one hash.

use crate::constants::MAX_SIZE;
use crate::error::DecodeError;
use crate::types::*;
use bitcoin_hashes::{sha256d, Hash as _};

/// Serialized header length
pub const HEADER_SIZE: usize = 80;

/// SHA256(SHA256(data))
pub fn double_sha256(data: &[u8]) -> Hash {
    sha256d::Hash::hash(data).into_inner()
}

pub fn write_compact_size(buf: &mut Vec<u8>, n: u64) {
    if n < 0xfd {
        buf.push(n as u8);
    } else if n <= u16::MAX as u64 {
        buf.push(0xfd);
        buf.extend_from_slice(&(n as u16).to_be_bytes());
    } else if n <= u32::MAX as u64 {
        buf.push(0xfe);
        buf.extend_from_slice(&(n as u32).to_be_bytes());
    } else {
        buf.push(0xff);
        buf.extend_from_slice(&n.to_be_bytes());
    }
}

pub fn compact_size_len(n: u64) -> usize {
    match n {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}

fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    write_compact_size(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

/// Byte cursor used by every decoder in this module
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::UnexpectedEnd);
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    pub fn read_hash(&mut self) -> Result<Hash, DecodeError> {
        self.array()
    }

    pub fn read_compact_size(&mut self) -> Result<u64, DecodeError> {
        let value = match self.read_u8()? {
            n @ 0..=0xfc => return Ok(n as u64),
            0xfd => {
                let n = self.read_u16()? as u64;
                if n < 0xfd {
                    return Err(DecodeError::NonCanonicalCompactSize);
                }
                n
            }
            0xfe => {
                let n = self.read_u32()? as u64;
                if n <= u16::MAX as u64 {
                    return Err(DecodeError::NonCanonicalCompactSize);
                }
                n
            }
            _ => {
                let n = self.read_u64()?;
                if n <= u32::MAX as u64 {
                    return Err(DecodeError::NonCanonicalCompactSize);
                }
                n
            }
        };
        if value > MAX_SIZE {
            return Err(DecodeError::OversizedLength(value));
        }
        Ok(value)
    }

    /// Length-prefixed byte string
    pub fn read_bytes(&mut self) -> Result<ByteString, DecodeError> {
        let len = self.read_compact_size()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    /// Element count, sanity-bounded by the bytes left to read
    fn read_count(&mut self, min_item_size: usize) -> Result<usize, DecodeError> {
        let count = self.read_compact_size()?;
        if count.saturating_mul(min_item_size as u64) > self.remaining() as u64 {
            return Err(DecodeError::UnexpectedEnd);
        }
        Ok(count as usize)
    }

    pub fn finish(self) -> Result<(), DecodeError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(DecodeError::TrailingBytes(n)),
        }
    }
}

// ============================================================================
// TRANSACTIONS
// ============================================================================

pub fn encode_transaction(buf: &mut Vec<u8>, tx: &Transaction) {
    buf.extend_from_slice(&tx.version.to_be_bytes());
    write_compact_size(buf, tx.inputs.len() as u64);
    for input in &tx.inputs {
        buf.extend_from_slice(&input.prevout.hash);
        buf.extend_from_slice(&input.prevout.index.to_be_bytes());
        write_bytes(buf, &input.script_sig);
        buf.extend_from_slice(&input.sequence.to_be_bytes());
    }
    write_compact_size(buf, tx.outputs.len() as u64);
    for output in &tx.outputs {
        buf.extend_from_slice(&(output.value as u64).to_be_bytes());
        write_bytes(buf, &output.script_pubkey);
    }
    buf.extend_from_slice(&tx.lock_time.to_be_bytes());
}

pub fn serialize_transaction(tx: &Transaction) -> Vec<u8> {
    let mut buf = Vec::with_capacity(serialized_transaction_size(tx));
    encode_transaction(&mut buf, tx);
    buf
}

/// Serialized size without allocating
pub fn serialized_transaction_size(tx: &Transaction) -> usize {
    let inputs: usize = tx
        .inputs
        .iter()
        .map(|i| 32 + 4 + compact_size_len(i.script_sig.len() as u64) + i.script_sig.len() + 4)
        .sum();
    let outputs: usize = tx
        .outputs
        .iter()
        .map(|o| 8 + compact_size_len(o.script_pubkey.len() as u64) + o.script_pubkey.len())
        .sum();
    4 + compact_size_len(tx.inputs.len() as u64)
        + inputs
        + compact_size_len(tx.outputs.len() as u64)
        + outputs
        + 4
}

pub fn decode_transaction(reader: &mut Reader<'_>) -> Result<Transaction, DecodeError> {
    let version = reader.read_u32()?;
    // Smallest input: 32 + 4 + 1 + 4 bytes
    let input_count = reader.read_count(41)?;
    let mut inputs = Vec::with_capacity(input_count);
    for _ in 0..input_count {
        let hash = reader.read_hash()?;
        let index = reader.read_u32()?;
        let script_sig = reader.read_bytes()?;
        let sequence = reader.read_u32()?;
        inputs.push(TransactionInput { prevout: OutPoint { hash, index }, script_sig, sequence });
    }
    // Smallest output: 8 + 1 bytes
    let output_count = reader.read_count(9)?;
    let mut outputs = Vec::with_capacity(output_count);
    for _ in 0..output_count {
        let raw = reader.read_u64()?;
        let value = i64::try_from(raw).map_err(|_| DecodeError::ValueOutOfRange)?;
        let script_pubkey = reader.read_bytes()?;
        outputs.push(TransactionOutput { value, script_pubkey });
    }
    let lock_time = reader.read_u32()?;
    Ok(Transaction { version, inputs, outputs, lock_time })
}

pub fn deserialize_transaction(bytes: &[u8]) -> Result<Transaction, DecodeError> {
    let mut reader = Reader::new(bytes);
    let tx = decode_transaction(&mut reader)?;
    reader.finish()?;
    Ok(tx)
}

// ============================================================================
// HEADERS AND BLOCKS
// ============================================================================

pub fn serialize_block_header(header: &BlockHeader) -> [u8; HEADER_SIZE] {
    let mut out = [0u8; HEADER_SIZE];
    out[0..32].copy_from_slice(&header.prev_block_hash);
    out[32..64].copy_from_slice(&header.merkle_root);
    out[64..68].copy_from_slice(&header.timestamp.to_be_bytes());
    out[68..72].copy_from_slice(&header.bits.to_be_bytes());
    out[72..76].copy_from_slice(&header.nonce.to_be_bytes());
    out[76..80].copy_from_slice(&header.version.to_be_bytes());
    out
}

pub fn decode_block_header(reader: &mut Reader<'_>) -> Result<BlockHeader, DecodeError> {
    let prev_block_hash = reader.read_hash()?;
    let merkle_root = reader.read_hash()?;
    let timestamp = reader.read_u32()?;
    let bits = reader.read_u32()?;
    let nonce = reader.read_u32()?;
    let version = reader.read_u32()? as i32;
    Ok(BlockHeader { prev_block_hash, merkle_root, timestamp, bits, nonce, version })
}

pub fn deserialize_block_header(bytes: &[u8]) -> Result<BlockHeader, DecodeError> {
    let mut reader = Reader::new(bytes);
    let header = decode_block_header(&mut reader)?;
    reader.finish()?;
    Ok(header)
}

pub fn serialize_block(block: &Block) -> Vec<u8> {
    let mut buf = Vec::with_capacity(serialized_block_size(block));
    buf.extend_from_slice(&serialize_block_header(&block.header));
    write_compact_size(&mut buf, block.transactions.len() as u64);
    for tx in &block.transactions {
        encode_transaction(&mut buf, tx);
    }
    buf
}

pub fn serialized_block_size(block: &Block) -> usize {
    HEADER_SIZE
        + compact_size_len(block.transactions.len() as u64)
        + block.transactions.iter().map(serialized_transaction_size).sum::<usize>()
}

pub fn deserialize_block(bytes: &[u8]) -> Result<Block, DecodeError> {
    let mut reader = Reader::new(bytes);
    let header = decode_block_header(&mut reader)?;
    // Smallest transaction: 4 + 1 + 1 + 4 bytes
    let tx_count = reader.read_count(10)?;
    let mut transactions = Vec::with_capacity(tx_count);
    for _ in 0..tx_count {
        transactions.push(decode_transaction(&mut reader)?);
    }
    reader.finish()?;
    Ok(Block { header, transactions })
}

impl Transaction {
    /// Content hash: SHA256d of the wire encoding
    pub fn txid(&self) -> Hash {
        double_sha256(&serialize_transaction(self))
    }

    pub fn serialized_size(&self) -> usize {
        serialized_transaction_size(self)
    }
}

impl BlockHeader {
    pub fn hash(&self) -> Hash {
        double_sha256(&serialize_block_header(self))
    }
}

impl Block {
    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn serialized_size(&self) -> usize {
        serialized_block_size(self)
    }
}
