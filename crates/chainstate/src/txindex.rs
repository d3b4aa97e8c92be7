//! Transaction index records: where a transaction sits on disk, and which
//! of its outputs have been spent by the best chain.

use novad_primitives::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};

/// Disk locator of one transaction. `block_offset` addresses the block
/// record inside `blk<file_id>.dat`; `tx_offset` the transaction within
/// that record.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DiskTxPos {
    pub file_id: u32,
    pub block_offset: u32,
    pub tx_offset: u32,
}

impl DiskTxPos {
    pub fn new(file_id: u32, block_offset: u32, tx_offset: u32) -> Self {
        Self {
            file_id,
            block_offset,
            tx_offset,
        }
    }

    pub fn null() -> Self {
        Self {
            file_id: u32::MAX,
            block_offset: 0,
            tx_offset: 0,
        }
    }

    pub fn is_null(&self) -> bool {
        self.file_id == u32::MAX
    }
}

impl Encodable for DiskTxPos {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_u32_le(self.file_id);
        encoder.write_u32_le(self.block_offset);
        encoder.write_u32_le(self.tx_offset);
    }
}

impl Decodable for DiskTxPos {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            file_id: decoder.read_u32_le()?,
            block_offset: decoder.read_u32_le()?,
            tx_offset: decoder.read_u32_le()?,
        })
    }
}

/// One entry per transaction on the best chain. `spent[i]` is null exactly
/// while output `i` is unspent; otherwise it locates the spending
/// transaction.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxIndexEntry {
    pub pos: DiskTxPos,
    pub spent: Vec<DiskTxPos>,
}

impl TxIndexEntry {
    pub fn new(pos: DiskTxPos, outputs: usize) -> Self {
        Self {
            pos,
            spent: vec![DiskTxPos::null(); outputs],
        }
    }

    pub fn is_fully_spent(&self) -> bool {
        self.spent.iter().all(|pos| !pos.is_null())
    }

    pub fn has_unspent_output(&self) -> bool {
        self.spent.iter().any(|pos| pos.is_null())
    }
}

impl Encodable for TxIndexEntry {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.pos.consensus_encode(encoder);
        encoder.write_compact_size(self.spent.len() as u64);
        for spent in &self.spent {
            spent.consensus_encode(encoder);
        }
    }
}

impl Decodable for TxIndexEntry {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let pos = DiskTxPos::consensus_decode(decoder)?;
        let count = decoder.read_compact_size()?;
        let count = usize::try_from(count).map_err(|_| DecodeError::Oversized)?;
        let mut spent = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            spent.push(DiskTxPos::consensus_decode(decoder)?);
        }
        Ok(Self { pos, spent })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use novad_primitives::encoding::{decode, encode};

    #[test]
    fn entry_round_trips() {
        let mut entry = TxIndexEntry::new(DiskTxPos::new(3, 120, 209), 4);
        entry.spent[2] = DiskTxPos::new(3, 900, 1_001);

        let bytes = encode(&entry);
        let decoded: TxIndexEntry = decode(&bytes).expect("decode");
        assert_eq!(decoded, entry);
        assert!(decoded.has_unspent_output());
        assert!(!decoded.is_fully_spent());
    }

    #[test]
    fn spent_flags() {
        let mut entry = TxIndexEntry::new(DiskTxPos::new(0, 0, 8), 2);
        assert!(entry.has_unspent_output());
        entry.spent[0] = DiskTxPos::new(0, 500, 600);
        entry.spent[1] = DiskTxPos::new(0, 500, 700);
        assert!(entry.is_fully_spent());
        assert!(!entry.has_unspent_output());
    }
}
