//! In-memory block-index nodes and their persisted form.
//!
//! The index map owns every node; `prev` and `next_on_best` are hashes
//! resolved through the map, never owning references. Chain trust is
//! recomputed from parents when the index is loaded, so the persisted form
//! omits it.

use novad_consensus::Hash256;
use novad_primitives::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use novad_primitives::outpoint::OutPoint;
use primitive_types::U256;

use novad_pow::difficulty::block_proof;

pub const FLAG_PROOF_OF_STAKE: u32 = 1 << 0;
pub const FLAG_STAKE_ENTROPY: u32 = 1 << 1;
pub const FLAG_GENERATED_STAKE_MODIFIER: u32 = 1 << 2;

#[derive(Clone, Debug)]
pub struct BlockIndex {
    pub block_hash: Hash256,
    /// Zero hash on the genesis node.
    pub prev: Hash256,
    pub next_on_best: Option<Hash256>,
    pub height: i32,
    pub file_id: u32,
    pub block_offset: u32,
    pub chain_trust: U256,
    pub money_supply: i64,
    pub mint: i64,
    pub version: i32,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
    pub flags: u32,
    pub stake_modifier: u64,
    pub stake_modifier_checksum: u32,
    pub hash_proof_of_stake: Hash256,
    pub prevout_stake: OutPoint,
    pub stake_time: u32,
}

impl BlockIndex {
    pub fn is_proof_of_stake(&self) -> bool {
        self.flags & FLAG_PROOF_OF_STAKE != 0
    }

    pub fn entropy_bit(&self) -> bool {
        self.flags & FLAG_STAKE_ENTROPY != 0
    }

    pub fn generated_stake_modifier(&self) -> bool {
        self.flags & FLAG_GENERATED_STAKE_MODIFIER != 0
    }

    pub fn set_proof_of_stake(&mut self) {
        self.flags |= FLAG_PROOF_OF_STAKE;
    }

    pub fn set_entropy_bit(&mut self, bit: bool) {
        if bit {
            self.flags |= FLAG_STAKE_ENTROPY;
        }
    }

    pub fn set_generated_stake_modifier(&mut self) {
        self.flags |= FLAG_GENERATED_STAKE_MODIFIER;
    }

    pub fn is_genesis(&self) -> bool {
        self.prev == [0u8; 32]
    }

    /// Work blocks count one unit; stake blocks carry target-derived trust,
    /// so coin weight dominates fork choice.
    pub fn block_trust(&self) -> U256 {
        if self.is_proof_of_stake() {
            block_proof(self.bits).unwrap_or_else(|_| U256::zero())
        } else {
            U256::one()
        }
    }

    /// The kernel proof for stake blocks, the block hash for work blocks;
    /// what the stake-modifier selection hashes.
    pub fn selection_proof(&self) -> Hash256 {
        if self.is_proof_of_stake() {
            self.hash_proof_of_stake
        } else {
            self.block_hash
        }
    }
}

impl Encodable for BlockIndex {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_hash(&self.prev);
        encoder.write_hash(&self.next_on_best.unwrap_or([0u8; 32]));
        encoder.write_i32_le(self.height);
        encoder.write_u32_le(self.file_id);
        encoder.write_u32_le(self.block_offset);
        encoder.write_i64_le(self.money_supply);
        encoder.write_i64_le(self.mint);
        encoder.write_hash(&self.merkle_root);
        encoder.write_u32_le(self.time);
        encoder.write_u32_le(self.bits);
        encoder.write_u32_le(self.nonce);
        encoder.write_u32_le(self.flags);
        encoder.write_u64_le(self.stake_modifier);
        encoder.write_u32_le(self.stake_modifier_checksum);
        encoder.write_hash(&self.hash_proof_of_stake);
        self.prevout_stake.consensus_encode(encoder);
        encoder.write_u32_le(self.stake_time);
    }
}

impl Decodable for BlockIndex {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let version = decoder.read_i32_le()?;
        let prev = decoder.read_hash()?;
        let next = decoder.read_hash()?;
        let height = decoder.read_i32_le()?;
        let file_id = decoder.read_u32_le()?;
        let block_offset = decoder.read_u32_le()?;
        let money_supply = decoder.read_i64_le()?;
        let mint = decoder.read_i64_le()?;
        let merkle_root = decoder.read_hash()?;
        let time = decoder.read_u32_le()?;
        let bits = decoder.read_u32_le()?;
        let nonce = decoder.read_u32_le()?;
        let flags = decoder.read_u32_le()?;
        let stake_modifier = decoder.read_u64_le()?;
        let stake_modifier_checksum = decoder.read_u32_le()?;
        let hash_proof_of_stake = decoder.read_hash()?;
        let prevout_stake = OutPoint::consensus_decode(decoder)?;
        let stake_time = decoder.read_u32_le()?;
        Ok(Self {
            // The key supplies the hash; the loader fills it in.
            block_hash: [0u8; 32],
            prev,
            next_on_best: if next == [0u8; 32] { None } else { Some(next) },
            height,
            file_id,
            block_offset,
            chain_trust: U256::zero(),
            money_supply,
            mint,
            version,
            merkle_root,
            time,
            bits,
            nonce,
            flags,
            stake_modifier,
            stake_modifier_checksum,
            hash_proof_of_stake,
            prevout_stake,
            stake_time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use novad_primitives::encoding::{decode, encode};

    fn sample() -> BlockIndex {
        BlockIndex {
            block_hash: [9u8; 32],
            prev: [1u8; 32],
            next_on_best: Some([2u8; 32]),
            height: 42,
            file_id: 1,
            block_offset: 4_096,
            chain_trust: U256::from(77u64),
            money_supply: 5_000,
            mint: 50,
            version: 6,
            merkle_root: [3u8; 32],
            time: 1_700_000_000,
            bits: 0x1e0f_ffff,
            nonce: 1234,
            flags: FLAG_PROOF_OF_STAKE | FLAG_STAKE_ENTROPY,
            stake_modifier: 0xdead_beef_cafe_f00d,
            stake_modifier_checksum: 0x1234_5678,
            hash_proof_of_stake: [4u8; 32],
            prevout_stake: OutPoint::new([5u8; 32], 1),
            stake_time: 1_700_000_100,
        }
    }

    #[test]
    fn disk_round_trip_preserves_everything_but_trust() {
        let node = sample();
        let decoded: BlockIndex = decode(&encode(&node)).expect("decode");
        assert_eq!(decoded.prev, node.prev);
        assert_eq!(decoded.next_on_best, node.next_on_best);
        assert_eq!(decoded.height, node.height);
        assert_eq!(decoded.money_supply, node.money_supply);
        assert_eq!(decoded.mint, node.mint);
        assert_eq!(decoded.flags, node.flags);
        assert_eq!(decoded.stake_modifier, node.stake_modifier);
        assert_eq!(
            decoded.stake_modifier_checksum,
            node.stake_modifier_checksum
        );
        assert_eq!(decoded.hash_proof_of_stake, node.hash_proof_of_stake);
        assert_eq!(decoded.prevout_stake, node.prevout_stake);
        assert_eq!(decoded.stake_time, node.stake_time);
        // Recomputed on load.
        assert_eq!(decoded.chain_trust, U256::zero());
        assert_eq!(decoded.block_hash, [0u8; 32]);
    }

    #[test]
    fn stake_blocks_outweigh_work_blocks() {
        let stake = sample();
        let mut work = sample();
        work.flags = 0;
        assert!(stake.block_trust() > work.block_trust());
        assert_eq!(work.block_trust(), U256::one());
    }

    #[test]
    fn selection_proof_depends_on_proof_type() {
        let stake = sample();
        assert_eq!(stake.selection_proof(), stake.hash_proof_of_stake);
        let mut work = sample();
        work.flags = 0;
        assert_eq!(work.selection_proof(), work.block_hash);
    }
}
