//! Per-network chain parameter definitions.

use crate::Hash256;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Checkpoint {
    pub height: i32,
    pub hash: Hash256,
}

/// Hard-coded stake-modifier checksum milestone.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StakeModifierCheckpoint {
    pub height: i32,
    pub checksum: u32,
}

#[derive(Clone, Debug)]
pub struct ConsensusParams {
    pub network: Network,
    pub hash_genesis_block: Hash256,
    pub genesis_time: u32,
    pub pow_limit: Hash256,
    pub pos_limit: Hash256,
    /// Stake entropy bits come from the pregenerated table below this
    /// height; from the block hash at and above it.
    pub entropy_switch_height: i32,
    /// Depth minted outputs must reach before they may be spent.
    pub coinbase_maturity: i32,
    pub checkpoints: Vec<Checkpoint>,
    pub stake_modifier_checkpoints: Vec<StakeModifierCheckpoint>,
}

impl ConsensusParams {
    pub fn checkpoint_at(&self, height: i32) -> Option<&Checkpoint> {
        self.checkpoints
            .iter()
            .find(|checkpoint| checkpoint.height == height)
    }

    pub fn last_checkpoint_height(&self) -> i32 {
        self.checkpoints
            .iter()
            .map(|checkpoint| checkpoint.height)
            .max()
            .unwrap_or(0)
    }

    pub fn stake_modifier_checkpoint_at(&self, height: i32) -> Option<u32> {
        if self.network != Network::Mainnet {
            return None;
        }
        self.stake_modifier_checkpoints
            .iter()
            .find(|checkpoint| checkpoint.height == height)
            .map(|checkpoint| checkpoint.checksum)
    }
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    pub consensus: ConsensusParams,
    /// Leading bytes of every block-file record.
    pub message_start: [u8; 4],
    pub default_port: u16,
}

#[derive(Debug)]
pub enum HexError {
    InvalidLength,
    InvalidHex,
}

/// Parses a big-endian hex string into the little-endian in-memory form.
pub fn hash256_from_hex(input: &str) -> Result<Hash256, HexError> {
    let mut hex = input.trim();
    if let Some(stripped) = hex.strip_prefix("0x").or_else(|| hex.strip_prefix("0X")) {
        hex = stripped;
    }
    if hex.is_empty() || hex.len() > 64 || hex.len() % 2 == 1 {
        return Err(HexError::InvalidLength);
    }

    let mut padded = String::with_capacity(64);
    for _ in 0..(64 - hex.len()) {
        padded.push('0');
    }
    padded.push_str(hex);

    let mut bytes = [0u8; 32];
    for (i, byte_out) in bytes.iter_mut().enumerate() {
        let start = i * 2;
        *byte_out = u8::from_str_radix(&padded[start..start + 2], 16)
            .map_err(|_| HexError::InvalidHex)?;
    }
    bytes.reverse();
    Ok(bytes)
}

pub fn consensus_params(network: Network) -> ConsensusParams {
    match network {
        Network::Mainnet => mainnet_consensus_params(),
        Network::Testnet => testnet_consensus_params(),
        Network::Regtest => regtest_consensus_params(),
    }
}

pub fn chain_params(network: Network) -> ChainParams {
    match network {
        Network::Mainnet => ChainParams {
            network,
            consensus: mainnet_consensus_params(),
            message_start: [0xe4, 0xe8, 0xe9, 0xe5],
            default_port: 7777,
        },
        Network::Testnet => ChainParams {
            network,
            consensus: testnet_consensus_params(),
            message_start: [0xcd, 0xf2, 0xc0, 0xef],
            default_port: 17_777,
        },
        Network::Regtest => ChainParams {
            network,
            consensus: regtest_consensus_params(),
            message_start: [0xfa, 0xbf, 0xb5, 0xda],
            default_port: 18_777,
        },
    }
}

fn mainnet_consensus_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::Mainnet,
        hash_genesis_block: hash256_from_hex(
            "00000a060336cbb72fe969666d337b87198b1add2abaa59cca226820b32933a4",
        )
        .expect("mainnet genesis hash"),
        genesis_time: 1_360_105_017,
        pow_limit: hash256_from_hex(
            "00000fffffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
        )
        .expect("mainnet pow limit"),
        pos_limit: hash256_from_hex(
            "00000fffffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
        )
        .expect("mainnet pos limit"),
        entropy_switch_height: 9_689,
        coinbase_maturity: 500,
        checkpoints: mainnet_checkpoints(),
        stake_modifier_checkpoints: mainnet_stake_modifier_checkpoints(),
    }
}

fn testnet_consensus_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::Testnet,
        hash_genesis_block: hash256_from_hex(
            "0000724595fb3b9609d441cbfb9577615c292abf07d996d3edabc48de843642d",
        )
        .expect("testnet genesis hash"),
        genesis_time: 1_360_105_017,
        pow_limit: hash256_from_hex(
            "0000ffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
        )
        .expect("testnet pow limit"),
        pos_limit: hash256_from_hex(
            "0000ffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
        )
        .expect("testnet pos limit"),
        entropy_switch_height: 0,
        coinbase_maturity: 60,
        checkpoints: Vec::new(),
        stake_modifier_checkpoints: Vec::new(),
    }
}

fn regtest_consensus_params() -> ConsensusParams {
    ConsensusParams {
        network: Network::Regtest,
        hash_genesis_block: hash256_from_hex(
            "7cf1ff19a5b39e15a5a6d1d1c47d35cbf6dd535ee232b1dbb2b60337f2cf3d4a",
        )
        .expect("regtest genesis hash"),
        genesis_time: 1_296_688_602,
        pow_limit: hash256_from_hex(
            "7fffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
        )
        .expect("regtest pow limit"),
        pos_limit: hash256_from_hex(
            "7fffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
        )
        .expect("regtest pos limit"),
        entropy_switch_height: 0,
        coinbase_maturity: 10,
        checkpoints: Vec::new(),
        stake_modifier_checkpoints: Vec::new(),
    }
}

fn parse_checkpoints(entries: &[(i32, &str)]) -> Vec<Checkpoint> {
    entries
        .iter()
        .map(|(height, hash)| Checkpoint {
            height: *height,
            hash: hash256_from_hex(hash).expect("checkpoint hash"),
        })
        .collect()
}

fn mainnet_checkpoints() -> Vec<Checkpoint> {
    parse_checkpoints(&[
        (
            0,
            "00000a060336cbb72fe969666d337b87198b1add2abaa59cca226820b32933a4",
        ),
        (
            9_690,
            "00000e5695fcc8fb9e23bd4dcfcb98789598d0a9bb83ccd8a96c6cbc8fb09d1a",
        ),
        (
            37_092,
            "0000060d90bdc7a13ac80e2b81f47caa1a5ba1df1d512f1b270e7f8bc8975f8e",
        ),
        (
            104_831,
            "0000019c42357106a0b69abd2d85504b4dfb2e9ad0ec6c93b4d42eca7e742e55",
        ),
        (
            158_311,
            "000000cbcd79d2b4b28e014ff81aaaa73b1bf2a0a1a47a5c34fc4a6b00b41344",
        ),
    ])
}

fn mainnet_stake_modifier_checkpoints() -> Vec<StakeModifierCheckpoint> {
    vec![
        StakeModifierCheckpoint {
            height: 0,
            checksum: 0x0e00_670b,
        },
        StakeModifierCheckpoint {
            height: 9_690,
            checksum: 0x9b23_2d63,
        },
        StakeModifierCheckpoint {
            height: 37_092,
            checksum: 0x60b4_7e02,
        },
        StakeModifierCheckpoint {
            height: 104_831,
            checksum: 0x1b27_a618,
        },
        StakeModifierCheckpoint {
            height: 158_311,
            checksum: 0xc40a_4b5e,
        },
    ]
}
