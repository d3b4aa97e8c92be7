//! Stake entropy bits.
//!
//! Blocks below the switch height predate entropy-carrying block hashes;
//! their bits were fixed once from the historic chain and shipped as a
//! table. At and above the switch height (and on test networks throughout)
//! the bit is the low bit of the block hash.

use novad_consensus::{ConsensusParams, Hash256};

/// One row per 256 consecutive heights, 38 rows covering every block below
/// the mainnet switch height of 9689. Row text is big-endian hex; bit `i`
/// of a row is bit `i` of the little-endian integer it denotes.
const ENTROPY_ROWS: [&str; 38] = [
    "871d472541384739f486ebc85c0bebd902d0bcbf6f48e0ca339482f236d378b7",
    "91d77b0068343237ba38721fe56ed3a6b83613eebdad5d8b7de500eb01cf8a9f",
    "1e920c1c1cf29cd24dff401e1a56c3760409b2fba6f97254bd6ff7d6b494b11e",
    "7455c4aa699aabf9276ec95dd3230fce478eb8cedb6a50705967796bb647c278",
    "5b7a033466559bd3ca3e021f0277cf0650af338a0573a9d094a6f51dfc88a93d",
    "eaeb95ed1689a1ba378efc9e6adcae6a278b292ec0da87489126a068dc993896",
    "e3d7be55001c253dd22d395d972c22ec1edc2c5d73cb94ab5dec3b9fe801f5fd",
    "6fcd37e6222d0f13862d4d1cbbccd63be511a291f1d7aafc9b246f04782c9ab4",
    "e85a97ae68215b19058d965df40924eb6f9242dd622d35900650f87bf4eecb9b",
    "0dab0498fc8360221a3d8104f63f8d3ee12fc081dc6a68d6e67afff30850f693",
    "3d23453dc362d63151080a4cca788df173a4fb6bd1223ad474fb71455f7e8109",
    "fc5828fc0e00ccea029cc8211f815c9acd622402ca3e025d47b0ac88e593a648",
    "08007833ab696f0bd076d601d09cea615bee97a2eceb72a4b7ff945fc24258e4",
    "e20d75d5ce1686d96441587e53187688af55789e82ae82d9cd7d7492b8a9ffff",
    "edb82ea4138e0c1b091485107fb03d7abd260db8c97314e84afb15584328e4f9",
    "3d61f95c5018bb2ae781f029e0e23ee77365e4ee73fe9dfeb5d6a9629726da48",
    "300c8acb9a83b67e202d823ad1e18aae52658861c04923dd79dfe158394f20d0",
    "3eedc226162b43fa48efe2a2c39c5c87ab40b861cf6c9ffb7a9647a28f3fa005",
    "32f0140bc371e87274a80c9b26ec28551cf836ee1a3871aca6de1bce6fa68bf0",
    "4a60f45a1c99b1b0f6a9319ce8908b2ce3f055b8298a8b6be15bed410efccd30",
    "27a92621c7d4f241633499ed05a4a2d13086f9881ad6c9375da3a0cca187d907",
    "850109695016d21e5b68236a08dd8a9d4a4469e7fda5dd4055e01ca38cb21cc4",
    "f86b8430849d6f0b27ecc7446f2f6dc2fc02c8bcc3bae1eecd282a17419b0b41",
    "694a4e9f8dd0ca1cae297d06416033b966aaa491005816bb8473add223cdd411",
    "66485cbab903f4f412d3af1d69515367ba42c25ab47e8e4964826aa120450bf4",
    "19e8d661a904e1b14d38549170534d0b74f42fbe800a2d875eae548b73e8976e",
    "a46d637e0118b4717af5512cb21ec5278ff0b74bd8c9c56e7295d54306a2b69a",
    "7d451ab88bd64bdbd1f721f68b8576a995de88881a72868e2b02fdca041101dd",
    "79b54f83bb78325c7501495a6d32d64774f8b0d0dabb2889c1d49fc3b487c559",
    "f1ff77e0fdf713955e4d7edf62577f8dbe1b3db9d629fe1d286c26d666858df4",
    "e3b4a730f116fb84163d07df7021e4fc73c4f43d493fd36a23f634b5204da104",
    "6389d773f6ed71cd44dc3e34a784b52b75f13ce347ebaf26f7ee5114f5619768",
    "a9196fa6d8e62f053d609dba39561f7560b02a54e5f5708a4c20d1071472e64d",
    "a71381576272e9c4c90606e63522f41d81c73f26cdf9bb037efd70bb16bd5501",
    "de472b97d9347f3e25621711d039e4703c66d96b0f8c5c9d1879deb491d2c672",
    "7f96c2dc5f1a31a51aca3baf9043067f439f42672c3744e3efb48d87adeae963",
    "cc60c8047bc6782947397d7ca20ba64d100cc2a40d563a97f5225f261c5625be",
    "41ac4dba6de4ad596dd12add6e93985d470ef3a9844677fac9a7b003de2714ac",
];

fn table_bit(height: i32) -> bool {
    let row = ENTROPY_ROWS[(height / 256) as usize];
    let bit = (height % 256) as usize;
    // Hex text is big-endian; bit 0 lives in the last byte pair.
    let nibble_index = 63 - bit / 4;
    let nibble = row.as_bytes()[nibble_index];
    let value = match nibble {
        b'0'..=b'9' => nibble - b'0',
        b'a'..=b'f' => nibble - b'a' + 10,
        _ => unreachable!("entropy table is lowercase hex"),
    };
    (value >> (bit % 4)) & 1 == 1
}

pub fn stake_entropy_bit(height: i32, block_hash: &Hash256, params: &ConsensusParams) -> bool {
    if height >= params.entropy_switch_height {
        return block_hash[0] & 1 == 1;
    }
    table_bit(height)
}
