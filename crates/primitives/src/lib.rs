//! Canonical serialization and the block / transaction object model.

pub mod block;
pub mod encoding;
pub mod hash;
pub mod merkle;
pub mod outpoint;
pub mod transaction;

pub use block::{Block, BlockHeader};
pub use outpoint::OutPoint;
pub use transaction::{Transaction, TxIn, TxOut};
