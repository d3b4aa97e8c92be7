//! Chain state: block storage, the transaction index, the block-index
//! graph, validation, and best-chain selection.

pub mod blockfiles;
pub mod blockindex;
pub mod chaindb;
pub mod notify;
pub mod script;
pub mod state;
pub mod txindex;
pub mod validation;

pub use blockfiles::{BlockFileError, BlockFileStore, BlockPosition};
pub use blockindex::BlockIndex;
pub use chaindb::ChainDb;
pub use notify::{BlockLocator, ChainListener};
pub use script::{ScriptError, ScriptVerifier, TxContext};
pub use state::{ChainOptions, ChainState, CheckpointPolicy};
pub use txindex::{DiskTxPos, TxIndexEntry};
pub use validation::{BlockError, CheckBlockFlags, ChainStateError};
