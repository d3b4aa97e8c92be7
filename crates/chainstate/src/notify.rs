//! Callback seams to the wallet, UI, and networking collaborators.

use novad_consensus::Hash256;
use novad_primitives::block::Block;

use crate::blockindex::BlockIndex;

/// Thinning list of best-chain hashes, dense near the tip, exponential
/// further back. Lets a peer find the fork point against its own chain.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockLocator {
    pub have: Vec<Hash256>,
}

/// External observer of chain-state changes. Callbacks fire after the
/// owning transaction has committed, in chain order; implementations must
/// not call back into the chain state.
pub trait ChainListener: Send + Sync {
    fn on_block_connected(&self, _block: &Block, _index: &BlockIndex) {}

    fn on_block_disconnected(&self, _block: &Block, _index: &BlockIndex) {}

    /// Debounced during initial sync.
    fn on_blocks_changed(&self) {}

    /// Fired on best-chain advances outside initial sync.
    fn on_best_chain(&self, _locator: &BlockLocator) {}
}
