//! The durable chain index: transaction index records, block index
//! records, the best-chain pointer, and the synchronized checkpoint,
//! wrapped in a single-writer transaction scope.
//!
//! `begin` opens an overlay all reads consult and all writes land in;
//! `commit` applies it as one atomic batch; `abort` drops it. Nested
//! transactions are a bug and are rejected.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use novad_consensus::Hash256;
use novad_primitives::encoding::{decode, encode};
use novad_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::blockindex::BlockIndex;
use crate::txindex::TxIndexEntry;

const META_BEST_CHAIN_KEY: &[u8] = b"best_chain";
const CHECKPOINT_SYNC_KEY: &[u8] = b"sync";

#[derive(Debug)]
pub enum ChainDbError {
    Store(StoreError),
    TransactionAlreadyOpen,
    Corrupt(&'static str),
}

impl std::fmt::Display for ChainDbError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainDbError::Store(err) => write!(f, "{err}"),
            ChainDbError::TransactionAlreadyOpen => {
                write!(f, "index transaction already open")
            }
            ChainDbError::Corrupt(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for ChainDbError {}

impl From<StoreError> for ChainDbError {
    fn from(err: StoreError) -> Self {
        ChainDbError::Store(err)
    }
}

type Overlay = BTreeMap<(Column, Vec<u8>), Option<Vec<u8>>>;

pub struct ChainDb<S> {
    store: Arc<S>,
    txn: Mutex<Option<Overlay>>,
}

impl<S: KeyValueStore> ChainDb<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            txn: Mutex::new(None),
        }
    }

    pub fn begin(&self) -> Result<(), ChainDbError> {
        let mut txn = self.txn.lock().expect("chain db lock");
        if txn.is_some() {
            return Err(ChainDbError::TransactionAlreadyOpen);
        }
        *txn = Some(Overlay::new());
        Ok(())
    }

    pub fn commit(&self) -> Result<(), ChainDbError> {
        let overlay = self
            .txn
            .lock()
            .expect("chain db lock")
            .take()
            .ok_or(ChainDbError::Corrupt("commit without open transaction"))?;
        let mut batch = WriteBatch::new();
        for ((column, key), value) in overlay {
            match value {
                Some(value) => batch.put(column, key, value),
                None => batch.delete(column, key),
            }
        }
        self.store.write_batch(&batch)?;
        Ok(())
    }

    pub fn abort(&self) {
        *self.txn.lock().expect("chain db lock") = None;
    }

    pub fn in_transaction(&self) -> bool {
        self.txn.lock().expect("chain db lock").is_some()
    }

    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, ChainDbError> {
        {
            let txn = self.txn.lock().expect("chain db lock");
            if let Some(overlay) = txn.as_ref() {
                if let Some(value) = overlay.get(&(column, key.to_vec())) {
                    return Ok(value.clone());
                }
            }
        }
        Ok(self.store.get(column, key)?)
    }

    fn put(&self, column: Column, key: &[u8], value: Vec<u8>) -> Result<(), ChainDbError> {
        let mut txn = self.txn.lock().expect("chain db lock");
        match txn.as_mut() {
            Some(overlay) => {
                overlay.insert((column, key.to_vec()), Some(value));
                Ok(())
            }
            None => Ok(self.store.put(column, key, &value)?),
        }
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), ChainDbError> {
        let mut txn = self.txn.lock().expect("chain db lock");
        match txn.as_mut() {
            Some(overlay) => {
                overlay.insert((column, key.to_vec()), None);
                Ok(())
            }
            None => Ok(self.store.delete(column, key)?),
        }
    }

    pub fn read_tx_index(&self, txid: &Hash256) -> Result<Option<TxIndexEntry>, ChainDbError> {
        match self.get(Column::TxIndex, txid)? {
            Some(bytes) => decode(&bytes)
                .map(Some)
                .map_err(|_| ChainDbError::Corrupt("invalid tx index entry")),
            None => Ok(None),
        }
    }

    pub fn update_tx_index(
        &self,
        txid: &Hash256,
        entry: &TxIndexEntry,
    ) -> Result<(), ChainDbError> {
        self.put(Column::TxIndex, txid, encode(entry))
    }

    pub fn erase_tx_index(&self, txid: &Hash256) -> Result<(), ChainDbError> {
        self.delete(Column::TxIndex, txid)
    }

    pub fn read_block_index(&self, hash: &Hash256) -> Result<Option<BlockIndex>, ChainDbError> {
        match self.get(Column::BlockIndex, hash)? {
            Some(bytes) => {
                let mut node: BlockIndex = decode(&bytes)
                    .map_err(|_| ChainDbError::Corrupt("invalid block index entry"))?;
                node.block_hash = *hash;
                Ok(Some(node))
            }
            None => Ok(None),
        }
    }

    pub fn write_block_index(&self, node: &BlockIndex) -> Result<(), ChainDbError> {
        self.put(Column::BlockIndex, &node.block_hash, encode(node))
    }

    /// Every persisted block-index node, hash filled from the key. Trust
    /// and linkage are the loader's job.
    pub fn scan_block_index(&self) -> Result<Vec<BlockIndex>, ChainDbError> {
        let entries = self.store.scan_prefix(Column::BlockIndex, &[])?;
        let mut nodes = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            if key.len() != 32 {
                return Err(ChainDbError::Corrupt("invalid block index key"));
            }
            let mut node: BlockIndex =
                decode(&value).map_err(|_| ChainDbError::Corrupt("invalid block index entry"))?;
            node.block_hash.copy_from_slice(&key);
            nodes.push(node);
        }
        Ok(nodes)
    }

    pub fn read_best_chain(&self) -> Result<Option<Hash256>, ChainDbError> {
        match self.get(Column::Meta, META_BEST_CHAIN_KEY)? {
            Some(bytes) => {
                let hash: Hash256 = bytes
                    .try_into()
                    .map_err(|_| ChainDbError::Corrupt("invalid best chain hash"))?;
                Ok(Some(hash))
            }
            None => Ok(None),
        }
    }

    pub fn write_best_chain(&self, hash: &Hash256) -> Result<(), ChainDbError> {
        self.put(Column::Meta, META_BEST_CHAIN_KEY, hash.to_vec())
    }

    pub fn read_sync_checkpoint(&self) -> Result<Option<Hash256>, ChainDbError> {
        match self.get(Column::Checkpoint, CHECKPOINT_SYNC_KEY)? {
            Some(bytes) => {
                let hash: Hash256 = bytes
                    .try_into()
                    .map_err(|_| ChainDbError::Corrupt("invalid sync checkpoint hash"))?;
                Ok(Some(hash))
            }
            None => Ok(None),
        }
    }

    pub fn write_sync_checkpoint(&self, hash: &Hash256) -> Result<(), ChainDbError> {
        self.put(Column::Checkpoint, CHECKPOINT_SYNC_KEY, hash.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txindex::DiskTxPos;
    use novad_storage::memory::MemoryStore;

    fn db() -> ChainDb<MemoryStore> {
        ChainDb::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn nested_begin_is_rejected() {
        let db = db();
        db.begin().expect("begin");
        assert!(matches!(
            db.begin(),
            Err(ChainDbError::TransactionAlreadyOpen)
        ));
        db.abort();
        db.begin().expect("begin after abort");
        db.commit().expect("commit");
    }

    #[test]
    fn abort_discards_writes() {
        let db = db();
        let txid = [7u8; 32];
        db.begin().expect("begin");
        db.update_tx_index(&txid, &TxIndexEntry::new(DiskTxPos::new(0, 0, 8), 1))
            .expect("update");
        assert!(db.read_tx_index(&txid).expect("read").is_some());
        db.abort();
        assert!(db.read_tx_index(&txid).expect("read").is_none());
    }

    #[test]
    fn commit_is_atomic_and_visible() {
        let db = db();
        let txid = [7u8; 32];
        let best = [9u8; 32];
        db.begin().expect("begin");
        db.update_tx_index(&txid, &TxIndexEntry::new(DiskTxPos::new(1, 2, 10), 2))
            .expect("update");
        db.write_best_chain(&best).expect("write best");
        db.commit().expect("commit");

        let entry = db.read_tx_index(&txid).expect("read").expect("entry");
        assert_eq!(entry.pos, DiskTxPos::new(1, 2, 10));
        assert_eq!(entry.spent.len(), 2);
        assert_eq!(db.read_best_chain().expect("read best"), Some(best));
    }

    #[test]
    fn overlay_shadows_committed_state() {
        let db = db();
        let txid = [7u8; 32];
        db.update_tx_index(&txid, &TxIndexEntry::new(DiskTxPos::new(0, 0, 8), 1))
            .expect("direct write");

        db.begin().expect("begin");
        db.erase_tx_index(&txid).expect("erase");
        assert!(db.read_tx_index(&txid).expect("read").is_none());
        db.abort();
        assert!(db.read_tx_index(&txid).expect("read").is_some());
    }
}
