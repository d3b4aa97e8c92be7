//! Append-only block files.
//!
//! Record layout: 4-byte network magic, 4-byte little-endian payload
//! length, serialized block. Files are `blk<NNNN>.dat` and roll over when
//! they pass the size cap. Offsets stay within `u32` because the cap does.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use novad_primitives::block::{Block, BlockHeader, HEADER_SIZE};
use novad_primitives::encoding::{Decodable, Decoder};
use novad_primitives::transaction::Transaction;

use crate::txindex::DiskTxPos;

pub const DEFAULT_MAX_FILE_SIZE: u32 = 0x7f00_0000;

const RECORD_HEADER_SIZE: u32 = 8;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockPosition {
    pub file_id: u32,
    /// Offset of the record (the magic bytes), not the payload.
    pub offset: u32,
}

#[derive(Debug)]
pub enum BlockFileError {
    Io(std::io::Error),
    BadMagic,
    BadLength,
    BadPayload(&'static str),
    FileTooLarge,
}

impl std::fmt::Display for BlockFileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockFileError::Io(err) => write!(f, "{err}"),
            BlockFileError::BadMagic => write!(f, "block record magic mismatch"),
            BlockFileError::BadLength => write!(f, "block record length mismatch"),
            BlockFileError::BadPayload(message) => write!(f, "{message}"),
            BlockFileError::FileTooLarge => write!(f, "block exceeds the file size cap"),
        }
    }
}

impl std::error::Error for BlockFileError {}

impl From<std::io::Error> for BlockFileError {
    fn from(err: std::io::Error) -> Self {
        BlockFileError::Io(err)
    }
}

pub struct BlockFileStore {
    dir: PathBuf,
    magic: [u8; 4],
    max_file_size: u32,
    state: Mutex<ActiveFile>,
}

#[derive(Debug)]
struct ActiveFile {
    file_id: u32,
    len: u32,
}

impl BlockFileStore {
    pub fn new(
        dir: impl Into<PathBuf>,
        magic: [u8; 4],
        max_file_size: u32,
    ) -> Result<Self, BlockFileError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let (file_id, len) = Self::locate_active_file(&dir, max_file_size)?;
        Ok(Self {
            dir,
            magic,
            max_file_size,
            state: Mutex::new(ActiveFile { file_id, len }),
        })
    }

    /// Appends one block payload; `sync` forces the write to disk before
    /// returning. Steady-state appends sync every block, initial sync only
    /// periodically.
    pub fn append(&self, payload: &[u8], sync: bool) -> Result<BlockPosition, BlockFileError> {
        let needed = RECORD_HEADER_SIZE as u64 + payload.len() as u64;
        if needed > self.max_file_size as u64 {
            return Err(BlockFileError::FileTooLarge);
        }

        let mut state = self.state.lock().expect("block file lock");
        if state.len as u64 + needed > self.max_file_size as u64 {
            state.file_id += 1;
            state.len = 0;
        }
        let offset = state.len;
        let path = self.file_path(state.file_id);
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(&self.magic)?;
        file.write_all(&(payload.len() as u32).to_le_bytes())?;
        file.write_all(payload)?;
        if sync {
            file.sync_data()?;
        }
        state.len += needed as u32;
        Ok(BlockPosition {
            file_id: state.file_id,
            offset,
        })
    }

    /// Reads one record's payload.
    pub fn read(&self, position: BlockPosition) -> Result<Vec<u8>, BlockFileError> {
        let path = self.file_path(position.file_id);
        let mut file = File::open(&path)?;
        file.seek(SeekFrom::Start(position.offset as u64))?;
        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if magic != self.magic {
            return Err(BlockFileError::BadMagic);
        }
        let mut len_bytes = [0u8; 4];
        file.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes);
        if len as u64 > self.max_file_size as u64 {
            return Err(BlockFileError::BadLength);
        }
        let mut payload = vec![0u8; len as usize];
        file.read_exact(&mut payload)?;
        Ok(payload)
    }

    pub fn read_block(&self, position: BlockPosition) -> Result<Block, BlockFileError> {
        let payload = self.read(position)?;
        novad_primitives::encoding::decode(&payload)
            .map_err(|_| BlockFileError::BadPayload("undecodable block record"))
    }

    /// Header-only read; skips transactions and the signature.
    pub fn read_header(&self, position: BlockPosition) -> Result<BlockHeader, BlockFileError> {
        let payload = self.read(position)?;
        if payload.len() < HEADER_SIZE {
            return Err(BlockFileError::BadLength);
        }
        let mut decoder = Decoder::new(&payload[..HEADER_SIZE]);
        BlockHeader::consensus_decode(&mut decoder)
            .map_err(|_| BlockFileError::BadPayload("undecodable block header"))
    }

    /// Reads one transaction through its disk locator. `tx_offset` is an
    /// absolute file offset inside the record at `block_offset`.
    pub fn read_tx(&self, pos: DiskTxPos) -> Result<Transaction, BlockFileError> {
        let payload = self.read(BlockPosition {
            file_id: pos.file_id,
            offset: pos.block_offset,
        })?;
        let skip = pos
            .tx_offset
            .checked_sub(pos.block_offset + RECORD_HEADER_SIZE)
            .ok_or(BlockFileError::BadPayload("transaction offset underflow"))?
            as usize;
        if skip >= payload.len() {
            return Err(BlockFileError::BadPayload("transaction offset out of range"));
        }
        let mut decoder = Decoder::new(&payload[skip..]);
        Transaction::consensus_decode(&mut decoder)
            .map_err(|_| BlockFileError::BadPayload("undecodable transaction record"))
    }

    fn file_path(&self, file_id: u32) -> PathBuf {
        self.dir.join(format!("blk{file_id:04}.dat"))
    }

    fn locate_active_file(dir: &Path, max_file_size: u32) -> Result<(u32, u32), BlockFileError> {
        let mut file_id = 0u32;
        let mut last: Option<(u32, u32)> = None;
        loop {
            let path = dir.join(format!("blk{file_id:04}.dat"));
            if !path.exists() {
                break;
            }
            let len = std::fs::metadata(&path)?.len();
            let len = u32::try_from(len).map_err(|_| BlockFileError::BadLength)?;
            last = Some((file_id, len));
            file_id += 1;
        }
        match last {
            Some((id, len)) if len >= max_file_size => Ok((id + 1, 0)),
            Some((id, len)) => Ok((id, len)),
            None => Ok((0, 0)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAGIC: [u8; 4] = [0xfa, 0xbf, 0xb5, 0xda];

    #[test]
    fn append_then_read_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = BlockFileStore::new(dir.path(), MAGIC, 1_000_000).expect("store");

        let first = store.append(b"first block", true).expect("append");
        let second = store.append(b"second", false).expect("append");
        assert_eq!(first.offset, 0);
        assert_eq!(second.offset, 8 + 11);

        assert_eq!(store.read(first).expect("read"), b"first block");
        assert_eq!(store.read(second).expect("read"), b"second");
    }

    #[test]
    fn rolls_to_next_file_at_cap() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = BlockFileStore::new(dir.path(), MAGIC, 64).expect("store");

        let first = store.append(&[0u8; 40], true).expect("append");
        let second = store.append(&[1u8; 40], true).expect("append");
        assert_eq!(first.file_id, 0);
        assert_eq!(second.file_id, 1);
        assert_eq!(second.offset, 0);
        assert_eq!(store.read(second).expect("read"), vec![1u8; 40]);
    }

    #[test]
    fn reopen_continues_the_last_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = {
            let store = BlockFileStore::new(dir.path(), MAGIC, 1_000_000).expect("store");
            store.append(b"persisted", true).expect("append")
        };
        let store = BlockFileStore::new(dir.path(), MAGIC, 1_000_000).expect("reopen");
        let second = store.append(b"more", true).expect("append");
        assert_eq!(second.file_id, first.file_id);
        assert!(second.offset > first.offset);
        assert_eq!(store.read(first).expect("read"), b"persisted");
    }

    #[test]
    fn wrong_magic_is_detected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let position = {
            let store = BlockFileStore::new(dir.path(), MAGIC, 1_000_000).expect("store");
            store.append(b"payload", true).expect("append")
        };
        let other = BlockFileStore::new(dir.path(), [0u8; 4], 1_000_000).expect("store");
        assert!(matches!(
            other.read(position),
            Err(BlockFileError::BadMagic)
        ));
    }
}
