// SPDX-License-Identifier: MIT OR Apache-2.0
//! Directory-backed local blockstore.
//!
//! One file per block, named by the CID's canonical string form. Writes go
//! through a temp file + rename so a crashed put never leaves a torn block.

use cid::Cid;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;

/// A durable block directory owned by the worker process.
#[derive(Debug, Clone)]
pub struct Blockstore {
    root: PathBuf,
}

impl Blockstore {
    /// Open (creating if needed) a blockstore at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn path_for(&self, cid: &Cid) -> PathBuf {
        self.root.join(cid.to_string())
    }

    /// Store a block. Idempotent; re-putting the same CID is a no-op write.
    pub async fn put(&self, cid: &Cid, bytes: &[u8]) -> std::io::Result<()> {
        let path = self.path_for(cid);
        if tokio::fs::try_exists(&path).await? {
            return Ok(());
        }
        let tmp = path.with_extension("tmp");
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Read a block, `None` when absent.
    pub async fn get(&self, cid: &Cid) -> std::io::Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.path_for(cid)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// `true` when the block is present locally.
    pub async fn contains(&self, cid: &Cid) -> std::io::Result<bool> {
        tokio::fs::try_exists(self.path_for(cid)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use multihash_codetable::{Code, MultihashDigest};

    fn cid_of(bytes: &[u8]) -> Cid {
        Cid::new_v1(crate::RAW_CODEC, Code::Sha2_256.digest(bytes))
    }

    #[tokio::test]
    async fn put_get_contains() {
        let dir = tempfile::tempdir().unwrap();
        let store = Blockstore::open(dir.path()).await.unwrap();
        let cid = cid_of(b"hello");

        assert!(!store.contains(&cid).await.unwrap());
        store.put(&cid, b"hello").await.unwrap();
        assert!(store.contains(&cid).await.unwrap());
        assert_eq!(store.get(&cid).await.unwrap().unwrap(), b"hello");
    }

    #[tokio::test]
    async fn re_put_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = Blockstore::open(dir.path()).await.unwrap();
        let cid = cid_of(b"twice");
        store.put(&cid, b"twice").await.unwrap();
        store.put(&cid, b"twice").await.unwrap();
        assert_eq!(store.get(&cid).await.unwrap().unwrap(), b"twice");
    }

    #[tokio::test]
    async fn missing_block_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = Blockstore::open(dir.path()).await.unwrap();
        assert!(store.get(&cid_of(b"nope")).await.unwrap().is_none());
    }
}
