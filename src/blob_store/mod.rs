/// Disk-backed blob storage
///
/// Optional: the relay only serves blobs when a blob directory is
/// configured. Blobs are stored under a per-DID directory keyed by CID.
use crate::error::{RelayError, RelayResult};
use std::path::{Path, PathBuf};

pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn blob_path(&self, did: &str, cid: &str) -> PathBuf {
        // DIDs contain ':' which is unfriendly on some filesystems
        let dir = did.replace(':', "_");
        self.root.join(dir).join(cid)
    }

    pub async fn get_blob(&self, did: &str, cid: &str) -> RelayResult<Vec<u8>> {
        let path = self.blob_path(did, cid);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(RelayError::NotFound(format!("blob {} not found", cid)))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn put_blob(&self, did: &str, cid: &str, bytes: &[u8]) -> RelayResult<()> {
        let path = self.blob_path(did, cid);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}
