use crate::crypto::PublicKey;
use crate::error::{GlobeError, Result};
use bytes::Bytes;
use std::io::SeekFrom;
use std::path::PathBuf;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// Local byte storage. Files live at `{base}/data/{owner_hex}/{filename}`.
#[derive(Debug, Clone)]
pub struct FileStore {
    base_path: PathBuf,
}

impl FileStore {
    pub fn new(base_path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(base_path.join("data"))?;
        Ok(Self { base_path })
    }

    fn owner_dir(&self, owner: &PublicKey) -> PathBuf {
        self.base_path.join("data").join(owner.to_hex())
    }

    fn file_path(&self, owner: &PublicKey, filename: &str) -> PathBuf {
        let mut path = self.owner_dir(owner);
        for component in filename.split('/') {
            path.push(component);
        }
        path
    }

    /// Refuse a name whose path runs through a stored file, or that lands on a
    /// directory of other files, as `a` and `a/b` would.
    async fn check_collision(&self, owner: &PublicKey, filename: &str) -> Result<()> {
        let mut path = self.owner_dir(owner);
        let mut components = filename.split('/').peekable();
        while let Some(component) = components.next() {
            path.push(component);
            let meta = match fs::metadata(&path).await {
                Ok(meta) => meta,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(e) => return Err(e.into()),
            };
            let is_last = components.peek().is_none();
            if meta.is_dir() == is_last {
                return Err(GlobeError::Conflict(format!(
                    "{}/{} collides with another stored file",
                    owner, filename
                )));
            }
        }
        Ok(())
    }

    /// Write `data` at `offset`, dropping whatever followed `offset` before.
    pub async fn write_at(&self, owner: &PublicKey, filename: &str, offset: u64, data: &[u8]) -> Result<()> {
        self.check_collision(owner, filename).await?;
        let path = self.file_path(owner, filename);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .await?;

        let current = file.metadata().await?.len();
        if current < offset {
            return Err(GlobeError::Internal(format!(
                "cannot write {}/{} at {}: only {} bytes stored",
                owner, filename, offset, current
            )));
        }

        file.set_len(offset).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.sync_data().await?;

        tracing::debug!(
            "Stored {} bytes of {}/{} at offset {}",
            data.len(),
            owner,
            filename,
            offset
        );
        Ok(())
    }

    pub async fn read_range(&self, owner: &PublicKey, filename: &str, offset: u64, len: u64) -> Result<Bytes> {
        let path = self.file_path(owner, filename);
        let mut file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(GlobeError::NotFound(format!("bytes of {}/{}", owner, filename)));
            }
            Err(e) => return Err(e.into()),
        };

        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = Vec::with_capacity(len as usize);
        file.take(len).read_to_end(&mut buf).await?;
        if (buf.len() as u64) < len {
            return Err(GlobeError::Internal(format!(
                "{}/{} is shorter than its ledger: wanted {} bytes at {}, got {}",
                owner,
                filename,
                len,
                offset,
                buf.len()
            )));
        }
        Ok(Bytes::from(buf))
    }

    /// Remove the bytes of a file along with directories it leaves empty.
    pub async fn delete(&self, owner: &PublicKey, filename: &str) -> Result<()> {
        let path = self.file_path(owner, filename);
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        let owner_dir = self.owner_dir(owner);
        let mut dir = path.parent();
        while let Some(current) = dir.filter(|d| *d != owner_dir.as_path()) {
            if fs::remove_dir(current).await.is_err() {
                break;
            }
            dir = current.parent();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    #[tokio::test]
    async fn test_file_store() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(temp_dir.path().to_path_buf()).unwrap();
        let owner = KeyPair::generate().public_key();

        assert!(store.read_range(&owner, "dir/a.txt", 0, 1).await.unwrap_err().is_not_found());

        store.write_at(&owner, "dir/a.txt", 0, b"hello ").await.unwrap();
        store.write_at(&owner, "dir/a.txt", 6, b"world").await.unwrap();
        assert_eq!(
            store.read_range(&owner, "dir/a.txt", 3, 5).await.unwrap(),
            Bytes::from_static(b"lo wo")
        );

        // rewriting at an earlier offset drops the old tail
        store.write_at(&owner, "dir/a.txt", 5, b"!").await.unwrap();
        assert_eq!(
            store.read_range(&owner, "dir/a.txt", 0, 6).await.unwrap(),
            Bytes::from_static(b"hello!")
        );
        assert!(store.read_range(&owner, "dir/a.txt", 0, 7).await.is_err());
        assert!(store.write_at(&owner, "dir/a.txt", 10, b"gap").await.is_err());

        store.delete(&owner, "dir/a.txt").await.unwrap();
        store.delete(&owner, "dir/a.txt").await.unwrap();
        assert!(store.read_range(&owner, "dir/a.txt", 0, 1).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_nested_name_collision() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(temp_dir.path().to_path_buf()).unwrap();
        let owner = KeyPair::generate().public_key();

        store.write_at(&owner, "a", 0, b"file").await.unwrap();
        let error = store.write_at(&owner, "a/b", 0, b"nested").await.unwrap_err();
        assert!(matches!(error, GlobeError::Conflict(_)), "{:?}", error);
        assert!(store.write_at(&owner, "a/b/c", 0, b"deeper").await.is_err());
        assert_eq!(store.read_range(&owner, "a", 0, 4).await.unwrap(), Bytes::from_static(b"file"));

        store.write_at(&owner, "c/d", 0, b"nested").await.unwrap();
        let error = store.write_at(&owner, "c", 0, b"file").await.unwrap_err();
        assert!(matches!(error, GlobeError::Conflict(_)), "{:?}", error);

        // Deleting the nested file frees its directories again.
        store.delete(&owner, "c/d").await.unwrap();
        store.write_at(&owner, "c", 0, b"file").await.unwrap();
        assert_eq!(store.read_range(&owner, "c", 0, 4).await.unwrap(), Bytes::from_static(b"file"));
    }
}
