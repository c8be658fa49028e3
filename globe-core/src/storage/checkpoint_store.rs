use crate::crypto::PublicKey;
use crate::error::{GlobeError, Result};
use crate::frame::SignedCheckpoint;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Per-node ledger of signed checkpoints and tombstones, keyed by (owner, filename).
///
/// Checkpoints are immutable once stored. A tombstone supersedes every checkpoint of
/// its file and blocks further stores for good.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    db_path: PathBuf,
}

impl CheckpointStore {
    pub fn new(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let store = Self { db_path };
        store.init_schema()?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn get_conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.get_conn()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                owner TEXT NOT NULL,
                filename TEXT NOT NULL,
                position INTEGER NOT NULL,
                payload BLOB NOT NULL,
                PRIMARY KEY (owner, filename, position)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS tombstones (
                owner TEXT NOT NULL,
                filename TEXT NOT NULL,
                payload BLOB NOT NULL,
                PRIMARY KEY (owner, filename)
            )",
            [],
        )?;

        Ok(())
    }

    /// Store a checkpoint. Identical re-stores are no-ops; a different checkpoint at an
    /// occupied position is a conflict; a tombstone checkpoint tombstones the file.
    pub fn store(&self, owner: &PublicKey, filename: &str, checkpoint: &SignedCheckpoint) -> Result<()> {
        if checkpoint.filename() != filename {
            return Err(GlobeError::InvalidRequest(format!(
                "checkpoint for '{}' stored under '{}'",
                checkpoint.filename(),
                filename
            )));
        }
        if checkpoint.is_tombstone() {
            return self.drop_file(owner, filename, checkpoint);
        }

        let owner_hex = owner.to_hex();
        let payload = checkpoint.to_bytes()?;
        let position = to_sql_position(checkpoint.position())?;

        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;

        if has_tombstone(&tx, &owner_hex, filename)? {
            return Err(GlobeError::Tombstoned(format!("{}/{}", owner_hex, filename)));
        }

        let existing: Option<Vec<u8>> = tx
            .query_row(
                "SELECT payload FROM checkpoints WHERE owner = ?1 AND filename = ?2 AND position = ?3",
                params![owner_hex, filename, position],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            Some(bytes) if bytes == payload => Ok(()),
            Some(_) => Err(GlobeError::Conflict(format!(
                "{}/{} already has a different checkpoint at {}",
                owner_hex,
                filename,
                checkpoint.position()
            ))),
            None => {
                tx.execute(
                    "INSERT INTO checkpoints (owner, filename, position, payload) VALUES (?1, ?2, ?3, ?4)",
                    params![owner_hex, filename, position, payload],
                )?;
                tx.commit()?;
                Ok(())
            }
        }
    }

    /// Permanently tombstone a file. Idempotent.
    pub fn drop_file(&self, owner: &PublicKey, filename: &str, tombstone: &SignedCheckpoint) -> Result<()> {
        if !tombstone.is_tombstone() || tombstone.filename() != filename {
            return Err(GlobeError::InvalidRequest(format!(
                "not a tombstone for '{}'",
                filename
            )));
        }

        let owner_hex = owner.to_hex();
        let payload = tombstone.to_bytes()?;

        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        if has_tombstone(&tx, &owner_hex, filename)? {
            return Ok(());
        }

        tx.execute(
            "INSERT INTO tombstones (owner, filename, payload) VALUES (?1, ?2, ?3)",
            params![owner_hex, filename, payload],
        )?;
        tx.execute(
            "DELETE FROM checkpoints WHERE owner = ?1 AND filename = ?2",
            params![owner_hex, filename],
        )?;
        tx.commit()?;

        tracing::debug!("Tombstoned {}/{}", owner_hex, filename);
        Ok(())
    }

    pub fn load(&self, owner: &PublicKey, filename: &str, position: u64) -> Result<SignedCheckpoint> {
        let conn = self.get_conn()?;
        let payload: Option<Vec<u8>> = conn
            .query_row(
                "SELECT payload FROM checkpoints WHERE owner = ?1 AND filename = ?2 AND position = ?3",
                params![owner.to_hex(), filename, to_sql_position(position)?],
                |row| row.get(0),
            )
            .optional()?;

        match payload {
            Some(bytes) => SignedCheckpoint::from_bytes(&bytes),
            None => Err(GlobeError::NotFound(format!(
                "checkpoint {}/{}@{}",
                owner, filename, position
            ))),
        }
    }

    /// The file's tombstone if it has one, otherwise its highest checkpoint.
    pub fn load_latest(&self, owner: &PublicKey, filename: &str) -> Result<SignedCheckpoint> {
        if let Some(tombstone) = self.tombstone(owner, filename)? {
            return Ok(tombstone);
        }

        let conn = self.get_conn()?;
        let payload: Option<Vec<u8>> = conn
            .query_row(
                "SELECT payload FROM checkpoints WHERE owner = ?1 AND filename = ?2
                 ORDER BY position DESC LIMIT 1",
                params![owner.to_hex(), filename],
                |row| row.get(0),
            )
            .optional()?;

        match payload {
            Some(bytes) => SignedCheckpoint::from_bytes(&bytes),
            None => Err(GlobeError::NotFound(format!("file {}/{}", owner, filename))),
        }
    }

    pub fn tombstone(&self, owner: &PublicKey, filename: &str) -> Result<Option<SignedCheckpoint>> {
        let conn = self.get_conn()?;
        let payload: Option<Vec<u8>> = conn
            .query_row(
                "SELECT payload FROM tombstones WHERE owner = ?1 AND filename = ?2",
                params![owner.to_hex(), filename],
                |row| row.get(0),
            )
            .optional()?;

        payload
            .map(|bytes| SignedCheckpoint::from_bytes(&bytes))
            .transpose()
    }

    pub fn list_index(&self, owner: &PublicKey, filename: &str) -> Result<Vec<u64>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT position FROM checkpoints WHERE owner = ?1 AND filename = ?2 ORDER BY position ASC",
        )?;
        let rows = stmt.query_map(params![owner.to_hex(), filename], |row| row.get::<_, i64>(0))?;

        let mut positions = Vec::new();
        for row in rows {
            positions.push(row? as u64);
        }
        Ok(positions)
    }

    /// Known filenames of `owner` matching `pattern`, tombstoned ones included.
    pub fn list_files(&self, owner: &PublicKey, pattern: &str) -> Result<Vec<String>> {
        let pattern = compile_glob(pattern)?;
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT filename FROM checkpoints WHERE owner = ?1
             UNION SELECT filename FROM tombstones WHERE owner = ?1
             ORDER BY filename ASC",
        )?;
        let rows = stmt.query_map(params![owner.to_hex()], |row| row.get::<_, String>(0))?;

        let mut files = Vec::new();
        for row in rows {
            let filename = row?;
            if pattern.matches(&filename) {
                files.push(filename);
            }
        }
        Ok(files)
    }

    /// Latest checkpoint (or tombstone) of every file matching `pattern`.
    pub fn list_latest(&self, owner: &PublicKey, pattern: &str) -> Result<Vec<SignedCheckpoint>> {
        let pattern = compile_glob(pattern)?;
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT c.filename, c.payload FROM checkpoints c
             WHERE c.owner = ?1 AND c.position = (
                 SELECT MAX(position) FROM checkpoints
                 WHERE owner = c.owner AND filename = c.filename
             )
             UNION ALL SELECT filename, payload FROM tombstones WHERE owner = ?1",
        )?;
        let rows = stmt.query_map(params![owner.to_hex()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;

        let mut checkpoints = Vec::new();
        for row in rows {
            let (filename, payload) = row?;
            if pattern.matches(&filename) {
                checkpoints.push(SignedCheckpoint::from_bytes(&payload)?);
            }
        }
        checkpoints.sort_by(|a, b| a.filename().cmp(b.filename()));
        Ok(checkpoints)
    }

    pub fn list_owners(&self) -> Result<Vec<PublicKey>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT owner FROM checkpoints UNION SELECT owner FROM tombstones ORDER BY owner ASC",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut owners = Vec::new();
        for row in rows {
            owners.push(PublicKey::from_hex(&row?)?);
        }
        Ok(owners)
    }

    /// Forget a live file's checkpoints. Tombstones are never evicted.
    pub fn evict(&self, owner: &PublicKey, filename: &str) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "DELETE FROM checkpoints WHERE owner = ?1 AND filename = ?2",
            params![owner.to_hex(), filename],
        )?;
        Ok(())
    }
}

fn has_tombstone(conn: &Connection, owner_hex: &str, filename: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM tombstones WHERE owner = ?1 AND filename = ?2",
            params![owner_hex, filename],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn to_sql_position(position: u64) -> Result<i64> {
    i64::try_from(position)
        .map_err(|_| GlobeError::InvalidRequest(format!("position {} out of range", position)))
}

fn compile_glob(pattern: &str) -> Result<glob::Pattern> {
    glob::Pattern::new(pattern)
        .map_err(|e| GlobeError::InvalidRequest(format!("invalid glob '{}': {}", pattern, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{KeyPair, Signed};
    use crate::frame::{Checkpoint, DigestState, sign_tombstone};

    fn checkpoint(keys: &KeyPair, filename: &str, data: &[u8]) -> SignedCheckpoint {
        let mut state = DigestState::new();
        state.update(data);
        Signed::sign(Checkpoint::at(filename, &state, None), keys).unwrap()
    }

    fn open_store() -> (tempfile::TempDir, CheckpointStore) {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(temp_dir.path().join("ledger.db")).unwrap();
        (temp_dir, store)
    }

    #[test]
    fn test_store_and_load() {
        let (_dir, store) = open_store();
        let keys = KeyPair::generate();
        let owner = keys.public_key();

        let first = checkpoint(&keys, "a.txt", b"0123456789");
        let second = checkpoint(&keys, "a.txt", b"0123456789abcdefghij");
        store.store(&owner, "a.txt", &first).unwrap();
        store.store(&owner, "a.txt", &second).unwrap();

        assert_eq!(store.load(&owner, "a.txt", 10).unwrap(), first);
        assert_eq!(store.load_latest(&owner, "a.txt").unwrap(), second);
        assert_eq!(store.list_index(&owner, "a.txt").unwrap(), vec![10, 20]);
        assert!(store.load(&owner, "a.txt", 15).unwrap_err().is_not_found());
        assert!(store.load_latest(&owner, "b.txt").unwrap_err().is_not_found());
    }

    #[test]
    fn test_identical_store_is_noop_and_conflict_detected() {
        let (_dir, store) = open_store();
        let keys = KeyPair::generate();
        let owner = keys.public_key();

        let original = checkpoint(&keys, "a.txt", b"0123456789");
        store.store(&owner, "a.txt", &original).unwrap();
        store.store(&owner, "a.txt", &original).unwrap();
        assert_eq!(store.list_index(&owner, "a.txt").unwrap(), vec![10]);

        let divergent = checkpoint(&keys, "a.txt", b"9876543210");
        assert!(matches!(
            store.store(&owner, "a.txt", &divergent),
            Err(GlobeError::Conflict(_))
        ));
    }

    #[test]
    fn test_tombstone_is_final() {
        let (_dir, store) = open_store();
        let keys = KeyPair::generate();
        let owner = keys.public_key();

        store
            .store(&owner, "a.txt", &checkpoint(&keys, "a.txt", b"abc"))
            .unwrap();
        let tombstone = sign_tombstone(&keys, "a.txt").unwrap();
        store.store(&owner, "a.txt", &tombstone).unwrap();
        store.drop_file(&owner, "a.txt", &tombstone).unwrap();

        assert!(store.load_latest(&owner, "a.txt").unwrap().is_tombstone());
        assert!(store.list_index(&owner, "a.txt").unwrap().is_empty());
        assert!(matches!(
            store.store(&owner, "a.txt", &checkpoint(&keys, "a.txt", b"abcd")),
            Err(GlobeError::Tombstoned(_))
        ));

        store.evict(&owner, "a.txt").unwrap();
        assert!(store.tombstone(&owner, "a.txt").unwrap().is_some());
    }

    #[test]
    fn test_list_files_and_owners() {
        let (_dir, store) = open_store();
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();

        for name in ["docs/a.txt", "docs/b.txt", "img/c.png"] {
            store
                .store(&alice.public_key(), name, &checkpoint(&alice, name, b"x"))
                .unwrap();
        }
        store
            .store(&bob.public_key(), "other", &checkpoint(&bob, "other", b"y"))
            .unwrap();
        store
            .drop_file(
                &alice.public_key(),
                "gone.txt",
                &sign_tombstone(&alice, "gone.txt").unwrap(),
            )
            .unwrap();

        assert_eq!(
            store.list_files(&alice.public_key(), "docs/*").unwrap(),
            vec!["docs/a.txt", "docs/b.txt"]
        );
        assert_eq!(store.list_files(&alice.public_key(), "*").unwrap().len(), 4);

        let latest = store.list_latest(&alice.public_key(), "*.txt").unwrap();
        let names: Vec<&str> = latest.iter().map(|c| c.filename()).collect();
        assert_eq!(names, vec!["docs/a.txt", "docs/b.txt", "gone.txt"]);
        assert!(latest[2].is_tombstone());

        let mut owners = store.list_owners().unwrap();
        owners.sort();
        let mut expected = vec![alice.public_key(), bob.public_key()];
        expected.sort();
        assert_eq!(owners, expected);

        assert!(store.list_files(&alice.public_key(), "[").is_err());
    }
}
