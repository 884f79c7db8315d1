//! Database connection management.
//!
//! The [`Database`] struct owns a [`rusqlite::Connection`] and guarantees that
//! migrations are run before any other operation.
//!
//! Plain SQLite is the default build. Message bodies and drafts are sealed
//! with XChaCha20-Poly1305 under a key derived from the identity, so the
//! file never holds plaintext content. The `sqlcipher` feature additionally
//! encrypts the whole file with the same key.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use rusqlite::Connection;

use courier_shared::constants::NONCE_SIZE;
use courier_shared::crypto::{self, SymmetricKey};

use crate::error::{Result, StoreError};
use crate::migrations;

/// Wrapper around a [`rusqlite::Connection`] and the content key.
pub struct Database {
    conn: Connection,
    content_key: SymmetricKey,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.path())
            .finish_non_exhaustive()
    }
}

impl Database {
    /// Open (or create) the default application database.
    ///
    /// The database file is placed in the platform-appropriate data directory:
    /// - Linux:   `~/.local/share/courier/courier.db`
    /// - macOS:   `~/Library/Application Support/com.courier.courier/courier.db`
    /// - Windows: `{FOLDERID_RoamingAppData}\courier\courier\data\courier.db`
    pub fn open(db_key: &SymmetricKey) -> Result<Self> {
        let project_dirs =
            ProjectDirs::from("com", "courier", "courier").ok_or(StoreError::NoDataDir)?;

        let data_dir = project_dirs.data_dir();
        std::fs::create_dir_all(data_dir)?;

        let db_path = data_dir.join("courier.db");

        tracing::info!(path = %db_path.display(), "opening database");

        Self::open_at(&db_path, db_key)
    }

    /// Open (or create) a database at an explicit path.
    pub fn open_at(path: &Path, db_key: &SymmetricKey) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::init(conn, db_key, true)
    }

    /// A private database that disappears when dropped.
    pub fn open_in_memory(db_key: &SymmetricKey) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, db_key, false)
    }

    fn init(conn: Connection, db_key: &SymmetricKey, wal: bool) -> Result<Self> {
        #[cfg(feature = "sqlcipher")]
        conn.pragma_update(None, "key", format!("x'{}'", hex::encode(db_key)))?;

        if wal {
            conn.pragma_update(None, "journal_mode", "WAL")?;
        }
        conn.pragma_update(None, "foreign_keys", "ON")?;

        migrations::run_migrations(&conn)?;

        Ok(Self {
            conn,
            content_key: *db_key,
        })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Return the filesystem path of the open database (if any).
    pub fn path(&self) -> Option<PathBuf> {
        self.conn
            .path()
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
    }

    /// Seal a text column as `nonce || ciphertext`.
    pub(crate) fn seal_text(&self, text: &str) -> Result<Vec<u8>> {
        let sealed = crypto::encrypt(&self.content_key, text.as_bytes())?;
        let mut blob = Vec::with_capacity(NONCE_SIZE + sealed.ciphertext.len());
        blob.extend_from_slice(&sealed.nonce);
        blob.extend_from_slice(&sealed.ciphertext);
        Ok(blob)
    }

    pub(crate) fn open_text(&self, blob: &[u8]) -> Result<String> {
        if blob.len() < NONCE_SIZE {
            return Err(StoreError::Corrupt("sealed column shorter than nonce".into()));
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_SIZE);
        let plaintext = crypto::decrypt(&self.content_key, ciphertext, nonce)?;
        String::from_utf8(plaintext).map_err(|e| StoreError::Corrupt(e.to_string()))
    }
}
