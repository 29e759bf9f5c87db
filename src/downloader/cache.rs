//! Persistent key/value cache with read-time TTL expiry
//!
//! Backed by a SQLite file so entries survive restarts. Expired rows are never
//! swept: `get` reports them absent and the next `put` for the same key
//! replaces the row. When storage cannot be opened the store runs as a bypass
//! (every `get` misses, every `put` is dropped) so callers never block on it.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use tracing::{debug, warn};

use super::errors::CacheError;

/// Default lifetime of cached extraction results
pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

/// Source of "now" in unix milliseconds
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
    }
}

/// Logical tables sharing the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheTable {
    /// Extraction results (JSON), keyed by canonical resource URL
    Extractors,
    /// Proxy Ladder content (raw bytes), keyed by original request URL
    Responses,
}

impl CacheTable {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Extractors => "extractors",
            Self::Responses => "responses",
        }
    }

    const ALL: [CacheTable; 2] = [CacheTable::Extractors, CacheTable::Responses];
}

/// A row as stored
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: String,
    pub value: Vec<u8>,
    /// Unix milliseconds
    pub stored_at: i64,
}

impl CacheEntry {
    fn is_expired(&self, now: i64, ttl: Duration) -> bool {
        now.saturating_sub(self.stored_at) > ttl.as_millis() as i64
    }
}

/// Idle reader connections kept per file store
const MAX_IDLE_READERS: usize = 4;

enum Backend {
    /// One connection for everything. In-memory databases are private to
    /// their connection, so they cannot be split.
    Shared(Mutex<Connection>),
    /// File database in WAL mode: one writer, reads on their own connections
    File {
        path: PathBuf,
        writer: Mutex<Connection>,
        readers: Mutex<Vec<Connection>>,
    },
    Bypass,
}

impl Backend {
    fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>, CacheError> {
        conn.lock()
            .map_err(|_| CacheError::Worker("connection lock poisoned".to_string()))
    }

    /// Run a read without touching the writer connection
    fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T, CacheError>) -> Result<T, CacheError> {
        match self {
            Self::Shared(conn) => f(&*Self::lock(conn)?),
            Self::File { path, readers, .. } => {
                let idle = Self::lock_readers(readers)?.pop();
                let conn = match idle {
                    Some(conn) => conn,
                    None => open_reader(path)?,
                };
                let result = f(&conn);
                let mut idle = Self::lock_readers(readers)?;
                if idle.len() < MAX_IDLE_READERS {
                    idle.push(conn);
                }
                result
            }
            Self::Bypass => Err(CacheError::Unavailable("cache bypassed".to_string())),
        }
    }

    fn write<T>(&self, f: impl FnOnce(&Connection) -> Result<T, CacheError>) -> Result<T, CacheError> {
        match self {
            Self::Shared(conn) => f(&*Self::lock(conn)?),
            Self::File { writer, .. } => f(&*Self::lock(writer)?),
            Self::Bypass => Err(CacheError::Unavailable("cache bypassed".to_string())),
        }
    }

    fn lock_readers(readers: &Mutex<Vec<Connection>>) -> Result<MutexGuard<'_, Vec<Connection>>, CacheError> {
        readers
            .lock()
            .map_err(|_| CacheError::Worker("reader pool lock poisoned".to_string()))
    }
}

fn open_reader(path: &Path) -> Result<Connection, CacheError> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

fn create_tables(conn: &Connection) -> Result<(), CacheError> {
    for table in CacheTable::ALL {
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    url TEXT PRIMARY KEY,
                    data BLOB NOT NULL,
                    timestamp INTEGER NOT NULL
                )",
                table.name()
            ),
            [],
        )?;
    }
    Ok(())
}

/// Cache Store shared by the orchestrator and the proxy ladder. Cloning is cheap.
#[derive(Clone)]
pub struct CacheStore {
    backend: Arc<Backend>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl CacheStore {
    /// Open (or create) the database file
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, CacheError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CacheError::Unavailable(format!("{}: {}", parent.display(), e)))?;
        }
        let writer = Connection::open(path)?;
        // WAL lets the reader connections run while the writer holds a transaction
        let _mode: String =
            writer.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        writer.busy_timeout(Duration::from_secs(5))?;
        create_tables(&writer)?;
        Ok(Self::with_backend(Backend::File {
            path: path.to_path_buf(),
            writer: Mutex::new(writer),
            readers: Mutex::new(Vec::new()),
        }))
    }

    /// Private in-memory database, mostly for tests
    pub fn in_memory() -> Result<Self, CacheError> {
        let conn = Connection::open_in_memory()?;
        create_tables(&conn)?;
        Ok(Self::with_backend(Backend::Shared(Mutex::new(conn))))
    }

    /// Open the database, or fall back to a bypass store when storage is unavailable
    pub fn open_or_bypass<P: AsRef<Path>>(path: P) -> Self {
        match Self::open(path.as_ref()) {
            Ok(store) => store,
            Err(e) => {
                warn!(
                    path = %path.as_ref().display(),
                    error = %e,
                    "Cache unavailable, continuing without it"
                );
                Self::bypass()
            }
        }
    }

    /// Store that never hits and never writes
    pub fn bypass() -> Self {
        Self::with_backend(Backend::Bypass)
    }

    /// Default location: `<user cache dir>/media-downloader/cache.sqlite3`
    pub fn default_path() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("media-downloader")
            .join("cache.sqlite3")
    }

    fn with_backend(backend: Backend) -> Self {
        Self {
            backend: Arc::new(backend),
            clock: Arc::new(SystemClock),
            ttl: DEFAULT_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(*self.backend, Backend::Bypass)
    }

    pub fn now_millis(&self) -> i64 {
        self.clock.now_millis()
    }

    /// Live value for `key`, or `None` when missing or older than the TTL
    pub async fn get(&self, table: CacheTable, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let Some(entry) = self.get_entry(table, key).await? else {
            return Ok(None);
        };
        if entry.is_expired(self.clock.now_millis(), self.ttl) {
            debug!(table = table.name(), key, "Cache entry expired");
            return Ok(None);
        }
        Ok(Some(entry.value))
    }

    /// Raw row regardless of age
    pub async fn get_entry(
        &self,
        table: CacheTable,
        key: &str,
    ) -> Result<Option<CacheEntry>, CacheError> {
        if !self.is_enabled() {
            return Ok(None);
        }
        let backend = self.backend.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || {
            backend.read(|conn| {
                let row = conn
                    .query_row(
                        &format!(
                            "SELECT data, timestamp FROM {} WHERE url = ?1",
                            table.name()
                        ),
                        params![key],
                        |row| Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, i64>(1)?)),
                    )
                    .optional()?;
                Ok(row.map(|(value, stored_at)| CacheEntry {
                    key,
                    value,
                    stored_at,
                }))
            })
        })
        .await
        .map_err(|e| CacheError::Worker(e.to_string()))?
    }

    /// Insert or overwrite `key`, stamped with the current time
    pub async fn put(&self, table: CacheTable, key: &str, value: Vec<u8>) -> Result<(), CacheError> {
        if !self.is_enabled() {
            return Ok(());
        }
        let backend = self.backend.clone();
        let key = key.to_string();
        let stored_at = self.clock.now_millis();
        tokio::task::spawn_blocking(move || {
            backend.write(|conn| {
                conn.execute(
                    &format!(
                        "INSERT OR REPLACE INTO {} (url, data, timestamp) VALUES (?1, ?2, ?3)",
                        table.name()
                    ),
                    params![key, value, stored_at],
                )?;
                Ok(())
            })
        })
        .await
        .map_err(|e| CacheError::Worker(e.to_string()))?
    }
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("enabled", &self.is_enabled())
            .field("ttl", &self.ttl)
            .finish()
    }
}

/// Clock whose time only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now: std::sync::atomic::AtomicI64,
}

impl ManualClock {
    pub fn new(start_millis: i64) -> Self {
        Self {
            now: std::sync::atomic::AtomicI64::new(start_millis),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now
            .fetch_add(by.as_millis() as i64, std::sync::atomic::Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_clock() -> (CacheStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store = CacheStore::in_memory()
            .unwrap()
            .with_clock(clock.clone());
        (store, clock)
    }

    #[tokio::test]
    async fn test_put_then_get_returns_value() {
        let (store, _clock) = store_with_clock();
        store
            .put(CacheTable::Extractors, "https://a.example/v", b"hello".to_vec())
            .await
            .unwrap();

        let got = store
            .get(CacheTable::Extractors, "https://a.example/v")
            .await
            .unwrap();
        assert_eq!(got.as_deref(), Some(&b"hello"[..]));
    }

    #[tokio::test]
    async fn test_expired_entry_is_absent_but_row_remains() {
        let (store, clock) = store_with_clock();
        store
            .put(CacheTable::Extractors, "k", b"v".to_vec())
            .await
            .unwrap();

        clock.advance(Duration::from_secs(3600));
        // Exactly at the TTL the entry is still live
        assert!(store.get(CacheTable::Extractors, "k").await.unwrap().is_some());

        clock.advance(Duration::from_millis(1));
        assert!(store.get(CacheTable::Extractors, "k").await.unwrap().is_none());

        // Never deleted, only hidden
        let row = store.get_entry(CacheTable::Extractors, "k").await.unwrap();
        assert!(row.is_some());
    }

    #[tokio::test]
    async fn test_put_overwrites_and_restamps() {
        let (store, clock) = store_with_clock();
        store.put(CacheTable::Responses, "k", b"old".to_vec()).await.unwrap();
        clock.advance(Duration::from_secs(4000));
        store.put(CacheTable::Responses, "k", b"new".to_vec()).await.unwrap();

        let got = store.get(CacheTable::Responses, "k").await.unwrap();
        assert_eq!(got.as_deref(), Some(&b"new"[..]));
    }

    #[tokio::test]
    async fn test_tables_are_independent() {
        let (store, _clock) = store_with_clock();
        store.put(CacheTable::Responses, "k", b"bytes".to_vec()).await.unwrap();
        assert!(store.get(CacheTable::Extractors, "k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_bypass_store_never_hits() {
        let store = CacheStore::bypass();
        assert!(!store.is_enabled());
        store.put(CacheTable::Extractors, "k", b"v".to_vec()).await.unwrap();
        assert!(store.get(CacheTable::Extractors, "k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cache.sqlite3");
        {
            let store = CacheStore::open(&path).unwrap();
            store.put(CacheTable::Extractors, "k", b"v".to_vec()).await.unwrap();
        }
        let reopened = CacheStore::open(&path).unwrap();
        assert_eq!(
            reopened.get(CacheTable::Extractors, "k").await.unwrap().as_deref(),
            Some(&b"v"[..])
        );
    }

    #[tokio::test]
    async fn test_file_store_reads_do_not_wait_for_writer() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path().join("cache.sqlite3")).unwrap();
        store.put(CacheTable::Extractors, "a", b"1".to_vec()).await.unwrap();

        // Hold the writer as a long-running put would
        let Backend::File { writer, .. } = &*store.backend else {
            panic!("expected a file backend");
        };
        let _busy = writer.lock().unwrap();

        let got = tokio::time::timeout(
            Duration::from_secs(5),
            store.get(CacheTable::Extractors, "a"),
        )
        .await
        .expect("read waited for the writer")
        .unwrap();
        assert_eq!(got.as_deref(), Some(&b"1"[..]));
    }

    #[tokio::test]
    async fn test_unopenable_path_degrades_to_bypass() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not-a-dir");
        std::fs::write(&file, b"x").unwrap();

        // Parent is a regular file, so the database can never be created
        let store = CacheStore::open_or_bypass(file.join("cache.sqlite3"));
        assert!(!store.is_enabled());
        store.put(CacheTable::Extractors, "k", b"v".to_vec()).await.unwrap();
        assert!(store.get(CacheTable::Extractors, "k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_reads_and_unrelated_write() {
        let (store, _clock) = store_with_clock();
        store.put(CacheTable::Extractors, "a", b"1".to_vec()).await.unwrap();

        let reads = (0..8).map(|_| {
            let store = store.clone();
            tokio::spawn(async move { store.get(CacheTable::Extractors, "a").await })
        })
        .collect::<Vec<_>>();
        let write = {
            let store = store.clone();
            tokio::spawn(async move { store.put(CacheTable::Extractors, "b", b"2".to_vec()).await })
        };

        for read in reads {
            assert_eq!(read.await.unwrap().unwrap().as_deref(), Some(&b"1"[..]));
        }
        write.await.unwrap().unwrap();
    }
}
