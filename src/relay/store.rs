//! Durable key-value storage with bounded retry.
//!
//! Records are hashes (field → string value) addressed by fully qualified
//! keys such as `{guild}:channel_subscriber:{channel}`. [`DurableStore`]
//! wraps any [`KvStore`] backend: writes are fire-and-forget, serialized per
//! key, and retried on a fixed interval until the policy gives up.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{Connection, params};
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Fields of one stored hash.
pub type Fields = HashMap<String, String>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store lock poisoned")]
    Poisoned,
}

/// Hash-oriented key-value backend.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// All fields of `key`; empty when the key does not exist.
    async fn hgetall(&self, key: &str) -> Result<Fields, StoreError>;
    /// Upsert the given fields, leaving other fields of `key` untouched.
    async fn hset(&self, key: &str, fields: &Fields) -> Result<(), StoreError>;
    async fn hdel(&self, key: &str, fields: &[&str]) -> Result<(), StoreError>;
    async fn del(&self, key: &str) -> Result<(), StoreError>;
    /// Keys starting with `prefix`.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

// ==================== SQLITE BACKEND ====================

/// SQLite-backed store, one row per (key, field). Queries run on the
/// blocking thread pool.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let store = Self {
            conn: Arc::new(Mutex::new(Connection::open(path)?)),
        };
        store.init_schema()?;
        info!("Opened store at {:?}", path);
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let store = Self {
            conn: Arc::new(Mutex::new(Connection::open_in_memory()?)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.lock()?.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv_hash (
                key TEXT NOT NULL,
                field TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (key, field)
            );
            "#,
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(|_| StoreError::Poisoned)?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("store task failed: {e}")))?
    }
}

#[async_trait]
impl KvStore for SqliteStore {
    async fn hgetall(&self, key: &str) -> Result<Fields, StoreError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare("SELECT field, value FROM kv_hash WHERE key = ?1")?;
            let rows = stmt.query_map(params![key], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            let fields = rows.collect::<Result<Fields, _>>()?;
            Ok(fields)
        })
        .await
    }

    async fn hset(&self, key: &str, fields: &Fields) -> Result<(), StoreError> {
        let key = key.to_string();
        let fields = fields.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            for (field, value) in &fields {
                tx.execute(
                    "INSERT INTO kv_hash (key, field, value) VALUES (?1, ?2, ?3)
                     ON CONFLICT(key, field) DO UPDATE SET value = excluded.value",
                    params![key, field, value],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn hdel(&self, key: &str, fields: &[&str]) -> Result<(), StoreError> {
        let key = key.to_string();
        let fields: Vec<String> = fields.iter().map(|f| f.to_string()).collect();
        self.with_conn(move |conn| {
            for field in &fields {
                conn.execute(
                    "DELETE FROM kv_hash WHERE key = ?1 AND field = ?2",
                    params![key, field],
                )?;
            }
            Ok(())
        })
        .await
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM kv_hash WHERE key = ?1", params![key])?;
            Ok(())
        })
        .await
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let prefix = prefix.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT key FROM kv_hash WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
            )?;
            let rows = stmt.query_map(params![prefix], |row| row.get::<_, String>(0))?;
            let keys = rows.collect::<Result<Vec<_>, _>>()?;
            Ok(keys)
        })
        .await
    }
}

// ==================== IN-MEMORY BACKEND ====================

/// In-process store. Can be switched into a failing mode to simulate an
/// unreachable backend.
#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<HashMap<String, Fields>>,
    failing: AtomicBool,
    writes: AtomicUsize,
    reads: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Write attempts so far, failed ones included.
    pub fn write_attempts(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Read attempts so far, failed ones included.
    pub fn read_attempts(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<MutexGuard<'_, HashMap<String, Fields>>, StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection refused".to_string()));
        }
        self.data.lock().map_err(|_| StoreError::Poisoned)
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn hgetall(&self, key: &str) -> Result<Fields, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.check()?.get(key).cloned().unwrap_or_default())
    }

    async fn hset(&self, key: &str, fields: &Fields) -> Result<(), StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut data = self.check()?;
        let entry = data.entry(key.to_string()).or_default();
        for (field, value) in fields {
            entry.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn hdel(&self, key: &str, fields: &[&str]) -> Result<(), StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut data = self.check()?;
        if let Some(entry) = data.get_mut(key) {
            for field in fields {
                entry.remove(*field);
            }
            if entry.is_empty() {
                data.remove(key);
            }
        }
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.check()?.remove(key);
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let mut keys: Vec<String> = self
            .check()?
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

// ==================== RETRYING WRAPPER ====================

/// Fixed-interval retry policy shared by every persisted record.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            max_retries: 15,
        }
    }
}

enum WriteOp {
    Put(Fields),
    Delete,
    Flush(oneshot::Sender<()>),
}

enum Write {
    Put(Fields),
    Delete,
}

/// Coalesced view of the ops waiting in a key's queue.
#[derive(Default)]
struct Batch {
    write: Option<Write>,
    waiters: Vec<oneshot::Sender<()>>,
}

impl Batch {
    fn absorb(&mut self, op: WriteOp) {
        match op {
            WriteOp::Put(fields) => self.write = Some(Write::Put(fields)),
            WriteOp::Delete => self.write = Some(Write::Delete),
            WriteOp::Flush(waiter) => self.waiters.push(waiter),
        }
    }

    fn drain(&mut self, rx: &mut mpsc::UnboundedReceiver<WriteOp>) {
        while let Ok(op) = rx.try_recv() {
            self.absorb(op);
        }
    }

    fn is_empty(&self) -> bool {
        self.write.is_none() && self.waiters.is_empty()
    }
}

type Queues = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<WriteOp>>>>;

/// Retrying front for a [`KvStore`]. When built without a backend every
/// operation is a silent no-op.
///
/// Each key with queued writes has its own writer task; the task exits and
/// unregisters itself once its queue runs dry.
pub struct DurableStore {
    backend: Option<Arc<dyn KvStore>>,
    policy: RetryPolicy,
    queues: Queues,
}

impl DurableStore {
    pub fn new(backend: Arc<dyn KvStore>, policy: RetryPolicy) -> Self {
        Self {
            backend: Some(backend),
            policy,
            queues: Queues::default(),
        }
    }

    /// A store that persists nothing.
    pub fn disabled() -> Self {
        Self {
            backend: None,
            policy: RetryPolicy::default(),
            queues: Queues::default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Keys with a live writer task.
    pub fn active_queues(&self) -> usize {
        self.queues.lock().map(|q| q.len()).unwrap_or_default()
    }

    /// Queue a write of `fields` under `key`. Returns immediately.
    pub fn persist(&self, key: &str, fields: Fields) {
        self.enqueue(key, WriteOp::Put(fields));
    }

    /// Queue removal of `key`. Best effort: failures are logged, not retried.
    pub fn erase(&self, key: &str) {
        self.enqueue(key, WriteOp::Delete);
    }

    /// Read `key`, retrying on failure. `None` when absent, when the store is
    /// disabled, or when the policy gave up.
    pub async fn load(&self, key: &str) -> Option<Fields> {
        let backend = self.backend.as_ref()?;
        let fields = self
            .retry(&format!("restoring {key}"), || backend.hgetall(key))
            .await?;
        if fields.is_empty() { None } else { Some(fields) }
    }

    /// List keys under `prefix`, retrying on failure.
    pub async fn keys(&self, prefix: &str) -> Vec<String> {
        let Some(backend) = self.backend.as_ref() else {
            return Vec::new();
        };
        self.retry(&format!("listing {prefix}*"), || backend.keys(prefix))
            .await
            .unwrap_or_default()
    }

    /// Wait until every write queued so far has been applied or dropped.
    pub async fn flush(&self) {
        let waiters: Vec<oneshot::Receiver<()>> = {
            let Ok(queues) = self.queues.lock() else {
                return;
            };
            queues
                .values()
                .filter_map(|tx| {
                    let (done_tx, done_rx) = oneshot::channel();
                    tx.send(WriteOp::Flush(done_tx)).ok().map(|_| done_rx)
                })
                .collect()
        };
        for waiter in waiters {
            let _ = waiter.await;
        }
    }

    async fn retry<T, F, Fut>(&self, what: &str, mut op: F) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut retries = 0;
        loop {
            match op().await {
                Ok(value) => return Some(value),
                Err(e) => {
                    error!("Error while {what}: {e}");
                    if retries >= self.policy.max_retries {
                        warn!("Giving up on {what} after {retries} retries");
                        return None;
                    }
                    retries += 1;
                    info!("Retrying {what} ({retries}/{})", self.policy.max_retries);
                    sleep(self.policy.interval).await;
                }
            }
        }
    }

    fn enqueue(&self, key: &str, op: WriteOp) {
        let Some(backend) = self.backend.as_ref() else {
            return;
        };
        let Ok(mut queues) = self.queues.lock() else {
            error!("Store queue lock poisoned, dropping write for {key}");
            return;
        };

        let op = match queues.get(key) {
            Some(tx) => match tx.send(op) {
                Ok(()) => return,
                Err(mpsc::error::SendError(op)) => op,
            },
            None => op,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(
            backend.clone(),
            self.policy,
            key.to_string(),
            self.queues.clone(),
            rx,
        ));
        if tx.send(op).is_err() {
            error!("Write queue for {key} closed immediately");
        }
        queues.insert(key.to_string(), tx);
    }
}

/// Unregister an idle queue. Returns the ops that slipped in before the
/// registry lock was taken; an empty batch means the writer should exit.
fn retire(queues: &Queues, key: &str, rx: &mut mpsc::UnboundedReceiver<WriteOp>) -> Batch {
    let mut batch = Batch::default();
    let Ok(mut queues) = queues.lock() else {
        error!("Store queue lock poisoned, stopping writer for {key}");
        return batch;
    };
    batch.drain(rx);
    if batch.is_empty() {
        queues.remove(key);
        debug!("Writer for {key} is idle, stopping");
    }
    batch
}

/// Serializes writes for one key. A write still waiting in back-off is
/// replaced by any newer write for the same key.
async fn write_loop(
    backend: Arc<dyn KvStore>,
    policy: RetryPolicy,
    key: String,
    queues: Queues,
    mut rx: mpsc::UnboundedReceiver<WriteOp>,
) {
    loop {
        let mut batch = Batch::default();
        batch.drain(&mut rx);
        if batch.is_empty() {
            batch = retire(&queues, &key, &mut rx);
            if batch.is_empty() {
                return;
            }
        }

        if let Some(mut write) = batch.write.take() {
            let mut retries = 0;
            loop {
                let result = match &write {
                    Write::Put(fields) => backend.hset(&key, fields).await,
                    Write::Delete => backend.del(&key).await,
                };
                match result {
                    Ok(()) => {
                        debug!("💾 Persisted {key}");
                        break;
                    }
                    Err(e) if matches!(write, Write::Delete) => {
                        error!("Error while deleting dump for {key}: {e}");
                        break;
                    }
                    Err(e) => {
                        error!("Error while dumping data for {key}: {e}");
                        if retries >= policy.max_retries {
                            warn!("Giving up on dumping data for {key} after {retries} retries");
                            break;
                        }
                        retries += 1;
                        info!("Retrying dump of {key} ({retries}/{})", policy.max_retries);
                        sleep(policy.interval).await;
                        batch.drain(&mut rx);
                        if let Some(newer) = batch.write.take() {
                            write = newer;
                        }
                    }
                }
            }
        }

        for waiter in batch.waiters.drain(..) {
            let _ = waiter.send(());
        }
    }
}
