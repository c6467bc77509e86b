//! Access to the shared key-value store the engine writes into.
//!
//! The store is a redis-style server with numbered databases. Database 0
//! holds the allocation ledger and the VT metadata cache; databases 1..N are
//! claimable knowledge bases, one per scan plus one per host the engine is
//! currently working on.
//!
//! Two traits form the seam:
//!
//! - [`KvStore`] — connection factory plus the atomic claim/release of a
//!   numbered database
//! - [`KvHandle`] — operations on one selected database
//!
//! [`RedisStore`] is the production implementation. [`MemoryKv`] is a
//! process-local stand-in with the same semantics, used by the test suites of
//! the higher layers so they can run without a redis server or an engine.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;

use crate::error::{Error, Result};

/// Hash in database 0 tracking which databases are claimed.
/// Field = database index, value = `1`. Claiming is a single `HSETNX`.
const DBINDEX_LEDGER: &str = "osprey/dbindex";

/// Connection factory and database allocator.
///
/// All operations are serialisable per connection; every handle owns its own
/// connection so concurrent supervisors never share one.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Binds a fresh connection to the numbered database.
    async fn select(&self, db: u32) -> Result<Box<dyn KvHandle>>;

    /// Number of numbered databases the server is configured with.
    async fn max_db_count(&self) -> Result<u32>;

    /// Atomically claims the in-use flag of `db`. Returns false when some
    /// other client already holds it.
    async fn try_claim(&self, db: u32) -> Result<bool>;

    /// Clears the in-use flag of `db`.
    async fn release_claim(&self, db: u32) -> Result<()>;

    /// Claims the first database (from index 1 upwards) with no active
    /// client and returns it bound to a fresh handle.
    async fn acquire_empty(&self) -> Result<(u32, Box<dyn KvHandle>)> {
        let max = self.max_db_count().await?;
        for db in 1..max {
            if self.try_claim(db).await? {
                return Ok((db, self.select(db).await?));
            }
        }
        Err(Error::NoFreeDb)
    }
}

/// Operations on one selected database.
///
/// `rpop` is a single atomic step; paired with the engine's `lpush` it makes
/// the result lists behave as FIFO queues.
#[async_trait]
pub trait KvHandle: Send + Sync + std::fmt::Debug {
    /// Index of the database this handle is bound to.
    fn index(&self) -> u32;

    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn del(&self, key: &str) -> Result<()>;

    /// Prepends `values` in the given order (first value ends up deepest).
    async fn lpush(&self, key: &str, values: &[String]) -> Result<()>;
    /// Pops the oldest `lpush`ed element, non-blocking.
    async fn rpop(&self, key: &str) -> Result<Option<String>>;
    /// Returns the whole list, newest first.
    async fn lrange(&self, key: &str) -> Result<Vec<String>>;

    /// Enumerates keys matching a `*` glob pattern.
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Removes every key in this database.
    async fn flush(&self) -> Result<()>;
}

/// Production store backed by a redis server.
pub struct RedisStore {
    client: redis::Client,
}

impl RedisStore {
    /// Opens a store for the given redis URL (`redis://...` or
    /// `redis+unix:///run/redis/redis.sock`).
    pub fn open(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        Ok(Self { client })
    }

    async fn ledger_connection(&self) -> Result<MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn select(&self, db: u32) -> Result<Box<dyn KvHandle>> {
        let mut con = self.client.get_multiplexed_async_connection().await?;
        redis::cmd("SELECT").arg(db).query_async::<()>(&mut con).await?;
        Ok(Box::new(RedisHandle { db, con }))
    }

    async fn max_db_count(&self) -> Result<u32> {
        let mut con = self.ledger_connection().await?;
        let reply: Vec<String> = redis::cmd("CONFIG")
            .arg("GET")
            .arg("databases")
            .query_async(&mut con)
            .await?;
        reply
            .get(1)
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| Error::KvUnavailable("unreadable database count".into()))
    }

    async fn try_claim(&self, db: u32) -> Result<bool> {
        let mut con = self.ledger_connection().await?;
        let claimed: bool = redis::cmd("HSETNX")
            .arg(DBINDEX_LEDGER)
            .arg(db)
            .arg(1)
            .query_async(&mut con)
            .await?;
        Ok(claimed)
    }

    async fn release_claim(&self, db: u32) -> Result<()> {
        let mut con = self.ledger_connection().await?;
        redis::cmd("HDEL")
            .arg(DBINDEX_LEDGER)
            .arg(db)
            .query_async::<()>(&mut con)
            .await?;
        Ok(())
    }
}

struct RedisHandle {
    db: u32,
    con: MultiplexedConnection,
}

impl std::fmt::Debug for RedisHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisHandle").field("db", &self.db).finish()
    }
}

#[async_trait]
impl KvHandle for RedisHandle {
    fn index(&self) -> u32 {
        self.db
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut con = self.con.clone();
        Ok(redis::cmd("GET").arg(key).query_async(&mut con).await?)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut con = self.con.clone();
        redis::cmd("SET").arg(key).arg(value).query_async::<()>(&mut con).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut con = self.con.clone();
        redis::cmd("DEL").arg(key).query_async::<()>(&mut con).await?;
        Ok(())
    }

    async fn lpush(&self, key: &str, values: &[String]) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        let mut con = self.con.clone();
        let mut cmd = redis::cmd("LPUSH");
        cmd.arg(key);
        for value in values {
            cmd.arg(value);
        }
        cmd.query_async::<()>(&mut con).await?;
        Ok(())
    }

    async fn rpop(&self, key: &str) -> Result<Option<String>> {
        let mut con = self.con.clone();
        Ok(redis::cmd("RPOP").arg(key).query_async(&mut con).await?)
    }

    async fn lrange(&self, key: &str) -> Result<Vec<String>> {
        let mut con = self.con.clone();
        Ok(redis::cmd("LRANGE")
            .arg(key)
            .arg(0)
            .arg(-1)
            .query_async(&mut con)
            .await?)
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut con = self.con.clone();
        Ok(redis::cmd("KEYS").arg(pattern).query_async(&mut con).await?)
    }

    async fn flush(&self) -> Result<()> {
        let mut con = self.con.clone();
        redis::cmd("FLUSHDB").query_async::<()>(&mut con).await?;
        Ok(())
    }
}

/// In-memory store mirroring the redis semantics the daemon relies on.
///
/// Shared freely between handles; every clone sees the same databases.
#[derive(Clone)]
pub struct MemoryKv {
    inner: Arc<Mutex<MemoryInner>>,
}

#[derive(Debug)]
struct MemoryInner {
    dbs: Vec<MemoryDb>,
    claimed: HashSet<u32>,
}

#[derive(Debug, Default)]
struct MemoryDb {
    strings: HashMap<String, String>,
    lists: HashMap<String, VecDeque<String>>,
}

impl MemoryKv {
    /// A store with `db_count` numbered databases (index 0 included).
    pub fn new(db_count: u32) -> Self {
        let dbs = (0..db_count).map(|_| MemoryDb::default()).collect();
        Self {
            inner: Arc::new(Mutex::new(MemoryInner {
                dbs,
                claimed: HashSet::new(),
            })),
        }
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn select(&self, db: u32) -> Result<Box<dyn KvHandle>> {
        if db as usize >= self.inner.lock().dbs.len() {
            return Err(Error::KvUnavailable(format!("no database {db}")));
        }
        Ok(Box::new(MemoryHandle {
            db,
            inner: self.inner.clone(),
        }))
    }

    async fn max_db_count(&self) -> Result<u32> {
        Ok(self.inner.lock().dbs.len() as u32)
    }

    async fn try_claim(&self, db: u32) -> Result<bool> {
        let mut inner = self.inner.lock();
        if db as usize >= inner.dbs.len() {
            return Err(Error::KvUnavailable(format!("no database {db}")));
        }
        Ok(inner.claimed.insert(db))
    }

    async fn release_claim(&self, db: u32) -> Result<()> {
        self.inner.lock().claimed.remove(&db);
        Ok(())
    }
}

#[derive(Debug)]
struct MemoryHandle {
    db: u32,
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryHandle {
    fn with_db<T>(&self, f: impl FnOnce(&mut MemoryDb) -> T) -> T {
        let mut inner = self.inner.lock();
        f(&mut inner.dbs[self.db as usize])
    }
}

#[async_trait]
impl KvHandle for MemoryHandle {
    fn index(&self) -> u32 {
        self.db
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.with_db(|db| db.strings.get(key).cloned()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.with_db(|db| db.strings.insert(key.to_string(), value.to_string()));
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.with_db(|db| {
            db.strings.remove(key);
            db.lists.remove(key);
        });
        Ok(())
    }

    async fn lpush(&self, key: &str, values: &[String]) -> Result<()> {
        self.with_db(|db| {
            let list = db.lists.entry(key.to_string()).or_default();
            for value in values {
                list.push_front(value.clone());
            }
        });
        Ok(())
    }

    async fn rpop(&self, key: &str) -> Result<Option<String>> {
        Ok(self.with_db(|db| db.lists.get_mut(key).and_then(|l| l.pop_back())))
    }

    async fn lrange(&self, key: &str) -> Result<Vec<String>> {
        Ok(self.with_db(|db| {
            db.lists
                .get(key)
                .map(|l| l.iter().cloned().collect())
                .unwrap_or_default()
        }))
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        Ok(self.with_db(|db| {
            db.strings
                .keys()
                .chain(db.lists.keys())
                .filter(|k| glob_match(pattern, k))
                .cloned()
                .collect()
        }))
    }

    async fn flush(&self) -> Result<()> {
        self.with_db(|db| {
            db.strings.clear();
            db.lists.clear();
        });
        Ok(())
    }
}

/// Matches `*` globs the way redis `KEYS` does for the patterns the daemon
/// uses. Other metacharacters are taken literally.
fn glob_match(pattern: &str, text: &str) -> bool {
    let pat: Vec<char> = pattern.chars().collect();
    let txt: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0usize, 0usize);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < txt.len() {
        if p < pat.len() && pat[p] == '*' {
            backtrack = Some((p, t));
            p += 1;
        } else if p < pat.len() && pat[p] == txt[t] {
            p += 1;
            t += 1;
        } else if let Some((star_p, star_t)) = backtrack {
            p = star_p + 1;
            t = star_t + 1;
            backtrack = Some((star_p, star_t + 1));
        } else {
            return false;
        }
    }
    while p < pat.len() && pat[p] == '*' {
        p += 1;
    }
    p == pat.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_matching() {
        assert!(glob_match("internal/*/globalscanid", "internal/scan-1/globalscanid"));
        assert!(glob_match("*", "anything"));
        assert!(glob_match("internal/results", "internal/results"));
        assert!(!glob_match("internal/*/globalscanid", "internal/results"));
        assert!(!glob_match("internal/results", "internal/result"));
    }

    #[tokio::test]
    async fn lists_are_fifo_across_lpush_and_rpop() {
        let store = MemoryKv::new(2);
        let kb = store.select(1).await.unwrap();

        kb.lpush("q", &["a".into(), "b".into()]).await.unwrap();
        kb.lpush("q", &["c".into()]).await.unwrap();

        assert_eq!(kb.rpop("q").await.unwrap().as_deref(), Some("a"));
        assert_eq!(kb.rpop("q").await.unwrap().as_deref(), Some("b"));
        assert_eq!(kb.rpop("q").await.unwrap().as_deref(), Some("c"));
        assert_eq!(kb.rpop("q").await.unwrap(), None);
    }

    #[tokio::test]
    async fn claims_are_exclusive_until_released() {
        let store = MemoryKv::new(4);
        assert!(store.try_claim(1).await.unwrap());
        assert!(!store.try_claim(1).await.unwrap());
        store.release_claim(1).await.unwrap();
        assert!(store.try_claim(1).await.unwrap());
    }

    #[tokio::test]
    async fn acquire_empty_skips_claimed_dbs_and_exhausts() {
        let store = MemoryKv::new(3);
        let (first, _) = store.acquire_empty().await.unwrap();
        let (second, _) = store.acquire_empty().await.unwrap();
        assert_eq!((first, second), (1, 2));

        match store.acquire_empty().await {
            Err(Error::NoFreeDb) => {}
            other => panic!("expected NoFreeDb, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn flush_clears_only_the_selected_db() {
        let store = MemoryKv::new(3);
        let kb1 = store.select(1).await.unwrap();
        let kb2 = store.select(2).await.unwrap();

        kb1.set("k", "v").await.unwrap();
        kb2.set("k", "v").await.unwrap();
        kb1.flush().await.unwrap();

        assert_eq!(kb1.get("k").await.unwrap(), None);
        assert_eq!(kb2.get("k").await.unwrap().as_deref(), Some("v"));
    }
}
