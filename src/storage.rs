//! 持久化键值存储
//!
//! 两个键：
//! - `groups`   → 完整的分组列表 (JSON)
//! - `formData` → 未保存的规则表单草稿 (JSON)，清空表单时整体删除
//!
//! `SqliteStore` 把"读取-修改-写回"放进一个 `BEGIN IMMEDIATE` 事务，
//! 两个管理端同时修改同一个数据库文件时不会丢失更新。

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
#[cfg(test)]
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

use crate::model::{FormData, Group};

pub const GROUPS_KEY: &str = "groups";
pub const FORM_DATA_KEY: &str = "formData";

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;

    /// 原子地读取-修改-写回一个键。`f` 返回 `None` 表示不写入。
    /// 返回值表示是否发生了写入。
    fn update(
        &self,
        key: &str,
        f: &mut dyn FnMut(Option<String>) -> Result<Option<String>>,
    ) -> Result<bool>;

    /// 读取分组列表，不存在时为空列表
    fn load_groups(&self) -> Result<Vec<Group>> {
        match self.get(GROUPS_KEY)? {
            Some(raw) => parse_groups(&raw),
            None => Ok(Vec::new()),
        }
    }

    #[cfg(test)]
    fn save_groups(&self, groups: &[Group]) -> Result<()> {
        let raw = serde_json::to_string(groups).context("Failed to serialize groups")?;
        self.set(GROUPS_KEY, &raw)
    }

    /// 在一个事务内修改分组列表。
    ///
    /// `f` 返回 `Ok(false)` 表示没有变化（例如目标已不存在），此时不写入并返回 `None`；
    /// `f` 返回错误时整个修改被放弃。
    fn update_groups(
        &self,
        f: &mut dyn FnMut(&mut Vec<Group>) -> Result<bool>,
    ) -> Result<Option<Vec<Group>>> {
        let mut written = None;
        self.update(GROUPS_KEY, &mut |raw| {
            let mut groups = match raw {
                Some(raw) => parse_groups(&raw)?,
                None => Vec::new(),
            };
            if !f(&mut groups)? {
                return Ok(None);
            }
            let serialized =
                serde_json::to_string(&groups).context("Failed to serialize groups")?;
            written = Some(groups);
            Ok(Some(serialized))
        })?;
        Ok(written)
    }

    fn load_form_data(&self) -> Result<Option<FormData>> {
        match self.get(FORM_DATA_KEY)? {
            Some(raw) => {
                let form = serde_json::from_str(&raw).context("Failed to parse stored formData")?;
                Ok(Some(form))
            }
            None => Ok(None),
        }
    }

    fn save_form_data(&self, form: &FormData) -> Result<()> {
        let raw = serde_json::to_string(form).context("Failed to serialize formData")?;
        self.set(FORM_DATA_KEY, &raw)
    }

    fn clear_form_data(&self) -> Result<()> {
        self.remove(FORM_DATA_KEY)
    }
}

fn parse_groups(raw: &str) -> Result<Vec<Group>> {
    serde_json::from_str(raw).context("Failed to parse stored groups")
}

/// SQLite 实现：表 `kv(key TEXT PRIMARY KEY, value TEXT NOT NULL)`
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open store database {:?}", path))?;
        debug!("Opened store database at: {:?}", path);
        Self::init(conn)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        // 另一个管理端持有写锁时等待而不是立刻失败
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            [],
        )
        .context("Failed to create kv table")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| anyhow!("Store connection lock poisoned"))
    }
}

fn select_value(conn: &Connection, key: &str) -> Result<Option<String>> {
    let value = conn
        .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| row.get(0))
        .optional()
        .with_context(|| format!("Failed to read key '{}'", key))?;
    Ok(value)
}

fn upsert_value(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO kv (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )
    .with_context(|| format!("Failed to write key '{}'", key))?;
    Ok(())
}

impl KeyValueStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.lock()?;
        select_value(&conn, key)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.lock()?;
        upsert_value(&conn, key, value)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM kv WHERE key = ?1", params![key])
            .with_context(|| format!("Failed to remove key '{}'", key))?;
        Ok(())
    }

    fn update(
        &self,
        key: &str,
        f: &mut dyn FnMut(Option<String>) -> Result<Option<String>>,
    ) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("Failed to begin store transaction")?;

        let current = select_value(&tx, key)?;
        match f(current)? {
            Some(next) => {
                upsert_value(&tx, key, &next)?;
                tx.commit().context("Failed to commit store transaction")?;
                Ok(true)
            }
            // 事务在 drop 时回滚
            None => Ok(false),
        }
    }
}

/// 内存实现，测试用
#[cfg(test)]
#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

#[cfg(test)]
impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_groups(groups: &[Group]) -> Result<Self> {
        let store = Self::new();
        store.save_groups(groups)?;
        Ok(store)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>> {
        self.values.lock().map_err(|_| anyhow!("Store lock poisoned"))
    }
}

#[cfg(test)]
impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.lock()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.lock()?.remove(key);
        Ok(())
    }

    fn update(
        &self,
        key: &str,
        f: &mut dyn FnMut(Option<String>) -> Result<Option<String>>,
    ) -> Result<bool> {
        let mut values = self.lock()?;
        match f(values.get(key).cloned())? {
            Some(next) => {
                values.insert(key.to_string(), next);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
