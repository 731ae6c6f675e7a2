//! 槽位计数器
//!
//! 准入控制的共享计数。单进程部署使用内存计数器；多个服务进程共享
//! 同一个数据库文件时使用 SQLite 计数器，每个持有者一行。

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, TransactionBehavior};
use tracing::{info, warn};

/// 原子槽位计数器
pub trait SlotCounter: Send + Sync {
    /// 计数未达到 `max` 时为 `holder` 占用一个槽位
    fn try_acquire(&self, holder: &str, max: usize) -> Result<bool>;

    fn release(&self, holder: &str) -> Result<()>;

    /// 当前被占用的槽位数
    fn held(&self) -> Result<usize>;
}

/// 进程内计数器
#[derive(Debug, Default)]
pub struct MemorySlotCounter {
    held: AtomicUsize,
}

impl MemorySlotCounter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SlotCounter for MemorySlotCounter {
    fn try_acquire(&self, _holder: &str, max: usize) -> Result<bool> {
        let acquired = self
            .held
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .is_ok();
        Ok(acquired)
    }

    fn release(&self, _holder: &str) -> Result<()> {
        let _ = self
            .held
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        Ok(())
    }

    fn held(&self) -> Result<usize> {
        Ok(self.held.load(Ordering::Acquire))
    }
}

/// SQLite 计数器
///
/// 槽位 = processing_slots 表中的一行。启动时删除本实例遗留的行，
/// 崩溃的进程不会永久占用槽位。
pub struct SqliteSlotCounter {
    conn: Mutex<Connection>,
    instance_id: String,
}

impl SqliteSlotCounter {
    pub fn open(db_path: &Path, instance_id: &str) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("打开槽位数据库失败: {:?}", db_path))?;
        Self::with_connection(conn, instance_id)
    }

    fn with_connection(conn: Connection, instance_id: &str) -> Result<Self> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS processing_slots (
                holder TEXT PRIMARY KEY,
                instance_id TEXT NOT NULL,
                acquired_at INTEGER NOT NULL
            )
            "#,
            [],
        )?;
        let stale = conn.execute(
            "DELETE FROM processing_slots WHERE instance_id = ?1",
            params![instance_id],
        )?;
        if stale > 0 {
            warn!("已清理实例 {} 遗留的 {} 个处理槽位", instance_id, stale);
        }
        info!("SQLite 槽位计数器已就绪: instance={}", instance_id);

        Ok(Self {
            conn: Mutex::new(conn),
            instance_id: instance_id.to_string(),
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }
}

impl SlotCounter for SqliteSlotCounter {
    fn try_acquire(&self, holder: &str, max: usize) -> Result<bool> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| anyhow!("获取数据库锁失败: {}", e))?;
        // IMMEDIATE 事务：计数与插入之间不会有其他写者
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let held: i64 = tx.query_row("SELECT COUNT(*) FROM processing_slots", [], |r| r.get(0))?;
        if held as usize >= max {
            return Ok(false);
        }
        tx.execute(
            "INSERT OR REPLACE INTO processing_slots (holder, instance_id, acquired_at) VALUES (?1, ?2, ?3)",
            params![holder, self.instance_id, chrono::Utc::now().timestamp_millis()],
        )?;
        tx.commit()?;
        Ok(true)
    }

    fn release(&self, holder: &str) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow!("获取数据库锁失败: {}", e))?;
        conn.execute(
            "DELETE FROM processing_slots WHERE holder = ?1",
            params![holder],
        )?;
        Ok(())
    }

    fn held(&self) -> Result<usize> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow!("获取数据库锁失败: {}", e))?;
        let held: i64 = conn.query_row("SELECT COUNT(*) FROM processing_slots", [], |r| r.get(0))?;
        Ok(held as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_counter_bounds() {
        let c = MemorySlotCounter::new();
        assert!(c.try_acquire("a", 2).unwrap());
        assert!(c.try_acquire("b", 2).unwrap());
        assert!(!c.try_acquire("c", 2).unwrap());
        c.release("a").unwrap();
        assert!(c.try_acquire("c", 2).unwrap());
        assert_eq!(c.held().unwrap(), 2);

        c.release("x").unwrap();
        c.release("y").unwrap();
        c.release("z").unwrap();
        assert_eq!(c.held().unwrap(), 0);
    }

    #[test]
    fn test_sqlite_counter_shared_between_instances() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("slots.db");
        let a = SqliteSlotCounter::open(&db, "node-a").unwrap();
        let b = SqliteSlotCounter::open(&db, "node-b").unwrap();

        assert!(a.try_acquire("a-1", 2).unwrap());
        assert!(b.try_acquire("b-1", 2).unwrap());
        assert!(!a.try_acquire("a-2", 2).unwrap());
        assert_eq!(b.held().unwrap(), 2);

        b.release("b-1").unwrap();
        assert!(a.try_acquire("a-2", 2).unwrap());
    }

    #[test]
    fn test_default_instances_keep_each_others_slots() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("slots.db");
        let config = crate::config::ProcessingConfig::default();

        let a = SqliteSlotCounter::open(&db, &config.resolve_instance_id()).unwrap();
        assert!(a.try_acquire("a-1", 1).unwrap());

        // 第二个进程启动不会清掉第一个进程持有的槽位
        let b = SqliteSlotCounter::open(&db, &config.resolve_instance_id()).unwrap();
        assert_ne!(a.instance_id(), b.instance_id());
        assert_eq!(b.held().unwrap(), 1);
        assert!(!b.try_acquire("b-1", 1).unwrap());
    }

    #[test]
    fn test_sqlite_counter_cleans_up_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("slots.db");
        {
            let crashed = SqliteSlotCounter::open(&db, "node-a").unwrap();
            assert!(crashed.try_acquire("a-1", 1).unwrap());
            // 未调用 release 即退出
        }
        let other = SqliteSlotCounter::open(&db, "node-b").unwrap();
        assert!(!other.try_acquire("b-1", 1).unwrap());

        let restarted = SqliteSlotCounter::open(&db, "node-a").unwrap();
        assert_eq!(restarted.held().unwrap(), 0);
        assert!(other.try_acquire("b-1", 1).unwrap());
    }
}
