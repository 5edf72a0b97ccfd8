//! SQLite文档存储
//!
//! 每类实体一张表，行内容为JSON文档，另外冗余 `doc_key` 和 `suborder_id`
//! 两列用于定位和缩小扫描范围。过滤与更新复用模型上的 `matches`/`apply`，
//! 在同一个事务里完成读取和回写，语义与 `MemoryStore` 保持一致。

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Row, Sqlite, SqlitePool};
use tokio::sync::Mutex;
use tracing::{debug, info};

use recycler_core::models::{
    DetectStep, DetectStepCfg, DetectTask, DetectTaskFilter, HostFilter, HostUpdate, OrderFilter,
    OrderUpdate, RecycleHost, RecycleOrder, ReturnTask, ReturnTaskUpdate, StepFilter, StepUpdate,
};
use recycler_core::{
    DatabaseConfig, DetectStepRepository, DetectTaskRepository, HostRepository, OrderRepository,
    RecyclerError, RecyclerResult, Repositories, ReturnTaskRepository, StepCfgRepository,
};

use crate::memory_store::paginate;

/// 以JSON文档形式落库的实体
trait Document: Serialize + DeserializeOwned + Send + Sync {
    const TABLE: &'static str;
    const LABEL: &'static str;

    fn doc_key(&self) -> String;

    fn suborder_id(&self) -> &str {
        ""
    }
}

impl Document for RecycleOrder {
    const TABLE: &'static str = "recycle_orders";
    const LABEL: &'static str = "回收单";

    fn doc_key(&self) -> String {
        self.suborder_id.clone()
    }

    fn suborder_id(&self) -> &str {
        &self.suborder_id
    }
}

impl Document for RecycleHost {
    const TABLE: &'static str = "recycle_hosts";
    const LABEL: &'static str = "回收主机";

    fn doc_key(&self) -> String {
        host_key(&self.suborder_id, self.host_id)
    }

    fn suborder_id(&self) -> &str {
        &self.suborder_id
    }
}

impl Document for DetectTask {
    const TABLE: &'static str = "detect_tasks";
    const LABEL: &'static str = "检测任务";

    fn doc_key(&self) -> String {
        self.task_id.clone()
    }

    fn suborder_id(&self) -> &str {
        &self.suborder_id
    }
}

impl Document for DetectStep {
    const TABLE: &'static str = "detect_steps";
    const LABEL: &'static str = "检测步骤";

    fn doc_key(&self) -> String {
        self.id.clone()
    }

    fn suborder_id(&self) -> &str {
        &self.suborder_id
    }
}

impl Document for DetectStepCfg {
    const TABLE: &'static str = "detect_step_cfgs";
    const LABEL: &'static str = "检测步骤配置";

    fn doc_key(&self) -> String {
        self.name.to_string()
    }
}

impl Document for ReturnTask {
    const TABLE: &'static str = "return_tasks";
    const LABEL: &'static str = "退回任务";

    fn doc_key(&self) -> String {
        self.suborder_id.clone()
    }

    fn suborder_id(&self) -> &str {
        &self.suborder_id
    }
}

type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

fn host_key(suborder_id: &str, host_id: i64) -> String {
    format!("{suborder_id}/{host_id}")
}

/// 查询范围，只用于缩小扫描的行数，最终结果仍由过滤条件决定
#[derive(Debug, Clone, Copy)]
enum Scope<'a> {
    All,
    Suborder(&'a str),
    Key(&'a str),
}

impl<'a> Scope<'a> {
    fn suborder(id: Option<&'a str>) -> Self {
        id.map_or(Scope::All, Scope::Suborder)
    }

    fn from_ids(ids: Option<&'a Vec<String>>) -> Self {
        match ids {
            Some(ids) if ids.len() == 1 => Scope::Suborder(&ids[0]),
            _ => Scope::All,
        }
    }

    fn select_sql(self, table: &str) -> String {
        match self {
            Scope::All => format!("SELECT doc FROM {table}"),
            Scope::Suborder(_) => format!("SELECT doc FROM {table} WHERE suborder_id = ?1"),
            Scope::Key(_) => format!("SELECT doc FROM {table} WHERE doc_key = ?1"),
        }
    }

    fn bind<'q>(self, query: SqliteQuery<'q>) -> SqliteQuery<'q>
    where
        'a: 'q,
    {
        match self {
            Scope::All => query,
            Scope::Suborder(v) | Scope::Key(v) => query.bind(v),
        }
    }
}

fn db_error(err: sqlx::Error) -> RecyclerError {
    RecyclerError::DatabaseOperation(err.to_string())
}

fn decode<T: Document>(row: &SqliteRow) -> RecyclerResult<T> {
    let doc: String = row.try_get("doc").map_err(db_error)?;
    Ok(serde_json::from_str(&doc)?)
}

/// SQLite文档存储
pub struct SqliteStore {
    pool: SqlitePool,
    /// 串行化本进程内的写事务，避免SQLite写锁冲突
    write_lock: Mutex<()>,
}

impl SqliteStore {
    /// 按配置打开数据库，文件不存在时自动创建
    pub async fn connect(config: &DatabaseConfig) -> RecyclerResult<Self> {
        debug!("打开SQLite数据库: {}", config.url);

        let connect_options = SqliteConnectOptions::from_str(&config.url)
            .map_err(db_error)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(config.connection_timeout_seconds));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds))
            .connect_with(connect_options)
            .await
            .map_err(db_error)?;

        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> RecyclerResult<Self> {
        Self::run_migrations(&pool).await?;
        Ok(Self {
            pool,
            write_lock: Mutex::new(()),
        })
    }

    /// 以同一个存储实例构造全部仓储
    pub fn repositories(self: &Arc<Self>) -> Repositories {
        Repositories {
            orders: self.clone(),
            hosts: self.clone(),
            detect_tasks: self.clone(),
            detect_steps: self.clone(),
            step_cfgs: self.clone(),
            return_tasks: self.clone(),
        }
    }

    async fn run_migrations(pool: &SqlitePool) -> RecyclerResult<()> {
        let tables = [
            RecycleOrder::TABLE,
            RecycleHost::TABLE,
            DetectTask::TABLE,
            DetectStep::TABLE,
            DetectStepCfg::TABLE,
            ReturnTask::TABLE,
        ];
        for table in tables {
            sqlx::query(&format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    doc_key TEXT PRIMARY KEY,
                    suborder_id TEXT NOT NULL DEFAULT '',
                    doc TEXT NOT NULL
                )"
            ))
            .execute(pool)
            .await
            .map_err(db_error)?;

            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS idx_{table}_suborder_id ON {table}(suborder_id)"
            ))
            .execute(pool)
            .await
            .map_err(db_error)?;
        }

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sequences (
                name TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            )",
        )
        .execute(pool)
        .await
        .map_err(db_error)?;

        info!("SQLite数据表初始化完成");
        Ok(())
    }

    async fn fetch<T: Document>(&self, scope: Scope<'_>) -> RecyclerResult<Vec<T>> {
        let sql = scope.select_sql(T::TABLE);
        let rows = scope
            .bind(sqlx::query(&sql))
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;
        rows.iter().map(decode::<T>).collect()
    }

    async fn fetch_one<T: Document>(&self, key: &str) -> RecyclerResult<Option<T>> {
        Ok(self.fetch::<T>(Scope::Key(key)).await?.into_iter().next())
    }

    /// 整批插入，任一主键冲突时整批回滚
    async fn insert_many<T: Document>(&self, docs: &[T]) -> RecyclerResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await.map_err(db_error)?;
        let sql = format!(
            "INSERT INTO {} (doc_key, suborder_id, doc) VALUES (?1, ?2, ?3)",
            T::TABLE
        );
        for doc in docs {
            let key = doc.doc_key();
            let result = sqlx::query(&sql)
                .bind(&key)
                .bind(doc.suborder_id())
                .bind(serde_json::to_string(doc)?)
                .execute(&mut *tx)
                .await;
            match result {
                Ok(_) => {}
                Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                    return Err(RecyclerError::DatabaseOperation(format!(
                        "{} {} 已存在",
                        T::LABEL,
                        key
                    )));
                }
                Err(e) => return Err(db_error(e)),
            }
        }
        tx.commit().await.map_err(db_error)
    }

    async fn upsert_doc<T: Document>(&self, doc: &T) -> RecyclerResult<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query(&format!(
            "INSERT INTO {} (doc_key, suborder_id, doc) VALUES (?1, ?2, ?3)
             ON CONFLICT(doc_key) DO UPDATE SET doc = excluded.doc",
            T::TABLE
        ))
        .bind(doc.doc_key())
        .bind(doc.suborder_id())
        .bind(serde_json::to_string(doc)?)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    /// 在一个事务内读取范围内的文档，对命中的文档执行修改并回写
    async fn update_where<T, P, A>(
        &self,
        scope: Scope<'_>,
        predicate: P,
        mut apply: A,
    ) -> RecyclerResult<u64>
    where
        T: Document,
        P: Fn(&T) -> bool + Send,
        A: FnMut(&mut T) -> RecyclerResult<()> + Send,
    {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let sql = scope.select_sql(T::TABLE);
        let rows = scope
            .bind(sqlx::query(&sql))
            .fetch_all(&mut *tx)
            .await
            .map_err(db_error)?;

        let update_sql = format!("UPDATE {} SET doc = ?1 WHERE doc_key = ?2", T::TABLE);
        let mut affected = 0;
        for row in &rows {
            let mut doc: T = decode(row)?;
            if !predicate(&doc) {
                continue;
            }
            apply(&mut doc)?;
            sqlx::query(&update_sql)
                .bind(serde_json::to_string(&doc)?)
                .bind(doc.doc_key())
                .execute(&mut *tx)
                .await
                .map_err(db_error)?;
            affected += 1;
        }

        tx.commit().await.map_err(db_error)?;
        Ok(affected)
    }

    async fn delete_where<T, P>(&self, scope: Scope<'_>, predicate: P) -> RecyclerResult<u64>
    where
        T: Document,
        P: Fn(&T) -> bool + Send,
    {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let sql = scope.select_sql(T::TABLE);
        let rows = scope
            .bind(sqlx::query(&sql))
            .fetch_all(&mut *tx)
            .await
            .map_err(db_error)?;

        let delete_sql = format!("DELETE FROM {} WHERE doc_key = ?1", T::TABLE);
        let mut affected = 0;
        for row in &rows {
            let doc: T = decode(row)?;
            if !predicate(&doc) {
                continue;
            }
            sqlx::query(&delete_sql)
                .bind(doc.doc_key())
                .execute(&mut *tx)
                .await
                .map_err(db_error)?;
            affected += 1;
        }

        tx.commit().await.map_err(db_error)?;
        Ok(affected)
    }
}

#[async_trait]
impl OrderRepository for SqliteStore {
    async fn create(&self, order: &RecycleOrder) -> RecyclerResult<()> {
        self.insert_many(std::slice::from_ref(order)).await
    }

    async fn get(&self, suborder_id: &str) -> RecyclerResult<Option<RecycleOrder>> {
        self.fetch_one(suborder_id).await
    }

    async fn find(&self, filter: &OrderFilter) -> RecyclerResult<Vec<RecycleOrder>> {
        let mut found: Vec<RecycleOrder> = self
            .fetch::<RecycleOrder>(Scope::from_ids(filter.suborder_ids.as_ref()))
            .await?
            .into_iter()
            .filter(|o| filter.matches(o))
            .collect();
        found.sort_by(|a, b| {
            a.create_at
                .cmp(&b.create_at)
                .then_with(|| a.suborder_id.cmp(&b.suborder_id))
        });
        Ok(paginate(found, filter.offset, filter.limit))
    }

    async fn count(&self, filter: &OrderFilter) -> RecyclerResult<u64> {
        let orders = self
            .fetch::<RecycleOrder>(Scope::from_ids(filter.suborder_ids.as_ref()))
            .await?;
        Ok(orders.iter().filter(|o| filter.matches(o)).count() as u64)
    }

    async fn update(&self, filter: &OrderFilter, update: &OrderUpdate) -> RecyclerResult<u64> {
        let affected = self
            .update_where(
                Scope::from_ids(filter.suborder_ids.as_ref()),
                |o: &RecycleOrder| filter.matches(o),
                |o| {
                    update.apply(o);
                    Ok(())
                },
            )
            .await?;
        debug!("更新回收单 {} 条", affected);
        Ok(affected)
    }
}

#[async_trait]
impl HostRepository for SqliteStore {
    async fn create_many(&self, hosts: &[RecycleHost]) -> RecyclerResult<()> {
        self.insert_many(hosts).await
    }

    async fn find(&self, filter: &HostFilter) -> RecyclerResult<Vec<RecycleHost>> {
        let mut found: Vec<RecycleHost> = self
            .fetch::<RecycleHost>(Scope::suborder(filter.suborder_id.as_deref()))
            .await?
            .into_iter()
            .filter(|h| filter.matches(h))
            .collect();
        found.sort_by_key(|h| h.host_id);
        Ok(paginate(found, None, filter.limit))
    }

    async fn count(&self, filter: &HostFilter) -> RecyclerResult<u64> {
        let hosts = self
            .fetch::<RecycleHost>(Scope::suborder(filter.suborder_id.as_deref()))
            .await?;
        Ok(hosts.iter().filter(|h| filter.matches(h)).count() as u64)
    }

    async fn update(&self, filter: &HostFilter, update: &HostUpdate) -> RecyclerResult<u64> {
        self.update_where(
            Scope::suborder(filter.suborder_id.as_deref()),
            |h: &RecycleHost| filter.matches(h),
            |h| {
                update.apply(h);
                Ok(())
            },
        )
        .await
    }

    async fn delete(&self, filter: &HostFilter) -> RecyclerResult<u64> {
        self.delete_where(Scope::suborder(filter.suborder_id.as_deref()), |h: &RecycleHost| {
            filter.matches(h)
        })
        .await
    }
}

#[async_trait]
impl DetectTaskRepository for SqliteStore {
    async fn create_many(&self, tasks: &[DetectTask]) -> RecyclerResult<()> {
        self.insert_many(tasks).await
    }

    async fn find(&self, filter: &DetectTaskFilter) -> RecyclerResult<Vec<DetectTask>> {
        let mut found: Vec<DetectTask> = self
            .fetch::<DetectTask>(Scope::suborder(filter.suborder_id.as_deref()))
            .await?
            .into_iter()
            .filter(|t| filter.matches(t))
            .collect();
        found.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        Ok(found)
    }

    async fn count(&self, filter: &DetectTaskFilter) -> RecyclerResult<u64> {
        let tasks = self
            .fetch::<DetectTask>(Scope::suborder(filter.suborder_id.as_deref()))
            .await?;
        Ok(tasks.iter().filter(|t| filter.matches(t)).count() as u64)
    }

    async fn save_progress(&self, tasks: &[DetectTask]) -> RecyclerResult<()> {
        for task in tasks {
            let affected = self
                .update_where(
                    Scope::Key(&task.task_id),
                    |_: &DetectTask| true,
                    |existing| {
                        existing.status = task.status;
                        existing.message = task.message.clone();
                        existing.total_num = task.total_num;
                        existing.success_num = task.success_num;
                        existing.failed_num = task.failed_num;
                        existing.pending_num = task.pending_num;
                        existing.update_at = task.update_at;
                        Ok(())
                    },
                )
                .await?;
            if affected == 0 {
                return Err(RecyclerError::DetectTaskNotFound {
                    task_id: task.task_id.clone(),
                });
            }
        }
        Ok(())
    }

    async fn delete(&self, filter: &DetectTaskFilter) -> RecyclerResult<u64> {
        self.delete_where(Scope::suborder(filter.suborder_id.as_deref()), |t: &DetectTask| {
            filter.matches(t)
        })
        .await
    }

    async fn next_sequence(&self, name: &str) -> RecyclerResult<u64> {
        let _guard = self.write_lock.lock().await;
        let row = sqlx::query(
            "INSERT INTO sequences (name, value) VALUES (?1, 1)
             ON CONFLICT(name) DO UPDATE SET value = value + 1
             RETURNING value",
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error)?;
        let value: i64 = row.try_get("value").map_err(db_error)?;
        Ok(value as u64)
    }
}

#[async_trait]
impl DetectStepRepository for SqliteStore {
    async fn create_many(&self, steps: &[DetectStep]) -> RecyclerResult<()> {
        self.insert_many(steps).await
    }

    async fn find(&self, filter: &StepFilter) -> RecyclerResult<Vec<DetectStep>> {
        let mut found: Vec<DetectStep> = self
            .fetch::<DetectStep>(Scope::suborder(filter.suborder_id.as_deref()))
            .await?
            .into_iter()
            .filter(|s| filter.matches(s))
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(found)
    }

    async fn count(&self, filter: &StepFilter) -> RecyclerResult<u64> {
        let steps = self
            .fetch::<DetectStep>(Scope::suborder(filter.suborder_id.as_deref()))
            .await?;
        Ok(steps.iter().filter(|s| filter.matches(s)).count() as u64)
    }

    async fn update(&self, filter: &StepFilter, update: &StepUpdate) -> RecyclerResult<u64> {
        self.update_where(
            Scope::suborder(filter.suborder_id.as_deref()),
            |s: &DetectStep| filter.matches(s),
            |s| {
                update.apply(s);
                Ok(())
            },
        )
        .await
    }

    async fn delete(&self, filter: &StepFilter) -> RecyclerResult<u64> {
        self.delete_where(Scope::suborder(filter.suborder_id.as_deref()), |s: &DetectStep| {
            filter.matches(s)
        })
        .await
    }
}

#[async_trait]
impl StepCfgRepository for SqliteStore {
    async fn list(&self) -> RecyclerResult<Vec<DetectStepCfg>> {
        let mut cfgs = self.fetch::<DetectStepCfg>(Scope::All).await?;
        cfgs.sort_by_key(|c| c.sequence);
        Ok(cfgs)
    }

    async fn upsert(&self, cfg: &DetectStepCfg) -> RecyclerResult<()> {
        self.upsert_doc(cfg).await
    }
}

#[async_trait]
impl ReturnTaskRepository for SqliteStore {
    async fn create(&self, task: &ReturnTask) -> RecyclerResult<()> {
        self.insert_many(std::slice::from_ref(task)).await
    }

    async fn get(&self, suborder_id: &str) -> RecyclerResult<Option<ReturnTask>> {
        self.fetch_one(suborder_id).await
    }

    async fn update(&self, suborder_id: &str, update: &ReturnTaskUpdate) -> RecyclerResult<u64> {
        self.update_where(
            Scope::Key(suborder_id),
            |_: &ReturnTask| true,
            |task| {
                update.apply(task);
                Ok(())
            },
        )
        .await
    }
}
