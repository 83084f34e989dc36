//! PostgreSQL 连接池
//!
//! 启动时按配置重试建立连接池，迁移脚本在编译期嵌入。

use std::time::{Duration, Instant};

use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{info, instrument, warn};

use crate::config::DatabaseConfig;
use crate::error::{InfraError, Result, is_transient};

/// 工作区根目录下的迁移脚本
static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// 建立连接池
    ///
    /// 瞬时故障按 `connect_retries` 重试，间隔逐次翻倍；其余错误立即返回。
    #[instrument(skip(config), fields(max_connections = config.max_connections))]
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let attempts = config.connect_retries.max(1);
        let mut backoff = Duration::from_millis(config.retry_backoff_millis);
        let mut attempt = 1;

        loop {
            match Self::build_pool(config).await {
                Ok(pool) => {
                    info!(attempt, "数据库连接池已创建");
                    return Ok(Self { pool });
                }
                Err(e) if !is_transient(&e) => return Err(e.into()),
                Err(e) if attempt >= attempts => {
                    return Err(InfraError::ConnectExhausted {
                        attempts,
                        source: e,
                    });
                }
                Err(e) => {
                    warn!(attempt, error = %e, retry_in = ?backoff, "连接数据库失败，稍后重试");
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                    attempt += 1;
                }
            }
        }
    }

    async fn build_pool(config: &DatabaseConfig) -> std::result::Result<PgPool, sqlx::Error> {
        PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .idle_timeout(Duration::from_secs(config.idle_timeout_seconds))
            .connect(&config.url)
            .await
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// 探测往返延迟
    pub async fn ping(&self) -> Result<Duration> {
        let started = Instant::now();
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(started.elapsed())
    }

    /// 应用尚未执行的迁移
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<()> {
        MIGRATOR.run(&self.pool).await?;
        info!(embedded = MIGRATOR.iter().count(), "数据库迁移完成");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
        info!("数据库连接池已关闭");
    }
}
