//! 通知服务
//!
//! 按类别分发赛事管理后台的通知：邮件、站内信与消息代理。

use std::sync::Arc;

use chrono::Duration;
use notification_service::dispatcher::{DispatcherFactory, DispatcherOptions};
use notification_service::queue::{BrokerConnector, KafkaBroker, MemoryBroker, QueueConfig, QueueSender};
use notification_service::sender::{
    EmailSender, InAppSender, PgRecipientDirectory, PlainTextRenderer, RecipientDirectory,
    SmtpMailTransport, StaticRecipientDirectory,
};
use notification_service::storage::{
    CombinedStorage, InMemoryMetadataStore, MetadataStore, PgMetadataStore, QueueStorage,
    StorageSweeper,
};
use notification_service::NotificationService;
use tokio_util::sync::CancellationToken;
use tourney_shared::config::AppConfig;
use tourney_shared::database::Database;
use tourney_shared::observability;
use tracing::{error, info, warn};

const SERVICE_NAME: &str = "notification-service";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. 配置
    let config = AppConfig::load(SERVICE_NAME)?;
    let notification_config = &config.notification;

    // 2. 可观测性
    let _guard = observability::init(&config.service_name, &config.observability).await?;
    info!(
        environment = %config.environment,
        standalone = notification_config.standalone,
        "Starting {}...",
        SERVICE_NAME
    );

    // 3. 元数据存储与收件人目录
    let (database, metadata, directory): (
        Option<Database>,
        Arc<dyn MetadataStore>,
        Arc<dyn RecipientDirectory>,
    ) = if notification_config.standalone {
        warn!("独立模式：使用内存元数据存储，进程退出后数据丢失");
        (
            None,
            Arc::new(InMemoryMetadataStore::new()),
            Arc::new(StaticRecipientDirectory::new()),
        )
    } else {
        let db = Database::connect(&config.database).await?;
        db.run_migrations().await?;
        info!(latency = ?db.ping().await?, "数据库就绪");
        let metadata = Arc::new(PgMetadataStore::new(db.pool().clone()));
        let directory = Arc::new(PgRecipientDirectory::new(db.pool().clone()));
        (Some(db), metadata, directory)
    };

    // 4. 消息代理
    let connector: Arc<dyn BrokerConnector> = if notification_config.standalone {
        Arc::new(MemoryBroker::new())
    } else {
        Arc::new(KafkaBroker::new(
            config.kafka.clone(),
            &notification_config.broker,
        )?)
    };
    let queue = QueueSender::connect(connector, QueueConfig::from(&notification_config.broker)).await?;

    // 5. 渠道发送器
    let in_app = InAppSender::new(notification_config.in_app_buffer);
    let mut options = DispatcherOptions::default()
        .with_sender(Arc::new(in_app.clone()))
        .with_queue(Arc::new(queue.clone()))
        .with_default_expiry(Duration::days(notification_config.default_expiry_days.max(1)));

    if config.smtp.host.trim().is_empty() && notification_config.standalone {
        warn!("未配置 SMTP 主机，邮件渠道将保持 Pending");
    } else {
        let transport = Arc::new(SmtpMailTransport::new(&config.smtp)?);
        let email = EmailSender::new(transport, directory, Arc::new(PlainTextRenderer))
            .with_timeout(config.smtp.timeout());
        options = options.with_sender(Arc::new(email));
    }

    // 6. 分发器工厂、存储与服务
    let factory = Arc::new(DispatcherFactory::new(options));
    let storage = Arc::new(
        CombinedStorage::new(metadata, QueueStorage::new(queue))
            .with_batch_size(notification_config.sweep_batch_size),
    );
    let service = NotificationService::new(factory, storage.clone(), in_app);

    // 7. 后台清扫
    let shutdown = CancellationToken::new();
    let sweeper = StorageSweeper::from_config(storage, notification_config);
    let sweeper_handle = tokio::spawn(sweeper.run(shutdown.clone()));

    info!("{} 已就绪", SERVICE_NAME);

    // 8. 优雅关闭
    shutdown_signal().await;
    shutdown.cancel();
    if let Err(e) = sweeper_handle.await {
        error!(error = %e, "清扫任务异常退出");
    }
    if let Err(e) = service.close().await {
        error!(error = %e, "关闭通知服务出错");
    }
    if let Some(db) = database {
        db.close().await;
    }

    info!("{} shutdown complete", SERVICE_NAME);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "注册 Ctrl+C 处理器失败");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "注册 SIGTERM 处理器失败");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating graceful shutdown..."),
        _ = terminate => info!("Received SIGTERM, initiating graceful shutdown..."),
    }
}
