//! 消息代理重连集成测试
//!
//! 通过内存代理断开连接，验证连接阶段的变化、订阅的自动重建，
//! 以及取消订阅后不再接收消息。
//!
//! ## 运行方式
//!
//! ```bash
//! cargo test -p notification-service --test broker_reconnect
//! ```

use std::sync::Arc;
use std::time::Duration;

use notification_service::model::{Category, Notification, NotificationType, UserRole};
use notification_service::queue::{
    ConnectionPhase, MemoryBroker, QueueConfig, QueueSender, SubscribeOptions,
};
use notification_service::sender::Sender;
use tokio_util::sync::CancellationToken;

// ==================== 辅助函数 ====================

fn fast_config() -> QueueConfig {
    QueueConfig {
        reconnect_interval: Duration::from_millis(20),
        fetch_idle: Duration::from_millis(50),
        ..QueueConfig::default()
    }
}

async fn connected() -> (MemoryBroker, QueueSender) {
    let broker = MemoryBroker::new();
    let sender = QueueSender::connect(Arc::new(broker.clone()), fast_config())
        .await
        .expect("连接内存代理失败");
    (broker, sender)
}

fn room_change(user_id: &str) -> Notification {
    Notification::new(
        NotificationType::RoomChange,
        user_id,
        UserRole::Student,
        "教室变更",
        "第三轮改至 B204",
    )
}

async fn wait_for_phase(sender: &QueueSender, phase: ConnectionPhase) {
    let mut rx = sender.watch_phase();
    tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|p| *p == phase))
        .await
        .expect("等待连接阶段超时")
        .expect("阶段通道已关闭");
}

// ==================== 测试用例 ====================

#[tokio::test]
async fn test_phase_transitions_through_outage() {
    let (broker, sender) = connected().await;
    assert_eq!(sender.phase(), ConnectionPhase::Connected);

    broker.set_available(false);
    broker.drop_connections();
    wait_for_phase(&sender, ConnectionPhase::Disconnected).await;

    let err = sender
        .publish(&CancellationToken::new(), &room_change("42"))
        .await
        .unwrap_err();
    assert!(err.is_retryable());

    broker.set_available(true);
    wait_for_phase(&sender, ConnectionPhase::Connected).await;
    assert_eq!(broker.connection_count(), 1);

    sender
        .publish(&CancellationToken::new(), &room_change("42"))
        .await
        .expect("重连后发布应成功");
}

#[tokio::test]
async fn test_subscription_is_restored_after_reconnect() {
    let (broker, sender) = connected().await;
    let ctx = CancellationToken::new();

    let mut sub = sender
        .subscribe(
            &ctx,
            SubscribeOptions::new("42", UserRole::Student).with_categories([Category::Debate]),
        )
        .await
        .unwrap();

    broker.drop_connections();
    assert_eq!(broker.connection_count(), 0);
    tokio::time::timeout(Duration::from_secs(2), async {
        while broker.connection_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("等待重连超时");
    assert_eq!(sender.active_subscriptions(), 1);

    // 订阅重建在阶段切换为 Connected 之后完成，期间发布的消息留在持久队列
    let n = room_change("42");
    let mut delivered = None;
    for _ in 0..20 {
        if sender.publish(&ctx, &n).await.is_err() {
            tokio::time::sleep(Duration::from_millis(20)).await;
            continue;
        }
        if let Ok(Some(got)) = tokio::time::timeout(Duration::from_millis(100), sub.recv()).await {
            delivered = Some(got);
            break;
        }
    }
    let got = delivered.expect("重连后订阅应恢复接收");
    assert_eq!(got.id, n.id);
    assert_eq!(
        broker.bindings("notifications.student.42"),
        vec!["student.debate.*".to_string()]
    );
}

#[tokio::test]
async fn test_unsubscribe_then_publish_is_not_forwarded() {
    let (_broker, sender) = connected().await;
    let ctx = CancellationToken::new();

    let mut sub = sender
        .subscribe(&ctx, SubscribeOptions::new("42", UserRole::Student))
        .await
        .unwrap();
    sub.unsubscribe();
    tokio::time::timeout(Duration::from_secs(1), async {
        while sender.active_subscriptions() > 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();

    sender.publish(&ctx, &room_change("42")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(sub.try_recv().is_none());

    // 消息留在持久队列，可被拉取
    let drained = sender
        .drain_user_queue(&ctx, UserRole::Student, "42", 10)
        .await
        .unwrap();
    assert_eq!(drained.len(), 1);
}

#[tokio::test]
async fn test_other_users_messages_are_not_delivered() {
    let (_broker, sender) = connected().await;
    let ctx = CancellationToken::new();

    let mut sub = sender
        .subscribe(&ctx, SubscribeOptions::new("42", UserRole::Student))
        .await
        .unwrap();

    sender.publish(&ctx, &room_change("43")).await.unwrap();
    let mine = room_change("42");
    sender.publish(&ctx, &mine).await.unwrap();

    let got = tokio::time::timeout(Duration::from_secs(1), sub.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got.id, mine.id);
    assert!(sub.try_recv().is_none());
}

#[tokio::test]
async fn test_close_stops_reconnecting() {
    let (broker, sender) = connected().await;
    sender.close().await.expect("关闭失败");

    broker.drop_connections();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(sender.phase(), ConnectionPhase::Disconnected);
    assert_eq!(broker.connection_count(), 0);
}
