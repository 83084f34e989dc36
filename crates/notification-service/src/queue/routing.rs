//! 路由键与队列命名
//!
//! 路由键格式为 `{userRole}.{category}.{type}`，绑定模式支持 topic 通配：
//! `*` 匹配恰好一个词，`#` 匹配零个或多个词。

use crate::model::{Category, NotificationType, UserRole};

/// 用户专属的持久队列名：`notifications.{role}.{userID}`
pub fn user_queue_name(role: UserRole, user_id: &str) -> String {
    format!("notifications.{}.{}", role, user_id)
}

/// 为订阅生成绑定键
///
/// 指定类型时逐个绑定；只指定类别时绑定该类别下全部类型；
/// 都未指定时绑定该角色的全部消息。
pub fn binding_keys(
    role: UserRole,
    categories: &[Category],
    types: &[NotificationType],
) -> Vec<String> {
    let mut keys: Vec<String> = if !types.is_empty() {
        types
            .iter()
            .map(|t| format!("{}.{}.{}", role, t.category(), t))
            .collect()
    } else if !categories.is_empty() {
        categories
            .iter()
            .map(|c| format!("{}.{}.*", role, c))
            .collect()
    } else {
        vec![format!("{}.#", role)]
    };
    keys.sort();
    keys.dedup();
    keys
}

/// topic 模式匹配
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((word, rest)) => match key.split_first() {
            Some((k, key_rest)) => (*word == "*" || word == k) && match_words(rest, key_rest),
            None => false,
        },
    }
}
