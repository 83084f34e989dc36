//! 邮件正文渲染
//!
//! 正文生成属于外部协作方，这里只定义接口与一个纯文本的默认实现。

use std::collections::BTreeMap;

use crate::error::Result;
use crate::model::Action;

/// 正文渲染器
#[cfg_attr(test, mockall::automock)]
pub trait BodyRenderer: Send + Sync {
    /// 根据标题、内容、操作与展平后的元数据生成可投递的正文
    fn render(
        &self,
        title: &str,
        content: &str,
        actions: &[Action],
        metadata: &BTreeMap<String, String>,
    ) -> Result<String>;
}

/// 纯文本渲染器
#[derive(Debug, Default, Clone)]
pub struct PlainTextRenderer;

impl BodyRenderer for PlainTextRenderer {
    fn render(
        &self,
        title: &str,
        content: &str,
        actions: &[Action],
        metadata: &BTreeMap<String, String>,
    ) -> Result<String> {
        let mut body = format!("{title}\n\n{content}\n");

        if !metadata.is_empty() {
            body.push('\n');
            for (key, value) in metadata {
                body.push_str(&format!("{key}: {value}\n"));
            }
        }

        let pending: Vec<&Action> = actions.iter().filter(|a| !a.completed).collect();
        if !pending.is_empty() {
            body.push('\n');
            for action in pending {
                match &action.url {
                    Some(url) => body.push_str(&format!("[{}] {}\n", action.label, url)),
                    None => body.push_str(&format!("[{}]\n", action.label)),
                }
            }
        }

        Ok(body)
    }
}
