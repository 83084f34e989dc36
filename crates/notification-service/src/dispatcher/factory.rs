//! 分发器工厂
//!
//! 按类别懒加载并缓存分发器实例。选项通过 `ArcSwap` 原子替换，
//! 替换的同时清空缓存；已取得旧实例的分发调用以旧选项完成。

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::RwLock;
use tracing::{debug, info};

use super::categories::{
    AuthDispatcher, DebateDispatcher, ReportDispatcher, TournamentDispatcher, UserDispatcher,
};
use super::{Dispatcher, DispatcherOptions};
use crate::error::Result;
use crate::model::Category;

pub struct DispatcherFactory {
    options: ArcSwap<DispatcherOptions>,
    cache: RwLock<HashMap<Category, Arc<dyn Dispatcher>>>,
}

impl DispatcherFactory {
    pub fn new(options: DispatcherOptions) -> Self {
        Self {
            options: ArcSwap::from_pointee(options),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// 当前选项快照
    pub fn options(&self) -> Arc<DispatcherOptions> {
        self.options.load_full()
    }

    /// 获取类别对应的分发器
    ///
    /// 先在读锁下查缓存，未命中时在写锁下再次检查后创建。
    pub fn get_dispatcher(&self, category: Category) -> Arc<dyn Dispatcher> {
        if let Some(dispatcher) = self.cache.read().get(&category) {
            return dispatcher.clone();
        }

        let mut cache = self.cache.write();
        if let Some(dispatcher) = cache.get(&category) {
            return dispatcher.clone();
        }

        let dispatcher = Self::build(category, self.options.load_full());
        cache.insert(category, dispatcher.clone());
        debug!(category = %category, "分发器已创建");
        dispatcher
    }

    /// 按类别名称获取分发器，未知类别返回错误
    pub fn get_dispatcher_by_name(&self, category: &str) -> Result<Arc<dyn Dispatcher>> {
        let category = Category::from_str(category)?;
        Ok(self.get_dispatcher(category))
    }

    /// 原子替换选项并使缓存失效
    pub fn update_options(&self, options: DispatcherOptions) {
        let mut cache = self.cache.write();
        self.options.store(Arc::new(options));
        let invalidated = cache.len();
        cache.clear();
        info!(invalidated, "分发器选项已更新，缓存已清空");
    }

    fn build(category: Category, options: Arc<DispatcherOptions>) -> Arc<dyn Dispatcher> {
        match category {
            Category::Auth => Arc::new(AuthDispatcher::new(options)),
            Category::User => Arc::new(UserDispatcher::new(options)),
            Category::Tournament => Arc::new(TournamentDispatcher::new(options)),
            Category::Debate => Arc::new(DebateDispatcher::new(options)),
            Category::Report => Arc::new(ReportDispatcher::new(options)),
        }
    }
}
