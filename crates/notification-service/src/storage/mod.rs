//! 通知存储层
//!
//! 设计原则：
//! - 元数据存储是已读状态与投递状态的权威来源
//! - 消息代理是面向订阅方的持久化投递日志，状态更新只做尽力镜像
//! - 写入先元数据后代理，同一 id 的重复写入幂等

mod combined;
mod memory;
mod metadata;
mod postgres;
mod queue_storage;
mod sweeper;

pub use combined::{CombinedStorage, DEFAULT_FETCH_LIMIT, RetrySweepReport};
pub use memory::InMemoryMetadataStore;
pub use metadata::{MetadataRecord, MetadataStore, RetryCursor};
pub use postgres::PgMetadataStore;
pub use queue_storage::{QueueStorage, UPDATE_ROUTING_PREFIX};
pub use sweeper::StorageSweeper;

#[cfg(test)]
pub use metadata::MockMetadataStore;
