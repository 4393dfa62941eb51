// 持久化层
// SQLite 单写入者队列 + 类型化读取，重启恢复所需的快照全部落库

pub mod entity;
pub mod error;
pub mod repo;
pub mod writer;

pub use error::{Result, StoreError};
pub use repo::Store;
pub use writer::{spawn_writer, WriteHandle, WriteOp};
