// 信令核心
// 设备注册、目录、点播/回放/下载、级联、订阅与重启恢复的编排层

pub mod cascade;
pub mod catalog;
pub mod config;
pub mod context;
pub mod device;
pub mod dialog;
pub mod error;
pub mod handler;
pub mod invite;
pub mod recover;
pub mod stream;
pub mod subscribe;

pub use config::Config;
pub use error::{CmsError, Result};
