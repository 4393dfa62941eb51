use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("数据库错误: {0}")]
    Db(#[from] sea_orm::DbErr),

    #[error("写入失败: {0}")]
    Write(String),

    #[error("写入队列已关闭")]
    WriterClosed,
}

pub type Result<T> = std::result::Result<T, StoreError>;
