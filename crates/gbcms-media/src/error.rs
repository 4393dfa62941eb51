use thiserror::Error;

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("HTTP 请求失败: {0}")]
    Http(#[from] reqwest::Error),

    #[error("流媒体服务器返回错误: code={code} msg={msg}")]
    Remote { code: i32, msg: String },

    #[error("流媒体服务器响应缺少 data 字段")]
    MissingData,
}

pub type Result<T> = std::result::Result<T, MediaError>;
