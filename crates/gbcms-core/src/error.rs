use thiserror::Error;

#[derive(Error, Debug)]
pub enum CmsError {
    #[error("SIP 错误: {0}")]
    Sip(#[from] gbcms_sip::SipError),

    #[error("存储错误: {0}")]
    Store(#[from] gbcms_store::StoreError),

    #[error("流媒体错误: {0}")]
    Media(#[from] gbcms_media::MediaError),

    #[error("配置错误: {0}")]
    Config(String),

    #[error("{0} 不存在: {1}")]
    NotFound(&'static str, String),

    #[error("设备离线: {0}")]
    Offline(String),

    #[error("操作超时: {0}")]
    Timeout(String),

    #[error("请求不合法: {0}")]
    BadRequest(String),

    #[error("设备忙: {0}")]
    Busy(String),

    #[error("认证失败: {0}")]
    Auth(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, CmsError>;
