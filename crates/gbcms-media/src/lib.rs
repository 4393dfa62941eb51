// 流媒体服务器接入
// HTTP 控制接口客户端与回调（webhook）报文类型

pub mod client;
pub mod error;
pub mod hook;

pub use client::{
    MediaClient, SinkAdd, SinkCreated, SinkInfo, SourceCreated, StreamInfo, FORWARD_BROADCAST,
    FORWARD_CASCADED, FORWARD_GATEWAY_1078,
};
pub use error::{MediaError, Result};
pub use hook::{HookBody, HookReply};
