// 流媒体服务器回调报文
// 服务器以 HTTP POST JSON 通知流事件，应答 {code, msg}

use serde::{Deserialize, Serialize};

/// 回调请求体。不同事件共用一套字段，缺省字段按空处理。
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HookBody {
    pub stream_id: String,
    /// 事件来源节点
    #[serde(default)]
    pub media_server: String,
    #[serde(default)]
    pub ssrc: Option<u32>,
    #[serde(default)]
    pub sink_id: Option<String>,
    /// 推流来源地址
    #[serde(default)]
    pub remote_addr: Option<String>,
}

/// 回调应答。code=0 放行。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookReply {
    pub code: i32,
    pub msg: String,
}

impl HookReply {
    pub fn ok() -> Self {
        Self {
            code: 0,
            msg: "success".to_string(),
        }
    }

    pub fn reject(msg: impl Into<String>) -> Self {
        Self {
            code: -1,
            msg: msg.into(),
        }
    }
}
