// 流媒体服务器控制客户端
// POST + JSON 报文调用，响应统一为 {code, msg, data} 信封，code=200 表示成功

use crate::error::{MediaError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// 转发出口类别
pub const FORWARD_BROADCAST: &str = "broadcast";
pub const FORWARD_CASCADED: &str = "cascaded";
pub const FORWARD_GATEWAY_1078: &str = "gateway_1078";

/// 统一响应信封
#[derive(Debug, Deserialize)]
struct ResMsg<T> {
    code: i32,
    #[serde(default)]
    msg: String,
    data: Option<T>,
}

impl<T> ResMsg<T> {
    fn into_data(self) -> Result<T> {
        if self.code != 200 {
            return Err(MediaError::Remote {
                code: self.code,
                msg: self.msg,
            });
        }
        self.data.ok_or(MediaError::MissingData)
    }

    fn into_ok(self) -> Result<()> {
        if self.code != 200 {
            return Err(MediaError::Remote {
                code: self.code,
                msg: self.msg,
            });
        }
        Ok(())
    }
}

/// gb28181/source/create 请求体
#[derive(Debug, Serialize)]
struct SourceCreate<'a> {
    source: &'a str,
    setup: &'a str,
    /// 期望的 SSRC，服务器可改派
    ssrc: u32,
    session_name: &'a str,
    speed: u32,
}

/// gb28181/source/create 返回的收流地址与播放地址
#[derive(Debug, Clone, Deserialize)]
pub struct SourceCreated {
    /// 收流地址 ip:port
    pub addr: String,
    /// 各协议播放地址（flv/hls/rtsp 等），老版本服务器可能缺失
    #[serde(default)]
    pub urls: Vec<String>,
    /// 服务器实际指派的 SSRC
    #[serde(default)]
    pub ssrc: u32,
}

impl SourceCreated {
    /// 收流端口，从 addr 里取
    pub fn port(&self) -> u16 {
        self.addr
            .rsplit(':')
            .next()
            .and_then(|p| p.parse().ok())
            .unwrap_or(0)
    }
}

/// sink/add 请求体
#[derive(Debug, Serialize)]
pub struct SinkAdd<'a> {
    pub source: &'a str,
    /// 对端收流地址 ip:port
    pub addr: &'a str,
    pub setup: &'a str,
    pub answer_setup: &'a str,
    pub ssrc: u32,
    pub session_name: &'a str,
    pub trans_stream_protocol: &'a str,
}

/// sink/add 返回的出口信息
#[derive(Debug, Clone, Deserialize)]
pub struct SinkCreated {
    /// 服务器指派的出口编号
    #[serde(rename = "sink")]
    pub sink_id: String,
    /// tcp-passive 时本端监听地址 ip:port
    #[serde(default)]
    pub addr: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub ssrc: u32,
}

impl SinkCreated {
    pub fn local_port(&self) -> u16 {
        if self.port != 0 {
            return self.port;
        }
        self.addr
            .rsplit(':')
            .next()
            .and_then(|p| p.parse().ok())
            .unwrap_or(0)
    }
}

/// 现存转发出口
#[derive(Debug, Clone, Deserialize)]
pub struct SinkInfo {
    #[serde(rename = "sink")]
    pub sink_id: String,
    #[serde(rename = "source")]
    pub stream_id: String,
    pub forward_type: String,
    #[serde(default)]
    pub addr: Option<String>,
}

/// 流状态
#[derive(Debug, Clone, Deserialize)]
pub struct StreamInfo {
    #[serde(rename = "source")]
    pub stream_id: String,
    /// 是否已收到推流
    pub publish: bool,
    #[serde(default)]
    pub ssrc: Option<u32>,
    #[serde(default)]
    pub sink_count: u32,
}

#[derive(Debug, Serialize)]
struct SourceParam<'a> {
    source: &'a str,
}

#[derive(Debug, Serialize)]
struct SinkClose<'a> {
    source: &'a str,
    sink: &'a str,
}

#[derive(Debug, Serialize)]
struct AnswerSet<'a> {
    source: &'a str,
    addr: &'a str,
    file_size: u64,
}

/// 流媒体服务器 HTTP 控制客户端
#[derive(Clone)]
pub struct MediaClient {
    http: reqwest::Client,
    base: String,
    secret: String,
}

impl MediaClient {
    pub fn new(base: impl Into<String>, secret: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(CALL_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            http,
            base: base.into().trim_end_matches('/').to_string(),
            secret: secret.into(),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
        body: &B,
    ) -> Result<ResMsg<T>> {
        let url = format!("{}/{}", self.base, path);
        let res = self
            .http
            .post(&url)
            .query(&[("secret", self.secret.as_str())])
            .query(query)
            .json(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(res.json().await?)
    }

    /// 开流收口：为 stream_id 打开收流地址并登记期望的 SSRC。
    /// 返回的 ssrc 以服务器指派为准。
    pub async fn create_source(
        &self,
        stream_id: &str,
        ssrc: u32,
        setup: &str,
        session_name: &str,
        speed: u32,
    ) -> Result<SourceCreated> {
        let res: ResMsg<SourceCreated> = self
            .post(
                "api/v1/gb28181/source/create",
                &[],
                &SourceCreate {
                    source: stream_id,
                    setup,
                    ssrc,
                    session_name,
                    speed,
                },
            )
            .await?;
        let created = res.into_data()?;
        tracing::debug!(
            target: "gbcms::media",
            stream_id,
            addr = %created.addr,
            ssrc = created.ssrc,
            "source created"
        );
        Ok(created)
    }

    /// tcp-active 时把对端应答中的媒体地址告知服务器，由其发起连接
    pub async fn set_answer(&self, stream_id: &str, addr: &str, file_size: u64) -> Result<()> {
        let res: ResMsg<serde_json::Value> = self
            .post(
                "api/v1/gb28181/answer/set",
                &[],
                &AnswerSet {
                    source: stream_id,
                    addr,
                    file_size,
                },
            )
            .await?;
        res.into_ok()
    }

    /// 关源。流不存在时服务器返回成功，调用方无需区分。
    pub async fn close_source(&self, stream_id: &str) -> Result<()> {
        let res: ResMsg<serde_json::Value> = self
            .post("api/v1/source/close", &[], &SourceParam { source: stream_id })
            .await?;
        res.into_ok()
    }

    /// 添加转发出口。forward_type 走 query，出口编号由服务器指派，
    /// tcp-passive 时返回本端监听端口。
    pub async fn add_sink(&self, forward_type: &str, req: &SinkAdd<'_>) -> Result<SinkCreated> {
        let res: ResMsg<SinkCreated> = self
            .post("api/v1/sink/add", &[("forward_type", forward_type)], req)
            .await?;
        res.into_data()
    }

    pub async fn close_sink(&self, stream_id: &str, sink_id: &str) -> Result<()> {
        let res: ResMsg<serde_json::Value> = self
            .post(
                "api/v1/sink/close",
                &[],
                &SinkClose {
                    source: stream_id,
                    sink: sink_id,
                },
            )
            .await?;
        res.into_ok()
    }

    /// 服务器侧现存的源列表，恢复对账用
    pub async fn list_sources(&self) -> Result<Vec<StreamInfo>> {
        let res: ResMsg<Vec<StreamInfo>> = self
            .post("api/v1/source/list", &[], &serde_json::json!({}))
            .await?;
        res.into_data()
    }

    /// 服务器侧现存的全部转发出口
    pub async fn list_sinks(&self) -> Result<Vec<SinkInfo>> {
        let res: ResMsg<Vec<SinkInfo>> = self
            .post("api/v1/sink/list", &[], &serde_json::json!({}))
            .await?;
        res.into_data()
    }

    pub async fn stream_info(&self, stream_id: &str) -> Result<StreamInfo> {
        let res: ResMsg<StreamInfo> = self
            .post(
                "api/v1/stream/info",
                &[("streamid", stream_id)],
                &serde_json::json!({}),
            )
            .await?;
        res.into_data()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_success() {
        let raw = r#"{"code":200,"msg":"ok","data":{"addr":"192.168.1.20:30000","ssrc":100001}}"#;
        let res: ResMsg<SourceCreated> = serde_json::from_str(raw).unwrap();
        let created = res.into_data().unwrap();
        assert_eq!(created.port(), 30000);
        assert_eq!(created.ssrc, 100001);
        assert!(created.urls.is_empty());
    }

    #[test]
    fn test_source_created_with_urls() {
        let raw = r#"{"addr":"m:30000","urls":["http://m/live/s.flv","rtsp://m/live/s"],"ssrc":0}"#;
        let created: SourceCreated = serde_json::from_str(raw).unwrap();
        assert_eq!(created.urls.len(), 2);
    }

    #[test]
    fn test_envelope_error_code() {
        let raw = r#"{"code":-1,"msg":"no free port"}"#;
        let res: ResMsg<SourceCreated> = serde_json::from_str(raw).unwrap();
        match res.into_data() {
            Err(MediaError::Remote { code, msg }) => {
                assert_eq!(code, -1);
                assert_eq!(msg, "no free port");
            }
            other => panic!("unexpected: {:?}", other.err()),
        }
    }

    #[test]
    fn test_envelope_unit_ok_without_data() {
        let raw = r#"{"code":200,"msg":"success"}"#;
        let res: ResMsg<serde_json::Value> = serde_json::from_str(raw).unwrap();
        assert!(res.into_ok().is_ok());
    }

    #[test]
    fn test_sink_created_port_fallback_to_addr() {
        let raw = r#"{"sink":"sink-7","addr":"192.168.1.20:31000"}"#;
        let created: SinkCreated = serde_json::from_str(raw).unwrap();
        assert_eq!(created.sink_id, "sink-7");
        assert_eq!(created.local_port(), 31000);

        let raw = r#"{"sink":"sink-8","port":31002}"#;
        let created: SinkCreated = serde_json::from_str(raw).unwrap();
        assert_eq!(created.local_port(), 31002);
    }

    #[test]
    fn test_sink_add_body_shape() {
        let body = SinkAdd {
            source: "34020000001320000001/34020000001320000001",
            addr: "10.0.0.2:9000",
            setup: "udp",
            answer_setup: "udp",
            ssrc: 100002,
            session_name: "Play",
            trans_stream_protocol: "ps",
        };
        let v = serde_json::to_value(&body).unwrap();
        assert_eq!(v["source"], "34020000001320000001/34020000001320000001");
        assert_eq!(v["answer_setup"], "udp");
        assert_eq!(v["trans_stream_protocol"], "ps");
    }

    #[test]
    fn test_stream_info_defaults() {
        let raw = r#"{"source":"a/b","publish":true}"#;
        let info: StreamInfo = serde_json::from_str(raw).unwrap();
        assert_eq!(info.stream_id, "a/b");
        assert!(info.publish);
        assert_eq!(info.sink_count, 0);
        assert!(info.ssrc.is_none());
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client = MediaClient::new("http://127.0.0.1:8080/", "secret");
        assert_eq!(client.base(), "http://127.0.0.1:8080");
    }
}
