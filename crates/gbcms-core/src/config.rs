// 配置
// TOML 文件加载，全部字段带默认值，缺省即可起一个本地联调实例

use crate::error::{CmsError, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub sip: SipConfig,
    pub media: MediaConfig,
    pub http: HttpConfig,
    pub db: DbConfig,
    pub log: LogConfig,
    pub subscribe: SubscribeConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SipConfig {
    /// 本级平台国标编码（20 位）
    pub id: String,
    /// SIP 域（编码前 10 位）
    pub domain: String,
    pub listen_ip: String,
    /// 对外宣告的地址，NAT 后与 listen_ip 不同
    pub public_ip: String,
    pub port: u16,
    /// 设备注册口令（设备行未配置时生效）
    pub password: String,
    /// 注册有效期上限（秒）
    pub register_expires: u32,
    /// 心跳超时（秒），超过即判离线
    pub alive_expires: u64,
    /// INVITE 及推流确认的等待上限（秒）
    pub invite_timeout: u64,
    /// 设备点播收流方式缺省值 udp / passive / active
    pub device_default_media_transport: String,
}

impl Default for SipConfig {
    fn default() -> Self {
        Self {
            id: "34020000002000000001".to_string(),
            domain: "3402000000".to_string(),
            listen_ip: "0.0.0.0".to_string(),
            public_ip: "127.0.0.1".to_string(),
            port: 5060,
            password: "12345678".to_string(),
            register_expires: 3600,
            alive_expires: 180,
            invite_timeout: 10,
            device_default_media_transport: "udp".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// 流媒体服务器控制接口
    pub url: String,
    pub secret: String,
    /// 流媒体服务器收流地址，写入 SDP 的 c= 行
    pub stream_ip: String,
    /// 播放地址列表中优先返回的封装格式
    pub prefer_stream_fmt: String,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8080".to_string(),
            secret: String::new(),
            stream_ip: "127.0.0.1".to_string(),
            prefer_stream_fmt: "flv".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// 回调与管理接口监听地址
    pub listen: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:18080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    pub url: String,
    /// 位置历史保留天数，每日 03:00 清理
    pub position_reserve_days: i64,
    /// 报警与日志历史保留天数
    pub alarm_reserve_days: i64,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://gbcms.db?mode=rwc".to_string(),
            position_reserve_days: 30,
            alarm_reserve_days: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SubscribeConfig {
    /// 目录/报警订阅有效期（秒）
    pub expires: u32,
    /// 移动位置订阅有效期（秒）
    pub mobile_position_expires: u32,
    /// 移动位置上报间隔（秒）
    pub mobile_position_interval: u32,
}

impl Default for SubscribeConfig {
    fn default() -> Self {
        Self {
            expires: 3600,
            mobile_position_expires: 600,
            mobile_position_interval: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| CmsError::Config(format!("读取 {} 失败: {}", path.as_ref().display(), e)))?;
        toml::from_str(&text).map_err(|e| CmsError::Config(e.to_string()))
    }

    /// 本级对外的 SIP 地址 ip:port
    pub fn sip_addr(&self) -> String {
        format!("{}:{}", self.sip.public_ip, self.sip.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.sip.port, 5060);
        assert_eq!(cfg.sip.invite_timeout, 10);
        assert_eq!(cfg.sip.device_default_media_transport, "udp");
        assert_eq!(cfg.db.position_reserve_days, 30);
        assert_eq!(cfg.db.alarm_reserve_days, 30);
        assert_eq!(cfg.subscribe.expires, 3600);
        assert_eq!(cfg.subscribe.mobile_position_interval, 5);
    }

    #[test]
    fn test_load_partial_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            f,
            "[sip]\nid = \"44010000002000000099\"\ndomain = \"4401000000\"\nport = 5061\n\n[media]\nurl = \"http://10.0.0.2:9090\"\n"
        )
        .unwrap();

        let cfg = Config::load(f.path()).unwrap();
        assert_eq!(cfg.sip.id, "44010000002000000099");
        assert_eq!(cfg.sip.port, 5061);
        // 未给出的段与字段取默认值
        assert_eq!(cfg.sip.alive_expires, 180);
        assert_eq!(cfg.media.url, "http://10.0.0.2:9090");
        assert_eq!(cfg.http.listen, "0.0.0.0:18080");
    }

    #[test]
    fn test_bad_toml_is_config_error() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "[sip\nport=").unwrap();
        assert!(matches!(Config::load(f.path()), Err(CmsError::Config(_))));
    }
}
