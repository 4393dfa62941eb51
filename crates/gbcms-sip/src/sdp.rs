// GB28181 SDP 描述
// 构造请求/应答 SDP，解析 y= SSRC、a=setup、a=downloadspeed 等国标扩展

use crate::error::{Result, SipError};

/// 会话目的，由 SDP 会话名称（s= 行）小写后得出
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteType {
    Play,
    Playback,
    Download,
    Broadcast,
    Talk,
}

impl InviteType {
    pub fn parse(session_name: &str) -> Option<Self> {
        match session_name.to_ascii_lowercase().as_str() {
            "play" => Some(InviteType::Play),
            "playback" => Some(InviteType::Playback),
            "download" => Some(InviteType::Download),
            "broadcast" => Some(InviteType::Broadcast),
            "talk" => Some(InviteType::Talk),
            _ => None,
        }
    }

    /// s= 行中使用的会话名称
    pub fn session_name(&self) -> &'static str {
        match self {
            InviteType::Play => "Play",
            InviteType::Playback => "Playback",
            InviteType::Download => "Download",
            InviteType::Broadcast => "Broadcast",
            InviteType::Talk => "Talk",
        }
    }
}

/// 媒体建立方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MediaSetup {
    #[default]
    Udp,
    Passive,
    Active,
}

impl MediaSetup {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Some(MediaSetup::Udp),
            "passive" => Some(MediaSetup::Passive),
            "active" => Some(MediaSetup::Active),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaSetup::Udp => "udp",
            MediaSetup::Passive => "passive",
            MediaSetup::Active => "active",
        }
    }

    pub fn is_tcp(&self) -> bool {
        !matches!(self, MediaSetup::Udp)
    }

    /// 应答方的 setup：TCP 上 passive/active 互换，UDP 原样
    pub fn answer(&self) -> MediaSetup {
        match self {
            MediaSetup::Udp => MediaSetup::Udp,
            MediaSetup::Passive => MediaSetup::Active,
            MediaSetup::Active => MediaSetup::Passive,
        }
    }
}

/// SDP 构造参数
#[derive(Debug, Clone)]
pub struct SdpBuild<'a> {
    /// 媒体类型（video/audio）
    pub media: &'a str,
    pub invite_type: InviteType,
    /// 收流地址
    pub ip: &'a str,
    pub port: u16,
    /// 录像回放/下载的时间范围（epoch 秒），实时为 (0, 0)
    pub start_time: i64,
    pub stop_time: i64,
    pub setup: MediaSetup,
    /// 下载倍速，0 表示不携带
    pub speed: u32,
    pub ssrc: u32,
    /// (payload, 编码名/时钟) 对
    pub rtpmap: &'a [(u8, &'a str)],
    /// sendonly/recvonly/sendrecv
    pub direction: &'a str,
}

/// 生成 GB28181 SDP。y= 行始终位于末尾。
pub fn build_sdp(owner: &str, b: &SdpBuild<'_>) -> String {
    let mut sdp = String::new();
    sdp.push_str("v=0\r\n");
    sdp.push_str(&format!("o={} 0 0 IN IP4 {}\r\n", owner, b.ip));
    sdp.push_str(&format!("s={}\r\n", b.invite_type.session_name()));
    sdp.push_str(&format!("c=IN IP4 {}\r\n", b.ip));
    sdp.push_str(&format!("t={} {}\r\n", b.start_time, b.stop_time));

    let proto = if b.setup.is_tcp() { "TCP/RTP/AVP" } else { "RTP/AVP" };
    let formats: Vec<String> = b.rtpmap.iter().map(|(pt, _)| pt.to_string()).collect();
    sdp.push_str(&format!(
        "m={} {} {} {}\r\n",
        b.media,
        b.port,
        proto,
        formats.join(" ")
    ));
    sdp.push_str(&format!("a={}\r\n", b.direction));
    for (pt, enc) in b.rtpmap {
        sdp.push_str(&format!("a=rtpmap:{} {}\r\n", pt, enc));
    }
    if b.setup.is_tcp() {
        sdp.push_str(&format!("a=setup:{}\r\n", b.setup.as_str()));
        sdp.push_str("a=connection:new\r\n");
    }
    if b.speed > 0 {
        sdp.push_str(&format!("a=downloadspeed:{}\r\n", b.speed));
    }
    sdp.push_str(&format!("y={:010}\r\n", b.ssrc));
    sdp
}

/// 解析出的对端 SDP 信息
#[derive(Debug, Clone, Default)]
pub struct SdpInfo {
    pub session_name: String,
    pub invite_type: Option<InviteType>,
    pub addr: String,
    /// 媒体类型（video/audio），取第一条 m= 行
    pub media: String,
    pub port: u16,
    pub is_tcp: bool,
    pub setup: Option<MediaSetup>,
    pub download_speed: Option<u32>,
    pub ssrc: Option<u32>,
    pub start_time: i64,
    pub stop_time: i64,
}

impl SdpInfo {
    pub fn parse(sdp: &str) -> Result<Self> {
        let mut info = SdpInfo::default();
        let mut saw_media = false;

        for line in sdp.lines() {
            let line = line.trim();
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            match key {
                "s" => {
                    info.session_name = value.to_string();
                    info.invite_type = InviteType::parse(value);
                }
                "c" => {
                    if let Some(addr) = value.split_whitespace().nth(2) {
                        info.addr = addr.to_string();
                    }
                }
                "t" => {
                    let mut parts = value.split_whitespace();
                    info.start_time = parts.next().and_then(|v| v.parse().ok()).unwrap_or(0);
                    info.stop_time = parts.next().and_then(|v| v.parse().ok()).unwrap_or(0);
                }
                "m" if !saw_media => {
                    saw_media = true;
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() >= 3 {
                        info.media = parts[0].to_string();
                        info.port = parts[1].parse().unwrap_or(0);
                        info.is_tcp = parts[2].contains("TCP");
                    }
                }
                "a" => {
                    if let Some(v) = value.strip_prefix("setup:") {
                        info.setup = MediaSetup::parse(v.trim());
                    } else if let Some(v) = value.strip_prefix("downloadspeed:") {
                        info.download_speed = v.trim().parse().ok();
                    }
                }
                "y" => {
                    info.ssrc = value.trim().parse().ok();
                }
                _ => {}
            }
        }

        if info.addr.is_empty() && info.port == 0 {
            return Err(SipError::Parse("SDP missing c=/m= lines".to_string()));
        }
        Ok(info)
    }

    /// 对端宣告的媒体地址 `ip:port`
    pub fn media_addr(&self) -> String {
        format!("{}:{}", self.addr, self.port)
    }

    /// 应答此 offer 时应使用的 setup
    pub fn answer_setup(&self) -> MediaSetup {
        if self.is_tcp {
            self.setup.unwrap_or(MediaSetup::Passive).answer()
        } else {
            MediaSetup::Udp
        }
    }
}

/// 国标 PS 流的默认 rtpmap
pub const PS_RTPMAP: &[(u8, &str)] = &[(96, "PS/90000"), (98, "H264/90000"), (97, "MPEG4/90000")];

/// 语音对讲/广播用 G.711
pub const AUDIO_RTPMAP: &[(u8, &str)] = &[(8, "PCMA/8000")];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_play_offer_udp() {
        let sdp = build_sdp(
            "34020000002000000001",
            &SdpBuild {
                media: "video",
                invite_type: InviteType::Play,
                ip: "192.168.1.100",
                port: 30000,
                start_time: 0,
                stop_time: 0,
                setup: MediaSetup::Udp,
                speed: 0,
                ssrc: 100001,
                rtpmap: PS_RTPMAP,
                direction: "recvonly",
            },
        );

        assert!(sdp.contains("s=Play"));
        assert!(sdp.contains("t=0 0"));
        assert!(sdp.contains("m=video 30000 RTP/AVP 96 98 97"));
        assert!(sdp.contains("a=rtpmap:96 PS/90000"));
        assert!(!sdp.contains("a=setup"));
        assert!(!sdp.contains("downloadspeed"));
        assert!(sdp.ends_with("y=0000100001\r\n"));
    }

    #[test]
    fn test_build_playback_with_speed_tcp() {
        let sdp = build_sdp(
            "34020000002000000001",
            &SdpBuild {
                media: "video",
                invite_type: InviteType::Playback,
                ip: "192.168.1.100",
                port: 30002,
                start_time: 1718724056,
                stop_time: 1718724356,
                setup: MediaSetup::Passive,
                speed: 2,
                ssrc: 1,
                rtpmap: PS_RTPMAP,
                direction: "recvonly",
            },
        );

        assert!(sdp.contains("s=Playback"));
        assert!(sdp.contains("t=1718724056 1718724356"));
        assert!(sdp.contains("m=video 30002 TCP/RTP/AVP"));
        assert!(sdp.contains("a=setup:passive"));
        assert!(sdp.contains("a=connection:new"));
        assert!(sdp.contains("a=downloadspeed:2"));
        // y= 必须是最后一个属性
        assert!(sdp.trim_end().ends_with("y=0000000001"));
    }

    #[test]
    fn test_parse_answer() {
        let sdp = "v=0\r\n\
                   o=34020000001320000001 0 0 IN IP4 192.168.1.64\r\n\
                   s=Play\r\n\
                   c=IN IP4 192.168.1.64\r\n\
                   t=0 0\r\n\
                   m=video 15060 TCP/RTP/AVP 96\r\n\
                   a=sendonly\r\n\
                   a=setup:active\r\n\
                   a=rtpmap:96 PS/90000\r\n\
                   y=0000100001\r\n";

        let info = SdpInfo::parse(sdp).unwrap();
        assert_eq!(info.invite_type, Some(InviteType::Play));
        assert_eq!(info.addr, "192.168.1.64");
        assert_eq!(info.port, 15060);
        assert!(info.is_tcp);
        assert_eq!(info.setup, Some(MediaSetup::Active));
        assert_eq!(info.ssrc, Some(100001));
        assert_eq!(info.media_addr(), "192.168.1.64:15060");
        assert_eq!(info.answer_setup(), MediaSetup::Passive);
    }

    #[test]
    fn test_parse_download_offer() {
        let sdp = "v=0\r\n\
                   o=u 0 0 IN IP4 1.2.3.4\r\n\
                   s=Download\r\n\
                   c=IN IP4 1.2.3.4\r\n\
                   t=1718724056 1718724356\r\n\
                   m=video 9000 RTP/AVP 96\r\n\
                   a=downloadspeed:4\r\n\
                   y=123\r\n";
        let info = SdpInfo::parse(sdp).unwrap();
        assert_eq!(info.invite_type, Some(InviteType::Download));
        assert_eq!(info.download_speed, Some(4));
        assert_eq!(info.start_time, 1718724056);
        assert_eq!(info.answer_setup(), MediaSetup::Udp);
    }

    #[test]
    fn test_setup_answer_swap() {
        assert_eq!(MediaSetup::Passive.answer(), MediaSetup::Active);
        assert_eq!(MediaSetup::Active.answer(), MediaSetup::Passive);
        assert_eq!(MediaSetup::Udp.answer(), MediaSetup::Udp);
    }
}
