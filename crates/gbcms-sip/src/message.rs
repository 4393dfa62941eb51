// SIP 消息解析和生成
// 支持 GB28181 标准的 SIP 消息格式，头部保持收发顺序

use crate::error::{Result, SipError};
use rand::Rng;
use std::fmt;
use std::net::SocketAddr;

/// SIP 方法
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Bye,
    Cancel,
    Message,
    Subscribe,
    Notify,
    Info,
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SipMethod::Register => "REGISTER",
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Bye => "BYE",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Message => "MESSAGE",
            SipMethod::Subscribe => "SUBSCRIBE",
            SipMethod::Notify => "NOTIFY",
            SipMethod::Info => "INFO",
        };
        write!(f, "{}", s)
    }
}

impl SipMethod {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "REGISTER" => Some(SipMethod::Register),
            "INVITE" => Some(SipMethod::Invite),
            "ACK" => Some(SipMethod::Ack),
            "BYE" => Some(SipMethod::Bye),
            "CANCEL" => Some(SipMethod::Cancel),
            "MESSAGE" => Some(SipMethod::Message),
            "SUBSCRIBE" => Some(SipMethod::Subscribe),
            "NOTIFY" => Some(SipMethod::Notify),
            "INFO" => Some(SipMethod::Info),
            _ => None,
        }
    }
}

/// 生成 Via branch（RFC3261 magic cookie 前缀）
pub fn new_branch() -> String {
    format!("z9hG4bK{}", rand_token(10))
}

/// 生成 From/To tag
pub fn new_tag() -> String {
    rand_token(10)
}

/// 生成 Call-ID
pub fn new_call_id(domain: &str) -> String {
    format!("{}@{}", rand_token(16), domain)
}

fn rand_token(len: usize) -> String {
    const CHARS: &[u8] = b"0123456789abcdef";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char)
        .collect()
}

/// 共享的头部集合，保持顺序，按名称大小写不敏感查找
#[derive(Debug, Clone, Default)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// 替换已有头部，不存在则追加
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        for (k, v) in self.0.iter_mut() {
            if k.eq_ignore_ascii_case(name) {
                *v = value;
                return;
            }
        }
        self.0.push((name.to_string(), value));
    }

    pub fn remove(&mut self, name: &str) {
        self.0.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    fn write_to(&self, out: &mut String) {
        for (k, v) in &self.0 {
            out.push_str(k);
            out.push_str(": ");
            out.push_str(v);
            out.push_str("\r\n");
        }
    }
}

/// 从 `<sip:user@host>` 形式的头部值中提取 user 部分
pub fn user_of(value: &str) -> Option<&str> {
    let start = value.find("sip:")? + 4;
    let rest = &value[start..];
    let end = rest
        .find(|c| c == '@' || c == '>' || c == ';' || c == ':')
        .unwrap_or(rest.len());
    Some(&rest[..end])
}

/// 提取头部值中的 tag 参数
pub fn tag_of(value: &str) -> Option<&str> {
    let idx = value.find("tag=")?;
    let rest = &value[idx + 4..];
    let end = rest.find([';', '>', ' ']).unwrap_or(rest.len());
    Some(&rest[..end])
}

/// SIP 请求
#[derive(Debug, Clone)]
pub struct SipRequest {
    pub method: SipMethod,
    pub uri: String,
    pub version: String,
    pub headers: Headers,
    pub body: Option<String>,
}

impl SipRequest {
    pub fn new(method: SipMethod, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            version: "SIP/2.0".to_string(),
            headers: Headers::default(),
            body: None,
        }
    }

    pub fn add_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.push(key, value);
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn set_body(&mut self, body: String) {
        self.body = Some(body);
    }

    pub fn call_id(&self) -> Option<&str> {
        self.headers.get("Call-ID")
    }

    /// CSeq 头部，返回 (序号, 方法)
    pub fn cseq(&self) -> Option<(u32, String)> {
        parse_cseq(self.headers.get("CSeq")?)
    }

    pub fn from_tag(&self) -> Option<&str> {
        self.headers.get("From").and_then(tag_of)
    }

    pub fn to_tag(&self) -> Option<&str> {
        self.headers.get("To").and_then(tag_of)
    }

    /// From 头部中的用户编码（下级设备的 DeviceID）
    pub fn from_user(&self) -> Option<&str> {
        self.headers.get("From").and_then(user_of)
    }

    /// 请求行 URI 中的用户编码
    pub fn uri_user(&self) -> Option<&str> {
        user_of(&self.uri)
    }

    pub fn expires(&self) -> Option<u32> {
        self.headers.get("Expires").and_then(|v| v.trim().parse().ok())
    }

    /// 将请求行 URI 的 host:port 改写为真实对端地址。
    /// 摄像机 Contact 常常填写内网地址，ACK/BYE 必须按实际套接字地址发送。
    pub fn rewrite_uri_host(&mut self, addr: SocketAddr) {
        if let Some(user) = user_of(&self.uri).map(|u| u.to_string()) {
            self.uri = format!("sip:{}@{}", user, addr);
        } else {
            self.uri = format!("sip:{}", addr);
        }
    }

    /// 以本请求为对话模板派生对话内请求：同 Call-ID/From/To，CSeq+1，新 branch。
    pub fn new_in_dialog_request(&self, method: SipMethod) -> SipRequest {
        let mut req = self.clone();
        req.method = method;
        req.body = None;
        req.headers.remove("Content-Type");
        req.headers.remove("Expires");
        req.headers.remove("Subject");
        let next = self.cseq().map(|(n, _)| n + 1).unwrap_or(1);
        req.headers.set("CSeq", format!("{} {}", next, method));
        if let Some(via) = self.headers.get("Via") {
            let base = via.split(';').next().unwrap_or(via).to_string();
            req.headers
                .set("Via", format!("{};branch={}", base, new_branch()));
        }
        req
    }

    pub fn from_string(s: &str) -> Result<Self> {
        let (start_line, headers, body) = split_message(s)?;

        let parts: Vec<&str> = start_line.split_whitespace().collect();
        if parts.len() != 3 {
            return Err(SipError::Parse(format!("invalid request line: {}", start_line)));
        }
        let method = SipMethod::parse(parts[0])
            .ok_or_else(|| SipError::Parse(format!("unknown method: {}", parts[0])))?;

        Ok(Self {
            method,
            uri: parts[1].to_string(),
            version: parts[2].to_string(),
            headers,
            body,
        })
    }
}

impl fmt::Display for SipRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = format!("{} {} {}\r\n", self.method, self.uri, self.version);
        self.headers.write_to(&mut out);
        write_body(&mut out, self.body.as_deref());
        f.write_str(&out)
    }
}

/// SIP 响应
#[derive(Debug, Clone)]
pub struct SipResponse {
    pub version: String,
    pub status_code: u16,
    pub reason_phrase: String,
    pub headers: Headers,
    pub body: Option<String>,
}

impl SipResponse {
    pub fn new(status_code: u16, reason_phrase: impl Into<String>) -> Self {
        Self {
            version: "SIP/2.0".to_string(),
            status_code,
            reason_phrase: reason_phrase.into(),
            headers: Headers::default(),
            body: None,
        }
    }

    /// 从请求构造响应，复制对话相关头部
    pub fn for_request(status_code: u16, reason: &str, req: &SipRequest) -> Self {
        let mut resp = Self::new(status_code, reason.to_string());
        for key in ["Via", "From", "To", "Call-ID", "CSeq"] {
            if let Some(value) = req.headers.get(key) {
                resp.headers.push(key, value.to_string());
            }
        }
        // UAS 的最终响应需要 To tag
        if status_code >= 200 {
            if let Some(to) = resp.headers.get("To") {
                if tag_of(to).is_none() {
                    let tagged = format!("{};tag={}", to, new_tag());
                    resp.headers.set("To", tagged);
                }
            }
        }
        resp
    }

    pub fn add_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.push(key, value);
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn set_body(&mut self, body: String) {
        self.body = Some(body);
    }

    pub fn call_id(&self) -> Option<&str> {
        self.headers.get("Call-ID")
    }

    pub fn cseq(&self) -> Option<(u32, String)> {
        parse_cseq(self.headers.get("CSeq")?)
    }

    pub fn to_tag(&self) -> Option<&str> {
        self.headers.get("To").and_then(tag_of)
    }

    /// Via 中的 received/rport（NAT 映射地址）
    pub fn nat_addr(&self) -> Option<String> {
        let via = self.headers.get("Via")?;
        let mut received = None;
        let mut rport = None;
        for param in via.split(';').skip(1) {
            let param = param.trim();
            if let Some(v) = param.strip_prefix("received=") {
                received = Some(v.to_string());
            } else if let Some(v) = param.strip_prefix("rport=") {
                rport = Some(v.to_string());
            }
        }
        match (received, rport) {
            (Some(ip), Some(port)) => Some(format!("{}:{}", ip, port)),
            _ => None,
        }
    }

    pub fn from_string(s: &str) -> Result<Self> {
        let (start_line, headers, body) = split_message(s)?;

        let parts: Vec<&str> = start_line.splitn(3, ' ').collect();
        if parts.len() != 3 {
            return Err(SipError::Parse(format!("invalid status line: {}", start_line)));
        }
        let status_code = parts[1]
            .parse::<u16>()
            .map_err(|_| SipError::Parse(format!("invalid status code: {}", parts[1])))?;

        Ok(Self {
            version: parts[0].to_string(),
            status_code,
            reason_phrase: parts[2].to_string(),
            headers,
            body,
        })
    }
}

impl fmt::Display for SipResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = format!(
            "{} {} {}\r\n",
            self.version, self.status_code, self.reason_phrase
        );
        self.headers.write_to(&mut out);
        write_body(&mut out, self.body.as_deref());
        f.write_str(&out)
    }
}

/// SIP 消息（请求或响应）
#[derive(Debug, Clone)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

impl SipMessage {
    pub fn from_string(s: &str) -> Result<Self> {
        if s.starts_with("SIP/") {
            Ok(SipMessage::Response(SipResponse::from_string(s)?))
        } else {
            Ok(SipMessage::Request(SipRequest::from_string(s)?))
        }
    }
}

fn parse_cseq(value: &str) -> Option<(u32, String)> {
    let mut parts = value.split_whitespace();
    let num = parts.next()?.parse().ok()?;
    let method = parts.next()?.to_string();
    Some((num, method))
}

fn write_body(out: &mut String, body: Option<&str>) {
    match body {
        Some(body) => {
            out.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));
            out.push_str(body);
        }
        None => out.push_str("Content-Length: 0\r\n\r\n"),
    }
}

fn split_message(s: &str) -> Result<(String, Headers, Option<String>)> {
    let lines: Vec<&str> = s.split("\r\n").collect();
    if lines.is_empty() || lines[0].is_empty() {
        return Err(SipError::Parse("empty SIP message".to_string()));
    }

    let mut headers = Headers::default();
    let mut body_start = lines.len();
    for (i, line) in lines.iter().enumerate().skip(1) {
        if line.is_empty() {
            body_start = i + 1;
            break;
        }
        if let Some(pos) = line.find(':') {
            headers.push(line[..pos].trim().to_string(), line[pos + 1..].trim().to_string());
        }
    }

    let body = if body_start < lines.len() {
        let body_str = lines[body_start..].join("\r\n");
        if body_str.is_empty() {
            None
        } else {
            Some(body_str)
        }
    } else {
        None
    };

    Ok((lines[0].to_string(), headers, body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_roundtrip() {
        let raw = "REGISTER sip:34020000002000000001@3402000000 SIP/2.0\r\n\
                   Via: SIP/2.0/UDP 10.0.0.5:5060;branch=z9hG4bK1234\r\n\
                   From: <sip:34020000001320000001@3402000000>;tag=abc\r\n\
                   To: <sip:34020000001320000001@3402000000>\r\n\
                   Call-ID: 98765@10.0.0.5\r\n\
                   CSeq: 1 REGISTER\r\n\
                   Expires: 3600\r\n\
                   Content-Length: 0\r\n\
                   \r\n";

        let req = SipRequest::from_string(raw).unwrap();
        assert_eq!(req.method, SipMethod::Register);
        assert_eq!(req.from_user(), Some("34020000001320000001"));
        assert_eq!(req.from_tag(), Some("abc"));
        assert_eq!(req.expires(), Some(3600));
        assert_eq!(req.cseq(), Some((1, "REGISTER".to_string())));

        let out = req.to_string();
        assert!(out.contains("REGISTER sip:"));
        assert!(out.contains("Content-Length: 0"));
    }

    #[test]
    fn test_request_with_body() {
        let mut req = SipRequest::new(SipMethod::Message, "sip:34020000001320000001@10.0.0.5:5060");
        req.add_header("Call-ID", "1@test");
        req.set_body("<Query></Query>".to_string());
        let out = req.to_string();
        assert!(out.contains("Content-Length: 15"));
        assert!(out.ends_with("<Query></Query>"));

        let parsed = SipRequest::from_string(&out).unwrap();
        assert_eq!(parsed.body.as_deref(), Some("<Query></Query>"));
    }

    #[test]
    fn test_response_for_request_adds_to_tag() {
        let mut req = SipRequest::new(SipMethod::Invite, "sip:x@y");
        req.add_header("Via", "SIP/2.0/UDP 1.2.3.4:5060;branch=z9hG4bKabc");
        req.add_header("From", "<sip:a@dom>;tag=f1");
        req.add_header("To", "<sip:b@dom>");
        req.add_header("Call-ID", "c1");
        req.add_header("CSeq", "20 INVITE");

        let resp = SipResponse::for_request(200, "OK", &req);
        assert!(resp.to_tag().is_some());
        assert_eq!(resp.call_id(), Some("c1"));

        let trying = SipResponse::for_request(100, "Trying", &req);
        assert!(trying.to_tag().is_none());
    }

    #[test]
    fn test_nat_addr_from_via() {
        let raw = "SIP/2.0 200 OK\r\n\
                   Via: SIP/2.0/UDP 192.168.1.2:5060;rport=13000;received=203.0.113.7;branch=z9hG4bK1\r\n\
                   Call-ID: c1\r\n\
                   CSeq: 1 REGISTER\r\n\
                   Content-Length: 0\r\n\
                   \r\n";
        let resp = SipResponse::from_string(raw).unwrap();
        assert_eq!(resp.nat_addr(), Some("203.0.113.7:13000".to_string()));
    }

    #[test]
    fn test_in_dialog_request() {
        let raw = "INVITE sip:34020000001320000001@10.0.0.5:5060 SIP/2.0\r\n\
                   Via: SIP/2.0/UDP 1.2.3.4:5060;branch=z9hG4bKold\r\n\
                   From: <sip:34020000002000000001@3402000000>;tag=f1\r\n\
                   To: <sip:34020000001320000001@3402000000>;tag=t1\r\n\
                   Call-ID: call-9\r\n\
                   CSeq: 20 INVITE\r\n\
                   Content-Type: application/sdp\r\n\
                   Content-Length: 0\r\n\
                   \r\n";
        let invite = SipRequest::from_string(raw).unwrap();
        let bye = invite.new_in_dialog_request(SipMethod::Bye);

        assert_eq!(bye.method, SipMethod::Bye);
        assert_eq!(bye.call_id(), Some("call-9"));
        assert_eq!(bye.cseq(), Some((21, "BYE".to_string())));
        assert!(bye.header("Content-Type").is_none());
        let via = bye.header("Via").unwrap();
        assert!(via.contains("branch=z9hG4bK"));
        assert!(!via.contains("z9hG4bKold"));
    }

    #[test]
    fn test_rewrite_uri_host() {
        let mut req = SipRequest::new(SipMethod::Ack, "sip:34020000001320000001@192.168.1.64:5060");
        req.rewrite_uri_host("10.0.0.5:5062".parse().unwrap());
        assert_eq!(req.uri, "sip:34020000001320000001@10.0.0.5:5062");
    }

    #[test]
    fn test_user_and_tag_helpers() {
        assert_eq!(user_of("<sip:34020000001320000001@3402000000>"), Some("34020000001320000001"));
        assert_eq!(user_of("sip:abc@host:5060"), Some("abc"));
        assert_eq!(tag_of("<sip:a@b>;tag=xyz;other=1"), Some("xyz"));
        assert_eq!(tag_of("<sip:a@b>"), None);
    }
}
