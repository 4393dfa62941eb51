// GB28181 MANSCDP XML 编解码
// 入站消息兼容 GB2312/UTF-8 两种编码；出站统一 GB2312 声明（内容为 ASCII 子集）

use crate::error::{Result, SipError};
use quick_xml::de::from_str;
use serde::Deserialize;

/// MANSCDP 根节点类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManscdpRoot {
    Query,
    Notify,
    Response,
    Control,
}

impl ManscdpRoot {
    fn detect(xml: &str) -> Option<Self> {
        // 跳过 XML 声明后看根元素名
        let rest = match xml.find("?>") {
            Some(idx) => &xml[idx + 2..],
            None => xml,
        };
        let rest = rest.trim_start();
        if rest.starts_with("<Query") {
            Some(ManscdpRoot::Query)
        } else if rest.starts_with("<Notify") {
            Some(ManscdpRoot::Notify)
        } else if rest.starts_with("<Response") {
            Some(ManscdpRoot::Response)
        } else if rest.starts_with("<Control") {
            Some(ManscdpRoot::Control)
        } else {
            None
        }
    }
}

/// MANSCDP 消息体。不同 CmdType 只填充各自的字段，缺省留空。
#[derive(Debug, Default, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "PascalCase", default)]
pub struct Manscdp {
    pub cmd_type: String,

    #[serde(rename = "SN")]
    pub sn: Option<u32>,

    #[serde(rename = "DeviceID")]
    pub device_id: String,

    pub sum_num: Option<u32>,

    pub device_list: Option<DeviceList>,

    pub record_list: Option<RecordList>,

    /// DeviceInfo 响应
    pub device_name: String,
    pub manufacturer: String,
    pub model: String,
    pub firmware: String,

    /// DeviceInfo/DeviceStatus/Control 结果
    pub result: String,

    /// DeviceStatus
    pub online: String,
    pub status: String,

    /// Notify/Broadcast
    #[serde(rename = "SourceID")]
    pub source_id: String,
    #[serde(rename = "TargetID")]
    pub target_id: String,

    /// MobilePosition
    pub time: String,
    pub longitude: Option<f64>,
    pub latitude: Option<f64>,
    pub speed: Option<f64>,
    pub direction: Option<f64>,
    pub altitude: Option<f64>,
    pub interval: Option<u32>,

    /// Notify/MediaStatus，121 为录像回放结束
    pub notify_type: Option<u32>,

    /// Control/DeviceControl 转发
    #[serde(rename = "PTZCmd")]
    pub ptz_cmd: Option<String>,

    /// Notify/Alarm
    pub alarm_priority: String,
    pub alarm_method: String,
    pub alarm_time: String,
    pub alarm_description: String,
}

/// 目录/录像响应中的设备列表
#[derive(Debug, Default, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceList {
    #[serde(rename = "@Num", default)]
    pub num: Option<u32>,

    #[serde(rename = "Item", default)]
    pub items: Vec<DeviceItem>,
}

/// 目录项（通道）
#[derive(Debug, Default, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "PascalCase", default)]
pub struct DeviceItem {
    #[serde(rename = "DeviceID")]
    pub device_id: String,
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub owner: String,
    pub civil_code: String,
    pub address: String,
    pub parental: Option<u8>,
    #[serde(rename = "ParentID")]
    pub parent_id: String,
    #[serde(rename = "BusinessGroupID")]
    pub business_group_id: String,
    pub register_way: Option<u8>,
    pub secrecy: Option<u8>,
    pub status: String,
    pub longitude: Option<f64>,
    pub latitude: Option<f64>,
}

/// 录像记录列表
#[derive(Debug, Default, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct RecordList {
    #[serde(rename = "@Num", default)]
    pub num: Option<u32>,

    #[serde(rename = "Item", default)]
    pub items: Vec<RecordItem>,
}

/// 录像记录
#[derive(Debug, Default, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "PascalCase", default)]
pub struct RecordItem {
    #[serde(rename = "DeviceID")]
    pub device_id: String,
    pub name: String,
    pub start_time: String,
    pub end_time: String,
    pub file_path: String,
    pub address: String,
    pub secrecy: Option<u8>,
    #[serde(rename = "Type")]
    pub record_type: String,
    pub file_size: Option<u64>,
}

/// 解析 MANSCDP XML。先按 UTF-8 解析，失败则按 GB2312/GB18030 转码后重试。
pub fn parse_manscdp(raw: &[u8]) -> Result<(ManscdpRoot, Manscdp)> {
    let text = match std::str::from_utf8(raw) {
        Ok(s) => s.to_string(),
        Err(_) => decode_gb2312(raw)?,
    };

    match parse_manscdp_str(&text) {
        Ok(parsed) => Ok(parsed),
        Err(first_err) => {
            // UTF-8 合法但内容实为 GB2312 的情况（ASCII 头 + 中文正文）
            let transcoded = decode_gb2312(raw)?;
            parse_manscdp_str(&transcoded).map_err(|_| first_err)
        }
    }
}

fn parse_manscdp_str(text: &str) -> Result<(ManscdpRoot, Manscdp)> {
    let root = ManscdpRoot::detect(text)
        .ok_or_else(|| SipError::Parse("unknown MANSCDP root element".to_string()))?;
    let body: Manscdp =
        from_str(text.trim()).map_err(|e| SipError::Parse(format!("MANSCDP parse: {}", e)))?;
    Ok((root, body))
}

fn decode_gb2312(raw: &[u8]) -> Result<String> {
    // GB18030 是 GB2312 的超集
    let (text, _, had_errors) = encoding_rs::GB18030.decode(raw);
    if had_errors {
        return Err(SipError::Encoding("GB2312 decode failed".to_string()));
    }
    // 声明里的 encoding="GB2312" 会让部分 XML 库拒绝已转码的文本，去掉声明
    let text = text.into_owned();
    let stripped = match text.find("?>") {
        Some(idx) => text[idx + 2..].trim_start().to_string(),
        None => text,
    };
    Ok(stripped)
}

const XML_HEADER: &str = "<?xml version=\"1.0\" encoding=\"GB2312\"?>\r\n";

/// Query/Catalog
pub fn query_catalog(sn: u32, device_id: &str) -> String {
    format!(
        "{XML_HEADER}<Query>\r\n<CmdType>Catalog</CmdType>\r\n<SN>{sn}</SN>\r\n<DeviceID>{device_id}</DeviceID>\r\n</Query>\r\n"
    )
}

/// Query/DeviceInfo
pub fn query_device_info(sn: u32, device_id: &str) -> String {
    format!(
        "{XML_HEADER}<Query>\r\n<CmdType>DeviceInfo</CmdType>\r\n<SN>{sn}</SN>\r\n<DeviceID>{device_id}</DeviceID>\r\n</Query>\r\n"
    )
}

/// Query/DeviceStatus
pub fn query_device_status(sn: u32, device_id: &str) -> String {
    format!(
        "{XML_HEADER}<Query>\r\n<CmdType>DeviceStatus</CmdType>\r\n<SN>{sn}</SN>\r\n<DeviceID>{device_id}</DeviceID>\r\n</Query>\r\n"
    )
}

/// Query/RecordInfo
pub fn query_record_info(
    sn: u32,
    device_id: &str,
    start_time: &str,
    end_time: &str,
    record_type: &str,
) -> String {
    format!(
        "{XML_HEADER}<Query>\r\n<CmdType>RecordInfo</CmdType>\r\n<SN>{sn}</SN>\r\n<DeviceID>{device_id}</DeviceID>\r\n<StartTime>{start_time}</StartTime>\r\n<EndTime>{end_time}</EndTime>\r\n<Type>{record_type}</Type>\r\n</Query>\r\n"
    )
}

/// Query/MobilePosition
pub fn query_mobile_position(sn: u32, device_id: &str, interval: u32) -> String {
    format!(
        "{XML_HEADER}<Query>\r\n<CmdType>MobilePosition</CmdType>\r\n<SN>{sn}</SN>\r\n<DeviceID>{device_id}</DeviceID>\r\n<Interval>{interval}</Interval>\r\n</Query>\r\n"
    )
}

/// Query/Alarm
pub fn query_alarm(sn: u32, device_id: &str, start_time: &str, end_time: &str) -> String {
    format!(
        "{XML_HEADER}<Query>\r\n<CmdType>Alarm</CmdType>\r\n<SN>{sn}</SN>\r\n<DeviceID>{device_id}</DeviceID>\r\n<StartAlarmPriority>1</StartAlarmPriority>\r\n<EndAlarmPriority>4</EndAlarmPriority>\r\n<AlarmMethod>0</AlarmMethod>\r\n<StartTime>{start_time}</StartTime>\r\n<EndTime>{end_time}</EndTime>\r\n</Query>\r\n"
    )
}

/// Control/DeviceControl（云台）
pub fn control_ptz(sn: u32, device_id: &str, ptz_cmd_hex: &str) -> String {
    format!(
        "{XML_HEADER}<Control>\r\n<CmdType>DeviceControl</CmdType>\r\n<SN>{sn}</SN>\r\n<DeviceID>{device_id}</DeviceID>\r\n<PTZCmd>{ptz_cmd_hex}</PTZCmd>\r\n</Control>\r\n"
    )
}

/// Notify/Keepalive（级联上报）
pub fn notify_keepalive(sn: u32, device_id: &str) -> String {
    format!(
        "{XML_HEADER}<Notify>\r\n<CmdType>Keepalive</CmdType>\r\n<SN>{sn}</SN>\r\n<DeviceID>{device_id}</DeviceID>\r\n<Status>OK</Status>\r\n</Notify>\r\n"
    )
}

/// Notify/Broadcast（语音广播发起）
pub fn notify_broadcast(sn: u32, source_id: &str, target_id: &str) -> String {
    format!(
        "{XML_HEADER}<Notify>\r\n<CmdType>Broadcast</CmdType>\r\n<SN>{sn}</SN>\r\n<SourceID>{source_id}</SourceID>\r\n<TargetID>{target_id}</TargetID>\r\n</Notify>\r\n"
    )
}

/// Response/Alarm 确认
pub fn response_alarm_ack(sn: u32, device_id: &str) -> String {
    format!(
        "{XML_HEADER}<Response>\r\n<CmdType>Alarm</CmdType>\r\n<SN>{sn}</SN>\r\n<DeviceID>{device_id}</DeviceID>\r\n<Result>OK</Result>\r\n</Response>\r\n"
    )
}

/// Response/DeviceInfo（应答上级）
pub fn response_device_info(
    sn: u32,
    device_id: &str,
    device_name: &str,
    manufacturer: &str,
    model: &str,
    firmware: &str,
) -> String {
    format!(
        "{XML_HEADER}<Response>\r\n<CmdType>DeviceInfo</CmdType>\r\n<SN>{sn}</SN>\r\n<DeviceID>{device_id}</DeviceID>\r\n<Result>OK</Result>\r\n<DeviceName>{device_name}</DeviceName>\r\n<Manufacturer>{manufacturer}</Manufacturer>\r\n<Model>{model}</Model>\r\n<Firmware>{firmware}</Firmware>\r\n</Response>\r\n"
    )
}

/// Response/DeviceStatus（应答上级）
pub fn response_device_status(sn: u32, device_id: &str, online: bool) -> String {
    let online = if online { "ONLINE" } else { "OFFLINE" };
    format!(
        "{XML_HEADER}<Response>\r\n<CmdType>DeviceStatus</CmdType>\r\n<SN>{sn}</SN>\r\n<DeviceID>{device_id}</DeviceID>\r\n<Result>OK</Result>\r\n<Online>{online}</Online>\r\n<Status>OK</Status>\r\n</Response>\r\n"
    )
}

/// 目录项的 XML 片段（应答上级 Query/Catalog）
#[derive(Debug, Clone, Default)]
pub struct CatalogItem {
    pub device_id: String,
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub civil_code: String,
    pub parent_id: String,
    pub status: String,
    pub parental: u8,
}

impl CatalogItem {
    pub fn to_xml(&self) -> String {
        format!(
            "<Item>\r\n<DeviceID>{}</DeviceID>\r\n<Name>{}</Name>\r\n<Manufacturer>{}</Manufacturer>\r\n<Model>{}</Model>\r\n<CivilCode>{}</CivilCode>\r\n<ParentID>{}</ParentID>\r\n<Parental>{}</Parental>\r\n<RegisterWay>1</RegisterWay>\r\n<Secrecy>0</Secrecy>\r\n<Status>{}</Status>\r\n</Item>\r\n",
            self.device_id,
            self.name,
            self.manufacturer,
            self.model,
            self.civil_code,
            self.parent_id,
            self.parental,
            self.status
        )
    }
}

/// Response/Catalog 单帧（每帧 Num=1，SumNum 为总数）
pub fn response_catalog_part(sn: u32, device_id: &str, sum_num: u32, item: &CatalogItem) -> String {
    format!(
        "{XML_HEADER}<Response>\r\n<CmdType>Catalog</CmdType>\r\n<SN>{sn}</SN>\r\n<DeviceID>{device_id}</DeviceID>\r\n<SumNum>{sum_num}</SumNum>\r\n<DeviceList Num=\"1\">\r\n{}</DeviceList>\r\n</Response>\r\n",
        item.to_xml()
    )
}

/// Notify/Catalog 单帧（订阅推送，每帧一条）
pub fn notify_catalog_part(sn: u32, device_id: &str, sum_num: u32, item: &CatalogItem) -> String {
    format!(
        "{XML_HEADER}<Notify>\r\n<CmdType>Catalog</CmdType>\r\n<SN>{sn}</SN>\r\n<DeviceID>{device_id}</DeviceID>\r\n<SumNum>{sum_num}</SumNum>\r\n<DeviceList Num=\"1\">\r\n{}</DeviceList>\r\n</Notify>\r\n",
        item.to_xml()
    )
}

/// 云台命令
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtzCommand {
    Stop,
    Right,
    Left,
    Down,
    Up,
    ZoomIn,
    ZoomOut,
}

/// 生成 8 字节云台指令的十六进制串。
/// 帧格式 A5 0F 01 CMD HSPD VSPD ZSPD CHK，CHK 为前 7 字节求和取模 256。
pub fn ptz_cmd(cmd: PtzCommand, speed: u8) -> String {
    let (cmd_byte, hspd, vspd, zspd) = match cmd {
        PtzCommand::Stop => (0x00u8, 0u8, 0u8, 0u8),
        PtzCommand::Right => (0x01, speed, 0, 0),
        PtzCommand::Left => (0x02, speed, 0, 0),
        PtzCommand::Down => (0x04, 0, speed, 0),
        PtzCommand::Up => (0x08, 0, speed, 0),
        PtzCommand::ZoomIn => (0x10, 0, 0, speed),
        PtzCommand::ZoomOut => (0x20, 0, 0, speed),
    };
    let bytes = [0xA5u8, 0x0F, 0x01, cmd_byte, hspd, vspd, zspd];
    let chk = bytes.iter().fold(0u32, |acc, b| acc + *b as u32) % 256;
    let mut out = String::with_capacity(16);
    for b in bytes {
        out.push_str(&format!("{:02X}", b));
    }
    out.push_str(&format!("{:02X}", chk));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_catalog_response() {
        let xml = br#"<?xml version="1.0" encoding="GB2312"?>
<Response>
<CmdType>Catalog</CmdType>
<SN>1</SN>
<DeviceID>34020000001110000001</DeviceID>
<SumNum>3</SumNum>
<DeviceList Num="2">
<Item>
<DeviceID>34020000001320000001</DeviceID>
<Name>Camera-1</Name>
<Manufacturer>HIK</Manufacturer>
<Model>DS-2CD3T46WD</Model>
<ParentID>34020000002150000001</ParentID>
<Status>ON</Status>
</Item>
<Item>
<DeviceID>34020000002150000001</DeviceID>
<Name>Group</Name>
<Parental>1</Parental>
<Status>ON</Status>
</Item>
</DeviceList>
</Response>"#;

        let (root, msg) = parse_manscdp(xml).unwrap();
        assert_eq!(root, ManscdpRoot::Response);
        assert_eq!(msg.cmd_type, "Catalog");
        assert_eq!(msg.sn, Some(1));
        assert_eq!(msg.sum_num, Some(3));
        let list = msg.device_list.unwrap();
        assert_eq!(list.num, Some(2));
        assert_eq!(list.items.len(), 2);
        assert_eq!(list.items[0].device_id, "34020000001320000001");
        assert_eq!(list.items[0].parent_id, "34020000002150000001");
        assert_eq!(list.items[1].parental, Some(1));
    }

    #[test]
    fn test_parse_keepalive_notify() {
        let xml = br#"<?xml version="1.0"?>
<Notify>
<CmdType>Keepalive</CmdType>
<SN>22</SN>
<DeviceID>34020000001320000001</DeviceID>
<Status>OK</Status>
</Notify>"#;
        let (root, msg) = parse_manscdp(xml).unwrap();
        assert_eq!(root, ManscdpRoot::Notify);
        assert_eq!(msg.cmd_type, "Keepalive");
        assert_eq!(msg.status, "OK");
    }

    #[test]
    fn test_parse_gb2312_encoded() {
        // 「摄像头」的 GB2312 字节
        let mut raw: Vec<u8> = Vec::new();
        raw.extend_from_slice(b"<?xml version=\"1.0\" encoding=\"GB2312\"?>\r\n<Response>\r\n<CmdType>Catalog</CmdType>\r\n<SN>5</SN>\r\n<DeviceID>34020000001110000001</DeviceID>\r\n<SumNum>1</SumNum>\r\n<DeviceList Num=\"1\">\r\n<Item>\r\n<DeviceID>34020000001320000001</DeviceID>\r\n<Name>");
        raw.extend_from_slice(&[0xC9, 0xE3, 0xCF, 0xF1, 0xCD, 0xB7]);
        raw.extend_from_slice(b"</Name>\r\n<Status>ON</Status>\r\n</Item>\r\n</DeviceList>\r\n</Response>");

        let (_, msg) = parse_manscdp(&raw).unwrap();
        let list = msg.device_list.unwrap();
        assert_eq!(list.items[0].name, "摄像头");
    }

    #[test]
    fn test_parse_mobile_position() {
        let xml = br#"<?xml version="1.0"?>
<Notify>
<CmdType>MobilePosition</CmdType>
<SN>9</SN>
<DeviceID>34020000001320000001</DeviceID>
<Time>2024-06-18T15:20:56</Time>
<Longitude>116.397</Longitude>
<Latitude>39.908</Latitude>
<Speed>12.5</Speed>
</Notify>"#;
        let (_, msg) = parse_manscdp(xml).unwrap();
        assert_eq!(msg.cmd_type, "MobilePosition");
        assert_eq!(msg.longitude, Some(116.397));
        assert_eq!(msg.speed, Some(12.5));
    }

    #[test]
    fn test_parse_record_info() {
        let xml = br#"<?xml version="1.0"?>
<Response>
<CmdType>RecordInfo</CmdType>
<SN>77</SN>
<DeviceID>34020000001320000001</DeviceID>
<SumNum>1</SumNum>
<RecordList Num="1">
<Item>
<DeviceID>34020000001320000001</DeviceID>
<Name>record-1</Name>
<StartTime>2024-06-18T15:20:56</StartTime>
<EndTime>2024-06-18T15:25:56</EndTime>
<Type>time</Type>
</Item>
</RecordList>
</Response>"#;
        let (_, msg) = parse_manscdp(xml).unwrap();
        let list = msg.record_list.unwrap();
        assert_eq!(list.items.len(), 1);
        assert_eq!(list.items[0].start_time, "2024-06-18T15:20:56");
    }

    #[test]
    fn test_query_builders() {
        let q = query_catalog(1, "34020000001110000001");
        assert!(q.contains("<CmdType>Catalog</CmdType>"));
        assert!(q.contains("<SN>1</SN>"));

        let r = query_record_info(2, "34020000001320000001", "2024-06-18T15:20:56", "2024-06-18T15:25:56", "all");
        assert!(r.contains("<StartTime>2024-06-18T15:20:56</StartTime>"));
        assert!(r.contains("<Type>all</Type>"));

        let a = query_alarm(3, "34020000001110000001", "", "");
        assert!(a.contains("<StartAlarmPriority>1</StartAlarmPriority>"));
        assert!(a.contains("<AlarmMethod>0</AlarmMethod>"));
    }

    #[test]
    fn test_ptz_cmd_left() {
        // A5+0F+01+02+81 = 0x138 → 校验和 0x38
        assert_eq!(ptz_cmd(PtzCommand::Left, 0x81), "A50F010281000038");
    }

    #[test]
    fn test_ptz_cmd_zoom_and_stop() {
        assert_eq!(ptz_cmd(PtzCommand::Stop, 0), "A50F0100000000B5");
        let up = ptz_cmd(PtzCommand::Up, 0x40);
        assert_eq!(&up[6..8], "08");
        assert_eq!(&up[10..12], "40");
        // 校验和可复算
        let bytes: Vec<u8> = (0..7)
            .map(|i| u8::from_str_radix(&up[i * 2..i * 2 + 2], 16).unwrap())
            .collect();
        let chk = bytes.iter().fold(0u32, |a, b| a + *b as u32) % 256;
        assert_eq!(format!("{:02X}", chk), &up[14..16]);
    }

    #[test]
    fn test_catalog_part_response() {
        let item = CatalogItem {
            device_id: "34020000001320000001".to_string(),
            name: "cam".to_string(),
            status: "ON".to_string(),
            ..Default::default()
        };
        let xml = response_catalog_part(8, "34020000002000000001", 12, &item);
        assert!(xml.contains("<SumNum>12</SumNum>"));
        assert!(xml.contains("DeviceList Num=\"1\""));

        let (root, parsed) = parse_manscdp(xml.as_bytes()).unwrap();
        assert_eq!(root, ManscdpRoot::Response);
        assert_eq!(parsed.device_list.unwrap().items.len(), 1);
    }
}
