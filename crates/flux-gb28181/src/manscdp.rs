// MANSCDP XML：解析设备上报 / 应答，构造查询、控制和通知
// 以及回放控制使用的 MANSRTSP 消息体

use crate::registry::{AlarmFact, CatalogEntry, CatalogEvent, Channel, ChannelKind, OnlineStatus, Position};
use crate::{Gb28181Error, Result};
use chrono::{Local, TimeZone, Utc};
use quick_xml::de::from_str;
use serde::{Deserialize, Serialize};

pub const CONTENT_TYPE: &str = "Application/MANSCDP+xml";
pub const RTSP_CONTENT_TYPE: &str = "Application/MANSRTSP";

/// 报文根节点
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootKind {
    Query,
    Response,
    Notify,
    Control,
}

/// 读取根元素名称
pub fn root_kind(xml: &str) -> Option<RootKind> {
    let mut rest = xml;
    loop {
        let start = rest.find('<')?;
        rest = &rest[start + 1..];
        if rest.starts_with('?') || rest.starts_with('!') {
            continue;
        }
        let name: String = rest
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric())
            .collect();
        return match name.as_str() {
            "Query" => Some(RootKind::Query),
            "Response" => Some(RootKind::Response),
            "Notify" => Some(RootKind::Notify),
            "Control" => Some(RootKind::Control),
            _ => None,
        };
    }
}

/// MANSCDP 报文
///
/// 根元素不参与反序列化，各命令的字段都放在同一结构中，缺省为空。
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase", default)]
pub struct ManscdpMessage {
    pub cmd_type: String,
    #[serde(rename = "SN")]
    pub sn: Option<u32>,
    #[serde(rename = "DeviceID")]
    pub device_id: String,

    // Catalog / RecordInfo
    pub sum_num: Option<u32>,
    pub device_list: Option<DeviceList>,
    pub record_list: Option<RecordList>,
    pub name: String,

    // DeviceInfo
    pub device_name: String,
    pub manufacturer: String,
    pub model: String,
    pub firmware: String,
    pub result: String,

    // DeviceStatus
    pub online: String,
    pub status: String,
    pub encode: String,
    pub record: String,

    // MobilePosition
    pub time: String,
    pub longitude: String,
    pub latitude: String,
    pub speed: String,
    pub direction: String,
    pub altitude: String,

    // Alarm
    pub alarm_priority: String,
    pub alarm_method: String,
    pub alarm_time: String,
    pub alarm_description: String,
    pub info: Option<AlarmInfo>,

    // MediaStatus
    pub notify_type: String,

    // Broadcast
    #[serde(rename = "SourceID")]
    pub source_id: String,
    #[serde(rename = "TargetID")]
    pub target_id: String,

    // RecordInfo 查询（上级下发）
    pub start_time: String,
    pub end_time: String,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase", default)]
pub struct AlarmInfo {
    pub alarm_type: String,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct DeviceList {
    #[serde(rename = "@Num", default)]
    pub num: Option<u32>,
    #[serde(rename = "Item", default)]
    pub items: Vec<DeviceItem>,
}

/// 目录项
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
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
    pub parental: String,
    #[serde(rename = "ParentID")]
    pub parent_id: String,
    #[serde(rename = "BusinessGroupID")]
    pub business_group_id: String,
    pub status: String,
    pub longitude: String,
    pub latitude: String,
    pub event: String,
    pub info: Option<ItemInfo>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase", default)]
pub struct ItemInfo {
    #[serde(rename = "PTZType")]
    pub ptz_type: String,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct RecordList {
    #[serde(rename = "@Num", default)]
    pub num: Option<u32>,
    #[serde(rename = "Item", default)]
    pub items: Vec<RecordItem>,
}

/// 录像文件
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "PascalCase", default)]
pub struct RecordItem {
    #[serde(rename = "DeviceID")]
    pub device_id: String,
    pub name: String,
    pub file_path: String,
    pub address: String,
    pub start_time: String,
    pub end_time: String,
    pub secrecy: String,
    #[serde(rename = "Type")]
    pub record_type: String,
    #[serde(rename = "RecorderID")]
    pub recorder_id: String,
    pub file_size: String,
}

fn opt_f64(s: &str) -> Option<f64> {
    s.trim().parse().ok()
}

/// 解析 MANSCDP 报文
pub fn parse(xml: &str) -> Result<ManscdpMessage> {
    let msg: ManscdpMessage = from_str(xml.trim())
        .map_err(|e| Gb28181Error::Parse(format!("Failed to parse MANSCDP XML: {}", e)))?;
    if msg.cmd_type.is_empty() {
        return Err(Gb28181Error::Parse("MANSCDP without CmdType".to_string()));
    }
    Ok(msg)
}

impl DeviceItem {
    /// 转换为目录合并项；缺省状态视为在线
    pub fn to_entry(&self, device_id: &str) -> CatalogEntry {
        let parental = self.parental.trim() == "1";
        let mut channel = Channel::new(device_id, self.device_id.trim());
        channel.kind = ChannelKind::classify(&channel.channel_id, parental);
        channel.name = self.name.clone();
        channel.manufacturer = self.manufacturer.clone();
        channel.model = self.model.clone();
        channel.owner = self.owner.clone();
        channel.civil_code = self.civil_code.clone();
        channel.address = self.address.clone();
        channel.parent_id = self.parent_id.clone();
        channel.business_group_id = self.business_group_id.clone();
        channel.parental = parental;
        channel.status = OnlineStatus::parse(&self.status).unwrap_or(OnlineStatus::On);
        channel.longitude = opt_f64(&self.longitude);
        channel.latitude = opt_f64(&self.latitude);
        channel.ptz_type = self
            .info
            .as_ref()
            .and_then(|i| i.ptz_type.trim().parse().ok());
        CatalogEntry {
            channel,
            event: CatalogEvent::parse(&self.event),
        }
    }
}

impl ManscdpMessage {
    pub fn catalog_entries(&self) -> Vec<CatalogEntry> {
        let device_id = self.device_id.as_str();
        self.device_list
            .as_ref()
            .map(|l| l.items.iter().map(|i| i.to_entry(device_id)).collect())
            .unwrap_or_default()
    }

    pub fn records(&self) -> Vec<RecordItem> {
        self.record_list
            .as_ref()
            .map(|l| l.items.clone())
            .unwrap_or_default()
    }

    /// MobilePosition；经纬度缺失时返回 None
    pub fn position(&self) -> Option<Position> {
        Some(Position {
            channel_id: self.device_id.clone(),
            longitude: opt_f64(&self.longitude)?,
            latitude: opt_f64(&self.latitude)?,
            speed: opt_f64(&self.speed),
            direction: opt_f64(&self.direction),
            altitude: opt_f64(&self.altitude),
            time: self.time.clone(),
            received_at: Utc::now(),
        })
    }

    pub fn alarm(&self) -> AlarmFact {
        AlarmFact {
            channel_id: self.device_id.clone(),
            priority: self.alarm_priority.clone(),
            method: self.alarm_method.clone(),
            alarm_type: self
                .info
                .as_ref()
                .map(|i| i.alarm_type.clone())
                .filter(|t| !t.is_empty()),
            description: self.alarm_description.clone(),
            time: self.alarm_time.clone(),
            longitude: opt_f64(&self.longitude),
            latitude: opt_f64(&self.latitude),
            received_at: Utc::now(),
        }
    }
}

/// GB28181 时间格式（本地时间）
pub fn format_time(unix_secs: i64) -> String {
    Local
        .timestamp_opt(unix_secs, 0)
        .single()
        .map(|t| t.format("%Y-%m-%dT%H:%M:%S").to_string())
        .unwrap_or_default()
}

fn xml(root: &str, body: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"GB2312\"?>\r\n<{root}>\r\n{body}</{root}>\r\n",
        root = root,
        body = body
    )
}

fn simple(root: &str, cmd: &str, sn: u32, device_id: &str) -> String {
    xml(
        root,
        &format!(
            "<CmdType>{}</CmdType>\r\n<SN>{}</SN>\r\n<DeviceID>{}</DeviceID>\r\n",
            cmd, sn, device_id
        ),
    )
}

pub fn catalog_query(sn: u32, device_id: &str) -> String {
    simple("Query", "Catalog", sn, device_id)
}

pub fn device_info_query(sn: u32, device_id: &str) -> String {
    simple("Query", "DeviceInfo", sn, device_id)
}

pub fn device_status_query(sn: u32, device_id: &str) -> String {
    simple("Query", "DeviceStatus", sn, device_id)
}

pub fn keepalive_notify(sn: u32, device_id: &str) -> String {
    xml(
        "Notify",
        &format!(
            "<CmdType>Keepalive</CmdType>\r\n<SN>{}</SN>\r\n<DeviceID>{}</DeviceID>\r\n<Status>OK</Status>\r\n",
            sn, device_id
        ),
    )
}

/// 录像检索，时间为 unix 秒
pub fn record_info_query(sn: u32, channel_id: &str, start: i64, end: i64) -> String {
    xml(
        "Query",
        &format!(
            "<CmdType>RecordInfo</CmdType>\r\n<SN>{}</SN>\r\n<DeviceID>{}</DeviceID>\r\n<StartTime>{}</StartTime>\r\n<EndTime>{}</EndTime>\r\n<Secrecy>0</Secrecy>\r\n<Type>all</Type>\r\n",
            sn,
            channel_id,
            format_time(start),
            format_time(end)
        ),
    )
}

/// 订阅消息体：Catalog / Alarm / MobilePosition / PTZPosition
pub fn subscribe_query(cmd: &str, sn: u32, device_id: &str, interval: Option<u32>) -> String {
    let mut body = format!(
        "<CmdType>{}</CmdType>\r\n<SN>{}</SN>\r\n<DeviceID>{}</DeviceID>\r\n",
        cmd, sn, device_id
    );
    if cmd == "Alarm" {
        body.push_str("<StartAlarmPriority>1</StartAlarmPriority>\r\n<EndAlarmPriority>4</EndAlarmPriority>\r\n<AlarmMethod>0</AlarmMethod>\r\n");
    }
    if let Some(interval) = interval {
        body.push_str(&format!("<Interval>{}</Interval>\r\n", interval));
    }
    xml("Query", &body)
}

pub fn broadcast_notify(sn: u32, source_id: &str, target_id: &str) -> String {
    xml(
        "Notify",
        &format!(
            "<CmdType>Broadcast</CmdType>\r\n<SN>{}</SN>\r\n<SourceID>{}</SourceID>\r\n<TargetID>{}</TargetID>\r\n",
            sn, source_id, target_id
        ),
    )
}

pub fn teleboot_control(sn: u32, device_id: &str) -> String {
    xml(
        "Control",
        &format!(
            "<CmdType>DeviceControl</CmdType>\r\n<SN>{}</SN>\r\n<DeviceID>{}</DeviceID>\r\n<TeleBoot>Boot</TeleBoot>\r\n",
            sn, device_id
        ),
    )
}

pub fn ptz_control(sn: u32, channel_id: &str, cmd: &PtzCommand) -> String {
    xml(
        "Control",
        &format!(
            "<CmdType>DeviceControl</CmdType>\r\n<SN>{}</SN>\r\n<DeviceID>{}</DeviceID>\r\n<PTZCmd>{}</PTZCmd>\r\n<Info>\r\n<ControlPriority>5</ControlPriority>\r\n</Info>\r\n",
            sn,
            channel_id,
            cmd.to_hex()
        ),
    )
}

// ---- 级联应答 ----

pub fn device_info_response(sn: u32, device_id: &str, name: &str) -> String {
    xml(
        "Response",
        &format!(
            "<CmdType>DeviceInfo</CmdType>\r\n<SN>{}</SN>\r\n<DeviceID>{}</DeviceID>\r\n<Result>OK</Result>\r\n<DeviceName>{}</DeviceName>\r\n<Manufacturer>flux</Manufacturer>\r\n<Model>flux-gb28181</Model>\r\n<Firmware>{}</Firmware>\r\n",
            sn,
            device_id,
            name,
            env!("CARGO_PKG_VERSION")
        ),
    )
}

pub fn device_status_response(sn: u32, device_id: &str) -> String {
    xml(
        "Response",
        &format!(
            "<CmdType>DeviceStatus</CmdType>\r\n<SN>{}</SN>\r\n<DeviceID>{}</DeviceID>\r\n<Result>OK</Result>\r\n<Online>ONLINE</Online>\r\n<Status>OK</Status>\r\n",
            sn, device_id
        ),
    )
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// 目录应答的一页
pub fn catalog_response(sn: u32, device_id: &str, sum_num: usize, page: &[Channel]) -> String {
    let mut items = String::new();
    for ch in page {
        items.push_str(&format!(
            "<Item>\r\n<DeviceID>{}</DeviceID>\r\n<Name>{}</Name>\r\n<Manufacturer>{}</Manufacturer>\r\n<Model>{}</Model>\r\n<Owner>{}</Owner>\r\n<CivilCode>{}</CivilCode>\r\n<Address>{}</Address>\r\n<Parental>{}</Parental>\r\n<ParentID>{}</ParentID>\r\n<SafetyWay>0</SafetyWay>\r\n<RegisterWay>1</RegisterWay>\r\n<Secrecy>0</Secrecy>\r\n<Status>{}</Status>\r\n",
            ch.channel_id,
            escape(&ch.name),
            escape(&ch.manufacturer),
            escape(&ch.model),
            escape(&ch.owner),
            ch.civil_code,
            escape(&ch.address),
            if ch.parental { 1 } else { 0 },
            if ch.parent_id.is_empty() { device_id } else { ch.parent_id.as_str() },
            ch.status.as_str()
        ));
        if let (Some(lng), Some(lat)) = (ch.longitude, ch.latitude) {
            items.push_str(&format!("<Longitude>{}</Longitude>\r\n<Latitude>{}</Latitude>\r\n", lng, lat));
        }
        items.push_str("</Item>\r\n");
    }
    xml(
        "Response",
        &format!(
            "<CmdType>Catalog</CmdType>\r\n<SN>{}</SN>\r\n<DeviceID>{}</DeviceID>\r\n<SumNum>{}</SumNum>\r\n<DeviceList Num=\"{}\">\r\n{}</DeviceList>\r\n",
            sn,
            device_id,
            sum_num,
            page.len(),
            items
        ),
    )
}

// ---- PTZ 指令（A.3） ----

/// 云台动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PtzAction {
    Stop,
    Up,
    Down,
    Left,
    Right,
    UpLeft,
    UpRight,
    DownLeft,
    DownRight,
    ZoomIn,
    ZoomOut,
    SetPreset,
    GotoPreset,
    DeletePreset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PtzCommand {
    pub action: PtzAction,
    /// 水平/垂直速度 0-255，变倍速度 0-15；预置位操作时为预置位号
    #[serde(default = "default_speed")]
    pub speed: u8,
}

fn default_speed() -> u8 {
    0x80
}

impl PtzCommand {
    pub fn new(action: PtzAction, speed: u8) -> Self {
        Self { action, speed }
    }

    /// 8 字节指令的十六进制表示
    pub fn to_hex(&self) -> String {
        let speed = self.speed;
        let zoom = (speed >> 4) & 0x0F;
        let (code, data1, data2, data3): (u8, u8, u8, u8) = match self.action {
            PtzAction::Stop => (0x00, 0, 0, 0),
            PtzAction::Right => (0x01, speed, 0, 0),
            PtzAction::Left => (0x02, speed, 0, 0),
            PtzAction::Down => (0x04, 0, speed, 0),
            PtzAction::Up => (0x08, 0, speed, 0),
            PtzAction::DownRight => (0x05, speed, speed, 0),
            PtzAction::DownLeft => (0x06, speed, speed, 0),
            PtzAction::UpRight => (0x09, speed, speed, 0),
            PtzAction::UpLeft => (0x0A, speed, speed, 0),
            PtzAction::ZoomIn => (0x10, 0, 0, zoom),
            PtzAction::ZoomOut => (0x20, 0, 0, zoom),
            PtzAction::SetPreset => (0x81, 0, speed, 0),
            PtzAction::GotoPreset => (0x82, 0, speed, 0),
            PtzAction::DeletePreset => (0x83, 0, speed, 0),
        };
        let b1: u8 = 0xA5;
        // 组合码 0，校验位 = (A + 5 + 0) % 16
        let b2: u8 = ((b1 >> 4) + (b1 & 0x0F)) % 16;
        let b3: u8 = 0x00;
        let b7: u8 = data3 << 4;
        let bytes = [b1, b2, b3, code, data1, data2, b7];
        let sum: u32 = bytes.iter().map(|b| *b as u32).sum();
        let mut hex: String = bytes.iter().map(|b| format!("{:02X}", b)).collect();
        hex.push_str(&format!("{:02X}", (sum % 256) as u8));
        hex
    }
}

// ---- MANSRTSP 回放控制 ----

/// 回放控制命令
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum PlaybackControl {
    Pause,
    Resume,
    Scale { scale: f32 },
    Seek { offset: u64 },
}

impl PlaybackControl {
    pub fn to_body(&self, cseq: u32) -> String {
        match self {
            PlaybackControl::Pause => format!("PAUSE RTSP/1.0\r\nCSeq: {}\r\nPauseTime: now\r\n\r\n", cseq),
            PlaybackControl::Resume => format!("PLAY RTSP/1.0\r\nCSeq: {}\r\nRange: npt=now-\r\n\r\n", cseq),
            PlaybackControl::Scale { scale } => {
                format!("PLAY RTSP/1.0\r\nCSeq: {}\r\nScale: {:.1}\r\n\r\n", cseq, scale)
            }
            PlaybackControl::Seek { offset } => {
                format!("PLAY RTSP/1.0\r\nCSeq: {}\r\nRange: npt={}-\r\n\r\n", cseq, offset)
            }
        }
    }
}
