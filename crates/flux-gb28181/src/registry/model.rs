// 设备 / 通道 / 近期事实数据模型，以及与数据库实体的转换

use crate::sip::transport::{Destination, TransportKind};
use crate::store::{channel, device};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use tokio::time::Instant;

/// 在线状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OnlineStatus {
    #[serde(rename = "ON")]
    On,
    #[serde(rename = "OFF")]
    Off,
}

impl OnlineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OnlineStatus::On => "ON",
            OnlineStatus::Off => "OFF",
        }
    }

    /// 兼容目录中出现的各种写法：ON / OFF / ONLINE / OFFLINE / OK
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ON" | "ONLINE" | "OK" => Some(OnlineStatus::On),
            "OFF" | "OFFLINE" => Some(OnlineStatus::Off),
            _ => None,
        }
    }
}

impl fmt::Display for OnlineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 通道类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelKind {
    Camera,
    Alarm,
    Directory,
    CivilCode,
    BusinessGroup,
    Virtual,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Camera => "camera",
            ChannelKind::Alarm => "alarm",
            ChannelKind::Directory => "directory",
            ChannelKind::CivilCode => "civil-code",
            ChannelKind::BusinessGroup => "business-group",
            ChannelKind::Virtual => "virtual",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "camera" => Some(ChannelKind::Camera),
            "alarm" => Some(ChannelKind::Alarm),
            "directory" => Some(ChannelKind::Directory),
            "civil-code" => Some(ChannelKind::CivilCode),
            "business-group" => Some(ChannelKind::BusinessGroup),
            "virtual" => Some(ChannelKind::Virtual),
            _ => None,
        }
    }

    /// 按 GB28181 编码规则（第 11-13 位类型码）推断类别
    pub fn classify(channel_id: &str, parental: bool) -> Self {
        if channel_id.len() <= 8 {
            return ChannelKind::CivilCode;
        }
        match type_code(channel_id) {
            Some("215") => ChannelKind::BusinessGroup,
            Some("216") => ChannelKind::Virtual,
            Some("134") | Some("135") => ChannelKind::Alarm,
            Some("131") | Some("132") | Some("137") | Some("138") => ChannelKind::Camera,
            Some("200") | Some("111") | Some("118") => ChannelKind::Directory,
            _ if parental => ChannelKind::Directory,
            _ => ChannelKind::Camera,
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 20 位编码中的类型码
pub fn type_code(id: &str) -> Option<&str> {
    if id.len() == 20 && id.is_char_boundary(10) && id.is_char_boundary(13) {
        Some(&id[10..13])
    } else {
        None
    }
}

/// DeviceStatus 应答内容
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatusReport {
    pub online: String,
    pub status: String,
    pub encode: Option<String>,
    pub record: Option<String>,
    pub reported_at: Option<DateTime<Utc>>,
}

/// 设备
#[derive(Debug, Clone, Serialize)]
pub struct Device {
    pub device_id: String,
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub firmware: String,
    pub charset: String,
    pub transport: TransportKind,
    pub host: String,
    pub port: u16,
    pub status: OnlineStatus,
    pub contact: String,
    pub realm: String,
    #[serde(skip)]
    pub password: Option<String>,
    pub media_transport: Option<String>,
    pub expires: u32,
    pub register_time: Option<DateTime<Utc>>,
    pub keepalive_time: Option<DateTime<Utc>>,
    pub keepalive_deadline_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub keepalive_deadline: Option<Instant>,
    pub status_report: Option<DeviceStatusReport>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Device {
    pub fn new(device_id: impl Into<String>, source: Destination) -> Self {
        let now = Utc::now();
        Self {
            device_id: device_id.into(),
            name: String::new(),
            manufacturer: String::new(),
            model: String::new(),
            firmware: String::new(),
            charset: "GB2312".to_string(),
            transport: source.transport,
            host: source.addr.ip().to_string(),
            port: source.addr.port(),
            status: OnlineStatus::Off,
            contact: String::new(),
            realm: String::new(),
            password: None,
            media_transport: None,
            expires: 3600,
            register_time: None,
            keepalive_time: None,
            keepalive_deadline_at: None,
            keepalive_deadline: None,
            status_report: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_online(&self) -> bool {
        self.status == OnlineStatus::On
    }

    /// 信令目的地址
    pub fn destination(&self) -> Option<Destination> {
        let ip: IpAddr = self.host.parse().ok()?;
        Some(Destination {
            addr: SocketAddr::new(ip, self.port),
            transport: self.transport,
        })
    }
}

impl From<&Device> for device::Model {
    fn from(d: &Device) -> Self {
        Self {
            id: d.device_id.clone(),
            name: d.name.clone(),
            manufacturer: d.manufacturer.clone(),
            model: d.model.clone(),
            firmware: d.firmware.clone(),
            charset: d.charset.clone(),
            transport: d.transport.as_str().to_string(),
            host: d.host.clone(),
            port: d.port as i32,
            status: d.status.as_str().to_string(),
            contact: d.contact.clone(),
            realm: d.realm.clone(),
            password: d.password.clone(),
            media_transport: d.media_transport.clone(),
            expires: d.expires as i64,
            register_time: d.register_time,
            keepalive_time: d.keepalive_time,
            keepalive_deadline: d.keepalive_deadline_at,
            created_at: d.created_at,
            updated_at: d.updated_at,
        }
    }
}

impl From<device::Model> for Device {
    fn from(m: device::Model) -> Self {
        // 重启后根据墙钟截止时间恢复单调时钟截止时间
        let now = Utc::now();
        let remaining = m
            .keepalive_deadline
            .and_then(|deadline| (deadline - now).to_std().ok());
        let online = OnlineStatus::parse(&m.status) == Some(OnlineStatus::On) && remaining.is_some();

        Self {
            device_id: m.id,
            name: m.name,
            manufacturer: m.manufacturer,
            model: m.model,
            firmware: m.firmware,
            charset: m.charset,
            transport: TransportKind::from_str(&m.transport).unwrap_or(TransportKind::Udp),
            host: m.host,
            port: m.port as u16,
            status: if online { OnlineStatus::On } else { OnlineStatus::Off },
            contact: m.contact,
            realm: m.realm,
            password: m.password,
            media_transport: m.media_transport,
            expires: m.expires as u32,
            register_time: m.register_time,
            keepalive_time: m.keepalive_time,
            keepalive_deadline_at: m.keepalive_deadline,
            keepalive_deadline: if online {
                remaining.map(|r| Instant::now() + r)
            } else {
                None
            },
            status_report: None,
            created_at: m.created_at,
            updated_at: m.updated_at,
        }
    }
}

/// 通道
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub device_id: String,
    pub channel_id: String,
    pub name: String,
    pub kind: ChannelKind,
    pub status: OnlineStatus,
    pub manufacturer: String,
    pub model: String,
    pub owner: String,
    pub civil_code: String,
    pub address: String,
    pub parent_id: String,
    pub business_group_id: String,
    pub parental: bool,
    pub longitude: Option<f64>,
    pub latitude: Option<f64>,
    pub ptz_type: Option<i32>,
    pub updated_at: DateTime<Utc>,
}

impl Channel {
    pub fn new(device_id: impl Into<String>, channel_id: impl Into<String>) -> Self {
        let channel_id = channel_id.into();
        Self {
            device_id: device_id.into(),
            kind: ChannelKind::classify(&channel_id, false),
            channel_id,
            name: String::new(),
            status: OnlineStatus::On,
            manufacturer: String::new(),
            model: String::new(),
            owner: String::new(),
            civil_code: String::new(),
            address: String::new(),
            parent_id: String::new(),
            business_group_id: String::new(),
            parental: false,
            longitude: None,
            latitude: None,
            ptz_type: None,
            updated_at: Utc::now(),
        }
    }

    /// 设备离线时通道隐式离线
    pub fn effective_status(&self, device_online: bool) -> OnlineStatus {
        if device_online {
            self.status
        } else {
            OnlineStatus::Off
        }
    }

    /// 父路径（ParentID 可能是 `/` 分隔的多级路径）
    pub fn parental_path(&self) -> Vec<&str> {
        self.parent_id
            .split('/')
            .filter(|s| !s.is_empty())
            .collect()
    }
}

impl From<&Channel> for channel::Model {
    fn from(c: &Channel) -> Self {
        Self {
            device_id: c.device_id.clone(),
            channel_id: c.channel_id.clone(),
            name: c.name.clone(),
            kind: c.kind.as_str().to_string(),
            status: c.status.as_str().to_string(),
            manufacturer: c.manufacturer.clone(),
            model: c.model.clone(),
            owner: c.owner.clone(),
            civil_code: c.civil_code.clone(),
            address: c.address.clone(),
            parent_id: c.parent_id.clone(),
            business_group_id: c.business_group_id.clone(),
            parental: c.parental,
            longitude: c.longitude,
            latitude: c.latitude,
            ptz_type: c.ptz_type,
            updated_at: c.updated_at,
        }
    }
}

impl From<channel::Model> for Channel {
    fn from(m: channel::Model) -> Self {
        Self {
            kind: ChannelKind::from_str(&m.kind)
                .unwrap_or_else(|| ChannelKind::classify(&m.channel_id, m.parental)),
            status: OnlineStatus::parse(&m.status).unwrap_or(OnlineStatus::Off),
            device_id: m.device_id,
            channel_id: m.channel_id,
            name: m.name,
            manufacturer: m.manufacturer,
            model: m.model,
            owner: m.owner,
            civil_code: m.civil_code,
            address: m.address,
            parent_id: m.parent_id,
            business_group_id: m.business_group_id,
            parental: m.parental,
            longitude: m.longitude,
            latitude: m.latitude,
            ptz_type: m.ptz_type,
            updated_at: m.updated_at,
        }
    }
}

/// 目录条目的变更事件（Catalog 通知中的 `<Event>`）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogEvent {
    Add,
    Del,
    Update,
    On,
    Off,
    Vlost,
    Defect,
}

impl CatalogEvent {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ADD" => Some(CatalogEvent::Add),
            "DEL" => Some(CatalogEvent::Del),
            "UPDATE" => Some(CatalogEvent::Update),
            "ON" => Some(CatalogEvent::On),
            "OFF" => Some(CatalogEvent::Off),
            "VLOST" => Some(CatalogEvent::Vlost),
            "DEFECT" => Some(CatalogEvent::Defect),
            _ => None,
        }
    }
}

/// 一条待合并的目录项
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub channel: Channel,
    pub event: Option<CatalogEvent>,
}

/// 目录合并结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CatalogMerge {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub dropped: usize,
}

/// 位置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub channel_id: String,
    pub longitude: f64,
    pub latitude: f64,
    pub speed: Option<f64>,
    pub direction: Option<f64>,
    pub altitude: Option<f64>,
    pub time: String,
    pub received_at: DateTime<Utc>,
}

/// 报警
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmFact {
    pub channel_id: String,
    pub priority: String,
    pub method: String,
    pub alarm_type: Option<String>,
    pub description: String,
    pub time: String,
    pub longitude: Option<f64>,
    pub latitude: Option<f64>,
    pub received_at: DateTime<Utc>,
}

/// 每台设备最近的事实
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecentFacts {
    pub last_position: Option<Position>,
    pub alarms: VecDeque<AlarmFact>,
    pub catalog_at: Option<DateTime<Utc>>,
    pub catalog_size: usize,
}

impl RecentFacts {
    pub fn push_alarm(&mut self, alarm: AlarmFact, limit: usize) {
        self.alarms.push_back(alarm);
        while self.alarms.len() > limit.max(1) {
            self.alarms.pop_front();
        }
    }
}
