// GB28181 SDP（附录 F）
// s= 标识点播类型，t= 携带回放时间窗，y= 携带 10 位 SSRC，f= 携带媒体格式

use crate::{Gb28181Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 媒体传输方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SetupType {
    #[serde(rename = "UDP", alias = "udp")]
    Udp,
    /// 媒体服务器监听
    #[serde(rename = "TCP-passive", alias = "passive", alias = "tcp-passive")]
    TcpPassive,
    /// 媒体服务器主动连接设备
    #[serde(rename = "TCP-active", alias = "active", alias = "tcp-active")]
    TcpActive,
}

impl SetupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SetupType::Udp => "UDP",
            SetupType::TcpPassive => "TCP-passive",
            SetupType::TcpActive => "TCP-active",
        }
    }

    /// 兼容配置和接口里的多种写法
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "udp" => Some(SetupType::Udp),
            "passive" | "tcp-passive" | "tcp_passive" | "tcppassive" => Some(SetupType::TcpPassive),
            "active" | "tcp-active" | "tcp_active" | "tcpactive" => Some(SetupType::TcpActive),
            _ => None,
        }
    }

    pub fn is_tcp(&self) -> bool {
        !matches!(self, SetupType::Udp)
    }

    pub fn protocol(&self) -> &'static str {
        if self.is_tcp() {
            "TCP/RTP/AVP"
        } else {
            "RTP/AVP"
        }
    }

    /// 对端看到的 setup 角色：媒体服务器被动时设备主动，反之亦然
    ///
    /// GB28181 中 INVITE 的 `a=setup` 描述的是本端（媒体服务器）的角色。
    pub fn setup_attr(&self) -> Option<&'static str> {
        match self {
            SetupType::Udp => None,
            SetupType::TcpPassive => Some("passive"),
            SetupType::TcpActive => Some("active"),
        }
    }

    /// 媒体服务器 tcp_mode 参数：0 UDP，1 被动，2 主动
    pub fn tcp_mode(&self) -> u8 {
        match self {
            SetupType::Udp => 0,
            SetupType::TcpPassive => 1,
            SetupType::TcpActive => 2,
        }
    }
}

impl fmt::Display for SetupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// SDP 媒体描述
#[derive(Debug, Clone, PartialEq)]
pub struct SdpMedia {
    /// video / audio
    pub media_type: String,
    pub port: u16,
    /// RTP/AVP 或 TCP/RTP/AVP
    pub protocol: String,
    pub formats: Vec<u8>,
    pub rtpmap: Vec<RtpMap>,
    /// rtpmap 之外的 a= 属性
    pub attributes: Vec<String>,
}

impl SdpMedia {
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.iter().find_map(|a| {
            let (key, value) = a.split_once(':').unwrap_or((a.as_str(), ""));
            (key == name).then_some(value)
        })
    }

    /// 应答方宣告的传输方式
    pub fn setup(&self) -> SetupType {
        if !self.protocol.to_ascii_uppercase().starts_with("TCP") {
            return SetupType::Udp;
        }
        match self.attribute("setup") {
            Some("active") => SetupType::TcpActive,
            _ => SetupType::TcpPassive,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RtpMap {
    pub payload_type: u8,
    /// PS / H264 / PCMA
    pub encoding_name: String,
    pub clock_rate: u32,
}

/// SDP 会话描述
#[derive(Debug, Clone, PartialEq)]
pub struct SdpSession {
    pub version: u8,
    /// o= 的用户名，GB28181 中为本端编码
    pub origin: String,
    /// Play / Playback / Download / Talk / Broadcast
    pub session_name: String,
    /// u= 回放时为 `通道:0`
    pub uri: Option<String>,
    pub address: String,
    pub start: u64,
    pub end: u64,
    /// y= 10 位十进制
    pub ssrc: Option<String>,
    /// f= 媒体格式描述
    pub format: Option<String>,
    pub media: Vec<SdpMedia>,
}

impl SdpSession {
    pub fn new(origin: impl Into<String>, session_name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            version: 0,
            origin: origin.into(),
            session_name: session_name.into(),
            uri: None,
            address: address.into(),
            start: 0,
            end: 0,
            ssrc: None,
            format: None,
            media: Vec::new(),
        }
    }

    /// 接收 PS 视频（recvonly）
    pub fn add_video(&mut self, port: u16, setup: SetupType) {
        let mut attributes = vec!["recvonly".to_string()];
        if let Some(role) = setup.setup_attr() {
            attributes.push(format!("setup:{}", role));
            attributes.push("connection:new".to_string());
        }
        self.media.push(SdpMedia {
            media_type: "video".to_string(),
            port,
            protocol: setup.protocol().to_string(),
            formats: vec![96, 98, 97],
            rtpmap: vec![
                RtpMap {
                    payload_type: 96,
                    encoding_name: "PS".to_string(),
                    clock_rate: 90000,
                },
                RtpMap {
                    payload_type: 98,
                    encoding_name: "H264".to_string(),
                    clock_rate: 90000,
                },
                RtpMap {
                    payload_type: 97,
                    encoding_name: "MPEG4".to_string(),
                    clock_rate: 90000,
                },
            ],
            attributes,
        });
    }

    /// 语音对讲 / 广播的音频流，direction 为 sendonly 或 sendrecv
    pub fn add_audio(&mut self, port: u16, setup: SetupType, direction: &str) {
        let mut attributes = vec![direction.to_string()];
        if let Some(role) = setup.setup_attr() {
            attributes.push(format!("setup:{}", role));
            attributes.push("connection:new".to_string());
        }
        self.media.push(SdpMedia {
            media_type: "audio".to_string(),
            port,
            protocol: setup.protocol().to_string(),
            formats: vec![8],
            rtpmap: vec![RtpMap {
                payload_type: 8,
                encoding_name: "PCMA".to_string(),
                clock_rate: 8000,
            }],
            attributes,
        });
    }

    /// 替换所有媒体的方向属性（应答上级时改为 sendonly）
    pub fn set_direction(&mut self, direction: &str) {
        for media in &mut self.media {
            for attr in &mut media.attributes {
                if matches!(attr.as_str(), "recvonly" | "sendonly" | "sendrecv" | "inactive") {
                    *attr = direction.to_string();
                }
            }
        }
    }

    /// 第一条音视频媒体
    pub fn primary_media(&self) -> Option<&SdpMedia> {
        self.media
            .iter()
            .find(|m| m.media_type == "video")
            .or_else(|| self.media.first())
    }

    pub fn to_string(&self) -> String {
        let mut sdp = String::new();

        sdp.push_str(&format!("v={}\r\n", self.version));
        sdp.push_str(&format!("o={} 0 0 IN IP4 {}\r\n", self.origin, self.address));
        sdp.push_str(&format!("s={}\r\n", self.session_name));
        if let Some(uri) = &self.uri {
            sdp.push_str(&format!("u={}\r\n", uri));
        }
        sdp.push_str(&format!("c=IN IP4 {}\r\n", self.address));
        sdp.push_str(&format!("t={} {}\r\n", self.start, self.end));

        for media in &self.media {
            let formats: Vec<String> = media.formats.iter().map(|f| f.to_string()).collect();
            sdp.push_str(&format!(
                "m={} {} {} {}\r\n",
                media.media_type,
                media.port,
                media.protocol,
                formats.join(" ")
            ));
            for attr in &media.attributes {
                sdp.push_str(&format!("a={}\r\n", attr));
            }
            for rtpmap in &media.rtpmap {
                sdp.push_str(&format!(
                    "a=rtpmap:{} {}/{}\r\n",
                    rtpmap.payload_type, rtpmap.encoding_name, rtpmap.clock_rate
                ));
            }
        }

        // y= / f= 位于媒体描述之后
        if let Some(ssrc) = &self.ssrc {
            sdp.push_str(&format!("y={}\r\n", ssrc));
        }
        if let Some(format) = &self.format {
            sdp.push_str(&format!("f={}\r\n", format));
        }
        sdp
    }

    pub fn from_string(sdp: &str) -> Result<Self> {
        let mut session = SdpSession::new("", "", "");
        let mut current: Option<SdpMedia> = None;

        for line in sdp.lines() {
            let line = line.trim();
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            match key {
                "v" => session.version = value.trim().parse().unwrap_or(0),
                "o" => {
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if let Some(origin) = parts.first() {
                        session.origin = origin.to_string();
                    }
                    // 没有 c= 时使用 o= 的地址
                    if session.address.is_empty() {
                        if let Some(addr) = parts.get(5) {
                            session.address = addr.to_string();
                        }
                    }
                }
                "s" => session.session_name = value.to_string(),
                "u" => session.uri = Some(value.to_string()),
                "c" => {
                    if let Some(addr) = value.split_whitespace().nth(2) {
                        session.address = addr.to_string();
                    }
                }
                "t" => {
                    let mut it = value.split_whitespace();
                    session.start = it.next().and_then(|v| v.parse().ok()).unwrap_or(0);
                    session.end = it.next().and_then(|v| v.parse().ok()).unwrap_or(0);
                }
                "y" => session.ssrc = Some(value.trim().to_string()),
                "f" => session.format = Some(value.trim().to_string()),
                "m" => {
                    if let Some(media) = current.take() {
                        session.media.push(media);
                    }
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() < 3 {
                        return Err(Gb28181Error::Parse(format!("bad SDP media line: {}", line)));
                    }
                    current = Some(SdpMedia {
                        media_type: parts[0].to_string(),
                        port: parts[1]
                            .parse()
                            .map_err(|_| Gb28181Error::Parse(format!("bad SDP port: {}", parts[1])))?,
                        protocol: parts[2].to_string(),
                        formats: parts[3..].iter().filter_map(|s| s.parse().ok()).collect(),
                        rtpmap: Vec::new(),
                        attributes: Vec::new(),
                    });
                }
                "a" => {
                    let Some(media) = current.as_mut() else {
                        continue;
                    };
                    if let Some(map) = value.strip_prefix("rtpmap:") {
                        if let Some((pt, rest)) = map.split_once(' ') {
                            let (name, rate) = rest.split_once('/').unwrap_or((rest, "90000"));
                            media.rtpmap.push(RtpMap {
                                payload_type: pt.parse().unwrap_or(0),
                                encoding_name: name.to_string(),
                                clock_rate: rate
                                    .split('/')
                                    .next()
                                    .and_then(|r| r.parse().ok())
                                    .unwrap_or(90000),
                            });
                        }
                    } else {
                        media.attributes.push(value.to_string());
                    }
                }
                _ => {}
            }
        }
        if let Some(media) = current {
            session.media.push(media);
        }
        if session.media.is_empty() {
            return Err(Gb28181Error::Parse("SDP without media".to_string()));
        }
        Ok(session)
    }
}
