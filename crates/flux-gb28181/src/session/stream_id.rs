// 流 ID：点播类型 + 设备 + 通道 + 时间窗的纯函数
//
//   stream-id := device "/" channel [ "." kind [ "." start "." end ] ]

use crate::sip::dialog::DialogRole;
use crate::{Gb28181Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 点播类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InviteKind {
    Play,
    Playback,
    Download,
    Broadcast,
    Talk,
}

impl InviteKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InviteKind::Play => "play",
            InviteKind::Playback => "playback",
            InviteKind::Download => "download",
            InviteKind::Broadcast => "broadcast",
            InviteKind::Talk => "talk",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "play" => Some(InviteKind::Play),
            "playback" => Some(InviteKind::Playback),
            "download" => Some(InviteKind::Download),
            "broadcast" => Some(InviteKind::Broadcast),
            "talk" => Some(InviteKind::Talk),
            _ => None,
        }
    }

    /// SDP s= 行
    pub fn session_name(&self) -> &'static str {
        match self {
            InviteKind::Play => "Play",
            InviteKind::Playback => "Playback",
            InviteKind::Download => "Download",
            InviteKind::Broadcast => "Broadcast",
            InviteKind::Talk => "Talk",
        }
    }

    pub fn from_session_name(s: &str) -> Option<Self> {
        Self::parse(s)
    }

    /// 是否携带 [start, end] 时间窗
    pub fn has_window(&self) -> bool {
        matches!(self, InviteKind::Playback | InviteKind::Download)
    }

    /// 由设备发起 INVITE（设备为 UAC）
    pub fn device_initiated(&self) -> bool {
        matches!(self, InviteKind::Broadcast | InviteKind::Talk)
    }

    pub fn dialog_role(&self) -> DialogRole {
        match self {
            InviteKind::Play => DialogRole::Play,
            InviteKind::Playback => DialogRole::Playback,
            InviteKind::Download => DialogRole::Download,
            InviteKind::Broadcast => DialogRole::Broadcast,
            InviteKind::Talk => DialogRole::Talk,
        }
    }
}

impl fmt::Display for InviteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamId {
    pub kind: InviteKind,
    pub device_id: String,
    pub channel_id: String,
    pub window: Option<(u64, u64)>,
}

fn valid_part(s: &str) -> bool {
    !s.is_empty() && !s.contains('/') && !s.contains('.')
}

impl StreamId {
    pub fn new(
        kind: InviteKind,
        device_id: &str,
        channel_id: &str,
        start: Option<u64>,
        end: Option<u64>,
    ) -> Result<Self> {
        if !valid_part(device_id) || !valid_part(channel_id) {
            return Err(Gb28181Error::Parse(format!(
                "invalid device/channel id {}/{}",
                device_id, channel_id
            )));
        }
        let window = if kind.has_window() {
            match (start, end) {
                (Some(s), Some(e)) if s < e => Some((s, e)),
                _ => {
                    return Err(Gb28181Error::Parse(format!(
                        "{} requires start < end",
                        kind
                    )))
                }
            }
        } else {
            None
        };
        Ok(Self {
            kind,
            device_id: device_id.to_string(),
            channel_id: channel_id.to_string(),
            window,
        })
    }

    pub fn parse(s: &str) -> Result<Self> {
        let bad = || Gb28181Error::Parse(format!("invalid stream id {}", s));
        let (device, rest) = s.split_once('/').ok_or_else(bad)?;
        let mut parts = rest.split('.');
        let channel = parts.next().ok_or_else(bad)?;
        let kind = match parts.next() {
            None => InviteKind::Play,
            Some(k) => match InviteKind::parse(k) {
                Some(InviteKind::Play) | None => return Err(bad()),
                Some(kind) => kind,
            },
        };
        let start = parts.next().map(|v| v.parse::<u64>().map_err(|_| bad())).transpose()?;
        let end = parts.next().map(|v| v.parse::<u64>().map_err(|_| bad())).transpose()?;
        if parts.next().is_some() || (!kind.has_window() && start.is_some()) {
            return Err(bad());
        }
        Self::new(kind, device, channel, start, end)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device_id, self.channel_id)?;
        if self.kind != InviteKind::Play {
            write!(f, ".{}", self.kind)?;
        }
        if let Some((start, end)) = self.window {
            write!(f, ".{}.{}", start, end)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const D: &str = "34020000001320000001";
    const C: &str = "34020000001310000001";

    #[test]
    fn test_stream_id_format() {
        let play = StreamId::new(InviteKind::Play, D, C, None, None).unwrap();
        assert_eq!(play.to_string(), format!("{}/{}", D, C));

        let pb = StreamId::new(InviteKind::Playback, D, C, Some(1700000000), Some(1700003600)).unwrap();
        assert_eq!(pb.to_string(), format!("{}/{}.playback.1700000000.1700003600", D, C));

        let bc = StreamId::new(InviteKind::Broadcast, D, C, Some(1), Some(2)).unwrap();
        assert_eq!(bc.to_string(), format!("{}/{}.broadcast", D, C));

        let talk = StreamId::new(InviteKind::Talk, D, C, None, None).unwrap();
        assert_eq!(talk.to_string(), format!("{}/{}.talk", D, C));
    }

    #[test]
    fn test_stream_id_is_pure() {
        for kind in [InviteKind::Play, InviteKind::Playback, InviteKind::Download, InviteKind::Broadcast] {
            let a = StreamId::new(kind, D, C, Some(10), Some(20)).unwrap();
            let b = StreamId::new(kind, D, C, Some(10), Some(20)).unwrap();
            assert_eq!(a.to_string(), b.to_string());
            assert_eq!(StreamId::parse(&a.to_string()).unwrap(), a);
        }
    }

    #[test]
    fn test_stream_id_rejects() {
        assert!(StreamId::new(InviteKind::Download, D, C, None, Some(5)).is_err());
        assert!(StreamId::new(InviteKind::Playback, D, C, Some(5), Some(5)).is_err());
        assert!(StreamId::parse("no-slash").is_err());
        assert!(StreamId::parse(&format!("{}/{}.play", D, C)).is_err());
        assert!(StreamId::parse(&format!("{}/{}.broadcast.1.2", D, C)).is_err());
        assert!(StreamId::parse(&format!("{}/{}.playback.x.2", D, C)).is_err());
    }
}
