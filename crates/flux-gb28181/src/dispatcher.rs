// MANSCDP 分发：按 CmdType 把 MESSAGE / NOTIFY 报文路由到注册表与会话管理
// 以及平台向设备发出的查询和控制

use crate::manscdp::{self, ManscdpMessage, PtzCommand, RecordItem, RootKind};
use crate::registry::{DeviceRegistry, DeviceStatusReport};
use crate::session::SessionManager;
use crate::sip::endpoint::SipEndpoint;
use crate::sip::message::{SipMethod, SipRequest};
use crate::sip::transport::Destination;
use crate::{ErrorKind, Gb28181Error, Result};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::Instrument;

/// 录像查询默认等待时长
pub const RECORD_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// 分页到达的 RecordInfo，凑齐 SumNum 条后交付
struct PendingRecords {
    items: Vec<RecordItem>,
    tx: Option<oneshot::Sender<Vec<RecordItem>>>,
}

pub struct MessageDispatcher {
    registry: Arc<DeviceRegistry>,
    sessions: Arc<SessionManager>,
    endpoint: Arc<SipEndpoint>,
    records: DashMap<u32, PendingRecords>,
    sn: AtomicU32,
}

/// SIP 应答码：错误类别 → 状态码
pub fn reply_code(err: &Gb28181Error) -> (u16, &'static str) {
    match err.kind() {
        ErrorKind::NotFound => (404, "Not Found"),
        ErrorKind::Auth => (403, "Forbidden"),
        ErrorKind::Parse => (400, "Bad Request"),
        _ => (500, "Server Internal Error"),
    }
}

impl MessageDispatcher {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        sessions: Arc<SessionManager>,
        endpoint: Arc<SipEndpoint>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            sessions,
            endpoint,
            records: DashMap::new(),
            sn: AtomicU32::new(1),
        })
    }

    fn next_sn(&self) -> u32 {
        self.sn.fetch_add(1, Ordering::Relaxed)
    }

    /// 处理设备发来的 MESSAGE，返回要应答的状态码
    pub async fn on_message(&self, req: &SipRequest, source: Destination) -> (u16, &'static str) {
        let sender = req.from_user().unwrap_or_default().to_string();
        let span = tracing::info_span!("gb28181.sip.message", device_id = %sender, remote = %source);
        match self.dispatch_body(req, &sender, source).instrument(span).await {
            Ok(()) => (200, "OK"),
            Err(e) => {
                tracing::warn!(target: "gb28181::sip", device_id = %sender, "MESSAGE rejected: {}", e);
                reply_code(&e)
            }
        }
    }

    async fn dispatch_body(&self, req: &SipRequest, sender: &str, source: Destination) -> Result<()> {
        let body = req
            .body
            .as_deref()
            .ok_or_else(|| Gb28181Error::Parse("MESSAGE without body".to_string()))?;
        let msg = manscdp::parse(body)?;
        self.dispatch(&msg, sender, source).await
    }

    /// 报文所属设备：优先取已注册的发送方，否则取报文 DeviceID
    fn owner<'a>(&self, msg: &'a ManscdpMessage, sender: &'a str) -> &'a str {
        if !sender.is_empty() && self.registry.get_device(sender).is_some() {
            sender
        } else {
            msg.device_id.trim()
        }
    }

    /// 按 CmdType 路由；NOTIFY 报文也走这里
    pub async fn dispatch(&self, msg: &ManscdpMessage, sender: &str, source: Destination) -> Result<()> {
        let device_id = self.owner(msg, sender);
        tracing::debug!(target: "gb28181::sip", %device_id, cmd = %msg.cmd_type, sn = ?msg.sn, "MANSCDP received");
        // 只接受已注册设备从注册地址发来的报文
        self.registry.verify_source(device_id, source)?;

        match msg.cmd_type.as_str() {
            "Keepalive" => {
                self.registry
                    .keepalive(device_id, source, Instant::now())
                    .await?;
            }
            "Catalog" => {
                let entries = msg
                    .device_list
                    .as_ref()
                    .map(|l| l.items.iter().map(|i| i.to_entry(device_id)).collect())
                    .unwrap_or_default();
                let merge = self.registry.apply_catalog(device_id, entries).await?;
                tracing::info!(
                    target: "gb28181::sip",
                    %device_id,
                    sum_num = msg.sum_num.unwrap_or(0),
                    added = merge.added,
                    updated = merge.updated,
                    removed = merge.removed,
                    "catalog page merged"
                );
            }
            "DeviceInfo" => {
                let name = if msg.device_name.is_empty() {
                    msg.name.clone()
                } else {
                    msg.device_name.clone()
                };
                self.registry
                    .update_info(
                        device_id,
                        Some(name),
                        Some(msg.manufacturer.clone()),
                        Some(msg.model.clone()),
                        Some(msg.firmware.clone()),
                    )
                    .await?;
            }
            "DeviceStatus" => {
                let report = DeviceStatusReport {
                    online: msg.online.clone(),
                    status: msg.status.clone(),
                    encode: Some(msg.encode.clone()).filter(|v| !v.is_empty()),
                    record: Some(msg.record.clone()).filter(|v| !v.is_empty()),
                    reported_at: None,
                };
                self.registry.update_status(device_id, report).await?;
            }
            "MobilePosition" => {
                let position = msg
                    .position()
                    .ok_or_else(|| Gb28181Error::Parse("MobilePosition without coordinates".to_string()))?;
                self.registry.record_position(device_id, position).await?;
            }
            "Alarm" => {
                self.registry.record_alarm(device_id, msg.alarm()).await?;
            }
            "RecordInfo" => self.deliver_records(msg),
            "MediaStatus" => {
                if msg.notify_type.trim() == "121" {
                    let channel = msg.device_id.trim();
                    let channel = if channel == device_id { "" } else { channel };
                    let stopped = self.sessions.on_media_status(device_id, channel).await;
                    tracing::info!(target: "gb28181::session", %device_id, stopped, "media end of file");
                }
            }
            "Broadcast" | "DeviceControl" => {
                tracing::debug!(target: "gb28181::sip", %device_id, cmd = %msg.cmd_type, result = %msg.result, "control answered");
            }
            other => {
                tracing::debug!(target: "gb28181::sip", %device_id, cmd = other, "unknown CmdType ignored");
            }
        }
        Ok(())
    }

    fn deliver_records(&self, msg: &ManscdpMessage) {
        let Some(sn) = msg.sn else {
            return;
        };
        let done = {
            let Some(mut pending) = self.records.get_mut(&sn) else {
                tracing::debug!(target: "gb28181::sip", sn, "RecordInfo for unknown query");
                return;
            };
            pending.items.extend(msg.records());
            let expected = msg.sum_num.unwrap_or(0) as usize;
            pending.items.len() >= expected
        };
        if done {
            if let Some((_, mut pending)) = self.records.remove(&sn) {
                if let Some(tx) = pending.tx.take() {
                    let _ = tx.send(pending.items);
                }
            }
        }
    }

    async fn send_query(&self, device_id: &str, body: String) -> Result<()> {
        let device = self
            .registry
            .get_device(device_id)
            .ok_or_else(|| Gb28181Error::NotFound(format!("device {}", device_id)))?;
        if !device.is_online() {
            return Err(Gb28181Error::State(format!("device {} is offline", device_id)));
        }
        let dest = device
            .destination()
            .ok_or_else(|| Gb28181Error::State(format!("device {} has no address", device_id)))?;
        let mut req = self.endpoint.new_request(SipMethod::Message, device_id, dest);
        req.set_body(manscdp::CONTENT_TYPE, body);
        self.endpoint.request_final(req, dest).await?;
        Ok(())
    }

    /// 目录查询；应答分页异步到达并合并
    pub async fn query_catalog(&self, device_id: &str) -> Result<u32> {
        let sn = self.next_sn();
        self.send_query(device_id, manscdp::catalog_query(sn, device_id)).await?;
        Ok(sn)
    }

    pub async fn query_device_info(&self, device_id: &str) -> Result<u32> {
        let sn = self.next_sn();
        self.send_query(device_id, manscdp::device_info_query(sn, device_id)).await?;
        Ok(sn)
    }

    pub async fn query_device_status(&self, device_id: &str) -> Result<u32> {
        let sn = self.next_sn();
        self.send_query(device_id, manscdp::device_status_query(sn, device_id)).await?;
        Ok(sn)
    }

    /// 录像查询：等待全部分页到达
    pub async fn query_records(
        &self,
        device_id: &str,
        channel_id: &str,
        start: i64,
        end: i64,
        timeout: Duration,
    ) -> Result<Vec<RecordItem>> {
        if start >= end {
            return Err(Gb28181Error::Parse("record query requires start < end".to_string()));
        }
        let sn = self.next_sn();
        let (tx, rx) = oneshot::channel();
        self.records.insert(
            sn,
            PendingRecords {
                items: Vec::new(),
                tx: Some(tx),
            },
        );

        if let Err(e) = self
            .send_query(device_id, manscdp::record_info_query(sn, channel_id, start, end))
            .await
        {
            self.records.remove(&sn);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(items)) => Ok(items),
            _ => {
                // 超时返回已收到的部分
                let partial = self.records.remove(&sn).map(|(_, p)| p.items);
                match partial {
                    Some(items) if !items.is_empty() => {
                        tracing::warn!(target: "gb28181::sip", %device_id, sn, received = items.len(), "record query incomplete");
                        Ok(items)
                    }
                    _ => Err(Gb28181Error::Timeout(format!("RecordInfo sn {}", sn))),
                }
            }
        }
    }

    /// 云台控制
    pub async fn ptz(&self, device_id: &str, channel_id: &str, cmd: &PtzCommand) -> Result<()> {
        let sn = self.next_sn();
        self.send_query(device_id, manscdp::ptz_control(sn, channel_id, cmd)).await
    }

    /// 远程重启
    pub async fn teleboot(&self, device_id: &str) -> Result<()> {
        let sn = self.next_sn();
        self.send_query(device_id, manscdp::teleboot_control(sn, device_id)).await
    }

    pub fn pending_record_queries(&self) -> usize {
        self.records.len()
    }
}

/// NOTIFY / MESSAGE 报文是否为设备主动上报
pub fn is_report(body: &str) -> bool {
    matches!(
        manscdp::root_kind(body),
        Some(RootKind::Notify) | Some(RootKind::Response)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::mock::MockMediaServer;
    use crate::registry::OnlineStatus;
    use crate::session::testkit::*;
    use crate::session::SessionState;

    fn message(body: &str) -> SipRequest {
        let mut req = SipRequest::new(SipMethod::Message, format!("sip:{}@3402000000", PLATFORM));
        req.add_header("From", format!("<sip:{}@3402000000>;tag=m1", DEVICE));
        req.add_header("To", format!("<sip:{}@3402000000>", PLATFORM));
        req.add_header("Call-ID", "msg-1");
        req.add_header("CSeq", "20 MESSAGE");
        req.set_body(manscdp::CONTENT_TYPE, body);
        req
    }

    async fn setup() -> (Harness, Arc<MessageDispatcher>) {
        let h = harness(fast_config(), MockMediaServer::new(30000)).await;
        let dispatcher = MessageDispatcher::new(h.registry.clone(), h.manager.clone(), h.endpoint.clone());
        (h, dispatcher)
    }

    #[tokio::test]
    async fn test_keepalive_source_checked() {
        let (h, dispatcher) = setup().await;
        let body = manscdp::keepalive_notify(1, DEVICE);
        let source = Destination::udp(h.device.addr());
        assert_eq!(dispatcher.on_message(&message(&body), source).await.0, 200);

        let other = Destination::udp("10.0.0.1:5060".parse().unwrap());
        assert_eq!(dispatcher.on_message(&message(&body), other).await.0, 403);
    }

    #[tokio::test]
    async fn test_reports_from_foreign_source_rejected() {
        let (h, dispatcher) = setup().await;
        let foreign = Destination::udp("10.0.0.1:5060".parse().unwrap());
        let catalog = format!(
            r#"<Response><CmdType>Catalog</CmdType><SN>7</SN><DeviceID>{dev}</DeviceID><SumNum>1</SumNum><DeviceList Num="1">
<Item><DeviceID>34020000001310000002</DeviceID><Name>b</Name><Status>ON</Status></Item>
</DeviceList></Response>"#,
            dev = DEVICE
        );
        assert_eq!(dispatcher.on_message(&message(&catalog), foreign).await.0, 403);
        assert_eq!(h.registry.channels(DEVICE).len(), 1);

        let info = format!(
            "<Response><CmdType>DeviceInfo</CmdType><SN>2</SN><DeviceID>{}</DeviceID><DeviceName>intruder</DeviceName><Result>OK</Result></Response>",
            DEVICE
        );
        assert_eq!(dispatcher.on_message(&message(&info), foreign).await.0, 403);
        assert_ne!(h.registry.get_device(DEVICE).unwrap().name, "intruder");

        let status = format!(
            "<Response><CmdType>DeviceStatus</CmdType><SN>3</SN><DeviceID>{}</DeviceID><Online>OFFLINE</Online><Status>ERROR</Status></Response>",
            DEVICE
        );
        assert_eq!(dispatcher.on_message(&message(&status), foreign).await.0, 403);

        // 未注册的设备
        let mut stranger = message(&manscdp::keepalive_notify(1, "34020000001320000999"));
        stranger
            .headers
            .set("From", "<sip:34020000001320000999@3402000000>;tag=m2");
        let source = Destination::udp(h.device.addr());
        assert_eq!(dispatcher.on_message(&stranger, source).await.0, 404);
    }

    #[tokio::test]
    async fn test_catalog_event_flags_offline() {
        let (h, dispatcher) = setup().await;
        let source = Destination::udp(h.device.addr());
        let page = |status: &str| {
            format!(
                r#"<?xml version="1.0"?><Response><CmdType>Catalog</CmdType><SN>7</SN><DeviceID>{dev}</DeviceID><SumNum>2</SumNum><DeviceList Num="2">
<Item><DeviceID>34020000001310000001</DeviceID><Name>a</Name><Status>{status}</Status></Item>
<Item><DeviceID>34020000001310000002</DeviceID><Name>b</Name><Status>ON</Status></Item>
</DeviceList></Response>"#,
                dev = DEVICE,
                status = status
            )
        };
        assert_eq!(dispatcher.on_message(&message(&page("ON")), source).await.0, 200);
        assert_eq!(h.registry.channels(DEVICE).len(), 2);

        assert_eq!(dispatcher.on_message(&message(&page("OFF")), source).await.0, 200);
        let ch = h.registry.get_channel(DEVICE, "34020000001310000001").unwrap();
        assert_eq!(ch.status, OnlineStatus::Off);
        assert_eq!(h.registry.channels(DEVICE).len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_cmd_and_bad_xml() {
        let (h, dispatcher) = setup().await;
        let source = Destination::udp(h.device.addr());
        let unknown = format!(
            "<Notify><CmdType>SomethingNew</CmdType><SN>1</SN><DeviceID>{}</DeviceID></Notify>",
            DEVICE
        );
        assert_eq!(dispatcher.on_message(&message(&unknown), source).await.0, 200);
        assert_eq!(dispatcher.on_message(&message("<Notify>"), source).await.0, 400);
    }

    #[tokio::test]
    async fn test_device_info_and_position() {
        let (h, dispatcher) = setup().await;
        let source = Destination::udp(h.device.addr());
        let info = format!(
            "<Response><CmdType>DeviceInfo</CmdType><SN>2</SN><DeviceID>{}</DeviceID><DeviceName>gate</DeviceName><Manufacturer>ACME</Manufacturer><Model>X1</Model><Firmware>1.0</Firmware><Result>OK</Result></Response>",
            DEVICE
        );
        assert_eq!(dispatcher.on_message(&message(&info), source).await.0, 200);
        let device = h.registry.get_device(DEVICE).unwrap();
        assert_eq!(device.name, "gate");
        assert_eq!(device.manufacturer, "ACME");

        let mut events = h.events.subscribe();
        let position = format!(
            "<Notify><CmdType>MobilePosition</CmdType><SN>3</SN><DeviceID>{}</DeviceID><Time>2024-01-01T00:00:00</Time><Longitude>116.1</Longitude><Latitude>39.9</Latitude></Notify>",
            CHANNEL
        );
        assert_eq!(dispatcher.on_message(&message(&position), source).await.0, 200);
        assert_eq!(events.recv().await.unwrap().name(), "position");
        let facts = h.registry.recent_facts(DEVICE).unwrap();
        assert_eq!(facts.last_position.unwrap().channel_id, CHANNEL);
    }

    #[tokio::test]
    async fn test_record_query_accumulates_pages() {
        let (h, dispatcher) = setup().await;
        let source = Destination::udp(h.device.addr());

        let query = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                dispatcher
                    .query_records(DEVICE, CHANNEL, 1_700_000_000, 1_700_003_600, Duration::from_secs(5))
                    .await
            })
        };
        let req = h.device.expect(SipMethod::Message).await;
        let body = req.body.clone().unwrap();
        assert!(body.contains("<CmdType>RecordInfo</CmdType>"));
        h.device.reply(&req, 200, "OK").await;
        let sn: u32 = body
            .split("<SN>")
            .nth(1)
            .and_then(|s| s.split("</SN>").next())
            .unwrap()
            .parse()
            .unwrap();

        let page = |name: &str| {
            format!(
                "<Response><CmdType>RecordInfo</CmdType><SN>{sn}</SN><DeviceID>{ch}</DeviceID><SumNum>2</SumNum><RecordList Num=\"1\"><Item><DeviceID>{ch}</DeviceID><Name>{name}</Name><StartTime>2023-11-14T22:13:20</StartTime><EndTime>2023-11-14T22:43:20</EndTime></Item></RecordList></Response>",
                sn = sn,
                ch = CHANNEL,
                name = name
            )
        };
        dispatcher.dispatch(&manscdp::parse(&page("r1")).unwrap(), DEVICE, source).await.unwrap();
        assert_eq!(dispatcher.pending_record_queries(), 1);
        dispatcher.dispatch(&manscdp::parse(&page("r2")).unwrap(), DEVICE, source).await.unwrap();

        let records = query.await.unwrap().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].name, "r2");
        assert_eq!(dispatcher.pending_record_queries(), 0);
    }

    #[tokio::test]
    async fn test_media_status_ends_playback() {
        let (h, dispatcher) = setup().await;
        let manager = h.manager.clone();
        let mut req = crate::session::InviteRequest::play(DEVICE, CHANNEL);
        req.invite_type = crate::session::InviteKind::Playback;
        req.start = Some(1_700_000_000);
        req.end = Some(1_700_003_600);
        let invite = tokio::spawn(async move { manager.invite(req).await });
        let sip = h.device.expect(SipMethod::Invite).await;
        assert!(sip.body.as_deref().unwrap().contains("t=1700000000 1700003600"));
        h.device.answer(&sip).await;
        let snapshot = invite.await.unwrap().unwrap();
        assert!(snapshot.ssrc.starts_with('1'));

        let status = format!(
            "<Notify><CmdType>MediaStatus</CmdType><SN>9</SN><DeviceID>{}</DeviceID><NotifyType>121</NotifyType></Notify>",
            CHANNEL
        );
        let source = Destination::udp(h.device.addr());
        assert_eq!(dispatcher.on_message(&message(&status), source).await.0, 200);
        assert_eq!(
            h.manager.snapshot(&snapshot.stream_id).unwrap().state,
            SessionState::Terminated
        );
    }
}
