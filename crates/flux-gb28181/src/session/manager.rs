// 点播会话管理：媒体服务器端口申请 → INVITE → ACK → 监督 → BYE
//
// 每个流 ID 至多一个非终态会话；会话之间互不阻塞，所有 DashMap 引用不跨 await。

use super::ssrc::SsrcAllocator;
use super::state::{FailReason, SessionState};
use super::stream_id::{InviteKind, StreamId};
use crate::events::{DomainEvent, EventBus};
use crate::manscdp::{self, PlaybackControl};
use crate::media::MediaServer;
use crate::registry::DeviceRegistry;
use crate::sdp::{SdpSession, SetupType};
use crate::sip::dialog::{Dialog, DialogId, DialogStore};
use crate::sip::endpoint::SipEndpoint;
use crate::sip::message::{SipMethod, SipRequest, SipResponse};
use crate::sip::transaction::{build_cancel, ClientTransaction};
use crate::sip::transport::Destination;
use crate::store::{session_log, Store};
use crate::{Gb28181Error, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sea_orm::ActiveValue::Set;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// INVITE 发出后等待 2xx 的时长
    pub invite_timeout: Duration,
    pub default_setup: SetupType,
    /// SDP f= 行，例如 `v/2/5/25/1/4096a///`
    pub prefer_stream_fmt: Option<String>,
    /// 流状态轮询间隔，为 0 时不监督
    pub media_check_interval: Duration,
    /// CANCEL 之后等待交叉 2xx 的时长
    pub cancel_grace: Duration,
    /// 终态会话保留多久供查询
    pub retain_terminal: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            invite_timeout: Duration::from_secs(10),
            default_setup: SetupType::TcpPassive,
            prefer_stream_fmt: None,
            media_check_interval: Duration::from_secs(10),
            cancel_grace: Duration::from_secs(2),
            retain_terminal: Duration::from_secs(300),
        }
    }
}

/// 点播请求（HTTP 接口和级联共用）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InviteRequest {
    #[serde(alias = "invite-type", alias = "type")]
    pub invite_type: InviteKind,
    #[serde(alias = "device_id")]
    pub device: String,
    #[serde(alias = "channel_id")]
    pub channel: String,
    #[serde(default)]
    pub start: Option<u64>,
    #[serde(default)]
    pub end: Option<u64>,
    #[serde(default)]
    pub setup: Option<SetupType>,
    #[serde(default)]
    pub ssrc: Option<String>,
}

impl InviteRequest {
    pub fn play(device: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            invite_type: InviteKind::Play,
            device: device.into(),
            channel: channel.into(),
            start: None,
            end: None,
            setup: None,
            ssrc: None,
        }
    }
}

/// 会话对外视图
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub stream_id: String,
    pub invite_type: InviteKind,
    pub device_id: String,
    pub channel_id: String,
    pub start: Option<u64>,
    pub end: Option<u64>,
    pub ssrc: String,
    pub setup: SetupType,
    pub media_port: Option<u16>,
    pub state: SessionState,
    pub device_dialog: Option<DialogId>,
    pub upstream_dialog: Option<DialogId>,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// 会话的哪一条腿
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Leg {
    Device,
    Upstream,
}

pub(super) struct SessionEntry {
    pub snapshot: SessionSnapshot,
    pub cancel: CancellationToken,
    /// 媒体服务器正在向上级/设备推流
    pub relaying: bool,
    pub ended: Option<Instant>,
}

type DeviceInviteWaiter = (String, oneshot::Sender<(SipRequest, Destination)>);

pub struct SessionManager {
    pub(super) config: SessionConfig,
    pub(super) endpoint: Arc<SipEndpoint>,
    pub(super) dialogs: Arc<DialogStore>,
    pub(super) registry: Arc<DeviceRegistry>,
    pub(super) media: Arc<dyn MediaServer>,
    pub(super) events: EventBus,
    pub(super) store: Option<Store>,
    pub(super) ssrc: SsrcAllocator,
    pub(super) sessions: DashMap<String, SessionEntry>,
    /// 对讲/广播：按音频通道 ID 等待设备发来的 INVITE
    pub(super) device_invites: DashMap<String, DeviceInviteWaiter>,
    /// 级联：上级 INVITE 的 Call-ID → 流 ID，用于 CANCEL
    pub(super) upstream_pending: DashMap<String, String>,
    sn: AtomicU32,
}

impl SessionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SessionConfig,
        endpoint: Arc<SipEndpoint>,
        dialogs: Arc<DialogStore>,
        registry: Arc<DeviceRegistry>,
        media: Arc<dyn MediaServer>,
        events: EventBus,
        store: Option<Store>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            endpoint,
            dialogs,
            registry,
            media,
            events,
            store,
            ssrc: SsrcAllocator::new(),
            sessions: DashMap::new(),
            device_invites: DashMap::new(),
            upstream_pending: DashMap::new(),
            sn: AtomicU32::new(1),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub(super) fn next_sn(&self) -> u32 {
        self.sn.fetch_add(1, Ordering::Relaxed)
    }

    pub fn snapshot(&self, stream_id: &str) -> Option<SessionSnapshot> {
        self.sessions.get(stream_id).map(|e| e.snapshot.clone())
    }

    pub fn list(&self) -> Vec<SessionSnapshot> {
        let mut list: Vec<SessionSnapshot> = self.sessions.iter().map(|e| e.snapshot.clone()).collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        list
    }

    /// 非终态会话数量
    pub fn active_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|e| !e.snapshot.state.is_terminal())
            .count()
    }

    pub fn ssrc_in_use(&self) -> usize {
        self.ssrc.in_use()
    }

    /// 发起点播；返回 CONFIRMED 状态的快照
    pub async fn invite(self: &Arc<Self>, req: InviteRequest) -> Result<SessionSnapshot> {
        let stream = StreamId::new(req.invite_type, &req.device, &req.channel, req.start, req.end)?;
        let device = self
            .registry
            .get_device(&req.device)
            .ok_or_else(|| Gb28181Error::NotFound(format!("device {}", req.device)))?;
        if !device.is_online() {
            return Err(Gb28181Error::State(format!("device {} is offline", req.device)));
        }
        let dest = device
            .destination()
            .ok_or_else(|| Gb28181Error::State(format!("device {} has no address", req.device)))?;
        if req.channel != req.device && self.registry.get_channel(&req.device, &req.channel).is_none() {
            return Err(Gb28181Error::NotFound(format!(
                "channel {} of device {}",
                req.channel, req.device
            )));
        }

        let setup = req
            .setup
            .or_else(|| device.media_transport.as_deref().and_then(SetupType::parse))
            .unwrap_or(self.config.default_setup);
        let ssrc = match &req.ssrc {
            Some(ssrc) => {
                self.ssrc.reserve(ssrc)?;
                ssrc.clone()
            }
            None => self.ssrc.allocate(stream.kind, &stream.device_id),
        };

        let stream_id = stream.to_string();
        let cancel = match self.reserve(&stream, setup, &ssrc) {
            Ok(cancel) => cancel,
            Err(e) => {
                self.ssrc.release(&ssrc);
                return Err(e);
            }
        };
        tracing::info!(
            target: "gb28181::session",
            stream_id = %stream_id,
            %setup,
            %ssrc,
            "invite requested"
        );

        if stream.kind.device_initiated() {
            self.run_device_initiated(&stream_id, &stream, dest, setup, &ssrc, cancel)
                .await
        } else {
            self.run_invite(&stream_id, &stream, dest, setup, &ssrc, cancel)
                .await
        }
    }

    /// 登记新会话；同一流 ID 存在非终态会话时拒绝
    fn reserve(&self, stream: &StreamId, setup: SetupType, ssrc: &str) -> Result<CancellationToken> {
        let stream_id = stream.to_string();
        let cancel = CancellationToken::new();
        let entry = SessionEntry {
            snapshot: SessionSnapshot {
                stream_id: stream_id.clone(),
                invite_type: stream.kind,
                device_id: stream.device_id.clone(),
                channel_id: stream.channel_id.clone(),
                start: stream.window.map(|w| w.0),
                end: stream.window.map(|w| w.1),
                ssrc: ssrc.to_string(),
                setup,
                media_port: None,
                state: SessionState::Idle,
                device_dialog: None,
                upstream_dialog: None,
                reason: None,
                created_at: Utc::now(),
                ended_at: None,
            },
            cancel: cancel.clone(),
            relaying: false,
            ended: None,
        };

        match self.sessions.entry(stream_id) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                if !occupied.get().snapshot.state.is_terminal() {
                    return Err(Gb28181Error::Duplicate(format!(
                        "session {} is {}",
                        occupied.key(),
                        occupied.get().snapshot.state
                    )));
                }
                occupied.insert(entry);
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(entry);
            }
        }
        Ok(cancel)
    }

    pub(super) fn transition(&self, stream_id: &str, to: SessionState) -> Result<()> {
        let mut entry = self
            .sessions
            .get_mut(stream_id)
            .ok_or_else(|| Gb28181Error::NotFound(format!("session {}", stream_id)))?;
        let from = entry.snapshot.state;
        entry.snapshot.state.advance(to)?;
        tracing::debug!(target: "gb28181::session", %stream_id, %from, %to, "session state");
        Ok(())
    }

    pub(super) fn update<F: FnOnce(&mut SessionEntry)>(&self, stream_id: &str, f: F) {
        if let Some(mut entry) = self.sessions.get_mut(stream_id) {
            f(&mut entry);
        }
    }

    async fn run_invite(
        self: &Arc<Self>,
        stream_id: &str,
        stream: &StreamId,
        dest: Destination,
        setup: SetupType,
        ssrc: &str,
        cancel: CancellationToken,
    ) -> Result<SessionSnapshot> {
        // 超时从申请媒体端口开始计算
        let deadline_at = Instant::now() + self.config.invite_timeout;
        self.transition(stream_id, SessionState::NegotiatingMediaServer)?;
        let opened = tokio::time::timeout_at(deadline_at, self.media.open_stream(stream_id, setup, ssrc)).await;
        let port = match opened {
            Ok(Ok(port)) => port,
            Ok(Err(e)) => {
                tracing::warn!(target: "gb28181::session", %stream_id, "open rtp server failed: {}", e);
                self.fail(stream_id, FailReason::MediaServer).await;
                return Err(e);
            }
            Err(_) => {
                tracing::warn!(target: "gb28181::session", %stream_id, "open rtp server timed out");
                // 端口可能已在媒体服务器侧打开
                if let Err(e) = self.media.close_stream(stream_id).await {
                    tracing::debug!(target: "gb28181::session", %stream_id, "close rtp server failed: {}", e);
                }
                self.fail(stream_id, FailReason::Timeout).await;
                return Err(Gb28181Error::Timeout(format!("open rtp server {}", stream_id)));
            }
        };
        self.update(stream_id, |e| e.snapshot.media_port = Some(port));

        if cancel.is_cancelled() {
            self.finish(stream_id, None, "cancelled").await;
            return Err(Gb28181Error::State(format!("session {} cancelled", stream_id)));
        }

        let invite = self.build_invite(stream, dest, setup, ssrc, port);
        self.transition(stream_id, SessionState::Inviting)?;
        let mut tx = match self.endpoint.send(invite.clone(), dest).await {
            Ok(tx) => tx,
            Err(e) => {
                self.fail(stream_id, FailReason::from_error(&e)).await;
                return Err(e);
            }
        };

        let deadline = tokio::time::sleep_until(deadline_at);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.cancel_invite(stream_id, &invite, dest, &mut tx).await;
                    self.discard_early_dialog(stream_id).await;
                    self.finish(stream_id, None, "cancelled").await;
                    return Err(Gb28181Error::State(format!("session {} cancelled", stream_id)));
                }
                _ = &mut deadline => {
                    tracing::warn!(target: "gb28181::session", %stream_id, "no answer before invite timeout");
                    self.cancel_invite(stream_id, &invite, dest, &mut tx).await;
                    self.fail(stream_id, FailReason::Timeout).await;
                    return Err(Gb28181Error::Timeout(format!("invite {}", stream_id)));
                }
                event = tx.recv() => match event {
                    Some(Ok(resp)) if resp.is_provisional() => {
                        if resp.status_code > 100 {
                            let _ = self.transition(stream_id, SessionState::Early);
                            if resp.headers.to_tag().is_some() {
                                self.record_early_dialog(stream_id, stream, &invite, &resp, dest).await;
                            }
                        }
                    }
                    Some(Ok(resp)) if resp.is_success() => {
                        return self
                            .confirm_uac(stream_id, stream, &invite, resp, dest, setup, cancel)
                            .await;
                    }
                    Some(Ok(resp)) => {
                        tracing::warn!(
                            target: "gb28181::session",
                            %stream_id,
                            code = resp.status_code,
                            reason = %resp.reason_phrase,
                            "device rejected invite"
                        );
                        self.fail(stream_id, FailReason::Device(resp.status_code)).await;
                        return Err(Gb28181Error::Device {
                            code: resp.status_code,
                            reason: resp.reason_phrase,
                        });
                    }
                    Some(Err(e)) => {
                        self.fail(stream_id, FailReason::from_error(&e)).await;
                        return Err(e);
                    }
                    None => {
                        self.fail(stream_id, FailReason::Transport).await;
                        return Err(Gb28181Error::Transport(format!("invite {} transaction closed", stream_id)));
                    }
                }
            }
        }
    }

    fn build_invite(
        &self,
        stream: &StreamId,
        dest: Destination,
        setup: SetupType,
        ssrc: &str,
        port: u16,
    ) -> SipRequest {
        let identity = self.endpoint.identity();
        let mut sdp = SdpSession::new(identity.id.clone(), stream.kind.session_name(), self.media.media_ip());
        if let Some((start, end)) = stream.window {
            sdp.uri = Some(format!("{}:0", stream.channel_id));
            sdp.start = start;
            sdp.end = end;
        }
        sdp.add_video(port, setup);
        sdp.ssrc = Some(ssrc.to_string());
        sdp.format = self.config.prefer_stream_fmt.clone();

        let mut req = self
            .endpoint
            .new_request(SipMethod::Invite, &stream.channel_id, dest);
        req.add_header("Subject", format!("{}:{},{}:0", stream.channel_id, ssrc, identity.id));
        req.set_body("APPLICATION/SDP", sdp.to_string());
        req
    }

    #[allow(clippy::too_many_arguments)]
    async fn confirm_uac(
        self: &Arc<Self>,
        stream_id: &str,
        stream: &StreamId,
        invite: &SipRequest,
        resp: SipResponse,
        dest: Destination,
        setup: SetupType,
        cancel: CancellationToken,
    ) -> Result<SessionSnapshot> {
        let mut dialog = match Dialog::from_uac_response(stream.kind.dialog_role(), &stream.device_id, invite, &resp, dest) {
            Ok(dialog) => dialog,
            Err(e) => {
                self.fail(stream_id, FailReason::Parse).await;
                return Err(e);
            }
        };
        let ack_raw = match dialog.build_ack(&self.endpoint.identity()) {
            Ok(ack) => ack.to_string(),
            Err(e) => {
                self.fail(stream_id, FailReason::Parse).await;
                return Err(e);
            }
        };
        dialog.ack_raw = Some(ack_raw.clone());

        // 2xx 的 To tag 与 18x 不同：早期对话作废
        let early = self.snapshot(stream_id).and_then(|s| s.device_dialog);
        if let Some(early) = early.filter(|id| *id != dialog.id) {
            self.update(stream_id, |e| e.snapshot.device_dialog = None);
            self.drop_dialog(&early).await;
        }

        // 媒体就绪后才 ACK；失败则 ACK 后立即 BYE
        let ready = self.prepare_media(stream_id, &resp, setup).await;
        if let Err(e) = self.endpoint.transactions().send_stateless(&ack_raw, dest).await {
            tracing::warn!(target: "gb28181::session", %stream_id, "send ACK failed: {}", e);
        }
        if let Err((reason, e)) = ready {
            self.bye_unregistered(&mut dialog).await;
            self.fail(stream_id, reason).await;
            return Err(e);
        }

        let dialog_id = dialog.id.clone();
        if let Err(e) = self.dialogs.insert(dialog.clone()).await {
            self.bye_unregistered(&mut dialog).await;
            self.fail(stream_id, FailReason::Persistence).await;
            return Err(e);
        }
        self.update(stream_id, |e| e.snapshot.device_dialog = Some(dialog_id));
        self.transition(stream_id, SessionState::Confirmed)?;

        if cancel.is_cancelled() {
            self.finish(stream_id, None, "cancelled").await;
            return Err(Gb28181Error::State(format!("session {} cancelled", stream_id)));
        }

        let snapshot = self
            .snapshot(stream_id)
            .ok_or_else(|| Gb28181Error::NotFound(format!("session {}", stream_id)))?;
        tracing::info!(
            target: "gb28181::session",
            %stream_id,
            ssrc = %snapshot.ssrc,
            port = ?snapshot.media_port,
            "session confirmed"
        );
        self.events.publish(DomainEvent::Invite {
            session: snapshot.clone(),
        });
        self.spawn_supervisor(stream_id.to_string(), cancel);
        Ok(snapshot)
    }

    /// 解析 2xx 的 SDP 应答；主动模式下让媒体服务器连接设备端口
    async fn prepare_media(
        &self,
        stream_id: &str,
        resp: &SipResponse,
        setup: SetupType,
    ) -> std::result::Result<(), (FailReason, Gb28181Error)> {
        let answer = resp
            .body
            .as_deref()
            .ok_or_else(|| Gb28181Error::Parse("2xx without SDP".to_string()))
            .and_then(SdpSession::from_string)
            .map_err(|e| (FailReason::Parse, e))?;
        if setup == SetupType::TcpActive {
            let port = answer.primary_media().map(|m| m.port).unwrap_or(0);
            self.media
                .connect_stream(stream_id, &answer.address, port)
                .await
                .map_err(|e| (FailReason::MediaServer, e))?;
        }
        Ok(())
    }

    /// 带 To tag 的 18x 建立早期对话，2xx 到达后被确认对话覆盖
    async fn record_early_dialog(
        &self,
        stream_id: &str,
        stream: &StreamId,
        invite: &SipRequest,
        resp: &SipResponse,
        dest: Destination,
    ) {
        let dialog = match Dialog::from_uac_response(stream.kind.dialog_role(), &stream.device_id, invite, resp, dest) {
            Ok(dialog) => dialog,
            Err(e) => {
                tracing::debug!(target: "gb28181::session", %stream_id, "ignore provisional response: {}", e);
                return;
            }
        };
        let previous = self.snapshot(stream_id).and_then(|s| s.device_dialog);
        if previous.as_ref() == Some(&dialog.id) {
            return;
        }
        if let Some(previous) = previous {
            self.drop_dialog(&previous).await;
        }
        let id = dialog.id.clone();
        if let Err(e) = self.dialogs.insert(dialog).await {
            tracing::warn!(target: "gb28181::session", %stream_id, "save early dialog failed: {}", e);
            self.update(stream_id, |e| e.snapshot.device_dialog = None);
            return;
        }
        self.update(stream_id, |e| e.snapshot.device_dialog = Some(id));
    }

    /// 取消后早期对话随 INVITE 事务结束，不再发 BYE
    async fn discard_early_dialog(&self, stream_id: &str) {
        let mut early = None;
        self.update(stream_id, |e| early = e.snapshot.device_dialog.take());
        if let Some(id) = early {
            self.drop_dialog(&id).await;
        }
    }

    /// 超时或取消：同 branch 发 CANCEL，宽限期内若 2xx 交叉到达则 ACK 后立即 BYE
    async fn cancel_invite(
        &self,
        stream_id: &str,
        invite: &SipRequest,
        dest: Destination,
        tx: &mut ClientTransaction,
    ) {
        match self.endpoint.send(build_cancel(invite), dest).await {
            Ok(mut cancel_tx) => {
                tokio::spawn(async move {
                    let _ = cancel_tx.final_response().await;
                });
            }
            Err(e) => tracing::warn!(target: "gb28181::session", %stream_id, "send CANCEL failed: {}", e),
        }

        let grace = tokio::time::sleep(self.config.cancel_grace);
        tokio::pin!(grace);
        loop {
            tokio::select! {
                _ = &mut grace => return,
                event = tx.recv() => match event {
                    Some(Ok(resp)) if resp.is_success() => {
                        tracing::info!(target: "gb28181::session", %stream_id, "2xx crossed CANCEL, sending BYE");
                        let role = StreamId::parse(stream_id)
                            .map(|s| s.kind.dialog_role())
                            .unwrap_or(crate::sip::dialog::DialogRole::Play);
                        match Dialog::from_uac_response(role, "", invite, &resp, dest) {
                            Ok(mut dialog) => {
                                if let Ok(ack) = dialog.build_ack(&self.endpoint.identity()) {
                                    let _ = self
                                        .endpoint
                                        .transactions()
                                        .send_stateless(&ack.to_string(), dest)
                                        .await;
                                }
                                self.bye_unregistered(&mut dialog).await;
                            }
                            Err(e) => tracing::warn!(target: "gb28181::session", %stream_id, "bad 2xx after CANCEL: {}", e),
                        }
                        return;
                    }
                    Some(Ok(resp)) if !resp.is_provisional() => return,
                    Some(Ok(_)) => continue,
                    _ => return,
                }
            }
        }
    }

    /// 对未登记到对话表的对话发 BYE（不等待结果）
    async fn bye_unregistered(&self, dialog: &mut Dialog) {
        dialog.local_seq += 1;
        match dialog.build_request(SipMethod::Bye, &self.endpoint.identity()) {
            Ok(bye) => self.spawn_request(bye, dialog.destination),
            Err(e) => tracing::warn!(target: "gb28181::session", dialog = %dialog.id, "build BYE failed: {}", e),
        }
    }

    pub(super) fn spawn_request(&self, req: SipRequest, dest: Destination) {
        let endpoint = self.endpoint.clone();
        tokio::spawn(async move {
            let method = req.method;
            if let Err(e) = endpoint.request_final(req, dest).await {
                tracing::debug!(target: "gb28181::session", %dest, "{} not acknowledged: {}", method.as_str(), e);
            }
        });
    }

    /// 对话内 BYE；对话随后从对话表删除
    pub(super) async fn bye_dialog(&self, id: &DialogId) {
        match self
            .dialogs
            .next_request(id, SipMethod::Bye, &self.endpoint.identity())
            .await
        {
            Ok((bye, dest)) => self.spawn_request(bye, dest),
            Err(e) => tracing::warn!(target: "gb28181::session", dialog = %id, "build BYE failed: {}", e),
        }
    }

    pub(super) async fn drop_dialog(&self, id: &DialogId) {
        if let Err(e) = self.dialogs.remove(id).await {
            tracing::error!(target: "gb28181::session", dialog = %id, "remove dialog failed: {}", e);
        }
    }

    /// 停止会话：建立中则取消，已确认则 BYE 拆除
    pub async fn stop(self: &Arc<Self>, stream_id: &str) -> Result<SessionSnapshot> {
        let state = {
            let entry = self
                .sessions
                .get(stream_id)
                .ok_or_else(|| Gb28181Error::NotFound(format!("session {}", stream_id)))?;
            if entry.snapshot.state.is_pending() {
                entry.cancel.cancel();
            }
            entry.snapshot.state
        };
        if !state.is_pending() {
            self.finish(stream_id, None, "stopped").await;
        }
        self.snapshot(stream_id)
            .ok_or_else(|| Gb28181Error::NotFound(format!("session {}", stream_id)))
    }

    /// 拆除会话：进入 TERMINATING，BYE 另一条腿，释放媒体资源，进入 TERMINATED
    ///
    /// `skip` 为已经收到 BYE 的一侧，只删除对话不再发 BYE。
    pub(super) async fn finish(&self, stream_id: &str, skip: Option<Leg>, reason: &str) {
        let (snapshot, relaying) = {
            let Some(mut entry) = self.sessions.get_mut(stream_id) else {
                return;
            };
            if entry.snapshot.state.advance(SessionState::Terminating).is_err() {
                return;
            }
            entry.cancel.cancel();
            (entry.snapshot.clone(), entry.relaying)
        };

        let legs = [
            (Leg::Device, snapshot.device_dialog.as_ref()),
            (Leg::Upstream, snapshot.upstream_dialog.as_ref()),
        ];
        for (leg, dialog) in legs {
            let Some(id) = dialog else { continue };
            if skip != Some(leg) {
                self.bye_dialog(id).await;
            }
            self.drop_dialog(id).await;
        }

        if relaying {
            if let Err(e) = self.media.stop_send_rtp(stream_id).await {
                tracing::warn!(target: "gb28181::session", %stream_id, "stop_send_rtp failed: {}", e);
            }
        }
        if snapshot.media_port.is_some() {
            if let Err(e) = self.media.close_stream(stream_id).await {
                tracing::warn!(target: "gb28181::session", %stream_id, "close rtp server failed: {}", e);
            }
        }

        let _ = self.transition(stream_id, SessionState::Terminated);
        tracing::info!(target: "gb28181::session", %stream_id, reason, "session terminated");
        self.conclude(stream_id, reason).await;
    }

    /// 进入 FAILED 并释放已申请的资源；调用方负责已建立对话的 BYE
    pub(super) async fn fail(&self, stream_id: &str, reason: FailReason) {
        let (snapshot, relaying) = {
            let Some(mut entry) = self.sessions.get_mut(stream_id) else {
                return;
            };
            if entry.snapshot.state.advance(SessionState::Failed(reason)).is_err() {
                return;
            }
            entry.cancel.cancel();
            (entry.snapshot.clone(), entry.relaying)
        };

        for id in [snapshot.device_dialog.as_ref(), snapshot.upstream_dialog.as_ref()]
            .into_iter()
            .flatten()
        {
            self.drop_dialog(id).await;
        }
        if relaying {
            let _ = self.media.stop_send_rtp(stream_id).await;
        }
        if snapshot.media_port.is_some() {
            if let Err(e) = self.media.close_stream(stream_id).await {
                tracing::warn!(target: "gb28181::session", %stream_id, "close rtp server failed: {}", e);
            }
        }
        tracing::warn!(target: "gb28181::session", %stream_id, %reason, "session failed");
        self.conclude(stream_id, &reason.to_string()).await;
    }

    /// 终态收尾：释放 SSRC、发布事件、写会话日志
    async fn conclude(&self, stream_id: &str, reason: &str) {
        let snapshot = {
            let Some(mut entry) = self.sessions.get_mut(stream_id) else {
                return;
            };
            entry.ended = Some(Instant::now());
            entry.snapshot.ended_at = Some(Utc::now());
            entry.snapshot.reason = Some(reason.to_string());
            entry.snapshot.clone()
        };
        self.ssrc.release(&snapshot.ssrc);

        if let Some(store) = &self.store {
            let log = session_log::ActiveModel {
                stream_id: Set(snapshot.stream_id.clone()),
                invite_type: Set(snapshot.invite_type.as_str().to_string()),
                device_id: Set(snapshot.device_id.clone()),
                channel_id: Set(snapshot.channel_id.clone()),
                ssrc: Set(snapshot.ssrc.clone()),
                state: Set(snapshot.state.to_string()),
                reason: Set(snapshot.reason.clone()),
                created_at: Set(snapshot.created_at),
                ended_at: Set(snapshot.ended_at.unwrap_or_else(Utc::now)),
                ..Default::default()
            };
            if let Err(e) = store.append_session_log(log).await {
                tracing::error!(target: "gb28181::session", stream_id = %snapshot.stream_id, "write session log failed: {}", e);
            }
        }
        self.events.publish(DomainEvent::SessionEnded { session: snapshot });
    }

    /// 对话内 BYE：返回 false 表示对话不存在（应答 481）
    pub async fn on_bye(self: &Arc<Self>, req: &SipRequest) -> bool {
        let Some(id) = DialogId::from_incoming(req) else {
            return false;
        };
        // 终态会话只保留供查询，其对话已删除
        let owner = self.sessions.iter().find_map(|e| {
            if e.snapshot.state.is_terminal() {
                None
            } else if e.snapshot.device_dialog.as_ref() == Some(&id) {
                Some((e.key().clone(), Leg::Device))
            } else if e.snapshot.upstream_dialog.as_ref() == Some(&id) {
                Some((e.key().clone(), Leg::Upstream))
            } else {
                None
            }
        });

        match owner {
            Some((stream_id, leg)) => {
                let reason = match leg {
                    Leg::Device => "device-bye",
                    Leg::Upstream => "upstream-bye",
                };
                self.finish(&stream_id, Some(leg), reason).await;
                true
            }
            None if self.dialogs.contains(&id) => {
                self.drop_dialog(&id).await;
                true
            }
            None => false,
        }
    }

    /// 2xx 重传（事务已结束）：原样重发保存的 ACK
    pub async fn on_stray_response(&self, resp: &SipResponse) -> bool {
        let is_invite_2xx = resp.is_success()
            && resp
                .headers
                .cseq()
                .map(|c| c.method == SipMethod::Invite)
                .unwrap_or(false);
        if !is_invite_2xx {
            return false;
        }
        let (Some(call_id), Some(local_tag), Some(remote_tag)) =
            (resp.headers.call_id(), resp.headers.from_tag(), resp.headers.to_tag())
        else {
            return false;
        };
        let id = DialogId {
            call_id: call_id.to_string(),
            local_tag: local_tag.to_string(),
            remote_tag: remote_tag.to_string(),
        };
        let Some(dialog) = self.dialogs.get(&id) else {
            return false;
        };
        let Some(ack_raw) = dialog.ack_raw.as_deref() else {
            return false;
        };
        tracing::debug!(target: "gb28181::session", dialog = %id, "2xx retransmitted, resending ACK");
        if let Err(e) = self
            .endpoint
            .transactions()
            .send_stateless(ack_raw, dialog.destination)
            .await
        {
            tracing::warn!(target: "gb28181::session", dialog = %id, "resend ACK failed: {}", e);
        }
        true
    }

    /// 设备离线：结束其全部会话
    pub async fn on_device_offline(self: &Arc<Self>, device_id: &str) -> usize {
        let targets: Vec<(String, bool)> = self
            .sessions
            .iter()
            .filter(|e| e.snapshot.device_id == device_id && !e.snapshot.state.is_terminal())
            .map(|e| (e.key().clone(), e.snapshot.state.is_pending()))
            .collect();
        for (stream_id, pending) in &targets {
            if *pending {
                self.update(stream_id, |e| e.cancel.cancel());
            } else {
                self.finish(stream_id, None, "device-offline").await;
            }
        }
        if !targets.is_empty() {
            tracing::info!(target: "gb28181::session", %device_id, count = targets.len(), "sessions stopped for offline device");
        }
        targets.len()
    }

    /// 设备上报 MediaStatus 121（回放/下载结束）
    pub async fn on_media_status(self: &Arc<Self>, device_id: &str, channel_id: &str) -> usize {
        let targets: Vec<String> = self
            .sessions
            .iter()
            .filter(|e| {
                e.snapshot.device_id == device_id
                    && (channel_id.is_empty() || e.snapshot.channel_id == channel_id)
                    && e.snapshot.invite_type.has_window()
                    && e.snapshot.state == SessionState::Confirmed
            })
            .map(|e| e.key().clone())
            .collect();
        for stream_id in &targets {
            self.finish(stream_id, None, "media-status").await;
        }
        targets.len()
    }

    /// 回放控制（INFO + MANSRTSP）
    pub async fn playback_control(&self, stream_id: &str, control: PlaybackControl) -> Result<()> {
        let snapshot = self
            .snapshot(stream_id)
            .ok_or_else(|| Gb28181Error::NotFound(format!("session {}", stream_id)))?;
        if snapshot.invite_type != InviteKind::Playback {
            return Err(Gb28181Error::State(format!("{} is not a playback session", stream_id)));
        }
        if snapshot.state != SessionState::Confirmed {
            return Err(Gb28181Error::State(format!("session {} is {}", stream_id, snapshot.state)));
        }
        let dialog = snapshot
            .device_dialog
            .ok_or_else(|| Gb28181Error::State(format!("session {} has no dialog", stream_id)))?;
        let (mut req, dest) = self
            .dialogs
            .next_request(&dialog, SipMethod::Info, &self.endpoint.identity())
            .await?;
        let cseq = req.headers.cseq().map(|c| c.seq).unwrap_or(1);
        req.set_body(manscdp::RTSP_CONTENT_TYPE, control.to_body(cseq));
        self.endpoint.request_final(req, dest).await?;
        Ok(())
    }

    /// 重启后遗留的点播对话：没有会话引用，发 BYE 释放设备侧推流
    pub async fn reclaim_orphan_dialogs(&self) -> usize {
        let referenced: Vec<DialogId> = self
            .sessions
            .iter()
            .flat_map(|e| {
                [e.snapshot.device_dialog.clone(), e.snapshot.upstream_dialog.clone()]
            })
            .flatten()
            .collect();
        let orphans: Vec<DialogId> = self
            .dialogs
            .all()
            .into_iter()
            .filter(|d| !d.role.is_subscription() && d.role != crate::sip::dialog::DialogRole::Register)
            .map(|d| d.id)
            .filter(|id| !referenced.contains(id))
            .collect();
        for id in &orphans {
            self.bye_dialog(id).await;
            self.drop_dialog(id).await;
        }
        if !orphans.is_empty() {
            tracing::info!(target: "gb28181::session", count = orphans.len(), "released orphan media dialogs");
        }
        orphans.len()
    }

    /// 流状态监督：连续两次断开则拆除
    fn spawn_supervisor(self: &Arc<Self>, stream_id: String, cancel: CancellationToken) {
        let interval = self.config.media_check_interval;
        if interval.is_zero() {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            let mut misses = 0u32;
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        match this.media.stream_status(&stream_id).await {
                            Ok(status) if status.connected => misses = 0,
                            Ok(_) => {
                                misses += 1;
                                if misses >= 2 {
                                    tracing::warn!(target: "gb28181::session", %stream_id, "media stream lost");
                                    this.finish(&stream_id, None, &FailReason::MediaLost.to_string()).await;
                                    return;
                                }
                            }
                            Err(e) => tracing::debug!(target: "gb28181::session", %stream_id, "stream status failed: {}", e),
                        }
                    }
                }
            }
        });
    }

    /// 清理保留期已过的终态会话
    pub fn sweep(&self, now: Instant) -> usize {
        let retain = self.config.retain_terminal;
        let before = self.sessions.len();
        self.sessions
            .retain(|_, e| !matches!(e.ended, Some(ended) if now.duration_since(ended) >= retain));
        before - self.sessions.len()
    }

    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let removed = this.sweep(Instant::now());
                        if removed > 0 {
                            tracing::debug!(target: "gb28181::session", removed, "terminal sessions swept");
                        }
                    }
                }
            }
        });
    }
}
