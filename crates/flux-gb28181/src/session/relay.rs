// 级联点播：上级平台 INVITE 本平台通道 → 向设备点播 → 媒体服务器转推上级

use super::manager::{InviteRequest, SessionManager, SessionSnapshot};
use super::state::SessionState;
use super::stream_id::{InviteKind, StreamId};
use super::talk::answer_setup;
use crate::media::StartSendRtp;
use crate::sdp::SdpSession;
use crate::sip::dialog::Dialog;
use crate::sip::message::{uri_user, SipRequest};
use crate::sip::transport::Destination;
use crate::{ErrorKind, Gb28181Error, Result};
use std::sync::Arc;

/// 下游失败映射为给上级的 SIP 状态码
pub fn status_for(err: &Gb28181Error) -> (u16, &'static str) {
    if let Gb28181Error::Device { code, .. } = err {
        if (400..700).contains(code) {
            return (*code, "Device Error");
        }
    }
    match err.kind() {
        ErrorKind::NotFound => (404, "Not Found"),
        ErrorKind::Duplicate => (486, "Busy Here"),
        ErrorKind::Timeout => (408, "Request Timeout"),
        ErrorKind::Parse => (488, "Not Acceptable Here"),
        ErrorKind::State => (480, "Temporarily Unavailable"),
        _ => (500, "Server Internal Error"),
    }
}

impl SessionManager {
    /// 处理上级 INVITE；所有分支都由本函数应答上级
    pub async fn on_upstream_invite(
        self: &Arc<Self>,
        upstream_id: &str,
        invite: SipRequest,
        source: Destination,
    ) -> Result<SessionSnapshot> {
        match self.relay(upstream_id, &invite, source).await {
            Ok(snapshot) => Ok(snapshot),
            Err(e) => {
                let call_id = invite.headers.call_id().unwrap_or_default().to_string();
                // 已被 CANCEL 的不再重复应答
                if self.upstream_pending.remove(&call_id).is_some() {
                    let (code, reason) = status_for(&e);
                    tracing::warn!(target: "gb28181::cascade", %call_id, code, "upstream INVITE rejected: {}", e);
                    let _ = self.endpoint.reply(&invite, code, reason, source).await;
                }
                Err(e)
            }
        }
    }

    async fn relay(
        self: &Arc<Self>,
        upstream_id: &str,
        invite: &SipRequest,
        source: Destination,
    ) -> Result<SessionSnapshot> {
        let call_id = invite
            .headers
            .call_id()
            .ok_or_else(|| Gb28181Error::Parse("INVITE without Call-ID".to_string()))?
            .to_string();
        self.upstream_pending.insert(call_id.clone(), String::new());

        let offer = SdpSession::from_string(invite.body.as_deref().unwrap_or_default())?;
        let kind = InviteKind::from_session_name(&offer.session_name)
            .filter(|k| !k.device_initiated())
            .ok_or_else(|| Gb28181Error::Parse(format!("unsupported session name {}", offer.session_name)))?;
        let media = offer
            .primary_media()
            .ok_or_else(|| Gb28181Error::Parse("upstream SDP without media".to_string()))?
            .clone();

        let channel_id = invite
            .headers
            .get("Subject")
            .and_then(|s| s.split(':').next())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .or_else(|| uri_user(&invite.uri).map(str::to_string))
            .ok_or_else(|| Gb28181Error::Parse("INVITE without target channel".to_string()))?;
        let channel = self
            .registry
            .find_channel(&channel_id)
            .ok_or_else(|| Gb28181Error::NotFound(format!("channel {}", channel_id)))?;

        let (start, end) = if kind.has_window() {
            (Some(offer.start), Some(offer.end))
        } else {
            (None, None)
        };
        let stream = StreamId::new(kind, &channel.device_id, &channel.channel_id, start, end)?;
        let stream_id = stream.to_string();
        self.upstream_pending.insert(call_id.clone(), stream_id.clone());

        // 直播复用已确认且尚未转推的下游会话
        let reusable = self.sessions.get(&stream_id).and_then(|e| {
            (e.snapshot.state == SessionState::Confirmed && e.snapshot.upstream_dialog.is_none() && !e.relaying)
                .then(|| e.snapshot.clone())
        });
        let (snapshot, created) = match reusable {
            Some(snapshot) if kind == InviteKind::Play => (snapshot, false),
            _ => {
                let snapshot = self
                    .invite(InviteRequest {
                        invite_type: kind,
                        device: channel.device_id.clone(),
                        channel: channel.channel_id.clone(),
                        start,
                        end,
                        setup: None,
                        ssrc: None,
                    })
                    .await?;
                (snapshot, true)
            }
        };

        if !self.upstream_pending.contains_key(&call_id) {
            return Err(self.abort_relay(&stream_id, created, Gb28181Error::State(format!("upstream call {} cancelled", call_id))).await);
        }

        let setup = media.setup();
        let ssrc = offer.ssrc.clone().unwrap_or_else(|| snapshot.ssrc.clone());
        let send = StartSendRtp {
            stream_id: snapshot.stream_id.clone(),
            ssrc: ssrc.clone(),
            dst_host: offer.address.clone(),
            dst_port: media.port,
            is_udp: !setup.is_tcp(),
        };
        let local_port = match self.media.start_send_rtp(&send).await {
            Ok(port) => port,
            Err(e) => return Err(self.abort_relay(&stream_id, created, e).await),
        };
        self.update(&snapshot.stream_id, |e| e.relaying = true);

        let identity = self.endpoint.identity();
        let mut answer = SdpSession::new(identity.id.clone(), offer.session_name.clone(), self.media.media_ip());
        answer.add_video(local_port, answer_setup(setup));
        answer.set_direction("sendonly");
        answer.ssrc = Some(ssrc);
        answer.start = offer.start;
        answer.end = offer.end;

        let mut resp = self.endpoint.response(invite, 200, "OK");
        resp.add_header("Contact", identity.contact());
        resp.set_body("APPLICATION/SDP", answer.to_string());
        let local_tag = resp.headers.to_tag().unwrap_or_default().to_string();
        let dialog = Dialog::from_uas_request(kind.dialog_role(), upstream_id, invite, &local_tag, source)?;

        if self.upstream_pending.remove(&call_id).is_none() {
            let _ = self.media.stop_send_rtp(&snapshot.stream_id).await;
            self.update(&snapshot.stream_id, |e| e.relaying = false);
            return Err(self.abort_relay(&stream_id, created, Gb28181Error::State(format!("upstream call {} cancelled", call_id))).await);
        }
        if let Err(e) = self
            .endpoint
            .transactions()
            .respond_await_ack(invite, resp, source)
            .await
        {
            let _ = self.media.stop_send_rtp(&snapshot.stream_id).await;
            self.update(&snapshot.stream_id, |e| e.relaying = false);
            return Err(self.abort_relay(&stream_id, created, e).await);
        }

        let dialog_id = dialog.id.clone();
        self.dialogs.insert(dialog).await?;
        self.update(&snapshot.stream_id, |e| e.snapshot.upstream_dialog = Some(dialog_id));
        tracing::info!(
            target: "gb28181::cascade",
            stream_id = %snapshot.stream_id,
            upstream = %upstream_id,
            dst = %format!("{}:{}", offer.address, media.port),
            "relaying stream to upstream"
        );
        self.snapshot(&snapshot.stream_id)
            .ok_or_else(|| Gb28181Error::NotFound(format!("session {}", snapshot.stream_id)))
    }

    /// 转推建立失败：本次新建的下游会话一并拆除
    async fn abort_relay(&self, stream_id: &str, created: bool, err: Gb28181Error) -> Gb28181Error {
        if created {
            self.finish(stream_id, None, "upstream-failed").await;
        }
        err
    }

    /// 上级取消尚未应答的 INVITE
    pub async fn on_upstream_cancel(self: &Arc<Self>, call_id: &str) -> bool {
        let Some((_, stream_id)) = self.upstream_pending.remove(call_id) else {
            return false;
        };
        tracing::info!(target: "gb28181::cascade", %call_id, %stream_id, "upstream cancelled INVITE");
        if !stream_id.is_empty() {
            let pending = self
                .sessions
                .get(&stream_id)
                .map(|e| e.snapshot.state.is_pending() && e.snapshot.upstream_dialog.is_none())
                .unwrap_or(false);
            if pending {
                let _ = self.stop(&stream_id).await;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(&Gb28181Error::NotFound("x".into())).0, 404);
        assert_eq!(status_for(&Gb28181Error::Timeout("x".into())).0, 408);
        assert_eq!(status_for(&Gb28181Error::MediaServer("x".into())).0, 500);
        assert_eq!(status_for(&Gb28181Error::Parse("x".into())).0, 488);
        assert_eq!(
            status_for(&Gb28181Error::Device {
                code: 486,
                reason: "Busy".into()
            })
            .0,
            486
        );
    }
}
