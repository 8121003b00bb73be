// 语音广播 / 对讲：平台先发 Broadcast 通知，设备再以 UAC 身份发起 INVITE

use super::manager::{SessionManager, SessionSnapshot};
use super::state::{FailReason, SessionState};
use super::stream_id::{InviteKind, StreamId};
use crate::events::DomainEvent;
use crate::manscdp;
use crate::media::StartSendRtp;
use crate::sdp::{SdpSession, SetupType};
use crate::sip::dialog::Dialog;
use crate::sip::message::{SipMethod, SipRequest};
use crate::sip::transport::Destination;
use crate::{Gb28181Error, Result};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// 应答方的 TCP 角色与提议方相反
pub(super) fn answer_setup(offer: SetupType) -> SetupType {
    match offer {
        SetupType::Udp => SetupType::Udp,
        SetupType::TcpActive => SetupType::TcpPassive,
        SetupType::TcpPassive => SetupType::TcpActive,
    }
}

impl SessionManager {
    pub(super) async fn run_device_initiated(
        self: &Arc<Self>,
        stream_id: &str,
        stream: &StreamId,
        dest: Destination,
        setup: SetupType,
        ssrc: &str,
        cancel: CancellationToken,
    ) -> Result<SessionSnapshot> {
        self.transition(stream_id, SessionState::NegotiatingMediaServer)?;
        if stream.kind == InviteKind::Talk {
            // 对讲需要同时接收设备上行音频
            match self.media.open_stream(stream_id, setup, ssrc).await {
                Ok(port) => self.update(stream_id, |e| e.snapshot.media_port = Some(port)),
                Err(e) => {
                    self.fail(stream_id, FailReason::MediaServer).await;
                    return Err(e);
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        self.device_invites
            .insert(stream.channel_id.clone(), (stream_id.to_string(), tx));

        let identity = self.endpoint.identity();
        let mut notify = self
            .endpoint
            .new_request(SipMethod::Message, &stream.device_id, dest);
        notify.set_body(
            manscdp::CONTENT_TYPE,
            manscdp::broadcast_notify(self.next_sn(), &identity.id, &stream.channel_id),
        );
        self.transition(stream_id, SessionState::Inviting)?;
        if let Err(e) = self.endpoint.request_final(notify, dest).await {
            self.device_invites.remove(&stream.channel_id);
            self.fail(stream_id, FailReason::from_error(&e)).await;
            return Err(e);
        }

        let incoming = tokio::select! {
            _ = cancel.cancelled() => {
                self.device_invites.remove(&stream.channel_id);
                self.finish(stream_id, None, "cancelled").await;
                return Err(Gb28181Error::State(format!("session {} cancelled", stream_id)));
            }
            _ = tokio::time::sleep(self.config.invite_timeout) => {
                self.device_invites.remove(&stream.channel_id);
                self.fail(stream_id, FailReason::Timeout).await;
                return Err(Gb28181Error::Timeout(format!("device INVITE for {}", stream_id)));
            }
            incoming = rx => incoming.map_err(|_| Gb28181Error::State(format!("waiter for {} dropped", stream_id))),
        };
        let (invite, source) = match incoming {
            Ok(incoming) => incoming,
            Err(e) => {
                self.fail(stream_id, FailReason::Transport).await;
                return Err(e);
            }
        };
        self.answer_device_invite(stream_id, stream, &invite, source, cancel)
            .await
    }

    /// 路由层收到设备 INVITE 时调用；不属于等待中的对讲/广播则原样返回
    pub fn on_device_invite(
        &self,
        invite: SipRequest,
        source: Destination,
    ) -> std::result::Result<(), (SipRequest, Destination)> {
        let key = invite
            .from_user()
            .filter(|user| self.device_invites.contains_key(*user))
            .map(str::to_string)
            .or_else(|| {
                invite
                    .headers
                    .get("Subject")
                    .and_then(|s| s.split(':').next())
                    .map(|s| s.trim().to_string())
            });
        let waiter = key.and_then(|k| self.device_invites.remove(&k));
        match waiter {
            Some((_, (stream_id, tx))) => {
                tracing::debug!(target: "gb28181::session", %stream_id, "device INVITE received");
                tx.send((invite, source))
            }
            None => Err((invite, source)),
        }
    }

    async fn answer_device_invite(
        self: &Arc<Self>,
        stream_id: &str,
        stream: &StreamId,
        invite: &SipRequest,
        source: Destination,
        cancel: CancellationToken,
    ) -> Result<SessionSnapshot> {
        let offer = match invite.body.as_deref().map(SdpSession::from_string) {
            Some(Ok(offer)) => offer,
            Some(Err(e)) => {
                let _ = self.endpoint.reply(invite, 488, "Not Acceptable Here", source).await;
                self.fail(stream_id, FailReason::Parse).await;
                return Err(e);
            }
            None => {
                let _ = self.endpoint.reply(invite, 488, "Not Acceptable Here", source).await;
                self.fail(stream_id, FailReason::Parse).await;
                return Err(Gb28181Error::Parse("device INVITE without SDP".to_string()));
            }
        };
        let Some(media) = offer.primary_media() else {
            let _ = self.endpoint.reply(invite, 488, "Not Acceptable Here", source).await;
            self.fail(stream_id, FailReason::Parse).await;
            return Err(Gb28181Error::Parse("device SDP without media".to_string()));
        };
        let offer_setup = media.setup();
        let snapshot = self
            .snapshot(stream_id)
            .ok_or_else(|| Gb28181Error::NotFound(format!("session {}", stream_id)))?;
        let ssrc = offer.ssrc.clone().unwrap_or_else(|| snapshot.ssrc.clone());

        // 媒体服务器向设备推送平台音频
        let send = StartSendRtp {
            stream_id: stream_id.to_string(),
            ssrc: ssrc.clone(),
            dst_host: offer.address.clone(),
            dst_port: media.port,
            is_udp: !offer_setup.is_tcp(),
        };
        let local_port = match self.media.start_send_rtp(&send).await {
            Ok(port) => port,
            Err(e) => {
                let _ = self.endpoint.reply(invite, 500, "Server Internal Error", source).await;
                self.fail(stream_id, FailReason::MediaServer).await;
                return Err(e);
            }
        };
        self.update(stream_id, |e| e.relaying = true);

        let identity = self.endpoint.identity();
        let (port, direction) = match stream.kind {
            InviteKind::Talk => (snapshot.media_port.unwrap_or(local_port), "sendrecv"),
            _ => (local_port, "sendonly"),
        };
        let mut answer = SdpSession::new(identity.id.clone(), stream.kind.session_name(), self.media.media_ip());
        answer.add_audio(port, answer_setup(offer_setup), direction);
        answer.ssrc = Some(ssrc);

        let mut resp = self.endpoint.response(invite, 200, "OK");
        resp.add_header("Contact", identity.contact());
        resp.set_body("APPLICATION/SDP", answer.to_string());
        let local_tag = resp.headers.to_tag().unwrap_or_default().to_string();
        let dialog = match Dialog::from_uas_request(stream.kind.dialog_role(), &stream.device_id, invite, &local_tag, source) {
            Ok(dialog) => dialog,
            Err(e) => {
                self.fail(stream_id, FailReason::Parse).await;
                return Err(e);
            }
        };

        if let Err(e) = self
            .endpoint
            .transactions()
            .respond_await_ack(invite, resp, source)
            .await
        {
            tracing::warn!(target: "gb28181::session", %stream_id, "device never acknowledged 200: {}", e);
            self.fail(stream_id, FailReason::from_error(&e)).await;
            return Err(e);
        }

        let dialog_id = dialog.id.clone();
        if let Err(e) = self.dialogs.insert(dialog).await {
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
        tracing::info!(target: "gb28181::session", %stream_id, kind = %stream.kind, "audio session confirmed");
        self.events.publish(DomainEvent::Invite {
            session: snapshot.clone(),
        });
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testkit::*;
    use super::super::InviteRequest;
    use super::*;
    use crate::media::mock::MockMediaServer;
    use crate::sip::message::SipMessage;
    use std::time::Duration;

    #[tokio::test]
    async fn test_broadcast_answers_device_invite() {
        let mut config = fast_config();
        config.invite_timeout = Duration::from_secs(3);
        let h = harness(config, MockMediaServer::new(30000)).await;
        let manager = h.manager.clone();
        let mut req = InviteRequest::play(DEVICE, CHANNEL);
        req.invite_type = InviteKind::Broadcast;
        let task = tokio::spawn(async move { manager.invite(req).await });

        let notify = h.device.expect(SipMethod::Message).await;
        assert!(notify.body.as_deref().unwrap().contains("<CmdType>Broadcast</CmdType>"));
        h.device.reply(&notify, 200, "OK").await;

        let mut invite = SipRequest::new(SipMethod::Invite, format!("sip:{}@{}", PLATFORM, h.device.server));
        invite.add_header("Via", format!("SIP/2.0/UDP {};branch=z9hG4bKbc1", h.device.addr()));
        invite.add_header("From", format!("<sip:{}@3402000000>;tag=bc1", CHANNEL));
        invite.add_header("To", format!("<sip:{}@3402000000>", PLATFORM));
        invite.add_header("Call-ID", "bc-1@127.0.0.1");
        invite.add_header("CSeq", "1 INVITE");
        invite.add_header("Contact", format!("<sip:{}@{}>", CHANNEL, h.device.addr()));
        invite.set_body(
            "APPLICATION/SDP",
            "v=0\r\no=ch 0 0 IN IP4 127.0.0.1\r\ns=Play\r\nc=IN IP4 127.0.0.1\r\nt=0 0\r\nm=audio 8000 RTP/AVP 8\r\na=recvonly\r\na=rtpmap:8 PCMA/8000\r\ny=0100000009\r\n",
        );
        h.device.send(&invite).await;

        let ok = loop {
            if let SipMessage::Response(resp) = h.device.recv().await {
                if resp.status_code == 200 {
                    break resp;
                }
            }
        };
        let body = ok.body.clone().unwrap();
        assert!(body.contains("m=audio 30001 RTP/AVP 8"));
        assert!(body.contains("a=sendonly"));
        assert!(body.contains("y=0100000009"));

        let mut ack = SipRequest::new(SipMethod::Ack, format!("sip:{}@{}", PLATFORM, h.device.server));
        ack.add_header("Via", format!("SIP/2.0/UDP {};branch=z9hG4bKbc2", h.device.addr()));
        ack.add_header("From", invite.headers.get("From").unwrap());
        ack.add_header("To", ok.headers.get("To").unwrap());
        ack.add_header("Call-ID", "bc-1@127.0.0.1");
        ack.add_header("CSeq", "1 ACK");
        h.device.send(&ack).await;

        let snapshot = task.await.unwrap().unwrap();
        assert_eq!(snapshot.state, SessionState::Confirmed);
        assert!(snapshot.stream_id.ends_with(".broadcast"));
        assert!(h
            .media
            .calls()
            .contains(&format!("send {} 127.0.0.1:8000", snapshot.stream_id)));

        h.manager.stop(&snapshot.stream_id).await.unwrap();
        assert!(h.media.calls().contains(&format!("stop_send {}", snapshot.stream_id)));
        let bye = h.device.expect(SipMethod::Bye).await;
        assert_eq!(bye.headers.call_id(), Some("bc-1@127.0.0.1"));
    }

    #[tokio::test]
    async fn test_unexpected_device_invite_is_returned() {
        let h = harness(fast_config(), MockMediaServer::new(30000)).await;
        let mut invite = SipRequest::new(SipMethod::Invite, format!("sip:{}@127.0.0.1", PLATFORM));
        invite.add_header("From", format!("<sip:{}@3402000000>;tag=x", CHANNEL));
        let source = Destination::udp(h.device.addr());
        assert!(h.manager.on_device_invite(invite, source).is_err());
    }

    #[test]
    fn test_answer_setup_is_reversed() {
        assert_eq!(answer_setup(SetupType::Udp), SetupType::Udp);
        assert_eq!(answer_setup(SetupType::TcpActive), SetupType::TcpPassive);
        assert_eq!(answer_setup(SetupType::TcpPassive), SetupType::TcpActive);
    }
}
