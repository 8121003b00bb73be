// 点播 / 回放 / 下载 / 对讲 / 广播会话

mod manager;
mod relay;
mod ssrc;
mod state;
mod stream_id;
mod talk;

pub use manager::{InviteRequest, SessionConfig, SessionManager, SessionSnapshot};
pub use relay::status_for as upstream_status;
pub use ssrc::SsrcAllocator;
pub use state::{FailReason, SessionState};
pub use stream_id::{InviteKind, StreamId};

/// 会话测试用的本地信令环境：真实 UDP 端点 + 模拟设备
#[cfg(test)]
pub(crate) mod testkit {
    use super::*;
    use crate::events::EventBus;
    use crate::media::mock::MockMediaServer;
    use crate::registry::{CatalogEntry, Channel, DeviceRegistry, RegistryConfig};
    use crate::sip::auth::DigestAuthenticator;
    use crate::sip::dialog::DialogStore;
    use crate::sip::endpoint::{LocalIdentity, SipEndpoint};
    use crate::sip::message::{SipMessage, SipMethod, SipRequest, SipResponse};
    use crate::sip::transaction::{TransactionLayer, Timers};
    use crate::sip::transport::{Destination, SipTransport};
    use crate::store::Store;
    use std::fmt::Display;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::UdpSocket;
    use tokio::time::Instant;

    pub const PLATFORM: &str = "34020000002000000001";
    pub const DEVICE: &str = "34020000001320000001";
    pub const CHANNEL: &str = "34020000001310000001";

    pub struct MockDevice {
        pub socket: UdpSocket,
        pub server: SocketAddr,
    }

    impl MockDevice {
        pub fn addr(&self) -> SocketAddr {
            self.socket.local_addr().unwrap()
        }

        pub async fn recv(&self) -> SipMessage {
            let mut buf = vec![0u8; 65535];
            let (n, _) = tokio::time::timeout(Duration::from_secs(5), self.socket.recv_from(&mut buf))
                .await
                .expect("device recv timeout")
                .unwrap();
            SipMessage::from_string(std::str::from_utf8(&buf[..n]).unwrap()).unwrap()
        }

        /// 跳过响应，返回下一条请求
        pub async fn recv_request(&self) -> SipRequest {
            loop {
                if let SipMessage::Request(req) = self.recv().await {
                    return req;
                }
            }
        }

        /// 等待指定方法的请求（跳过重传和其他请求）
        pub async fn expect(&self, method: SipMethod) -> SipRequest {
            loop {
                let req = self.recv_request().await;
                if req.method == method {
                    return req;
                }
            }
        }

        pub async fn send(&self, msg: impl Display) {
            self.socket
                .send_to(msg.to_string().as_bytes(), self.server)
                .await
                .unwrap();
        }

        pub fn response(&self, req: &SipRequest, code: u16, reason: &str) -> SipResponse {
            let mut resp = SipResponse::from_request(req, code, reason);
            if code > 100 && resp.headers.to_tag().is_none() {
                resp = resp.with_to_tag("dev-tag-1");
            }
            resp.add_header("Contact", format!("<sip:{}@{}>", DEVICE, self.addr()));
            resp
        }

        pub async fn reply(&self, req: &SipRequest, code: u16, reason: &str) {
            let resp = self.response(req, code, reason);
            self.send(resp).await;
        }

        /// 以 SDP 应答 INVITE
        pub async fn answer(&self, invite: &SipRequest) -> SipResponse {
            let mut resp = self.response(invite, 200, "OK");
            resp.set_body("APPLICATION/SDP", device_sdp(self.addr().ip().to_string(), 15060));
            self.send(&resp).await;
            resp
        }
    }

    pub fn device_sdp(ip: String, port: u16) -> String {
        format!(
            "v=0\r\no={} 0 0 IN IP4 {ip}\r\ns=Play\r\nc=IN IP4 {ip}\r\nt=0 0\r\nm=video {port} RTP/AVP 96\r\na=sendonly\r\na=rtpmap:96 PS/90000\r\ny=0100000001\r\n",
            DEVICE,
            ip = ip,
            port = port
        )
    }

    pub struct Harness {
        pub manager: Arc<SessionManager>,
        pub media: Arc<MockMediaServer>,
        pub registry: Arc<DeviceRegistry>,
        pub endpoint: Arc<SipEndpoint>,
        pub dialogs: Arc<DialogStore>,
        pub events: EventBus,
        pub store: Store,
        pub device: MockDevice,
    }

    pub async fn harness(config: SessionConfig, media: MockMediaServer) -> Harness {
        let store = Store::memory().await.unwrap();
        let (transport, mut rx) = SipTransport::bind("127.0.0.1:0".parse().unwrap(), 64)
            .await
            .unwrap();
        let server = transport.local_addr();
        let layer = TransactionLayer::new(transport, Timers::default());
        let identity = LocalIdentity {
            id: PLATFORM.to_string(),
            realm: "3402000000".to_string(),
            host: "127.0.0.1".to_string(),
            port: server.port(),
        };
        let endpoint = SipEndpoint::new(layer, identity, "127.0.0.1".parse().unwrap(), false);

        let events = EventBus::new(64);
        let registry = Arc::new(DeviceRegistry::new(
            RegistryConfig::default(),
            Some(store.clone()),
            events.clone(),
        ));
        let device = MockDevice {
            socket: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
            server,
        };

        let mut register = SipRequest::new(SipMethod::Register, format!("sip:{}@3402000000", PLATFORM));
        register.add_header("Via", format!("SIP/2.0/UDP {};branch=z9hG4bKreg1", device.addr()));
        register.add_header("From", format!("<sip:{}@3402000000>;tag=r1", DEVICE));
        register.add_header("To", format!("<sip:{}@3402000000>", DEVICE));
        register.add_header("Call-ID", "reg-1@127.0.0.1");
        register.add_header("CSeq", "1 REGISTER");
        register.add_header("Contact", format!("<sip:{}@{}>", DEVICE, device.addr()));
        register.add_header("Expires", "3600");
        registry
            .register(
                &register,
                Destination::udp(device.addr()),
                &DigestAuthenticator::new("3402000000"),
                Instant::now(),
            )
            .await
            .unwrap();
        registry
            .apply_catalog(
                DEVICE,
                vec![CatalogEntry {
                    channel: Channel::new(DEVICE, CHANNEL),
                    event: None,
                }],
            )
            .await
            .unwrap();

        let dialogs = Arc::new(DialogStore::new(Some(store.clone())));
        let media = Arc::new(media);
        let manager = SessionManager::new(
            config,
            endpoint.clone(),
            dialogs.clone(),
            registry.clone(),
            media.clone(),
            events.clone(),
            Some(store.clone()),
        );

        // 简化的入站路由：响应交给事务层，BYE 交给会话管理
        let pump = manager.clone();
        let layer = endpoint.transactions().clone();
        let pump_endpoint = endpoint.clone();
        tokio::spawn(async move {
            while let Some(inbound) = rx.recv().await {
                match inbound.message {
                    SipMessage::Response(resp) => {
                        if let Some(stray) = layer.on_response(resp).await {
                            pump.on_stray_response(&stray).await;
                        }
                    }
                    SipMessage::Request(req) => {
                        let Some(req) = layer.on_request(req, inbound.source).await else {
                            continue;
                        };
                        match req.method {
                            SipMethod::Bye => {
                                let code = if pump.on_bye(&req).await { 200 } else { 481 };
                                let _ = pump_endpoint.reply(&req, code, "OK", inbound.source).await;
                            }
                            SipMethod::Invite => {
                                let _ = pump_endpoint.reply(&req, 100, "Trying", inbound.source).await;
                                if let Err((req, source)) = pump.on_device_invite(req, inbound.source) {
                                    let _ = pump_endpoint.reply(&req, 404, "Not Found", source).await;
                                }
                            }
                            SipMethod::Ack => {}
                            _ => {
                                let _ = pump_endpoint.reply(&req, 200, "OK", inbound.source).await;
                            }
                        }
                    }
                }
            }
        });

        Harness {
            manager,
            media,
            registry,
            endpoint,
            dialogs,
            events,
            store,
            device,
        }
    }

    /// 等待会话进入终态
    pub async fn wait_terminal(manager: &SessionManager, stream_id: &str) -> SessionSnapshot {
        for _ in 0..100 {
            if let Some(snapshot) = manager.snapshot(stream_id) {
                if snapshot.state.is_terminal() {
                    return snapshot;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("session {} did not terminate", stream_id);
    }

    pub fn fast_config() -> SessionConfig {
        SessionConfig {
            invite_timeout: Duration::from_millis(400),
            cancel_grace: Duration::from_millis(200),
            media_check_interval: Duration::ZERO,
            ..Default::default()
        }
    }
}
