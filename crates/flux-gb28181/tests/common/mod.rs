// 端到端测试环境：真实 SIP 服务器 + UDP 模拟设备 + axum 模拟媒体服务器 / Webhook

#![allow(dead_code)]

use axum::extract::Path;
use axum::routing::{get, post};
use axum::{Json, Router};
use flux_gb28181::dispatcher::MessageDispatcher;
use flux_gb28181::hooks::{HookConfig, HookDispatcher};
use flux_gb28181::media::{HttpMediaServer, MediaServer};
use flux_gb28181::registry::{DeviceRegistry, RegistryConfig};
use flux_gb28181::sip::auth::{ChallengeCache, DigestChallenge};
use flux_gb28181::sip::dialog::DialogStore;
use flux_gb28181::sip::transaction::{Timers, TransactionLayer};
use flux_gb28181::sip::{LocalIdentity, SipEndpoint, SipMessage, SipMethod, SipRequest, SipResponse, SipTransport};
use flux_gb28181::store::Store;
use flux_gb28181::subscription::{SubscriptionConfig, SubscriptionEngine};
use flux_gb28181::{EventBus, SessionConfig, SessionManager, SessionSnapshot, SipServer, WorkerConfig};
use serde_json::{json, Value};
use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const PLATFORM: &str = "34020000002000000001";
pub const REALM: &str = "3402000000";
pub const DEVICE: &str = "34020000001320000001";
pub const CHANNEL: &str = "34020000001310000001";
pub const PASSWORD: &str = "12345678";
pub const MEDIA_PORT: u16 = 10000;

/// 模拟媒体服务器，记录调用序列
#[derive(Clone, Default)]
pub struct MediaCalls(Arc<Mutex<Vec<String>>>);

impl MediaCalls {
    pub fn push(&self, call: String) {
        self.0.lock().unwrap().push(call);
    }

    pub fn all(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

pub async fn spawn_media(calls: MediaCalls) -> SocketAddr {
    let open = calls.clone();
    let close = calls.clone();
    let connect = calls.clone();
    let app = Router::new()
        .route(
            "/open_rtp_server",
            post(move |Json(body): Json<Value>| {
                let calls = open.clone();
                async move {
                    calls.push(format!(
                        "open {} {}",
                        body["stream_id"].as_str().unwrap_or_default(),
                        body["setup"].as_str().unwrap_or_default()
                    ));
                    Json(json!({ "port": MEDIA_PORT }))
                }
            }),
        )
        .route(
            "/connect_rtp_server",
            post(move |Json(body): Json<Value>| {
                let calls = connect.clone();
                async move {
                    calls.push(format!("connect {}", body["stream_id"].as_str().unwrap_or_default()));
                    Json(json!({}))
                }
            }),
        )
        .route(
            "/close_rtp_server",
            post(move |Json(body): Json<Value>| {
                let calls = close.clone();
                async move {
                    calls.push(format!("close {}", body["stream_id"].as_str().unwrap_or_default()));
                    Json(json!({}))
                }
            }),
        )
        .route(
            "/rtp_server_status/*stream_id",
            get(|Path(_stream_id): Path<String>| async { Json(json!({ "connected": true, "bytes": 1024 })) }),
        );
    serve(app)
}

/// Webhook 接收端：按路径名转发请求体
pub async fn spawn_hook_sink() -> (SocketAddr, mpsc::UnboundedReceiver<(String, Value)>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let app = Router::new().route(
        "/hook/:name",
        post(move |Path(name): Path<String>, Json(body): Json<Value>| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((name, body));
                "ok"
            }
        }),
    );
    (serve(app), rx)
}

fn serve(app: Router) -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(axum::Server::from_tcp(listener).unwrap().serve(app.into_make_service()));
    addr
}

/// 等待指定名称的 Webhook
pub async fn next_hook(rx: &mut mpsc::UnboundedReceiver<(String, Value)>, name: &str) -> Value {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let (got, body) = tokio::time::timeout(remaining, rx.recv())
            .await
            .unwrap_or_else(|_| panic!("hook {} not delivered", name))
            .unwrap();
        if got == name {
            return body;
        }
    }
}

pub struct Options {
    pub alive_expires: Duration,
    pub invite_timeout: Duration,
    pub catalog_interval: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            alive_expires: Duration::from_secs(60),
            invite_timeout: Duration::from_secs(5),
            catalog_interval: 0,
        }
    }
}

pub struct Platform {
    pub addr: SocketAddr,
    pub registry: Arc<DeviceRegistry>,
    pub sessions: Arc<SessionManager>,
    pub subscriptions: Arc<SubscriptionEngine>,
    pub dialogs: Arc<DialogStore>,
    pub media: MediaCalls,
    pub hooks: mpsc::UnboundedReceiver<(String, Value)>,
    pub cancel: CancellationToken,
}

impl Drop for Platform {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub async fn platform(options: Options) -> Platform {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("gb28181=debug")
        .with_test_writer()
        .try_init();
    let cancel = CancellationToken::new();
    let store = Store::memory().await.unwrap();
    let events = EventBus::new(256);

    let (hook_addr, hooks) = spawn_hook_sink().await;
    let hook_url = |name: &str| Some(format!("http://{}/hook/{}", hook_addr, name));
    let hook_dispatcher = HookDispatcher::new(HookConfig {
        online: hook_url("online"),
        offline: hook_url("offline"),
        position: hook_url("position"),
        on_invite: hook_url("on_invite"),
        alarm: None,
        queue_capacity: 64,
        timeout: Some(Duration::from_secs(5)),
    })
    .unwrap();
    hook_dispatcher.spawn(&events, cancel.clone());

    let media = MediaCalls::default();
    let media_addr = spawn_media(media.clone()).await;

    let registry = Arc::new(DeviceRegistry::new(
        RegistryConfig {
            password: Some(PASSWORD.to_string()),
            alive_expires: options.alive_expires,
            ..Default::default()
        },
        Some(store.clone()),
        events.clone(),
    ));
    let dialogs = Arc::new(DialogStore::new(Some(store.clone())));

    let (transport, inbound) = SipTransport::bind("127.0.0.1:0".parse().unwrap(), 256)
        .await
        .unwrap();
    let addr = transport.local_addr();
    let endpoint = SipEndpoint::new(
        TransactionLayer::new(transport, Timers::default()),
        LocalIdentity {
            id: PLATFORM.to_string(),
            realm: REALM.to_string(),
            host: "127.0.0.1".to_string(),
            port: addr.port(),
        },
        "127.0.0.1".parse().unwrap(),
        false,
    );

    let media_server: Arc<dyn MediaServer> = Arc::new(
        HttpMediaServer::new(format!("http://{}", media_addr), "127.0.0.1", Duration::from_secs(2)).unwrap(),
    );
    let sessions = SessionManager::new(
        SessionConfig {
            invite_timeout: options.invite_timeout,
            media_check_interval: Duration::ZERO,
            cancel_grace: Duration::from_millis(200),
            ..Default::default()
        },
        endpoint.clone(),
        dialogs.clone(),
        registry.clone(),
        media_server,
        events.clone(),
        Some(store.clone()),
    );
    let dispatcher = MessageDispatcher::new(registry.clone(), sessions.clone(), endpoint.clone());
    let subscriptions = SubscriptionEngine::new(
        SubscriptionConfig {
            expires: 3600,
            catalog_interval: options.catalog_interval,
            ..Default::default()
        },
        endpoint.clone(),
        dialogs.clone(),
        registry.clone(),
        dispatcher.clone(),
        Some(store.clone()),
        cancel.clone(),
    );
    let server = SipServer::new(
        endpoint,
        registry.clone(),
        dialogs.clone(),
        sessions.clone(),
        dispatcher,
        subscriptions.clone(),
        None,
        events,
    );
    server.start(inbound, WorkerConfig::default(), cancel.clone());
    registry.spawn_reaper(cancel.clone());

    Platform {
        addr,
        registry,
        sessions,
        subscriptions,
        dialogs,
        media,
        hooks,
        cancel,
    }
}

/// UDP 模拟设备
pub struct Device {
    pub socket: UdpSocket,
    pub server: SocketAddr,
    challenges: ChallengeCache,
    cseq: Mutex<u32>,
}

impl Device {
    pub async fn new(server: SocketAddr) -> Self {
        Self {
            socket: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
            server,
            challenges: ChallengeCache::new(),
            cseq: Mutex::new(0),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.socket.local_addr().unwrap()
    }

    pub async fn send(&self, msg: impl Display) {
        self.socket
            .send_to(msg.to_string().as_bytes(), self.server)
            .await
            .unwrap();
    }

    async fn recv(&self) -> SipMessage {
        let mut buf = vec![0u8; 65535];
        let (n, _) = tokio::time::timeout(Duration::from_secs(10), self.socket.recv_from(&mut buf))
            .await
            .expect("device recv timeout")
            .unwrap();
        SipMessage::from_string(std::str::from_utf8(&buf[..n]).unwrap()).unwrap()
    }

    /// 平台主动发来的 MESSAGE（设备信息、目录查询）直接应答 200
    async fn absorb(&self, req: &SipRequest) {
        if req.method == SipMethod::Message {
            self.reply(req, 200, "OK").await;
        }
    }

    pub async fn expect(&self, method: SipMethod) -> SipRequest {
        loop {
            if let SipMessage::Request(req) = self.recv().await {
                if req.method == method {
                    return req;
                }
                self.absorb(&req).await;
            }
        }
    }

    pub async fn expect_response(&self, method: SipMethod) -> SipResponse {
        loop {
            match self.recv().await {
                SipMessage::Response(resp) => {
                    if resp.headers.cseq().map(|c| c.method == method).unwrap_or(false) {
                        return resp;
                    }
                }
                SipMessage::Request(req) => self.absorb(&req).await,
            }
        }
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
    pub async fn answer(&self, invite: &SipRequest) {
        let ip = self.addr().ip();
        let sdp = format!(
            "v=0\r\no={dev} 0 0 IN IP4 {ip}\r\ns=Play\r\nc=IN IP4 {ip}\r\nt=0 0\r\nm=video 15060 TCP/RTP/AVP 96\r\na=sendonly\r\na=rtpmap:96 PS/90000\r\na=setup:active\r\na=connection:new\r\ny=0100000001\r\n",
            dev = DEVICE,
            ip = ip
        );
        let mut resp = self.response(invite, 200, "OK");
        resp.set_body("APPLICATION/SDP", sdp);
        self.send(resp).await;
    }

    fn next_cseq(&self) -> u32 {
        let mut cseq = self.cseq.lock().unwrap();
        *cseq += 1;
        *cseq
    }

    pub fn register_request(&self, expires: u32) -> SipRequest {
        let uri = format!("sip:{}@{}", PLATFORM, REALM);
        let cseq = self.next_cseq();
        let mut req = SipRequest::new(SipMethod::Register, uri.clone());
        req.add_header(
            "Via",
            format!("SIP/2.0/UDP {};rport;branch=z9hG4bKreg{}", self.addr(), cseq),
        );
        req.add_header("From", format!("<sip:{}@{}>;tag=reg-tag", DEVICE, REALM));
        req.add_header("To", format!("<sip:{}@{}>", DEVICE, REALM));
        req.add_header("Call-ID", format!("register-{}@{}", DEVICE, self.addr().ip()));
        req.add_header("CSeq", format!("{} REGISTER", cseq));
        req.add_header("Contact", format!("<sip:{}@{}>", DEVICE, self.addr()));
        req.add_header("Max-Forwards", "70");
        req.add_header("Expires", expires.to_string());
        if let Some(auth) = self.challenges.authorization(PLATFORM, "REGISTER", &uri, DEVICE, PASSWORD) {
            req.add_header("Authorization", auth);
        }
        req
    }

    /// 完整注册流程：401 挑战后携带摘要重发
    pub async fn register(&self) -> SipResponse {
        self.send(self.register_request(3600)).await;
        let challenge = self.expect_response(SipMethod::Register).await;
        assert_eq!(challenge.status_code, 401);
        let www = challenge.headers.get("WWW-Authenticate").expect("WWW-Authenticate");
        self.challenges
            .store(PLATFORM, DigestChallenge::parse(www).expect("digest challenge"));

        self.send(self.register_request(3600)).await;
        self.expect_response(SipMethod::Register).await
    }
}

/// 等待会话进入终态
pub async fn wait_state(sessions: &SessionManager, stream_id: &str, state: &str) -> SessionSnapshot {
    for _ in 0..250 {
        if let Some(snapshot) = sessions.snapshot(stream_id) {
            if snapshot.state.to_string() == state {
                return snapshot;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("session {} never reached {}", stream_id, state);
}

pub async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..250 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {}", what);
}
