// GB28181 SIP 服务器
// 入站路由：注册、心跳/查询应答、订阅通知、会话信令、级联

use crate::cascade::CascadeClient;
use crate::dispatcher::MessageDispatcher;
use crate::events::{DomainEvent, EventBus};
use crate::registry::{DeviceRegistry, RegisterOutcome};
use crate::session::SessionManager;
use crate::sip::auth::DigestAuthenticator;
use crate::sip::dialog::DialogStore;
use crate::sip::endpoint::SipEndpoint;
use crate::sip::message::{SipMessage, SipMethod, SipRequest};
use crate::sip::transport::{Destination, Inbound};
use crate::subscription::SubscriptionEngine;
use chrono::Utc;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// 入站处理的并行度与每条通道的队列长度
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub lanes: usize,
    pub lane_queue: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            lanes: 8,
            lane_queue: 256,
        }
    }
}

/// GB28181 SIP 服务器
pub struct SipServer {
    endpoint: Arc<SipEndpoint>,
    registry: Arc<DeviceRegistry>,
    dialogs: Arc<DialogStore>,
    sessions: Arc<SessionManager>,
    dispatcher: Arc<MessageDispatcher>,
    subscriptions: Arc<SubscriptionEngine>,
    cascade: Option<Arc<CascadeClient>>,
    auth: DigestAuthenticator,
    events: EventBus,
}

impl SipServer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        endpoint: Arc<SipEndpoint>,
        registry: Arc<DeviceRegistry>,
        dialogs: Arc<DialogStore>,
        sessions: Arc<SessionManager>,
        dispatcher: Arc<MessageDispatcher>,
        subscriptions: Arc<SubscriptionEngine>,
        cascade: Option<Arc<CascadeClient>>,
        events: EventBus,
    ) -> Arc<Self> {
        let auth = DigestAuthenticator::new(registry.config().realm.clone());
        Arc::new(Self {
            endpoint,
            registry,
            dialogs,
            sessions,
            dispatcher,
            subscriptions,
            cascade,
            auth,
            events,
        })
    }

    /// 启动服务器：同一 Call-ID 的消息进入同一条处理通道，保证对话内有序
    pub fn start(
        self: &Arc<Self>,
        mut inbound: mpsc::Receiver<Inbound>,
        workers: WorkerConfig,
        cancel: CancellationToken,
    ) {
        let lanes: Vec<mpsc::Sender<Inbound>> = (0..workers.lanes.max(1))
            .map(|_| {
                let (tx, mut rx) = mpsc::channel::<Inbound>(workers.lane_queue.max(1));
                let server = self.clone();
                tokio::spawn(async move {
                    while let Some(msg) = rx.recv().await {
                        server.handle(msg).await;
                    }
                });
                tx
            })
            .collect();

        let watcher_cancel = cancel.clone();
        tokio::spawn(async move {
            tracing::info!(target: "gb28181::sip", lanes = lanes.len(), "GB28181 SIP server started");
            loop {
                let msg = tokio::select! {
                    _ = cancel.cancelled() => break,
                    msg = inbound.recv() => match msg {
                        Some(msg) => msg,
                        None => break,
                    },
                };
                let lane = &lanes[lane_of(&msg, lanes.len())];
                if lane.try_send(msg).is_err() {
                    tracing::warn!(target: "gb28181::sip", "worker lane full, message dropped");
                }
            }
            tracing::info!(target: "gb28181::sip", "GB28181 SIP server stopped");
        });

        self.spawn_device_watcher(watcher_cancel);
    }

    /// 处理一条入站消息
    pub async fn handle(self: &Arc<Self>, inbound: Inbound) {
        let source = inbound.source;
        match inbound.message {
            SipMessage::Response(resp) => {
                let layer = self.endpoint.transactions();
                if let Some(stray) = layer.on_response(resp).await {
                    if !self.sessions.on_stray_response(&stray).await {
                        tracing::debug!(target: "gb28181::sip", code = stray.status_code, call_id = ?stray.headers.call_id(), "unmatched response dropped");
                    }
                }
            }
            SipMessage::Request(req) => {
                tracing::debug!(target: "gb28181::sip", remote = %source, "<<< {}", inbound.raw);
                let Some(req) = self.endpoint.transactions().on_request(req, source).await else {
                    return;
                };
                let span = tracing::info_span!("gb28181.sip.request", method = req.method.as_str(), remote = %source);
                self.route(req, source).instrument(span).await;
            }
        }
    }

    async fn route(self: &Arc<Self>, req: SipRequest, source: Destination) {
        let upstream = self.cascade.as_ref().filter(|c| c.is_upstream(&req)).cloned();

        match req.method {
            SipMethod::Register => self.handle_register(&req, source).await,
            SipMethod::Message => {
                let (code, reason) = match &upstream {
                    Some(cascade) => cascade.on_message(&req).await,
                    None => self.dispatcher.on_message(&req, source).await,
                };
                self.reply(&req, code, reason, source).await;
            }
            SipMethod::Notify => {
                let (code, reason) = self.subscriptions.on_notify(&req, source).await;
                self.reply(&req, code, reason, source).await;
            }
            SipMethod::Invite => self.handle_invite(req, source, upstream).await,
            SipMethod::Ack => {
                tracing::debug!(target: "gb28181::sip", call_id = ?req.headers.call_id(), "ACK outside any transaction");
            }
            SipMethod::Bye => {
                if let Some(id) = crate::sip::dialog::DialogId::from_incoming(&req) {
                    if let Some(seq) = req.headers.cseq().map(|c| c.seq) {
                        self.dialogs.observe_remote_seq(&id, seq);
                    }
                }
                if self.sessions.on_bye(&req).await {
                    self.reply(&req, 200, "OK", source).await;
                } else {
                    self.reply(&req, 481, "Call/Transaction Does Not Exist", source).await;
                }
            }
            SipMethod::Cancel => self.handle_cancel(&req, source, upstream).await,
            SipMethod::Options => self.reply(&req, 200, "OK", source).await,
            SipMethod::Info => self.reply(&req, 200, "OK", source).await,
            SipMethod::Subscribe => self.reply(&req, 489, "Bad Event", source).await,
        }
    }

    async fn reply(&self, req: &SipRequest, code: u16, reason: &str, dest: Destination) {
        if let Err(e) = self.endpoint.reply(req, code, reason, dest).await {
            tracing::warn!(target: "gb28181::sip", code, "failed to send response: {}", e);
        }
    }

    async fn handle_register(self: &Arc<Self>, req: &SipRequest, source: Destination) {
        let device_id = req.from_user().unwrap_or_default().to_string();
        let span = tracing::info_span!("gb28181.sip.register", %device_id, remote = %source);
        async {
            let outcome = match self.registry.register(req, source, &self.auth, Instant::now()).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::warn!(target: "gb28181::sip", "REGISTER failed: {}", e);
                    let (code, reason) = crate::dispatcher::reply_code(&e);
                    self.reply(req, code, reason, source).await;
                    return;
                }
            };

            match outcome {
                RegisterOutcome::Registered {
                    expires,
                    first_online,
                    ..
                } => {
                    let mut resp = self.endpoint.response(req, 200, "OK");
                    resp.add_header("Expires", expires.to_string());
                    resp.add_header("Date", Utc::now().format("%Y-%m-%dT%H:%M:%S%.3f").to_string());
                    if let Some(contact) = req.headers.get("Contact") {
                        resp.add_header("Contact", contact);
                    }
                    if let Err(e) = self.endpoint.respond(req, resp, source).await {
                        tracing::warn!(target: "gb28181::sip", "failed to answer REGISTER: {}", e);
                    }
                    if first_online {
                        self.spawn_initial_queries(&device_id);
                    }
                }
                RegisterOutcome::Unregistered { .. } => {
                    self.reply(req, 200, "OK", source).await;
                }
                RegisterOutcome::Challenge(www) => {
                    let mut resp = self.endpoint.response(req, 401, "Unauthorized");
                    resp.add_header("WWW-Authenticate", www);
                    if let Err(e) = self.endpoint.respond(req, resp, source).await {
                        tracing::warn!(target: "gb28181::sip", "failed to send challenge: {}", e);
                    }
                }
                RegisterOutcome::Reject(reason) => {
                    tracing::warn!(target: "gb28181::sip", %reason, "REGISTER rejected");
                    self.reply(req, 403, "Forbidden", source).await;
                }
            }
        }
        .instrument(span)
        .await
    }

    /// 设备首次上线：查询设备信息和目录
    fn spawn_initial_queries(&self, device_id: &str) {
        let dispatcher = self.dispatcher.clone();
        let device_id = device_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = dispatcher.query_device_info(&device_id).await {
                tracing::warn!(target: "gb28181::sip", %device_id, "DeviceInfo query failed: {}", e);
            }
            if let Err(e) = dispatcher.query_catalog(&device_id).await {
                tracing::warn!(target: "gb28181::sip", %device_id, "Catalog query failed: {}", e);
            }
        });
    }

    async fn handle_invite(
        self: &Arc<Self>,
        req: SipRequest,
        source: Destination,
        upstream: Option<Arc<CascadeClient>>,
    ) {
        // 对话内 re-INVITE 不支持
        if req.headers.to_tag().is_some() {
            self.reply(&req, 488, "Not Acceptable Here", source).await;
            return;
        }
        self.reply(&req, 100, "Trying", source).await;

        if let Some(cascade) = upstream {
            tokio::spawn(async move { cascade.on_invite(req, source).await });
            return;
        }
        if let Err((req, source)) = self.sessions.on_device_invite(req, source) {
            self.reply(&req, 404, "Not Found", source).await;
        }
    }

    async fn handle_cancel(&self, req: &SipRequest, source: Destination, upstream: Option<Arc<CascadeClient>>) {
        let pending = req
            .headers
            .branch()
            .and_then(|b| self.endpoint.transactions().pending_invite(b));
        let Some((invite, invite_source)) = pending else {
            self.reply(req, 481, "Call/Transaction Does Not Exist", source).await;
            return;
        };
        self.reply(req, 200, "OK", source).await;

        self.reply(&invite, 487, "Request Terminated", invite_source).await;
        if let Some(cascade) = upstream {
            let call_id = invite.headers.call_id().unwrap_or_default().to_string();
            cascade.on_cancel(&call_id).await;
        }
    }

    /// 设备上下线联动会话和订阅
    fn spawn_device_watcher(self: &Arc<Self>, cancel: CancellationToken) {
        let server = self.clone();
        let mut rx = self.events.subscribe();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = rx.recv() => event,
                };
                match event {
                    Ok(DomainEvent::Offline { device }) => {
                        let stopped = server.sessions.on_device_offline(&device.device_id).await;
                        let cancelled = server.subscriptions.on_device_offline(&device.device_id).await;
                        tracing::info!(target: "gb28181::registry", device_id = %device.device_id, stopped, cancelled, "device offline");
                    }
                    Ok(DomainEvent::Online { device }) => {
                        server.subscriptions.start_device(&device.device_id);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(target: "gb28181::registry", skipped = n, "device watcher lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}

fn lane_of(msg: &Inbound, lanes: usize) -> usize {
    let call_id = match &msg.message {
        SipMessage::Request(req) => req.headers.call_id(),
        SipMessage::Response(resp) => resp.headers.call_id(),
    };
    let mut hasher = DefaultHasher::new();
    call_id.unwrap_or_default().hash(&mut hasher);
    (hasher.finish() as usize) % lanes
}
