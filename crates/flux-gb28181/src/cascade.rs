// 级联：作为下级平台向上级注册、心跳、上报目录，并承接上级点播

use crate::manscdp::{self, RootKind};
use crate::registry::{Channel, DeviceRegistry};
use crate::session::SessionManager;
use crate::sip::auth::{ChallengeCache, DigestChallenge};
use crate::sip::endpoint::{domain_of, SipEndpoint, USER_AGENT};
use crate::sip::message::{new_branch, new_call_id, new_tag, CSeq, SipMethod, SipRequest, SipResponse};
use crate::sip::transport::{Destination, TransportKind};
use crate::{Gb28181Error, Result};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// 连续心跳失败多少次后重新注册
const KEEPALIVE_MAX_FAILURES: u32 = 3;

#[derive(Debug, Clone)]
pub struct CascadeConfig {
    pub server_id: String,
    pub server_realm: String,
    pub server_host: String,
    pub server_port: u16,
    pub transport: TransportKind,
    /// 向上级呈现的编码，为空时使用本平台编码
    pub local_id: String,
    pub password: Option<String>,
    pub register_expires: u32,
    pub keepalive_interval: Duration,
    pub catalog_page_size: usize,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            server_id: String::new(),
            server_realm: String::new(),
            server_host: String::new(),
            server_port: 5060,
            transport: TransportKind::Udp,
            local_id: String::new(),
            password: None,
            register_expires: 3600,
            keepalive_interval: Duration::from_secs(60),
            catalog_page_size: 20,
        }
    }
}

pub struct CascadeClient {
    config: CascadeConfig,
    endpoint: Arc<SipEndpoint>,
    registry: Arc<DeviceRegistry>,
    sessions: Arc<SessionManager>,
    challenges: ChallengeCache,
    registered: AtomicBool,
    /// REGISTER 刷新沿用同一 Call-ID / From tag
    call_id: String,
    from_tag: String,
    cseq: AtomicU32,
    sn: AtomicU32,
    reregister: Notify,
}

impl CascadeClient {
    pub fn new(
        config: CascadeConfig,
        endpoint: Arc<SipEndpoint>,
        registry: Arc<DeviceRegistry>,
        sessions: Arc<SessionManager>,
    ) -> Arc<Self> {
        let call_id = new_call_id(&endpoint.identity().host);
        Arc::new(Self {
            config,
            endpoint,
            registry,
            sessions,
            challenges: ChallengeCache::new(),
            registered: AtomicBool::new(false),
            call_id,
            from_tag: new_tag(),
            cseq: AtomicU32::new(1),
            sn: AtomicU32::new(1),
            reregister: Notify::new(),
        })
    }

    pub fn server_id(&self) -> &str {
        &self.config.server_id
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Relaxed)
    }

    /// 请求是否来自上级平台
    pub fn is_upstream(&self, req: &SipRequest) -> bool {
        req.from_user() == Some(self.config.server_id.as_str())
    }

    fn local_id(&self) -> String {
        if self.config.local_id.is_empty() {
            self.endpoint.identity().id.clone()
        } else {
            self.config.local_id.clone()
        }
    }

    fn realm(&self) -> &str {
        if self.config.server_realm.is_empty() {
            domain_of(&self.config.server_id)
        } else {
            &self.config.server_realm
        }
    }

    async fn destination(&self) -> Result<Destination> {
        let target = format!("{}:{}", self.config.server_host, self.config.server_port);
        let addr = tokio::net::lookup_host(&target)
            .await?
            .next()
            .ok_or_else(|| Gb28181Error::Transport(format!("cannot resolve {}", target)))?;
        Ok(Destination {
            addr,
            transport: self.config.transport,
        })
    }

    fn register_request(&self, dest: Destination, expires: u32) -> SipRequest {
        let identity = self.endpoint.identity();
        let local = self.local_id();
        let aor = format!("<sip:{}@{}>", local, domain_of(&local));
        let uri = format!("sip:{}@{}", self.config.server_id, self.realm());

        let mut req = SipRequest::new(SipMethod::Register, uri.clone());
        req.add_header("Via", identity.via(dest.transport, &new_branch()));
        req.add_header("From", format!("{};tag={}", aor, self.from_tag));
        req.add_header("To", aor);
        req.add_header("Call-ID", self.call_id.clone());
        req.add_header(
            "CSeq",
            CSeq {
                seq: self.cseq.fetch_add(1, Ordering::Relaxed),
                method: SipMethod::Register,
            }
            .to_string(),
        );
        req.add_header("Contact", format!("<sip:{}@{}:{}>", local, identity.host, identity.port));
        req.add_header("Max-Forwards", "70");
        req.add_header("User-Agent", USER_AGENT);
        req.add_header("Expires", expires.to_string());
        if let Some(password) = &self.config.password {
            if let Some(auth) = self.challenges.authorization(
                &self.config.server_id,
                "REGISTER",
                &uri,
                &local,
                password,
            ) {
                req.add_header("Authorization", auth);
            }
        }
        req
    }

    /// 注册一次；401 时带凭证重试一次，返回上级确认的有效期
    pub async fn register(&self, expires: u32) -> Result<u32> {
        let dest = self.destination().await?;
        let mut challenged = false;
        loop {
            let req = self.register_request(dest, expires);
            let mut tx = self.endpoint.send(req, dest).await?;
            let resp = tx.final_response().await?;
            match resp.status_code {
                200..=299 => {
                    let granted = granted_expires(&resp).unwrap_or(expires);
                    let was = self.registered.swap(expires > 0, Ordering::Relaxed);
                    if expires > 0 && !was {
                        tracing::info!(target: "gb28181::cascade", server = %self.config.server_id, granted, "registered to upstream");
                    } else if expires == 0 {
                        tracing::info!(target: "gb28181::cascade", server = %self.config.server_id, "unregistered from upstream");
                    }
                    return Ok(granted);
                }
                401 | 407 if !challenged && self.config.password.is_some() => {
                    let header = if resp.status_code == 401 { "WWW-Authenticate" } else { "Proxy-Authenticate" };
                    let challenge = resp
                        .headers
                        .get(header)
                        .and_then(DigestChallenge::parse)
                        .ok_or_else(|| Gb28181Error::Parse(format!("{} without usable challenge", resp.status_code)))?;
                    self.challenges.store(&self.config.server_id, challenge);
                    challenged = true;
                }
                401 | 403 | 407 => {
                    self.registered.store(false, Ordering::Relaxed);
                    self.challenges.clear(&self.config.server_id);
                    return Err(Gb28181Error::Auth(format!(
                        "upstream {} rejected REGISTER: {} {}",
                        self.config.server_id, resp.status_code, resp.reason_phrase
                    )));
                }
                code => {
                    self.registered.store(false, Ordering::Relaxed);
                    return Err(Gb28181Error::Device {
                        code,
                        reason: resp.reason_phrase.clone(),
                    });
                }
            }
        }
    }

    /// 心跳 MESSAGE
    pub async fn keepalive(&self) -> Result<()> {
        let dest = self.destination().await?;
        let local = self.local_id();
        let sn = self.sn.fetch_add(1, Ordering::Relaxed);
        let req = self.message_request(dest, manscdp::keepalive_notify(sn, &local));
        self.endpoint.request_final(req, dest).await?;
        Ok(())
    }

    fn message_request(&self, dest: Destination, body: String) -> SipRequest {
        let local = self.local_id();
        let mut req = self
            .endpoint
            .new_request(SipMethod::Message, &self.config.server_id, dest);
        req.uri = format!("sip:{}@{}", self.config.server_id, self.realm());
        req.headers.set("From", format!("<sip:{}@{}>;tag={}", local, domain_of(&local), new_tag()));
        req.set_body(manscdp::CONTENT_TYPE, body);
        req
    }

    /// 注册刷新与心跳任务
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) {
        let client = self.clone();
        let token = cancel.clone();
        tokio::spawn(async move {
            let retry = client.config.keepalive_interval.min(Duration::from_secs(30));
            loop {
                let wait = match client.register(client.config.register_expires).await {
                    Ok(granted) => Duration::from_secs(u64::from(granted.max(2)) / 2),
                    Err(e) => {
                        tracing::warn!(target: "gb28181::cascade", server = %client.config.server_id, "register failed: {}", e);
                        retry
                    }
                };
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = client.reregister.notified() => {}
                    _ = tokio::time::sleep(wait) => {}
                }
            }
            if client.is_registered() {
                if let Err(e) = client.register(0).await {
                    tracing::debug!(target: "gb28181::cascade", "unregister failed: {}", e);
                }
            }
        });

        let client = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(client.config.keepalive_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            let mut failures = 0u32;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if !client.is_registered() {
                    continue;
                }
                match client.keepalive().await {
                    Ok(()) => failures = 0,
                    Err(e) => {
                        failures += 1;
                        tracing::warn!(target: "gb28181::cascade", failures, "upstream keepalive failed: {}", e);
                        if failures >= KEEPALIVE_MAX_FAILURES {
                            failures = 0;
                            client.registered.store(false, Ordering::Relaxed);
                            client.reregister.notify_one();
                        }
                    }
                }
            }
        });
    }

    /// 上级发来的 MESSAGE：查询类先应答 200，结果随后以 MESSAGE 上报
    pub async fn on_message(self: &Arc<Self>, req: &SipRequest) -> (u16, &'static str) {
        let Some(body) = req.body.as_deref() else {
            return (400, "Bad Request");
        };
        let msg = match manscdp::parse(body) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(target: "gb28181::cascade", "bad upstream MESSAGE: {}", e);
                return (400, "Bad Request");
            }
        };
        if manscdp::root_kind(body) != Some(RootKind::Query) {
            tracing::debug!(target: "gb28181::cascade", cmd = %msg.cmd_type, "upstream notify ignored");
            return (200, "OK");
        }

        let sn = msg.sn.unwrap_or(0);
        let client = self.clone();
        let cmd = msg.cmd_type.clone();
        tokio::spawn(async move {
            let result = match cmd.as_str() {
                "Catalog" => client.report_catalog(sn).await.map(|_| ()),
                "DeviceInfo" => client.answer(manscdp::device_info_response(sn, &client.local_id(), "flux-gb28181")).await,
                "DeviceStatus" => client.answer(manscdp::device_status_response(sn, &client.local_id())).await,
                other => {
                    tracing::debug!(target: "gb28181::cascade", cmd = other, "upstream query not supported");
                    Ok(())
                }
            };
            if let Err(e) = result {
                tracing::warn!(target: "gb28181::cascade", %cmd, sn, "answering upstream query failed: {}", e);
            }
        });
        (200, "OK")
    }

    async fn answer(&self, body: String) -> Result<()> {
        let dest = self.destination().await?;
        let req = self.message_request(dest, body);
        self.endpoint.request_final(req, dest).await?;
        Ok(())
    }

    /// 本平台目录，按页上报
    pub async fn report_catalog(&self, sn: u32) -> Result<usize> {
        let channels = self.catalog();
        let local = self.local_id();
        let page_size = self.config.catalog_page_size.max(1);
        if channels.is_empty() {
            self.answer(manscdp::catalog_response(sn, &local, 0, &[])).await?;
            return Ok(0);
        }
        for page in channels.chunks(page_size) {
            self.answer(manscdp::catalog_response(sn, &local, channels.len(), page)).await?;
        }
        tracing::info!(target: "gb28181::cascade", sn, channels = channels.len(), "catalog reported to upstream");
        Ok(channels.len())
    }

    fn catalog(&self) -> Vec<Channel> {
        self.registry
            .list_devices()
            .into_iter()
            .flat_map(|device| {
                let online = device.is_online();
                self.registry
                    .channels(&device.device_id)
                    .into_iter()
                    .map(move |mut ch| {
                        ch.status = ch.effective_status(online);
                        ch
                    })
            })
            .collect()
    }

    /// 上级 INVITE：转给会话管理做级联点播
    pub async fn on_invite(self: &Arc<Self>, req: SipRequest, source: Destination) {
        let call_id = req.headers.call_id().unwrap_or_default().to_string();
        match self
            .sessions
            .on_upstream_invite(&self.config.server_id, req, source)
            .await
        {
            Ok(snapshot) => {
                tracing::info!(target: "gb28181::cascade", %call_id, stream_id = %snapshot.stream_id, "upstream session established")
            }
            Err(e) => tracing::warn!(target: "gb28181::cascade", %call_id, "upstream session failed: {}", e),
        }
    }

    pub async fn on_cancel(self: &Arc<Self>, call_id: &str) -> bool {
        self.sessions.on_upstream_cancel(call_id).await
    }
}

/// 2xx 中的有效期：Expires 头或 Contact 的 expires 参数
fn granted_expires(resp: &SipResponse) -> Option<u32> {
    resp.headers.expires().or_else(|| {
        resp.headers
            .get("Contact")
            .and_then(|c| crate::sip::message::header_param(c, "expires"))
            .and_then(|v| v.parse().ok())
    })
}
