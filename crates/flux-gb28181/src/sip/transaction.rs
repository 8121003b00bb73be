// SIP 事务层（RFC 3261 §17）
// 客户端事务：重传（Timer A/E）、超时（Timer B/F）、非 2xx 自动 ACK
// 服务端事务：请求重传吸收、最终响应重传、2xx ACK 按 Call-ID + tag 匹配

use super::message::{CSeq, SipMethod, SipRequest, SipResponse};
use super::transport::{Destination, SipTransport, TransportKind};
use crate::{Gb28181Error, Result};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

/// RFC 3261 定时器
#[derive(Debug, Clone, Copy)]
pub struct Timers {
    pub t1: Duration,
    pub t2: Duration,
    pub t4: Duration,
}

impl Default for Timers {
    fn default() -> Self {
        Self {
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(4),
            t4: Duration::from_secs(5),
        }
    }
}

impl Timers {
    /// 64*T1，Timer B/F/H/J
    pub fn timeout(&self) -> Duration {
        self.t1 * 64
    }
}

/// 事务键：(branch, method)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TxKey {
    pub branch: String,
    pub method: SipMethod,
}

impl TxKey {
    pub fn from_request(req: &SipRequest) -> Option<Self> {
        let branch = req.headers.branch()?.to_string();
        // 非 2xx 的 ACK 归属 INVITE 事务
        let method = match req.method {
            SipMethod::Ack => SipMethod::Invite,
            m => m,
        };
        Some(Self { branch, method })
    }

    pub fn from_response(resp: &SipResponse) -> Option<Self> {
        Some(Self {
            branch: resp.headers.branch()?.to_string(),
            method: resp.headers.cseq()?.method,
        })
    }
}

/// 2xx ACK 匹配键：Call-ID + From tag + To tag
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AckKey {
    pub call_id: String,
    pub from_tag: String,
    pub to_tag: String,
}

impl AckKey {
    fn from_headers(headers: &super::message::Headers) -> Option<Self> {
        Some(Self {
            call_id: headers.call_id()?.to_string(),
            from_tag: headers.from_tag()?.to_string(),
            to_tag: headers.to_tag()?.to_string(),
        })
    }
}

const STATE_TRYING: u8 = 0;
const STATE_PROCEEDING: u8 = 1;
const STATE_COMPLETED: u8 = 2;

struct ClientEntry {
    events: mpsc::UnboundedSender<Result<SipResponse>>,
    state: Arc<AtomicU8>,
    stop: CancellationToken,
    request: SipRequest,
    dest: Destination,
    ack_raw: Option<String>,
    expires_at: Option<Instant>,
}

struct ServerEntry {
    request: SipRequest,
    dest: Destination,
    last_response: Option<(u16, String)>,
    stop: CancellationToken,
    expires_at: Instant,
}

struct AckWaiter {
    notify: Option<oneshot::Sender<SipRequest>>,
    stop: CancellationToken,
}

/// 客户端事务句柄，由 TU 持有并读取响应
pub struct ClientTransaction {
    key: TxKey,
    events: mpsc::UnboundedReceiver<Result<SipResponse>>,
    layer: Arc<TransactionLayer>,
    pub request: SipRequest,
    pub dest: Destination,
}

impl ClientTransaction {
    pub fn key(&self) -> &TxKey {
        &self.key
    }

    /// 下一条响应；事务结束后返回 None
    pub async fn recv(&mut self) -> Option<Result<SipResponse>> {
        self.events.recv().await
    }

    /// 跳过临时响应，等待最终响应
    pub async fn final_response(&mut self) -> Result<SipResponse> {
        while let Some(event) = self.recv().await {
            let resp = event?;
            if !resp.is_provisional() {
                return Ok(resp);
            }
        }
        Err(Gb28181Error::Transport(format!(
            "transaction {} closed without final response",
            self.key.branch
        )))
    }
}

impl Drop for ClientTransaction {
    fn drop(&mut self) {
        self.layer.abandon(&self.key);
    }
}

/// 事务层
pub struct TransactionLayer {
    transport: Arc<SipTransport>,
    timers: Timers,
    clients: DashMap<TxKey, ClientEntry>,
    servers: DashMap<TxKey, ServerEntry>,
    ack_waiters: DashMap<AckKey, AckWaiter>,
}

impl TransactionLayer {
    pub fn new(transport: Arc<SipTransport>, timers: Timers) -> Arc<Self> {
        let layer = Arc::new(Self {
            transport,
            timers,
            clients: DashMap::new(),
            servers: DashMap::new(),
            ack_waiters: DashMap::new(),
        });
        tokio::spawn(Self::sweeper(Arc::downgrade(&layer)));
        layer
    }

    pub fn timers(&self) -> Timers {
        self.timers
    }

    pub fn transport(&self) -> &Arc<SipTransport> {
        &self.transport
    }

    /// 周期清理已完成的事务
    async fn sweeper(layer: Weak<Self>) {
        let mut interval = tokio::time::interval(Duration::from_millis(500));
        loop {
            interval.tick().await;
            let Some(strong) = layer.upgrade() else { break };
            let now = Instant::now();
            strong.servers.retain(|_, e| {
                if e.expires_at <= now {
                    e.stop.cancel();
                    false
                } else {
                    true
                }
            });
            strong
                .clients
                .retain(|_, e| e.expires_at.map(|t| t > now).unwrap_or(true));
        }
    }

    /// 发起客户端事务
    pub async fn send_request(
        self: &Arc<Self>,
        req: SipRequest,
        dest: Destination,
    ) -> Result<ClientTransaction> {
        let key = TxKey::from_request(&req)
            .ok_or_else(|| Gb28181Error::Parse("request without Via branch".to_string()))?;
        let raw = req.to_string();

        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(AtomicU8::new(STATE_TRYING));
        let stop = CancellationToken::new();
        self.clients.insert(
            key.clone(),
            ClientEntry {
                events: tx.clone(),
                state: state.clone(),
                stop: stop.clone(),
                request: req.clone(),
                dest,
                ack_raw: None,
                expires_at: None,
            },
        );

        if let Err(e) = self.transport.send(dest, &raw).await {
            self.clients.remove(&key);
            return Err(e);
        }

        let layer = self.clone();
        let timer_key = key.clone();
        tokio::spawn(async move {
            layer.client_timers(timer_key, raw, dest, state, stop, tx).await;
        });

        Ok(ClientTransaction {
            key,
            events: rx,
            layer: self.clone(),
            request: req,
            dest,
        })
    }

    async fn client_timers(
        self: Arc<Self>,
        key: TxKey,
        raw: String,
        dest: Destination,
        state: Arc<AtomicU8>,
        stop: CancellationToken,
        events: mpsc::UnboundedSender<Result<SipResponse>>,
    ) {
        let is_invite = key.method == SipMethod::Invite;
        let mut interval = self.timers.t1;
        let deadline = Instant::now() + self.timers.timeout();
        let mut next = Instant::now() + interval;

        loop {
            let proceeding = state.load(Ordering::Acquire) == STATE_PROCEEDING;
            if is_invite && proceeding {
                // INVITE 收到临时响应后不再重传，超时由 TU 负责
                stop.cancelled().await;
                return;
            }

            tokio::select! {
                _ = stop.cancelled() => return,
                _ = sleep_until(deadline) => {
                    if is_invite && state.load(Ordering::Acquire) == STATE_PROCEEDING {
                        continue;
                    }
                    tracing::debug!(target: "gb28181::sip", branch = %key.branch, method = %key.method, "client transaction timeout");
                    let _ = events.send(Err(Gb28181Error::Timeout(format!(
                        "{} transaction {} timed out",
                        key.method, key.branch
                    ))));
                    self.clients.remove(&key);
                    return;
                }
                _ = sleep_until(next) => {
                    let state_now = state.load(Ordering::Acquire);
                    let skip = is_invite && state_now == STATE_PROCEEDING;
                    if dest.transport == TransportKind::Udp && !skip {
                        if let Err(e) = self.transport.send(dest, &raw).await {
                            tracing::warn!(target: "gb28181::sip", branch = %key.branch, "retransmit failed: {}", e);
                        }
                    }
                    interval = if is_invite {
                        interval * 2
                    } else if state_now == STATE_PROCEEDING {
                        self.timers.t2
                    } else {
                        (interval * 2).min(self.timers.t2)
                    };
                    next = Instant::now() + interval;
                }
            }
        }
    }

    /// TU 放弃事务（句柄被丢弃）
    fn abandon(&self, key: &TxKey) {
        let completed = self
            .clients
            .get(key)
            .map(|e| e.state.load(Ordering::Acquire) == STATE_COMPLETED)
            .unwrap_or(true);
        if !completed {
            if let Some((_, entry)) = self.clients.remove(key) {
                entry.stop.cancel();
            }
        }
    }

    /// 处理收到的响应；无匹配事务时原样返回给上层
    pub async fn on_response(&self, resp: SipResponse) -> Option<SipResponse> {
        let Some(key) = TxKey::from_response(&resp) else {
            return Some(resp);
        };

        let (events, state, stop, request, dest, ack_raw) = match self.clients.get(&key) {
            Some(e) => (
                e.events.clone(),
                e.state.clone(),
                e.stop.clone(),
                e.request.clone(),
                e.dest,
                e.ack_raw.clone(),
            ),
            None => return Some(resp),
        };

        if resp.is_provisional() {
            let _ = state.compare_exchange(
                STATE_TRYING,
                STATE_PROCEEDING,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            let _ = events.send(Ok(resp));
            return None;
        }

        let is_invite = key.method == SipMethod::Invite;
        let previous = state.swap(STATE_COMPLETED, Ordering::AcqRel);
        if previous == STATE_COMPLETED {
            // 最终响应重传：非 2xx 重发 ACK
            if let Some(ack) = ack_raw {
                if let Err(e) = self.transport.send(dest, &ack).await {
                    tracing::warn!(target: "gb28181::sip", "ACK retransmit failed: {}", e);
                }
            }
            return None;
        }

        stop.cancel();
        let success = resp.is_success();
        let to_header = resp.headers.get("To").map(str::to_string);
        let _ = events.send(Ok(resp));

        let now = Instant::now();
        if is_invite && !success {
            let ack = build_non2xx_ack(&request, to_header.as_deref()).to_string();
            if let Err(e) = self.transport.send(dest, &ack).await {
                tracing::warn!(target: "gb28181::sip", "ACK send failed: {}", e);
            }
            // Timer D
            let linger = match dest.transport {
                TransportKind::Udp => Duration::from_secs(32),
                TransportKind::Tcp => Duration::ZERO,
            };
            if let Some(mut e) = self.clients.get_mut(&key) {
                e.ack_raw = Some(ack);
                e.expires_at = Some(now + linger);
            }
        } else if is_invite {
            // 2xx 的重传交给对话层处理
            self.clients.remove(&key);
        } else {
            // Timer K
            let linger = match dest.transport {
                TransportKind::Udp => self.timers.t4,
                TransportKind::Tcp => Duration::ZERO,
            };
            if let Some(mut e) = self.clients.get_mut(&key) {
                e.expires_at = Some(now + linger);
            }
        }
        None
    }

    /// 处理收到的请求；重传被吸收返回 None，否则交给上层
    pub async fn on_request(&self, req: SipRequest, source: Destination) -> Option<SipRequest> {
        if req.method == SipMethod::Ack {
            return self.on_ack(req);
        }

        let Some(key) = TxKey::from_request(&req) else {
            return Some(req);
        };

        let retransmit = self.servers.get(&key).map(|e| (e.dest, e.last_response.clone()));
        if let Some((dest, last)) = retransmit {
            if let Some((code, raw)) = last {
                tracing::debug!(target: "gb28181::sip", branch = %key.branch, code, "request retransmission, resending last response");
                if let Err(e) = self.transport.send(dest, &raw).await {
                    tracing::warn!(target: "gb28181::sip", "response retransmit failed: {}", e);
                }
            }
            return None;
        }

        self.servers.insert(
            key,
            ServerEntry {
                request: req.clone(),
                dest: source,
                last_response: None,
                stop: CancellationToken::new(),
                expires_at: Instant::now() + self.timers.timeout() * 2,
            },
        );
        Some(req)
    }

    fn on_ack(&self, ack: SipRequest) -> Option<SipRequest> {
        if let Some(ack_key) = AckKey::from_headers(&ack.headers) {
            if let Some((_, waiter)) = self.ack_waiters.remove(&ack_key) {
                waiter.stop.cancel();
                if let Some(notify) = waiter.notify {
                    let _ = notify.send(ack.clone());
                }
                return Some(ack);
            }
        }

        // 非 2xx 最终响应的 ACK 属于 INVITE 事务本身
        if let Some(key) = TxKey::from_request(&ack) {
            if let Some(entry) = self.servers.get(&key) {
                if matches!(entry.last_response, Some((code, _)) if code >= 300) {
                    entry.stop.cancel();
                    return None;
                }
            }
        }
        Some(ack)
    }

    /// 发送响应并维护服务端事务
    pub async fn respond(
        self: &Arc<Self>,
        req: &SipRequest,
        resp: SipResponse,
        dest: Destination,
    ) -> Result<()> {
        let code = resp.status_code;
        let raw = resp.to_string();
        self.transport.send(dest, &raw).await?;

        let Some(key) = TxKey::from_request(req) else {
            return Ok(());
        };

        let now = Instant::now();
        let stop = match self.servers.get_mut(&key) {
            Some(mut entry) => {
                entry.last_response = Some((code, raw.clone()));
                if code >= 200 {
                    // Timer J / 吸收 INVITE 重传
                    entry.expires_at = match (dest.transport, key.method) {
                        (TransportKind::Tcp, m) if m != SipMethod::Invite => now,
                        _ => now + self.timers.timeout(),
                    };
                }
                entry.stop.clone()
            }
            None => return Ok(()),
        };

        if key.method == SipMethod::Invite && code >= 300 && dest.transport == TransportKind::Udp {
            // Timer G：重传非 2xx 最终响应直到收到 ACK
            let layer = self.clone();
            tokio::spawn(async move {
                layer.retransmit_until(raw, dest, stop).await;
            });
        }
        Ok(())
    }

    /// 发送 INVITE 的 2xx 并等待对应 ACK（按 Call-ID + tag 匹配）
    pub async fn respond_await_ack(
        self: &Arc<Self>,
        req: &SipRequest,
        resp: SipResponse,
        dest: Destination,
    ) -> Result<SipRequest> {
        let ack_key = AckKey::from_headers(&resp.headers)
            .ok_or_else(|| Gb28181Error::Parse("2xx without dialog tags".to_string()))?;
        let raw = resp.to_string();

        let (tx, rx) = oneshot::channel();
        let stop = CancellationToken::new();
        self.ack_waiters.insert(
            ack_key.clone(),
            AckWaiter {
                notify: Some(tx),
                stop: stop.clone(),
            },
        );

        if let Err(e) = self.respond(req, resp, dest).await {
            self.ack_waiters.remove(&ack_key);
            return Err(e);
        }

        if dest.transport == TransportKind::Udp {
            let layer = self.clone();
            let stop = stop.clone();
            tokio::spawn(async move {
                layer.retransmit_until(raw, dest, stop).await;
            });
        }

        let result = tokio::time::timeout(self.timers.timeout(), rx).await;
        stop.cancel();
        match result {
            Ok(Ok(ack)) => Ok(ack),
            _ => {
                self.ack_waiters.remove(&ack_key);
                Err(Gb28181Error::Timeout(format!(
                    "no ACK for 2xx on call {}",
                    ack_key.call_id
                )))
            }
        }
    }

    /// T1 起步、T2 封顶的响应重传
    async fn retransmit_until(self: Arc<Self>, raw: String, dest: Destination, stop: CancellationToken) {
        let mut interval = self.timers.t1;
        let deadline = Instant::now() + self.timers.timeout();
        loop {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = sleep_until(deadline) => return,
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.transport.send(dest, &raw).await {
                        tracing::warn!(target: "gb28181::sip", "response retransmit failed: {}", e);
                    }
                    interval = (interval * 2).min(self.timers.t2);
                }
            }
        }
    }

    /// 不经事务直接发送（ACK for 2xx、CRLF 等）
    pub async fn send_stateless(&self, raw: &str, dest: Destination) -> Result<()> {
        self.transport.send(dest, raw).await
    }

    /// 查询尚未最终应答的 INVITE 服务端事务（用于 CANCEL）
    pub fn pending_invite(&self, branch: &str) -> Option<(SipRequest, Destination)> {
        let key = TxKey {
            branch: branch.to_string(),
            method: SipMethod::Invite,
        };
        self.servers.get(&key).and_then(|e| match e.last_response {
            Some((code, _)) if code >= 200 => None,
            _ => Some((e.request.clone(), e.dest)),
        })
    }

    /// 未发送最终响应的服务端事务数量
    pub fn pending_server_transactions(&self) -> usize {
        self.servers
            .iter()
            .filter(|e| !matches!(e.last_response, Some((code, _)) if code >= 200))
            .count()
    }

    pub fn client_transactions(&self) -> usize {
        self.clients.len()
    }

    /// 等待进行中的服务端事务结束，最多等待 `timeout`
    pub async fn drain(&self, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        loop {
            let pending = self.pending_server_transactions();
            if pending == 0 || Instant::now() >= deadline {
                if pending > 0 {
                    tracing::warn!(target: "gb28181::sip", pending, "drain timeout with pending server transactions");
                }
                return pending;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

/// 为非 2xx 最终响应构造 ACK（与 INVITE 同 branch）
pub fn build_non2xx_ack(invite: &SipRequest, to_header: Option<&str>) -> SipRequest {
    let mut ack = SipRequest::new(SipMethod::Ack, invite.uri.clone());
    if let Some(via) = invite.headers.top_via() {
        ack.add_header("Via", via);
    }
    for route in invite.headers.get_all("Route") {
        ack.add_header("Route", route);
    }
    if let Some(from) = invite.headers.get("From") {
        ack.add_header("From", from);
    }
    if let Some(to) = to_header.or_else(|| invite.headers.get("To")) {
        ack.add_header("To", to);
    }
    if let Some(call_id) = invite.headers.call_id() {
        ack.add_header("Call-ID", call_id);
    }
    let seq = invite.headers.cseq().map(|c| c.seq).unwrap_or(1);
    ack.add_header("CSeq", CSeq { seq, method: SipMethod::Ack }.to_string());
    ack.add_header("Max-Forwards", "70");
    ack
}

/// 为尚未最终应答的 INVITE 构造 CANCEL（同 branch、同 CSeq 序号）
pub fn build_cancel(invite: &SipRequest) -> SipRequest {
    let mut cancel = SipRequest::new(SipMethod::Cancel, invite.uri.clone());
    if let Some(via) = invite.headers.top_via() {
        cancel.add_header("Via", via);
    }
    for route in invite.headers.get_all("Route") {
        cancel.add_header("Route", route);
    }
    for name in ["From", "To", "Call-ID"] {
        if let Some(value) = invite.headers.get(name) {
            cancel.add_header(name, value);
        }
    }
    let seq = invite.headers.cseq().map(|c| c.seq).unwrap_or(1);
    cancel.add_header("CSeq", CSeq { seq, method: SipMethod::Cancel }.to_string());
    cancel.add_header("Max-Forwards", "70");
    cancel
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sip::message::{new_branch, SipMessage};
    use std::net::SocketAddr;
    use tokio::net::UdpSocket;

    async fn setup(timers: Timers) -> (Arc<TransactionLayer>, mpsc::Receiver<crate::sip::transport::Inbound>) {
        let (transport, rx) = SipTransport::bind("127.0.0.1:0".parse().unwrap(), 64).await.unwrap();
        (TransactionLayer::new(transport, timers), rx)
    }

    fn request(method: SipMethod, branch: &str) -> SipRequest {
        let mut req = SipRequest::new(method, "sip:34020000001320000001@127.0.0.1");
        req.add_header("Via", format!("SIP/2.0/UDP 127.0.0.1:5060;branch={}", branch));
        req.add_header("From", "<sip:34020000002000000001@3402000000>;tag=local1");
        req.add_header("To", "<sip:34020000001320000001@3402000000>");
        req.add_header("Call-ID", format!("call-{}", branch));
        req.add_header("CSeq", format!("1 {}", method));
        req
    }

    async fn recv_text(sock: &UdpSocket) -> (String, SocketAddr) {
        let mut buf = vec![0u8; 4096];
        let (n, from) = tokio::time::timeout(Duration::from_secs(5), sock.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        (String::from_utf8_lossy(&buf[..n]).into_owned(), from)
    }

    fn fast() -> Timers {
        Timers {
            t1: Duration::from_millis(20),
            t2: Duration::from_millis(80),
            t4: Duration::from_millis(100),
        }
    }

    #[tokio::test]
    async fn test_client_retransmits_then_times_out() {
        let (layer, _rx) = setup(fast()).await;
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dest = Destination::udp(peer.local_addr().unwrap());

        let mut tx = layer
            .send_request(request(SipMethod::Message, &new_branch()), dest)
            .await
            .unwrap();

        let (first, _) = recv_text(&peer).await;
        let (second, _) = recv_text(&peer).await;
        assert_eq!(first, second);

        let err = tx.final_response().await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_client_receives_final_response() {
        let (layer, _rx) = setup(Timers::default()).await;
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dest = Destination::udp(peer.local_addr().unwrap());
        let branch = new_branch();
        let req = request(SipMethod::Message, &branch);

        let mut tx = layer.send_request(req.clone(), dest).await.unwrap();
        let resp = SipResponse::from_request(&req, 200, "OK").with_to_tag("remote1");
        assert!(layer.on_response(resp).await.is_none());

        let fin = tx.final_response().await.unwrap();
        assert_eq!(fin.status_code, 200);
        assert_eq!(fin.headers.to_tag(), Some("remote1"));
    }

    #[tokio::test]
    async fn test_invite_non2xx_is_acked() {
        let (layer, _rx) = setup(Timers::default()).await;
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dest = Destination::udp(peer.local_addr().unwrap());
        let branch = new_branch();
        let req = request(SipMethod::Invite, &branch);

        let mut tx = layer.send_request(req.clone(), dest).await.unwrap();
        let _invite = recv_text(&peer).await;

        let busy = SipResponse::from_request(&req, 486, "Busy Here").with_to_tag("r2");
        layer.on_response(busy).await;
        assert_eq!(tx.final_response().await.unwrap().status_code, 486);

        let (ack, _) = recv_text(&peer).await;
        let ack = match SipMessage::from_string(&ack).unwrap() {
            SipMessage::Request(r) => r,
            _ => panic!("expected ACK"),
        };
        assert_eq!(ack.method, SipMethod::Ack);
        assert_eq!(ack.headers.branch(), Some(branch.as_str()));
        assert_eq!(ack.headers.to_tag(), Some("r2"));
        assert_eq!(ack.headers.cseq().unwrap().method, SipMethod::Ack);
    }

    #[tokio::test]
    async fn test_unmatched_response_passes_through() {
        let (layer, _rx) = setup(Timers::default()).await;
        let req = request(SipMethod::Invite, &new_branch());
        let resp = SipResponse::from_request(&req, 200, "OK").with_to_tag("x");
        assert!(layer.on_response(resp).await.is_some());
    }

    #[tokio::test]
    async fn test_server_absorbs_retransmission_and_resends_response() {
        let (layer, _rx) = setup(Timers::default()).await;
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let source = Destination::udp(peer.local_addr().unwrap());
        let req = request(SipMethod::Message, &new_branch());

        assert!(layer.on_request(req.clone(), source).await.is_some());
        assert_eq!(layer.pending_server_transactions(), 1);
        layer
            .respond(&req, SipResponse::from_request(&req, 200, "OK"), source)
            .await
            .unwrap();
        let (first, _) = recv_text(&peer).await;
        assert_eq!(layer.pending_server_transactions(), 0);

        assert!(layer.on_request(req.clone(), source).await.is_none());
        let (again, _) = recv_text(&peer).await;
        assert_eq!(first, again);
    }

    #[tokio::test]
    async fn test_2xx_ack_matched_by_dialog_tags() {
        let (layer, _rx) = setup(fast()).await;
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let source = Destination::udp(peer.local_addr().unwrap());
        let invite = request(SipMethod::Invite, &new_branch());
        layer.on_request(invite.clone(), source).await;

        let ok = SipResponse::from_request(&invite, 200, "OK").with_to_tag("uas1");
        let waiter = {
            let layer = layer.clone();
            let invite = invite.clone();
            tokio::spawn(async move { layer.respond_await_ack(&invite, ok, source).await })
        };

        // 2xx 会被重传，直到 ACK 到达
        let _ = recv_text(&peer).await;
        let _ = recv_text(&peer).await;

        // ACK 使用新 branch，只能按 tag 匹配
        let mut ack = request(SipMethod::Ack, &new_branch());
        ack.headers.set("Call-ID", invite.headers.call_id().unwrap());
        ack.headers.set("To", "<sip:34020000001320000001@3402000000>;tag=uas1");
        assert!(layer.on_request(ack, source).await.is_some());

        let matched = waiter.await.unwrap().unwrap();
        assert_eq!(matched.method, SipMethod::Ack);
    }

    #[tokio::test]
    async fn test_drain_waits_for_pending() {
        let (layer, _rx) = setup(Timers::default()).await;
        let source = Destination::udp("127.0.0.1:9".parse().unwrap());
        let req = request(SipMethod::Message, &new_branch());
        layer.on_request(req, source).await;
        let left = layer.drain(Duration::from_millis(100)).await;
        assert_eq!(left, 1);
    }
}
