// SIP 端点：本地身份 + 请求/响应构造 + 热重启

use super::message::{new_branch, new_call_id, new_tag, CSeq, SipMethod, SipRequest, SipResponse};
use super::transaction::{ClientTransaction, TransactionLayer};
use super::transport::{Destination, TransportKind};
use crate::{Gb28181Error, Result};
use arc_swap::ArcSwap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

pub const USER_AGENT: &str = "flux-gb28181";

/// 重启前等待服务端事务结束的时间
const RESTART_DRAIN: Duration = Duration::from_secs(2);

/// 本地 SIP 身份，host/port 为对外通告地址
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub id: String,
    pub realm: String,
    pub host: String,
    pub port: u16,
}

impl LocalIdentity {
    pub fn uri(&self) -> String {
        format!("sip:{}@{}:{}", self.id, self.host, self.port)
    }

    /// From 头部使用的地址（不带 tag）
    pub fn from_addr(&self) -> String {
        format!("<sip:{}@{}>", self.id, self.realm)
    }

    pub fn contact(&self) -> String {
        format!("<{}>", self.uri())
    }

    pub fn via(&self, transport: TransportKind, branch: &str) -> String {
        format!(
            "SIP/2.0/{} {}:{};rport;branch={}",
            transport.as_str(),
            self.host,
            self.port,
            branch
        )
    }
}

/// GB28181 编码的前 10 位为域
pub fn domain_of(id: &str) -> &str {
    id.get(..10).unwrap_or(id)
}

pub struct SipEndpoint {
    identity: ArcSwap<LocalIdentity>,
    transactions: Arc<TransactionLayer>,
    bind_ip: IpAddr,
    /// 配置了 public_ip 时不随重绑定改变通告地址
    advertise_fixed: bool,
}

impl SipEndpoint {
    pub fn new(
        transactions: Arc<TransactionLayer>,
        identity: LocalIdentity,
        bind_ip: IpAddr,
        advertise_fixed: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            identity: ArcSwap::from_pointee(identity),
            transactions,
            bind_ip,
            advertise_fixed,
        })
    }

    pub fn identity(&self) -> Arc<LocalIdentity> {
        self.identity.load_full()
    }

    pub fn transactions(&self) -> &Arc<TransactionLayer> {
        &self.transactions
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transactions.transport().local_addr()
    }

    /// 构造对话外请求：Request-URI 指向目标地址，To/From 使用 GB28181 域
    pub fn new_request(&self, method: SipMethod, target_id: &str, dest: Destination) -> SipRequest {
        let identity = self.identity();
        let uri = format!("sip:{}@{}", target_id, dest.addr);
        let mut req = SipRequest::new(method, uri);
        req.add_header("Via", identity.via(dest.transport, &new_branch()));
        req.add_header("From", format!("{};tag={}", identity.from_addr(), new_tag()));
        req.add_header("To", format!("<sip:{}@{}>", target_id, domain_of(target_id)));
        req.add_header("Call-ID", new_call_id(&identity.host));
        req.add_header("CSeq", CSeq { seq: 1, method }.to_string());
        req.add_header("Max-Forwards", "70");
        req.add_header("User-Agent", USER_AGENT);
        if matches!(
            method,
            SipMethod::Invite | SipMethod::Subscribe | SipMethod::Register | SipMethod::Notify
        ) {
            req.add_header("Contact", identity.contact());
        }
        req
    }

    /// 发起客户端事务
    pub async fn send(&self, req: SipRequest, dest: Destination) -> Result<ClientTransaction> {
        self.transactions.send_request(req, dest).await
    }

    /// 发送请求并等待最终响应，非 2xx 映射为 device 错误
    pub async fn request_final(&self, req: SipRequest, dest: Destination) -> Result<SipResponse> {
        let mut tx = self.send(req, dest).await?;
        let resp = tx.final_response().await?;
        if !resp.is_success() {
            return Err(Gb28181Error::Device {
                code: resp.status_code,
                reason: resp.reason_phrase.clone(),
            });
        }
        Ok(resp)
    }

    /// 按请求构造响应；建立对话的响应没有 To tag 时补一个
    pub fn response(&self, req: &SipRequest, code: u16, reason: &str) -> SipResponse {
        let mut resp = SipResponse::from_request(req, code, reason);
        if code > 100 && resp.headers.to_tag().is_none() {
            resp = resp.with_to_tag(&new_tag());
        }
        resp.add_header("User-Agent", USER_AGENT);
        resp
    }

    pub async fn respond(&self, req: &SipRequest, resp: SipResponse, dest: Destination) -> Result<()> {
        self.transactions.respond(req, resp, dest).await
    }

    /// 快捷应答
    pub async fn reply(&self, req: &SipRequest, code: u16, reason: &str, dest: Destination) -> Result<()> {
        let resp = self.response(req, code, reason);
        self.respond(req, resp, dest).await
    }

    /// 热重启：等待进行中的服务端事务，然后切换端口和身份
    pub async fn restart(&self, new_id: Option<String>, port: u16) -> Result<SocketAddr> {
        let current = self.identity();
        if port == current.port && new_id.as_deref().map(|id| id == current.id).unwrap_or(true) {
            return Err(Gb28181Error::State("restart requires a new id or port".to_string()));
        }

        let pending = self.transactions.drain(RESTART_DRAIN).await;
        let local = if port != self.local_addr().port() {
            self.transactions
                .transport()
                .rebind(SocketAddr::new(self.bind_ip, port))
                .await?
        } else {
            self.local_addr()
        };

        let mut identity = (*current).clone();
        if let Some(id) = new_id {
            identity.id = id;
        }
        identity.port = local.port();
        if !self.advertise_fixed && !self.bind_ip.is_unspecified() {
            identity.host = self.bind_ip.to_string();
        }
        tracing::info!(
            target: "gb28181::sip",
            id = %identity.id,
            %local,
            pending,
            "SIP endpoint restarted"
        );
        self.identity.store(Arc::new(identity));
        Ok(local)
    }
}

/// 未配置 public_ip 且监听 0.0.0.0 时探测出口地址
pub fn detect_local_ip() -> Option<IpAddr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    socket.local_addr().ok().map(|a| a.ip())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sip::transaction::Timers;
    use crate::sip::transport::SipTransport;

    fn identity() -> LocalIdentity {
        LocalIdentity {
            id: "34020000002000000001".to_string(),
            realm: "3402000000".to_string(),
            host: "192.168.1.10".to_string(),
            port: 5060,
        }
    }

    #[test]
    fn test_identity_headers() {
        let id = identity();
        assert_eq!(id.contact(), "<sip:34020000002000000001@192.168.1.10:5060>");
        assert_eq!(id.from_addr(), "<sip:34020000002000000001@3402000000>");
        assert_eq!(
            id.via(TransportKind::Tcp, "z9hG4bKabc"),
            "SIP/2.0/TCP 192.168.1.10:5060;rport;branch=z9hG4bKabc"
        );
        assert_eq!(domain_of("34020000001320000001"), "3402000000");
    }

    #[tokio::test]
    async fn test_new_request_and_restart() {
        let (transport, _rx) = SipTransport::bind("127.0.0.1:0".parse().unwrap(), 16).await.unwrap();
        let layer = TransactionLayer::new(transport, Timers::default());
        let mut id = identity();
        id.host = "127.0.0.1".to_string();
        id.port = layer.transport().local_addr().port();
        let endpoint = SipEndpoint::new(layer, id, "127.0.0.1".parse().unwrap(), false);

        let dest = Destination::udp("127.0.0.1:15060".parse().unwrap());
        let req = endpoint.new_request(SipMethod::Message, "34020000001320000001", dest);
        assert_eq!(req.uri, "sip:34020000001320000001@127.0.0.1:15060");
        assert!(req.headers.from_tag().is_some());
        assert_eq!(req.headers.cseq().unwrap().method, SipMethod::Message);
        assert!(req.headers.branch().unwrap().starts_with("z9hG4bK"));
        assert!(!req.headers.contains("Contact"));

        let old_port = endpoint.identity().port;
        assert!(endpoint.restart(None, old_port).await.is_err());

        let free = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let new_port = free.local_addr().unwrap().port();
        drop(free);
        let local = endpoint
            .restart(Some("34020000002000000002".to_string()), new_port)
            .await
            .unwrap();
        assert_eq!(local.port(), new_port);
        assert_eq!(endpoint.identity().id, "34020000002000000002");
        assert_eq!(endpoint.identity().port, new_port);
    }
}
