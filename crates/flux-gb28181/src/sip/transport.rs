// SIP 传输层：UDP + TCP 监听、TCP Content-Length 分帧、热重绑定

use super::message::{header_param, SipMessage};
use crate::{Gb28181Error, Result};
use arc_swap::ArcSwap;
use bytes::{Buf, Bytes, BytesMut};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const MAX_MESSAGE_SIZE: usize = 64 * 1024;
const TCP_WRITE_QUEUE: usize = 64;

/// 传输协议
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransportKind {
    Udp,
    Tcp,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Udp => "UDP",
            TransportKind::Tcp => "TCP",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        if s.eq_ignore_ascii_case("udp") {
            Some(TransportKind::Udp)
        } else if s.eq_ignore_ascii_case("tcp") {
            Some(TransportKind::Tcp)
        } else {
            None
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 消息目的地（对端地址 + 传输协议）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Destination {
    pub addr: SocketAddr,
    pub transport: TransportKind,
}

impl Destination {
    pub fn udp(addr: SocketAddr) -> Self {
        Self { addr, transport: TransportKind::Udp }
    }

    pub fn tcp(addr: SocketAddr) -> Self {
        Self { addr, transport: TransportKind::Tcp }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.transport, self.addr)
    }
}

/// 收到的一条 SIP 消息，保留原始文本
#[derive(Debug, Clone)]
pub struct Inbound {
    pub message: SipMessage,
    pub raw: String,
    pub source: Destination,
}

/// 从 TCP 缓冲区切出一条完整消息
///
/// 消息之间的 CRLF 心跳会被跳过；头部不完整或消息体未到齐时返回 `Ok(None)`。
pub fn split_frame(buf: &mut BytesMut) -> Result<Option<Bytes>> {
    let skip = buf.iter().take_while(|b| **b == b'\r' || **b == b'\n').count();
    buf.advance(skip);

    let Some(head_end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
        if buf.len() > MAX_MESSAGE_SIZE {
            return Err(Gb28181Error::Parse("SIP header too large".to_string()));
        }
        return Ok(None);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]);
    let mut content_length = 0usize;
    for line in head.split("\r\n").skip(1) {
        if let Some(pos) = line.find(':') {
            let name = line[..pos].trim();
            if name.eq_ignore_ascii_case("Content-Length") || name.eq_ignore_ascii_case("l") {
                content_length = line[pos + 1..].trim().parse().map_err(|_| {
                    Gb28181Error::Parse(format!("Invalid Content-Length: {}", line))
                })?;
                break;
            }
        }
    }

    let total = head_end + 4 + content_length;
    if total > MAX_MESSAGE_SIZE {
        return Err(Gb28181Error::Parse(format!("SIP message too large: {}", total)));
    }
    if buf.len() < total {
        return Ok(None);
    }
    Ok(Some(buf.split_to(total).freeze()))
}

/// 为请求的顶层 Via 补充 received / rport（RFC 3581）
fn annotate_via(message: &mut SipMessage, source: SocketAddr) {
    if let SipMessage::Request(req) = message {
        req.headers.modify_first("Via", |via| {
            let host_matches = via
                .split_whitespace()
                .nth(1)
                .map(|sent_by| sent_by.split(';').next().unwrap_or(""))
                .map(|sent_by| sent_by.starts_with(&source.ip().to_string()))
                .unwrap_or(false);
            if header_param(via, "rport") == Some("") {
                *via = via.replacen(";rport", &format!(";rport={}", source.port()), 1);
            }
            if !host_matches && header_param(via, "received").is_none() {
                via.push_str(&format!(";received={}", source.ip()));
            }
        });
    }
}

/// 当前绑定的端点
struct Endpoint {
    udp: Arc<UdpSocket>,
    local: SocketAddr,
    shutdown: CancellationToken,
}

/// SIP 传输句柄
pub struct SipTransport {
    endpoint: ArcSwap<Endpoint>,
    inbound: mpsc::Sender<Inbound>,
    tcp_conns: DashMap<SocketAddr, mpsc::Sender<Bytes>>,
    dropped: AtomicU64,
}

impl SipTransport {
    /// 绑定 UDP + TCP，返回传输句柄与入站队列
    pub async fn bind(
        bind_addr: SocketAddr,
        queue: usize,
    ) -> Result<(Arc<Self>, mpsc::Receiver<Inbound>)> {
        let (tx, rx) = mpsc::channel(queue.max(1));
        let (endpoint, listener) = Self::open(bind_addr).await?;

        let transport = Arc::new(Self {
            endpoint: ArcSwap::from_pointee(endpoint),
            inbound: tx,
            tcp_conns: DashMap::new(),
            dropped: AtomicU64::new(0),
        });
        transport.clone().spawn_loops(listener);
        Ok((transport, rx))
    }

    async fn open(bind_addr: SocketAddr) -> Result<(Endpoint, TcpListener)> {
        let udp = UdpSocket::bind(bind_addr).await.map_err(|e| {
            Gb28181Error::Transport(format!("Failed to bind UDP {}: {}", bind_addr, e))
        })?;
        let local = udp.local_addr()?;
        // TCP 与 UDP 使用同一端口
        let listener = TcpListener::bind(local).await.map_err(|e| {
            Gb28181Error::Transport(format!("Failed to bind TCP {}: {}", local, e))
        })?;

        tracing::info!(target: "gb28181::transport", %local, "SIP transport listening (UDP+TCP)");

        Ok((
            Endpoint {
                udp: Arc::new(udp),
                local,
                shutdown: CancellationToken::new(),
            },
            listener,
        ))
    }

    fn spawn_loops(self: Arc<Self>, listener: TcpListener) {
        let endpoint = self.endpoint.load_full();
        let udp_self = self.clone();
        let udp_endpoint = endpoint.clone();
        tokio::spawn(async move {
            udp_self.udp_loop(udp_endpoint).await;
        });
        tokio::spawn(async move {
            self.accept_loop(listener, endpoint.shutdown.clone()).await;
        });
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.load().local
    }

    /// 因队列满被丢弃的 UDP 报文数
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// 重新绑定到新端口，旧套接字在切换后关闭
    pub async fn rebind(self: &Arc<Self>, bind_addr: SocketAddr) -> Result<SocketAddr> {
        let (endpoint, listener) = Self::open(bind_addr).await?;
        let local = endpoint.local;
        let old = self.endpoint.swap(Arc::new(endpoint));
        old.shutdown.cancel();
        self.tcp_conns.clear();
        self.clone().spawn_loops(listener);
        tracing::info!(target: "gb28181::transport", old = %old.local, new = %local, "SIP transport rebound");
        Ok(local)
    }

    /// 关闭所有监听
    pub fn shutdown(&self) {
        self.endpoint.load().shutdown.cancel();
        self.tcp_conns.clear();
    }

    async fn udp_loop(self: Arc<Self>, endpoint: Arc<Endpoint>) {
        let mut buf = vec![0u8; 65536];
        loop {
            let received = tokio::select! {
                _ = endpoint.shutdown.cancelled() => break,
                r = endpoint.udp.recv_from(&mut buf) => r,
            };
            match received {
                Ok((len, addr)) => {
                    if len <= 4 && buf[..len].iter().all(|b| b.is_ascii_whitespace()) {
                        continue;
                    }
                    let raw = String::from_utf8_lossy(&buf[..len]).into_owned();
                    if let Some(inbound) = Self::decode(raw, Destination::udp(addr)) {
                        if let Err(mpsc::error::TrySendError::Full(_)) = self.inbound.try_send(inbound) {
                            // 队列满：丢弃报文，依赖 SIP 重传
                            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                            tracing::warn!(target: "gb28181::transport", remote = %addr, dropped = total, "inbound queue full, datagram dropped");
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(target: "gb28181::transport", "Failed to receive UDP packet: {}", e);
                }
            }
        }
        tracing::debug!(target: "gb28181::transport", local = %endpoint.local, "UDP loop stopped");
    }

    fn decode(raw: String, source: Destination) -> Option<Inbound> {
        match SipMessage::from_string(&raw) {
            Ok(mut message) => {
                tracing::debug!(target: "gb28181::sip", remote = %source, "Received SIP message:\n{}", raw);
                annotate_via(&mut message, source.addr);
                Some(Inbound { message, raw, source })
            }
            Err(e) => {
                tracing::warn!(target: "gb28181::transport", remote = %source, "Failed to parse SIP message: {}", e);
                None
            }
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                r = listener.accept() => r,
            };
            match accepted {
                Ok((stream, addr)) => {
                    tracing::debug!(target: "gb28181::transport", remote = %addr, "TCP connection accepted");
                    self.clone().attach(stream, addr, shutdown.clone());
                }
                Err(e) => {
                    tracing::error!(target: "gb28181::transport", "Failed to accept TCP connection: {}", e);
                }
            }
        }
    }

    /// 为一条 TCP 连接启动读写任务
    fn attach(self: Arc<Self>, stream: TcpStream, addr: SocketAddr, shutdown: CancellationToken) -> mpsc::Sender<Bytes> {
        let (read, write) = stream.into_split();
        let (tx, rx) = mpsc::channel(TCP_WRITE_QUEUE);
        self.tcp_conns.insert(addr, tx.clone());

        tokio::spawn(Self::tcp_writer(write, rx, shutdown.clone()));
        tokio::spawn(async move {
            self.tcp_reader(read, addr, shutdown).await;
            self.tcp_conns.remove(&addr);
        });
        tx
    }

    async fn tcp_reader(&self, mut read: OwnedReadHalf, addr: SocketAddr, shutdown: CancellationToken) {
        let mut buf = BytesMut::with_capacity(8192);
        loop {
            let n = tokio::select! {
                _ = shutdown.cancelled() => return,
                r = read.read_buf(&mut buf) => r,
            };
            match n {
                Ok(0) => {
                    tracing::debug!(target: "gb28181::transport", remote = %addr, "TCP connection closed");
                    return;
                }
                Ok(_) => loop {
                    match split_frame(&mut buf) {
                        Ok(Some(frame)) => {
                            let raw = String::from_utf8_lossy(&frame).into_owned();
                            if let Some(inbound) = Self::decode(raw, Destination::tcp(addr)) {
                                // 队列满时阻塞读取，形成背压
                                if self.inbound.send(inbound).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            tracing::warn!(target: "gb28181::transport", remote = %addr, "TCP framing error: {}", e);
                            return;
                        }
                    }
                },
                Err(e) => {
                    tracing::warn!(target: "gb28181::transport", remote = %addr, "TCP read failed: {}", e);
                    return;
                }
            }
        }
    }

    async fn tcp_writer(mut write: OwnedWriteHalf, mut rx: mpsc::Receiver<Bytes>, shutdown: CancellationToken) {
        loop {
            let data = tokio::select! {
                _ = shutdown.cancelled() => break,
                d = rx.recv() => d,
            };
            let Some(data) = data else { break };
            if let Err(e) = write.write_all(&data).await {
                tracing::warn!(target: "gb28181::transport", "TCP write failed: {}", e);
                break;
            }
        }
        let _ = write.shutdown().await;
    }

    /// 发送一条消息
    pub async fn send(self: &Arc<Self>, dest: Destination, data: &str) -> Result<()> {
        tracing::debug!(target: "gb28181::sip", remote = %dest, "Sending SIP message:\n{}", data);
        match dest.transport {
            TransportKind::Udp => {
                let endpoint = self.endpoint.load();
                endpoint.udp.send_to(data.as_bytes(), dest.addr).await.map_err(|e| {
                    Gb28181Error::Transport(format!("Failed to send to {}: {}", dest.addr, e))
                })?;
            }
            TransportKind::Tcp => {
                let bytes = Bytes::copy_from_slice(data.as_bytes());
                let existing = self.tcp_conns.get(&dest.addr).map(|c| c.clone());
                let conn = match existing {
                    Some(conn) if !conn.is_closed() => conn,
                    _ => {
                        let stream = TcpStream::connect(dest.addr).await.map_err(|e| {
                            Gb28181Error::Transport(format!("Failed to connect {}: {}", dest.addr, e))
                        })?;
                        let shutdown = self.endpoint.load().shutdown.clone();
                        self.clone().attach(stream, dest.addr, shutdown)
                    }
                };
                conn.send(bytes).await.map_err(|_| {
                    Gb28181Error::Transport(format!("TCP connection to {} closed", dest.addr))
                })?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const MSG: &str = "MESSAGE sip:a@b SIP/2.0\r\nVia: SIP/2.0/TCP 127.0.0.1:5061;branch=z9hG4bK1\r\nCall-ID: 1\r\nCSeq: 1 MESSAGE\r\nContent-Length: 5\r\n\r\nhello";

    #[test]
    fn test_split_frame_partial_and_pipelined() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"\r\n\r\n");
        buf.extend_from_slice(&MSG.as_bytes()[..40]);
        assert!(split_frame(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&MSG.as_bytes()[40..]);
        buf.extend_from_slice(MSG.as_bytes());
        let first = split_frame(&mut buf).unwrap().unwrap();
        assert_eq!(&first[..], MSG.as_bytes());
        let second = split_frame(&mut buf).unwrap().unwrap();
        assert!(second.ends_with(b"hello"));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_split_frame_rejects_bad_length() {
        let mut buf = BytesMut::from(&b"MESSAGE sip:a SIP/2.0\r\nContent-Length: x\r\n\r\n"[..]);
        assert!(split_frame(&mut buf).is_err());
    }

    #[test]
    fn test_annotate_via() {
        let raw = "REGISTER sip:a@b SIP/2.0\r\nVia: SIP/2.0/UDP 192.168.1.64:5060;rport;branch=z9hG4bK1\r\n\r\n";
        let mut msg = SipMessage::from_string(raw).unwrap();
        annotate_via(&mut msg, "10.0.0.9:40000".parse().unwrap());
        let via = msg.headers().top_via().unwrap().to_string();
        assert!(via.contains(";rport=40000"));
        assert!(via.contains(";received=10.0.0.9"));
    }

    #[tokio::test]
    async fn test_udp_receive_and_send() {
        let (transport, mut rx) = SipTransport::bind("127.0.0.1:0".parse().unwrap(), 8).await.unwrap();
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer.send_to(MSG.as_bytes(), transport.local_addr()).await.unwrap();

        let inbound = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(inbound.source.addr, peer.local_addr().unwrap());
        assert_eq!(inbound.source.transport, TransportKind::Udp);
        assert_eq!(inbound.message.headers().call_id(), Some("1"));

        transport.send(inbound.source, "SIP/2.0 200 OK\r\nContent-Length: 0\r\n\r\n").await.unwrap();
        let mut buf = [0u8; 1024];
        let (n, _) = peer.recv_from(&mut buf).await.unwrap();
        assert!(std::str::from_utf8(&buf[..n]).unwrap().starts_with("SIP/2.0 200 OK"));
    }

    #[tokio::test]
    async fn test_tcp_receive_and_reply_on_same_connection() {
        let (transport, mut rx) = SipTransport::bind("127.0.0.1:0".parse().unwrap(), 8).await.unwrap();
        let mut client = TcpStream::connect(transport.local_addr()).await.unwrap();
        client.write_all(MSG.as_bytes()).await.unwrap();

        let inbound = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(inbound.source.transport, TransportKind::Tcp);

        transport.send(inbound.source, "SIP/2.0 200 OK\r\nContent-Length: 0\r\n\r\n").await.unwrap();
        let mut buf = vec![0u8; 1024];
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf)).await.unwrap().unwrap();
        assert!(std::str::from_utf8(&buf[..n]).unwrap().starts_with("SIP/2.0 200 OK"));
    }

    #[tokio::test]
    async fn test_udp_queue_full_drops() {
        let (transport, _rx) = SipTransport::bind("127.0.0.1:0".parse().unwrap(), 1).await.unwrap();
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        for _ in 0..4 {
            peer.send_to(MSG.as_bytes(), transport.local_addr()).await.unwrap();
        }
        let mut waited = 0;
        while transport.dropped() < 3 && waited < 100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            waited += 1;
        }
        assert_eq!(transport.dropped(), 3);
    }

    #[tokio::test]
    async fn test_rebind() {
        let (transport, mut rx) = SipTransport::bind("127.0.0.1:0".parse().unwrap(), 8).await.unwrap();
        let old = transport.local_addr();
        let new = transport.rebind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        assert_ne!(old, new);
        assert_eq!(transport.local_addr(), new);

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer.send_to(MSG.as_bytes(), new).await.unwrap();
        let inbound = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(inbound.message.headers().call_id(), Some("1"));
    }
}
