// 媒体服务器 RPC（HTTP/JSON）
// 信令层只通过这几个接口申请/释放收流端口并查询流状态

use crate::sdp::SetupType;
use crate::{Gb28181Error, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize)]
pub struct OpenRtpServer<'a> {
    pub stream_id: &'a str,
    pub setup: SetupType,
    pub ssrc: &'a str,
    pub tcp_mode: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenRtpServerReply {
    pub port: u16,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectRtpServer<'a> {
    pub stream_id: &'a str,
    pub host: &'a str,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize)]
struct StreamRef<'a> {
    stream_id: &'a str,
}

/// 收流状态，用于会话监督
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtpServerStatus {
    pub connected: bool,
    #[serde(default)]
    pub bytes: u64,
}

/// 级联转发：媒体服务器向上级推流
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartSendRtp {
    pub stream_id: String,
    pub ssrc: String,
    pub dst_host: String,
    pub dst_port: u16,
    pub is_udp: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StartSendRtpReply {
    pub local_port: u16,
}

#[async_trait]
pub trait MediaServer: Send + Sync {
    /// SDP c= 中填写的媒体地址
    fn media_ip(&self) -> &str;

    /// 申请收流端口
    async fn open_stream(&self, stream_id: &str, setup: SetupType, ssrc: &str) -> Result<u16>;

    /// TCP 主动模式下连接设备宣告的地址
    async fn connect_stream(&self, stream_id: &str, host: &str, port: u16) -> Result<()>;

    async fn close_stream(&self, stream_id: &str) -> Result<()>;

    async fn stream_status(&self, stream_id: &str) -> Result<RtpServerStatus>;

    async fn start_send_rtp(&self, req: &StartSendRtp) -> Result<u16>;

    async fn stop_send_rtp(&self, stream_id: &str) -> Result<()>;
}

/// 基于 reqwest 的实现
pub struct HttpMediaServer {
    base_url: String,
    media_ip: String,
    client: reqwest::Client,
}

impl HttpMediaServer {
    pub fn new(base_url: impl Into<String>, media_ip: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            media_ip: media_ip.into(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn decode<T: DeserializeOwned>(resp: reqwest::Response, op: &str) -> Result<T> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Gb28181Error::MediaServer(format!("{} failed: {} {}", op, status, body)));
        }
        resp.json::<T>()
            .await
            .map_err(|e| Gb28181Error::MediaServer(format!("{} returned bad body: {}", op, e)))
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let resp = self.client.post(self.url(path)).json(body).send().await?;
        Self::decode(resp, path).await
    }
}

#[async_trait]
impl MediaServer for HttpMediaServer {
    fn media_ip(&self) -> &str {
        &self.media_ip
    }

    async fn open_stream(&self, stream_id: &str, setup: SetupType, ssrc: &str) -> Result<u16> {
        let reply: OpenRtpServerReply = self
            .post(
                "/open_rtp_server",
                &OpenRtpServer {
                    stream_id,
                    setup,
                    ssrc,
                    tcp_mode: setup.tcp_mode(),
                },
            )
            .await?;
        if reply.port == 0 {
            return Err(Gb28181Error::MediaServer(format!(
                "open_rtp_server returned port 0 for {}",
                stream_id
            )));
        }
        tracing::debug!(target: "gb28181::media", %stream_id, port = reply.port, %setup, "rtp server opened");
        Ok(reply.port)
    }

    async fn connect_stream(&self, stream_id: &str, host: &str, port: u16) -> Result<()> {
        let _: serde_json::Value = self
            .post("/connect_rtp_server", &ConnectRtpServer { stream_id, host, port })
            .await?;
        Ok(())
    }

    async fn close_stream(&self, stream_id: &str) -> Result<()> {
        let _: serde_json::Value = self
            .post("/close_rtp_server", &StreamRef { stream_id })
            .await?;
        tracing::debug!(target: "gb28181::media", %stream_id, "rtp server closed");
        Ok(())
    }

    async fn stream_status(&self, stream_id: &str) -> Result<RtpServerStatus> {
        let resp = self
            .client
            .get(self.url(&format!("/rtp_server_status/{}", stream_id)))
            .send()
            .await?;
        Self::decode(resp, "/rtp_server_status").await
    }

    async fn start_send_rtp(&self, req: &StartSendRtp) -> Result<u16> {
        let reply: StartSendRtpReply = self.post("/start_send_rtp", req).await?;
        Ok(reply.local_port)
    }

    async fn stop_send_rtp(&self, stream_id: &str) -> Result<()> {
        let _: serde_json::Value = self
            .post("/stop_send_rtp", &StreamRef { stream_id })
            .await?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::net::SocketAddr;

    async fn spawn_mock() -> SocketAddr {
        let app = Router::new()
            .route(
                "/open_rtp_server",
                post(|Json(body): Json<Value>| async move {
                    assert_eq!(body["tcp_mode"], 1);
                    Json(json!({ "port": 10000 }))
                }),
            )
            .route("/close_rtp_server", post(|| async { Json(json!({})) }))
            .route(
                "/connect_rtp_server",
                post(|| async { (axum::http::StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
            )
            .route(
                "/rtp_server_status/*stream_id",
                get(|Path(id): Path<String>| async move {
                    Json(json!({ "connected": id.ends_with("C"), "bytes": 42 }))
                }),
            );
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(axum::Server::from_tcp(listener).unwrap().serve(app.into_make_service()));
        addr
    }

    #[tokio::test]
    async fn test_http_media_server_rpc() {
        let addr = spawn_mock().await;
        let ms = HttpMediaServer::new(format!("http://{}/", addr), "127.0.0.1", Duration::from_secs(2)).unwrap();

        assert_eq!(ms.open_stream("D/C", SetupType::TcpPassive, "0000000001").await.unwrap(), 10000);
        ms.close_stream("D/C").await.unwrap();

        let status = ms.stream_status("D/C").await.unwrap();
        assert!(status.connected);
        assert_eq!(status.bytes, 42);

        let err = ms.connect_stream("D/C", "1.2.3.4", 5).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::MediaServer);
    }

    #[tokio::test]
    async fn test_unreachable_media_server() {
        let ms = HttpMediaServer::new("http://127.0.0.1:1", "127.0.0.1", Duration::from_millis(200)).unwrap();
        let err = ms.close_stream("x").await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::MediaServer);
    }
}
