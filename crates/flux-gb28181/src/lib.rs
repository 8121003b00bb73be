// flux-gb28181: GB28181 信令引擎
//
// 架构：
// - sip/: SIP 传输、事务、对话、鉴权
// - registry: 设备 / 通道注册表与心跳超时
// - dispatcher: MANSCDP 报文分发与设备查询
// - subscription: 目录 / 报警 / 位置订阅
// - session/: 点播、回放、下载、对讲、广播的 INVITE 状态机
// - cascade: 向上级平台注册并承接级联点播
// - hooks: 事件 Webhook 推送
// - media: 外部媒体服务器 RPC

pub mod cascade;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod hooks;
pub mod manscdp;
pub mod media;
pub mod registry;
pub mod sdp;
pub mod server;
pub mod session;
pub mod sip;
pub mod store;
pub mod subscription;

// 重新导出常用类型
pub use error::{ErrorKind, Gb28181Error, Result};
pub use events::{DomainEvent, EventBus};
pub use server::{SipServer, WorkerConfig};
pub use session::{InviteKind, InviteRequest, SessionConfig, SessionManager, SessionSnapshot, SessionState};
