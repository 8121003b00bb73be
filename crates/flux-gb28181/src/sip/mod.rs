// SIP 信令层
//
// - transport: UDP/TCP 收发与帧切分
// - transaction: RFC 3261 客户端/服务端事务
// - dialog: 对话存储（持久化原始 INVITE）
// - auth: Digest 鉴权

pub mod auth;
pub mod dialog;
pub mod endpoint;
pub mod message;
pub mod transaction;
pub mod transport;

pub use endpoint::{LocalIdentity, SipEndpoint};
pub use message::{SipMessage, SipMethod, SipRequest, SipResponse};
pub use transport::{Destination, SipTransport, TransportKind};
