// GB28181 SIP 信令编解码与传输
// 消息编解码、SDP、MANSCDP XML、Digest 鉴权、SN 关联、UDP/TCP 传输

pub mod auth;
pub mod error;
pub mod message;
pub mod sdp;
pub mod sn;
pub mod transport;
pub mod xml;

pub use error::{Result, SipError};
pub use message::{SipMessage, SipMethod, SipRequest, SipResponse};
pub use sdp::{InviteType, MediaSetup, SdpInfo};
pub use transport::{ClientTransaction, RequestHandler, SipTransport, Transport};
