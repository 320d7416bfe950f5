//! Non-blocking socket wrapper with classified transport outcomes.

mod addr;
mod result;
mod socket;
mod tls;

pub use addr::BindAddr;
pub use result::NetResult;
pub use socket::NetSocket;
pub use tls::TlsLayer;
