use crate::net::{NetResult, NetSocket};

/// Seam for an opt-in TLS collaborator.
///
/// The engine never touches cryptographic state; when a connection carries a
/// TLS context, its reads and writes are routed through this trait instead of
/// hitting the socket directly. The concrete implementation (and its
/// certificate handling) lives outside the core.
pub trait TlsLayer: Send + Sync {
    /// Client-side setup after the TCP connect.
    fn after_connection(&self, socket: NetSocket, server_name: &str) -> NetResult;

    /// Server-side setup once the listening socket is bound.
    fn after_bind(&self, listener: NetSocket) -> NetResult;

    /// Server-side handshake for one accepted socket. On success `cipher`
    /// receives the negotiated cipher description.
    fn after_accept(
        &self,
        socket: NetSocket,
        last_error: &mut NetResult,
        cipher: &mut String,
    ) -> NetResult;

    /// Decrypt into `buf`; returns outcome and plaintext byte count.
    fn receive(&self, socket: NetSocket, buf: &mut [u8]) -> (NetResult, usize);

    /// Encrypt and send from `buf`; returns outcome and consumed byte count.
    fn send(&self, socket: NetSocket, buf: &[u8]) -> (NetResult, usize);
}
