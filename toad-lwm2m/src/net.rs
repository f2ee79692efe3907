use no_std_net::SocketAddr;

/// A connected datagram socket carrying one CoAP conversation.
///
/// This mirrors the socket seam of the rest of the toad family, narrowed to
/// the connected shape an LwM2M client uses: the engine opens one socket per
/// server and only ever talks to that peer.
///
/// DTLS lives behind this trait too: a secure implementation reports
/// [`Socket::is_secure`] and the engine refuses `coaps://` URIs on sockets
/// that don't.
pub trait Socket: Sized {
  /// The error yielded by socket operations
  type Error: core::fmt::Debug;

  /// Open a non-blocking socket connected to `addr`.
  fn connect(addr: SocketAddr) -> Result<Self, Self::Error>;

  /// Send a datagram to the connected peer.
  fn send(&self, msg: &[u8]) -> nb::Result<(), Self::Error>;

  /// Pull a buffered datagram from the socket.
  ///
  /// Yields [`nb::Error::WouldBlock`] when nothing is queued. Like
  /// [`std::net::UdpSocket`], a datagram larger than `buffer` is truncated
  /// and the excess dropped.
  fn recv(&self, buffer: &mut [u8]) -> nb::Result<usize, Self::Error>;

  /// Does this socket speak DTLS?
  fn is_secure(&self) -> bool {
    false
  }
}
