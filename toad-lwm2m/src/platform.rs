use embedded_time::rate::Fraction;

use crate::net::Socket;
use crate::time::Clock;

/// The two seams the engine is generic over: where time comes from and
/// where datagrams go.
///
/// Collections are pinned to `Vec` (the alloc platform); only the clock and
/// the socket vary between targets.
pub trait PlatformTypes: Sized + 'static + core::fmt::Debug {
  /// What should we use to keep track of time?
  type Clock: Clock + 'static;

  /// What should we use for networking?
  type Socket: Socket + 'static;
}

/// [`PlatformTypes`] for ordinary std targets: [`SystemClock`] +
/// [`std::net::UdpSocket`].
#[derive(Debug, Clone, Copy)]
pub struct Std;

impl PlatformTypes for Std {
  type Clock = SystemClock;
  type Socket = ::std::net::UdpSocket;
}

/// Implement [`embedded_time::Clock`] using [`std::time`] primitives,
/// ticking in milliseconds since construction.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock(::std::time::Instant);

impl Default for SystemClock {
  fn default() -> Self {
    Self::new()
  }
}

impl SystemClock {
  /// Create a new clock whose epoch is "now"
  pub fn new() -> Self {
    Self(::std::time::Instant::now())
  }
}

impl embedded_time::Clock for SystemClock {
  type T = u64;

  const SCALING_FACTOR: Fraction = Fraction::new(1, 1_000);

  fn try_now(&self) -> Result<embedded_time::Instant<Self>, embedded_time::clock::Error> {
    let elapsed = ::std::time::Instant::now().duration_since(self.0);
    Ok(embedded_time::Instant::new(elapsed.as_millis() as u64))
  }
}

fn as_std_addr(addr: no_std_net::SocketAddr) -> ::std::net::SocketAddr {
  match addr {
    | no_std_net::SocketAddr::V4(v4) => {
      ::std::net::SocketAddr::new(::std::net::IpAddr::V4(v4.ip().octets().into()), v4.port())
    },
    | no_std_net::SocketAddr::V6(v6) => {
      ::std::net::SocketAddr::new(::std::net::IpAddr::V6(v6.ip().octets().into()), v6.port())
    },
  }
}

fn io_to_nb(err: ::std::io::Error) -> nb::Error<::std::io::Error> {
  match err.kind() {
    | ::std::io::ErrorKind::WouldBlock => nb::Error::WouldBlock,
    | _ => nb::Error::Other(err),
  }
}

impl Socket for ::std::net::UdpSocket {
  type Error = ::std::io::Error;

  fn connect(addr: no_std_net::SocketAddr) -> Result<Self, Self::Error> {
    let local: ::std::net::SocketAddr = match addr {
      | no_std_net::SocketAddr::V4(_) => "0.0.0.0:0".parse().expect("infallible"),
      | no_std_net::SocketAddr::V6(_) => "[::]:0".parse().expect("infallible"),
    };

    let sock = ::std::net::UdpSocket::bind(local)?;
    ::std::net::UdpSocket::connect(&sock, as_std_addr(addr))?;
    sock.set_nonblocking(true)?;
    Ok(sock)
  }

  fn send(&self, msg: &[u8]) -> nb::Result<(), Self::Error> {
    ::std::net::UdpSocket::send(self, msg).map(|_| ())
                                          .map_err(io_to_nb)
  }

  fn recv(&self, buffer: &mut [u8]) -> nb::Result<usize, Self::Error> {
    ::std::net::UdpSocket::recv(self, buffer).map_err(io_to_nb)
  }
}
