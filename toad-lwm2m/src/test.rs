use core::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use embedded_time::rate::Fraction;
use no_std_net::SocketAddr;

use crate::config::Config;
use crate::engine::Engine;
use crate::net::Socket;
use crate::obj;
use crate::path::Path;

/// A settable, shareable clock: tests hold a clone and advance time while
/// the engine owns the other half.
#[derive(Debug, Clone, Default)]
pub(crate) struct ClockMock {
  now: Rc<Cell<u64>>,
}

impl ClockMock {
  pub(crate) fn new() -> Self {
    Self::default()
  }

  pub(crate) fn advance(&self, ms: u64) {
    self.now.set(self.now.get() + ms);
  }

  pub(crate) fn set(&self, ms: u64) {
    self.now.set(ms);
  }
}

impl embedded_time::Clock for ClockMock {
  type T = u64;

  const SCALING_FACTOR: Fraction = Fraction::new(1, 1_000);

  fn try_now(&self) -> Result<embedded_time::Instant<Self>, embedded_time::clock::Error> {
    Ok(embedded_time::Instant::new(self.now.get()))
  }
}

#[derive(Debug, Default)]
pub(crate) struct SockInner {
  pub(crate) rx: RefCell<VecDeque<Vec<u8>>>,
  pub(crate) tx: RefCell<Vec<Vec<u8>>>,
  pub(crate) addr: Cell<Option<SocketAddr>>,
}

impl SockInner {
  /// Drain everything the engine sent.
  pub(crate) fn sent(&self) -> Vec<Vec<u8>> {
    self.tx.borrow_mut().drain(..).collect()
  }

  /// Queue a datagram for the engine to receive.
  pub(crate) fn push_rx(&self, dgram: Vec<u8>) {
    self.rx.borrow_mut().push_back(dgram);
  }
}

thread_local! {
  static LAST_SOCK: RefCell<Option<Rc<SockInner>>> = RefCell::new(None);
}

/// In-memory socket; the engine connects it, tests reach the same buffers
/// through [`SockMock::last`].
#[derive(Debug)]
pub(crate) struct SockMock {
  inner: Rc<SockInner>,
}

impl SockMock {
  /// The most recently connected mock socket's buffers.
  pub(crate) fn last() -> Rc<SockInner> {
    LAST_SOCK.with(|l| l.borrow().clone().expect("no socket connected yet"))
  }
}

impl Socket for SockMock {
  type Error = ();

  fn connect(addr: SocketAddr) -> Result<Self, Self::Error> {
    let inner = Rc::new(SockInner::default());
    inner.addr.set(Some(addr));
    LAST_SOCK.with(|l| *l.borrow_mut() = Some(inner.clone()));
    Ok(SockMock { inner })
  }

  fn send(&self, msg: &[u8]) -> nb::Result<(), Self::Error> {
    self.inner.tx.borrow_mut().push(msg.to_vec());
    Ok(())
  }

  fn recv(&self, buffer: &mut [u8]) -> nb::Result<usize, Self::Error> {
    match self.inner.rx.borrow_mut().pop_front() {
      | Some(dgram) => {
        let n = dgram.len().min(buffer.len());
        buffer[..n].copy_from_slice(&dgram[..n]);
        Ok(n)
      },
      | None => Err(nb::Error::WouldBlock),
    }
  }
}

/// Clock + mock-socket platform for engine tests.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Platform;

impl crate::platform::PlatformTypes for Platform {
  type Clock = ClockMock;
  type Socket = SockMock;
}

/// An engine with the core objects registered and one server configured
/// at `coap://192.0.2.1` with SSID 101.
pub(crate) fn test_engine(config: Config) -> (Engine<Platform>, ClockMock) {
  let clock = ClockMock::new();
  let mut engine: Engine<Platform> = Engine::new_with_clock(config, clock.clone());

  obj::register_core_objects(engine.registry_mut()).unwrap();
  let reg = engine.registry_mut();
  reg.set_string(&Path::resource(0, 0, 0), "coap://192.0.2.1").unwrap();
  reg.set_u16(&Path::resource(0, 0, 10), 101).unwrap();
  reg.set_u16(&Path::resource(1, 0, 0), 101).unwrap();
  reg.take_dirty();

  (engine, clock)
}
