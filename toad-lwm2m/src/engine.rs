//! The engine: one registration context, its socket, the fixed pools, and
//! the cooperative service loop that drives timers, observers and the
//! registration state machine.
//!
//! Everything runs on the caller's thread: [`Engine::step`] performs one
//! service iteration (drain the socket, fire due timers, flush queued
//! sends) and never blocks; [`Engine::run`] wraps it in a nap-loop for
//! hosts that just want a client thread.

use core::fmt;
use std::collections::VecDeque;

use no_std_net::SocketAddr;
use rand::{Rng, SeedableRng};
use toad_msg::{CodeKind, Id, Token, TryFromBytes, TryIntoBytes, Type};

use crate::config::{Config, TICK_INTERVAL_MS};
use crate::msg::{self, BlockContext, Packet, Pending, Reply, ReplyKind, Retransmit, Verdict};
use crate::net::Socket;
use crate::observe::Observer;
use crate::path::Path;
use crate::platform::PlatformTypes;
use crate::rd::RdClient;
use crate::registry::Registry;
use crate::time::uptime_ms;
use crate::{logging, obj, rd};

/// Engine-level failure: transport, clock or protocol trouble surfaced to
/// the local caller (never to the peer).
pub enum Error<P: PlatformTypes> {
  /// Some socket operation failed
  Socket(<P::Socket as Socket>::Error),
  /// The clock failed to provide timing
  Clock,
  /// Serializing a message to bytes failed
  ToBytes(toad_msg::to_bytes::MessageToBytesError),
  /// A registry or codec operation failed
  Protocol(crate::Error),
  /// The Security instance's server URI is not `coap(s)://host[:port]`
  /// with a literal IP address
  BadPeerUrl,
  /// The URI demands DTLS but the platform socket is not secure
  DtlsRequired,
  /// `start` while the client is already running
  AlreadyRunning,
}

impl<P: PlatformTypes> fmt::Debug for Error<P> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      | Error::Socket(e) => f.debug_tuple("Socket").field(e).finish(),
      | Error::Clock => write!(f, "Clock"),
      | Error::ToBytes(e) => f.debug_tuple("ToBytes").field(e).finish(),
      | Error::Protocol(e) => f.debug_tuple("Protocol").field(e).finish(),
      | Error::BadPeerUrl => write!(f, "BadPeerUrl"),
      | Error::DtlsRequired => write!(f, "DtlsRequired"),
      | Error::AlreadyRunning => write!(f, "AlreadyRunning"),
    }
  }
}

/// Something the application should hear about, drained with
/// [`Engine::poll_notice`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
  /// The registration state machine did something; see [`rd::Event`]
  Rd(rd::Event),
  /// A server started observing `path`
  ObserverAdded(Path),
  /// A server stopped observing `path`
  ObserverRemoved(Path),
  /// The server ACKed a notification for `path`
  NotifyAck(Path),
  /// A notification for `path` ran out of retransmissions
  NotifyTimeout(Path),
  /// The server ACKed a Send operation
  SendAck,
  /// A Send operation ran out of retransmissions
  SendTimeout,
}

/// One queued outbound message.
#[derive(Debug, Clone)]
pub(crate) struct Outgoing {
  pub(crate) packet: Packet,
  pub(crate) kind: Option<ReplyKind>,
  /// rewrite this ACK into a separate CON response at send time
  pub(crate) promote: bool,
}

impl Outgoing {
  pub(crate) fn new(packet: Packet, kind: Option<ReplyKind>) -> Self {
    Outgoing { packet,
               kind,
               promote: false }
  }
}

/// Per-server runtime: socket, remote address, security/server instance
/// selection and the fixed per-context tables.
pub(crate) struct Context<P: PlatformTypes> {
  pub(crate) socket: Option<P::Socket>,
  pub(crate) remote: Option<SocketAddr>,
  pub(crate) bootstrap_mode: bool,
  pub(crate) sec_obj_inst: Option<u16>,
  pub(crate) srv_obj_inst: Option<u16>,
  pub(crate) pendings: Vec<Pending>,
  pub(crate) replies: Vec<Reply>,
  pub(crate) observers: Vec<Observer>,
  pub(crate) pending_sends: VecDeque<Outgoing>,
  pub(crate) queued_messages: VecDeque<Outgoing>,
  pub(crate) buffer_outbound: bool,
  pub(crate) connection_suspended: bool,
}

impl<P: PlatformTypes> fmt::Debug for Context<P> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Context")
     .field("remote", &self.remote)
     .field("bootstrap_mode", &self.bootstrap_mode)
     .field("srv_obj_inst", &self.srv_obj_inst)
     .field("pendings", &self.pendings.len())
     .field("observers", &self.observers.len())
     .finish()
  }
}

impl<P: PlatformTypes> Context<P> {
  fn new() -> Self {
    Context { socket: None,
              remote: None,
              bootstrap_mode: false,
              sec_obj_inst: None,
              srv_obj_inst: None,
              pendings: vec![],
              replies: vec![],
              observers: vec![],
              pending_sends: VecDeque::new(),
              queued_messages: VecDeque::new(),
              buffer_outbound: true,
              connection_suspended: false }
  }
}

/// The LwM2M client engine.
///
/// Owns the [`Registry`], the registration [state machine](crate::rd), the
/// observation tables and the socket. One engine per process is the
/// intended shape.
pub struct Engine<P: PlatformTypes> {
  pub(crate) config: Config,
  pub(crate) clock: P::Clock,
  pub(crate) registry: Registry,
  pub(crate) ctx: Context<P>,
  pub(crate) rd: RdClient,
  pub(crate) block1: Vec<BlockContext>,
  pub(crate) notices: VecDeque<Notice>,
  pub(crate) disabled_until: Vec<(u16, Option<u64>)>,
  rand: rand_chacha::ChaCha8Rng,
  last_mid: Option<u16>,
}

impl<P: PlatformTypes> fmt::Debug for Engine<P> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Engine")
     .field("config", &self.config)
     .field("registry", &self.registry)
     .field("ctx", &self.ctx)
     .field("rd", &self.rd)
     .finish()
  }
}

impl<P: PlatformTypes> Engine<P> where P::Clock: Default
{
  /// An engine with a default-constructed clock.
  pub fn new(config: Config) -> Self {
    Self::new_with_clock(config, P::Clock::default())
  }
}

impl<P: PlatformTypes> Engine<P> {
  /// An engine reading time from `clock`.
  pub fn new_with_clock(config: Config, clock: P::Clock) -> Self {
    Engine { registry: Registry::new(&config),
             ctx: Context::new(),
             rd: RdClient::new(),
             block1: vec![],
             notices: VecDeque::new(),
             disabled_until: vec![],
             rand: rand_chacha::ChaCha8Rng::seed_from_u64(0),
             last_mid: None,
             config,
             clock }
  }

  /// The object registry.
  pub fn registry(&self) -> &Registry {
    &self.registry
  }

  /// The object registry, mutably. Values written here reach observers on
  /// the next [`Engine::step`].
  pub fn registry_mut(&mut self) -> &mut Registry {
    &mut self.registry
  }

  /// The next queued [`Notice`], if any.
  pub fn poll_notice(&mut self) -> Option<Notice> {
    self.notices.pop_front()
  }

  pub(crate) fn notice(&mut self, notice: Notice) {
    self.notices.push_back(notice);
  }

  pub(crate) fn now_ms(&self) -> u64 {
    // a clock that stops telling time leaves us no sane recovery; freeze
    // timers instead of panicking
    uptime_ms(&self.clock).unwrap_or(0)
  }

  pub(crate) fn next_mid(&mut self) -> Id {
    let next = match self.last_mid {
      | Some(id) => id.wrapping_add(1),
      | None => self.rand.gen_range(0..=u16::MAX),
    };
    self.last_mid = Some(next);
    Id(next)
  }

  pub(crate) fn next_token(&mut self) -> Token {
    let now = self.now_ms();
    let salt: u32 = self.rand.gen();
    let ([a, b, c, d], [e, f, g, h, i, j, k, l]) = (salt.to_be_bytes(), now.to_be_bytes());
    Token::opaque(&[a, b, c, d, e, f, g, h, i, j, k, l])
  }

  /// Remove an object from the registry, evicting every observer that
  /// watches any of its instances.
  pub fn unregister_object(&mut self, obj_id: u16) -> Result<(), crate::Error> {
    self.registry.unregister_object(obj_id)?;
    self.remove_observers_by_id(obj_id, None);
    Ok(())
  }

  /// Create an object instance and schedule a registration update so the
  /// server learns about it.
  pub fn create_instance(&mut self, obj_id: u16, inst_id: u16) -> Result<(), crate::Error> {
    self.registry.create_instance(obj_id, inst_id)?;
    let now = self.now_ms();
    self.trigger_update_at(now, true);
    Ok(())
  }

  /// Delete an object instance, evict its observers and schedule a
  /// registration update.
  pub fn delete_instance(&mut self, obj_id: u16, inst_id: u16) -> Result<(), crate::Error> {
    self.registry.delete_instance(obj_id, inst_id)?;
    self.remove_observers_by_id(obj_id, Some(inst_id));
    let now = self.now_ms();
    self.trigger_update_at(now, true);
    Ok(())
  }

  // server disable windows

  pub(crate) fn server_enabled(&self, inst: u16, now: u64) -> bool {
    match self.disabled_until.iter().find(|(i, _)| *i == inst) {
      | Some((_, None)) => false,
      | Some((_, Some(until))) => now >= *until,
      | None => true,
    }
  }

  /// `until` of `None` disables forever (until the next engine start).
  pub(crate) fn disable_server(&mut self, inst: u16, until: Option<u64>) {
    self.disabled_until.retain(|(i, _)| *i != inst);
    self.disabled_until.push((inst, until));
  }

  pub(crate) fn reset_server_disables(&mut self) {
    self.disabled_until.clear();
  }

  // outbound plumbing

  /// Queue `outgoing` on the pending-sends list; the service loop drains
  /// it after timers run.
  pub(crate) fn send_message_async(&mut self, outgoing: Outgoing) {
    if self.ctx.pending_sends.len() >= self.config.tables.messages {
      log::error!("unable to queue message, no free slot");
      return;
    }

    if self.config.queue_mode.enabled {
      self.rd_connection_resume();
      let now = self.now_ms();
      self.rd.last_tx = now;
    }
    self.ctx.pending_sends.push_back(outgoing);
  }

  /// Queue a notification or Send: buffered while queue mode has the RX
  /// window closed (waking the registration machine so the window
  /// reopens), released by the next registration exchange.
  pub(crate) fn information_interface_send(&mut self, outgoing: Outgoing) {
    if self.config.queue_mode.enabled {
      self.rd_connection_resume();
      if self.ctx.buffer_outbound {
        self.ctx.queued_messages.push_back(outgoing);
        return;
      }
    }

    self.send_message_async(outgoing);
  }

  /// Flush messages buffered during queue-mode sleep.
  pub(crate) fn push_queued_buffers(&mut self) {
    while let Some(m) = self.ctx.queued_messages.pop_front() {
      self.ctx.pending_sends.push_back(m);
    }
  }

  /// Queue an empty ACK for `mid`.
  pub(crate) fn send_empty_ack(&mut self, mid: Id) {
    let ack = Packet::new(Type::Ack, toad_msg::Code::EMPTY, mid, Token(Default::default()));
    self.ctx
        .pending_sends
        .push_back(Outgoing::new(ack, None));
  }

  fn send_now(&mut self, outgoing: Outgoing, now: u64) -> Result<(), Error<P>> {
    let Outgoing { packet,
                   kind,
                   promote, } = outgoing;
    let (id, token, ty) = (packet.id, packet.token, packet.ty);

    log::trace!("sending {} -> {:?}",
                logging::msg_summary(&packet).as_str(),
                self.ctx.remote);

    let mut bytes = packet.try_into_bytes::<Vec<u8>>().map_err(Error::ToBytes)?;

    let (id, ty) = if promote {
      let fresh = self.next_mid();
      msg::promote_to_con(&mut bytes, fresh);
      (fresh, Type::Con)
    } else {
      (id, ty)
    };

    if ty == Type::Con {
      if self.ctx.pendings.len() >= self.config.tables.pendings {
        log::error!("no free slot to track retransmissions");
        return Err(Error::Protocol(crate::Error::NoMem(crate::error::Pool::Pending)));
      }

      self.ctx.pendings.push(Pending { id,
                                       token,
                                       data: bytes.clone(),
                                       retransmit: Retransmit::new(now, &self.config.transfer),
                                       acknowledged: false });

      if let Some(kind) = kind {
        if self.ctx.replies.len() >= self.config.tables.replies {
          log::error!("no free slot to wait for replies");
          self.ctx.pendings.retain(|p| p.id != id);
          return Err(Error::Protocol(crate::Error::NoMem(crate::error::Pool::Reply)));
        }
        self.ctx.replies.push(Reply { token, kind });
      }
    }

    let sent = match self.ctx.socket.as_ref() {
      | Some(sock) => sock.send(&bytes),
      | None => Ok(()),
    };

    match sent {
      | Ok(()) | Err(nb::Error::WouldBlock) => Ok(()),
      | Err(nb::Error::Other(e)) => {
        log::error!("failed to send packet: {:?}", e);
        self.ctx.pendings.retain(|p| p.id != id);
        self.ctx.replies.retain(|r| r.token != token);
        self.socket_fault();
        Err(Error::Socket(e))
      },
    }
  }

  fn drain_pending_sends(&mut self, now: u64) {
    while let Some(outgoing) = self.ctx.pending_sends.pop_front() {
      if self.ctx.socket.is_none() {
        log::debug!("dropping outbound message, no socket");
        continue;
      }
      let _ = self.send_now(outgoing, now);
    }
  }

  fn retransmit_due(&mut self, now: u64) {
    let mut timed_out: Vec<Token> = vec![];
    let mut resend: Vec<Vec<u8>> = vec![];

    for p in self.ctx.pendings.iter_mut() {
      if p.acknowledged {
        continue;
      }

      match p.retransmit.poll(now) {
        | Verdict::Wait => {},
        | Verdict::Retry => resend.push(p.data.clone()),
        | Verdict::Exhausted => timed_out.push(p.token),
      }
    }

    if let Some(sock) = self.ctx.socket.as_ref() {
      for data in resend {
        let _ = sock.send(&data);
      }
    }

    for token in timed_out {
      self.exchange_timed_out(token);
    }
  }

  fn exchange_timed_out(&mut self, token: Token) {
    log::warn!("confirmable message timed out");
    self.ctx.pendings.retain(|p| p.token != token);
    let kind = self.find_reply(token, true);

    match kind {
      | Some(ReplyKind::Notify) => self.notify_timed_out(token),
      | Some(ReplyKind::Send) => self.notice(Notice::SendTimeout),
      | Some(kind) => self.rd_exchange_timed_out(kind),
      | None => {},
    }
  }

  /// Look up (and optionally consume) the reply matcher for `token`.
  pub(crate) fn find_reply(&mut self, token: Token, take: bool) -> Option<ReplyKind> {
    let kind = self.ctx
                   .replies
                   .iter()
                   .find(|r| r.token == token)
                   .map(|r| r.kind);
    if take {
      self.ctx.replies.retain(|r| r.token != token);
    }
    kind
  }

  // inbound path

  fn drain_socket(&mut self, now: u64) {
    let mut buf = vec![0u8; self.config.transfer.max_payload + 64];

    loop {
      let n = match self.ctx.socket.as_ref() {
        | None => return,
        | Some(sock) => match sock.recv(&mut buf) {
          | Ok(n) => n,
          | Err(nb::Error::WouldBlock) => return,
          | Err(nb::Error::Other(e)) => {
            log::error!("error reading socket: {:?}", e);
            self.socket_fault();
            return;
          },
        },
      };

      if n == 0 {
        continue;
      }

      self.udp_receive(&buf[..n], now);
    }
  }

  /// Parse and route one datagram: pending match, reply match, or a new
  /// server-initiated request.
  pub(crate) fn udp_receive(&mut self, datagram: &[u8], now: u64) {
    let packet = match Packet::try_from_bytes(datagram) {
      | Ok(p) => p,
      | Err(e) => {
        log::error!("invalid data received: {:?}", e);
        return;
      },
    };

    log::trace!("recvd {} <- {:?}",
                logging::msg_summary(&packet).as_str(),
                self.ctx.remote);

    match packet.ty {
      | Type::Ack => self.recv_ack(packet, now),
      | Type::Reset => self.recv_reset(packet),
      | Type::Con | Type::Non => match packet.code.kind() {
        | CodeKind::Request => {
          if packet.ty == Type::Con {
            if let Some(response) = self.handle_request(packet, now) {
              self.send_message_async(response);
            }
          } else {
            log::debug!("ignoring NON request");
          }
        },
        | CodeKind::Response => {
          // separate response to an earlier request
          if packet.ty == Type::Con {
            self.send_empty_ack(packet.id);
          }
          let token = packet.token;
          self.ctx.pendings.retain(|p| p.token != token);
          if let Some(kind) = self.find_reply(token, true) {
            self.dispatch_reply(kind, &packet, now);
          } else {
            log::debug!("no handler for response");
          }
        },
        | CodeKind::Empty => {
          // CoAP ping; reset tells the peer we're alive
          let reset = Packet::new(Type::Reset,
                                  toad_msg::Code::EMPTY,
                                  packet.id,
                                  Token(Default::default()));
          self.ctx.pending_sends.push_back(Outgoing::new(reset, None));
        },
      },
    }
  }

  fn recv_ack(&mut self, packet: Packet, now: u64) {
    let pending = match self.ctx.pendings.iter_mut().find(|p| p.id == packet.id) {
      | Some(p) => p,
      | None => {
        log::debug!("orphaned ACK {:?}", packet.id);
        return;
      },
    };

    pending.acknowledged = true;
    let token = pending.token;

    if packet.code.kind() == CodeKind::Empty {
      // an empty ACK finishes a notify/Send exchange outright; for
      // requests it just stops retransmission and a separate response
      // follows
      match self.find_reply(token, false) {
        | None => {
          self.ctx.pendings.retain(|p| p.id != packet.id);
        },
        | Some(ReplyKind::Notify) => {
          self.ctx.pendings.retain(|p| p.id != packet.id);
          self.find_reply(token, true);
          self.notify_replied(token);
        },
        | Some(ReplyKind::Send) => {
          self.ctx.pendings.retain(|p| p.id != packet.id);
          self.find_reply(token, true);
          self.notice(Notice::SendAck);
        },
        | Some(_) => {
          log::debug!("empty ACK, expect separate response");
        },
      }
      return;
    }

    // piggybacked response
    self.ctx.pendings.retain(|p| p.id != packet.id);
    if let Some(kind) = self.find_reply(packet.token, true) {
      self.dispatch_reply(kind, &packet, now);
    }
  }

  fn recv_reset(&mut self, packet: Packet) {
    let token = match self.ctx.pendings.iter().find(|p| p.id == packet.id) {
      | Some(p) => p.token,
      | None => return,
    };

    self.ctx.pendings.retain(|p| p.id != packet.id);
    match self.find_reply(token, true) {
      | Some(ReplyKind::Notify) => self.notify_reset(token),
      | Some(kind) => self.rd_exchange_timed_out(kind),
      | None => {},
    }
  }

  fn dispatch_reply(&mut self, kind: ReplyKind, packet: &Packet, now: u64) {
    match kind {
      | ReplyKind::Notify => self.notify_replied(packet.token),
      | ReplyKind::Send => self.notice(Notice::SendAck),
      | _ => self.rd_reply(kind, packet, now),
    }
  }

  // connection lifecycle

  pub(crate) fn engine_start(&mut self) -> Result<(), Error<P>> {
    let sec = self.ctx.sec_obj_inst.ok_or(Error::BadPeerUrl)?;
    let url = crate::obj::security::uri(&self.registry, sec).map_err(|_| Error::BadPeerUrl)?;
    let (addr, secure) = parse_peer(&url).ok_or(Error::BadPeerUrl)?;

    let socket = P::Socket::connect(addr).map_err(Error::Socket)?;
    if secure && !socket.is_secure() {
      return Err(Error::DtlsRequired);
    }

    self.context_init();
    self.ctx.remote = Some(addr);
    self.ctx.socket = Some(socket);
    log::debug!("connected to {}", addr);
    Ok(())
  }

  pub(crate) fn context_init(&mut self) {
    self.ctx.pending_sends.clear();
    self.ctx.queued_messages.clear();
    self.ctx.buffer_outbound = true;
    self.ctx.connection_suspended = false;
  }

  /// Clear exchange state — observers, in-flight messages, queued sends —
  /// while keeping the connection itself.
  pub(crate) fn context_reset(&mut self) {
    let paths: Vec<Path> = self.ctx
                               .observers
                               .iter()
                               .filter_map(|o| o.path_list.first().copied())
                               .collect();
    for p in paths {
      self.notice(Notice::ObserverRemoved(p));
    }

    self.ctx.observers.clear();
    self.ctx.pendings.clear();
    self.ctx.replies.clear();
    self.ctx.pending_sends.clear();
    self.ctx.queued_messages.clear();
    self.ctx.buffer_outbound = true;
    self.ctx.connection_suspended = false;
  }

  /// [`Engine::context_reset`] plus dropping the socket.
  pub(crate) fn context_close(&mut self) {
    self.context_reset();
    self.ctx.socket = None;
    self.ctx.remote = None;
  }

  /// `context_close` plus forgetting the selected server.
  pub(crate) fn engine_stop(&mut self) {
    self.context_close();
    self.ctx.bootstrap_mode = false;
  }

  pub(crate) fn socket_suspend(&mut self) {
    self.ctx.connection_suspended = true;
  }

  pub(crate) fn socket_close(&mut self) {
    self.ctx.socket = None;
  }

  fn socket_fault(&mut self) {
    self.socket_close();
    self.rd_socket_fault();
  }

  // the service loop

  /// One cooperative service iteration. Never blocks.
  pub fn step(&mut self) -> Result<(), Error<P>> {
    let now = self.now_ms();

    self.drain_socket(now);

    // value changes accumulated since the last step reach observers (and
    // the update trigger for lifetime writes) here
    let dirty = self.registry.take_dirty();
    for path in dirty {
      self.value_changed(&path, now);
    }

    self.check_notifications(now);
    self.rd_service(now);
    self.retransmit_due(now);
    self.drain_pending_sends(now);

    Ok(())
  }

  fn value_changed(&mut self, path: &Path, now: u64) {
    self.notify_observer_path(path, now);

    // writing the active server's lifetime re-schedules registration
    if let Some(srv) = self.ctx.srv_obj_inst {
      if *path == Path::resource(obj::server::OBJECT_ID, srv, obj::server::LIFETIME) {
        self.trigger_update_at(now, false);
      }
    }
  }

  /// Milliseconds until the next scheduled piece of work, clamped to the
  /// engine tick.
  pub fn next_event_in_ms(&self) -> u64 {
    let now = self.now_ms();
    let mut soonest = now + TICK_INTERVAL_MS;

    if let Some(at) = self.rd.next_event {
      soonest = soonest.min(at);
    }
    if let Some(at) = self.next_observe_event_ms() {
      soonest = soonest.min(at);
    }
    for p in &self.ctx.pendings {
      if !p.acknowledged {
        soonest = soonest.min(p.retransmit.next_at_ms());
      }
    }

    soonest.saturating_sub(now)
  }

  /// Drive [`Engine::step`] forever, napping between iterations.
  ///
  /// The nap is capped well under the engine tick so inbound requests see
  /// sub-tick latency without an OS poller behind the [`Socket`] seam.
  pub fn run(&mut self) -> Result<(), Error<P>> {
    loop {
      self.step()?;
      let nap = self.next_event_in_ms().min(50).max(1);
      ::std::thread::sleep(::std::time::Duration::from_millis(nap));
    }
  }
}

/// Split `coap(s)://host[:port]` into a socket address and whether DTLS is
/// required. Hosts must be literal IPs (v6 in brackets).
pub(crate) fn parse_peer(url: &str) -> Option<(SocketAddr, bool)> {
  let (scheme, rest) = url.split_once("://")?;
  let secure = match scheme {
    | "coap" => false,
    | "coaps" => true,
    | _ => return None,
  };
  let default_port = if secure { 5684 } else { 5683 };

  let (host, port) = if let Some(rest) = rest.strip_prefix('[') {
    let (host, tail) = rest.split_once(']')?;
    let port = match tail.strip_prefix(':') {
      | Some(p) => p.parse().ok()?,
      | None if tail.is_empty() => default_port,
      | None => return None,
    };
    (host, port)
  } else {
    match rest.split_once(':') {
      | Some((host, p)) => (host, p.parse().ok()?),
      | None => (rest, default_port),
    }
  };

  let ip: no_std_net::IpAddr = host.parse().ok()?;
  Some((SocketAddr::new(ip, port), secure))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn peer_urls() {
    assert_eq!(parse_peer("coap://192.0.2.1"),
               Some(("192.0.2.1:5683".parse().unwrap(), false)));
    assert_eq!(parse_peer("coaps://192.0.2.1:49152"),
               Some(("192.0.2.1:49152".parse().unwrap(), true)));
    assert_eq!(parse_peer("coap://[2001:db8::1]:1234"),
               Some(("[2001:db8::1]:1234".parse().unwrap(), false)));
    assert_eq!(parse_peer("http://192.0.2.1"), None);
    assert_eq!(parse_peer("coap://hostname.example"), None);
  }
}

#[cfg(test)]
mod service_tests {
  use std::rc::Rc;

  use toad_msg::{Id, MessageOptions, OptValue, TryIntoBytes};

  use super::*;
  use crate::config::Config;
  use crate::msg::code;
  use crate::obj::server;
  use crate::rd::State;
  use crate::registry::attr::Attr;
  use crate::registry::{Field, Handled, Object, ObjectHandler, Perm, ResourceEvent};
  use crate::test::{test_engine, ClockMock, SockInner, SockMock};
  use crate::value::{ResourceKind, Value};
  use crate::{codec, Error as ProtoError};

  fn tok(n: u8) -> Token {
    Token(tinyvec::array_vec!([u8; 8] => n))
  }

  fn parse(dgram: &[u8]) -> Packet {
    Packet::try_from_bytes(dgram).unwrap()
  }

  fn registered(config: Config) -> (Engine<crate::test::Platform>, ClockMock, Rc<SockInner>) {
    let (mut e, clock) = test_engine(config);
    server::set_lifetime(e.registry_mut(), 0, 86_400).unwrap();
    e.registry_mut()
     .register_object(Object::new(3303,
                                  (1, 0),
                                  vec![Field::new(5700, ResourceKind::Float, Perm::R)],
                                  2))
     .unwrap();
    e.registry_mut().create_instance(3303, 0).unwrap();
    e.registry_mut().take_dirty();

    e.start("ep1", false).unwrap();
    for _ in 0..4 {
      e.step().unwrap();
    }
    let sock = SockMock::last();
    let req = parse(&sock.sent().pop().unwrap());
    let mut rsp = Packet::new(Type::Ack, code::CREATED, req.id, req.token);
    rsp.add_location_path("rd").unwrap();
    rsp.add_location_path("abc").unwrap();
    sock.push_rx(rsp.try_into_bytes::<Vec<u8>>().unwrap());
    e.step().unwrap();
    assert_eq!(e.rd_state(), State::RegistrationDone);
    while e.poll_notice().is_some() {}

    (e, clock, sock)
  }

  fn observe(e: &mut Engine<crate::test::Platform>, sock: &SockInner, token: Token) {
    let mut req = Packet::new(Type::Con, code::GET, Id(100), token);
    req.set_path("3303/0/5700").unwrap();
    req.set_accept(codec::PLAIN_TEXT).unwrap();
    MessageOptions::set(&mut req, toad_msg::no_repeat::OBSERVE, OptValue(vec![])).unwrap();
    sock.push_rx(req.try_into_bytes::<Vec<u8>>().unwrap());
    e.step().unwrap();

    let rsp = parse(&sock.sent().pop().unwrap());
    assert_eq!(rsp.code, code::CONTENT);
    assert!(MessageOptions::get(&rsp, toad_msg::no_repeat::OBSERVE).is_some());
    while e.poll_notice().is_some() {}
  }

  fn observe_counter(p: &Packet) -> u32 {
    MessageOptions::get(p, toad_msg::no_repeat::OBSERVE).and_then(|vs| vs.get(0))
                                                        .map(|v| crate::msg::decode_uint_option(&v.0))
                                                        .unwrap_or(u32::MAX)
  }

  #[test]
  fn pmin_gates_notifications_to_the_last_value() {
    let (mut e, clock, sock) = registered(Config::default());
    e.registry_mut()
     .attrs_mut()
     .set(Path::resource(3303, 0, 5700), Attr::Pmin(5))
     .unwrap();

    observe(&mut e, &sock, tok(9));

    // long quiet period: the first change may notify immediately
    clock.advance(10_000);
    e.registry_mut()
     .set_float(&Path::resource(3303, 0, 5700), 1.0)
     .unwrap();
    e.step().unwrap();

    let sent = sock.sent();
    assert_eq!(sent.len(), 1, "first change notifies at once");
    let notify = parse(&sent[0]);
    assert_eq!(notify.ty, Type::Con);
    assert_eq!(notify.code, code::CONTENT);
    assert_eq!(observe_counter(&notify), 1);
    assert_eq!(core::str::from_utf8(&notify.payload.0).unwrap(), "1");

    // server ACKs the notify
    let ack = Packet::new(Type::Ack,
                          toad_msg::Code::EMPTY,
                          notify.id,
                          Token(Default::default()));
    sock.push_rx(ack.try_into_bytes::<Vec<u8>>().unwrap());
    e.step().unwrap();
    assert!(matches!(e.poll_notice(), Some(Notice::NotifyAck(_))));

    // four more changes inside the pmin window stay quiet
    for v in [2.0, 3.0, 4.0] {
      clock.advance(1_000);
      e.registry_mut()
       .set_float(&Path::resource(3303, 0, 5700), v)
       .unwrap();
      e.step().unwrap();
      assert!(sock.sent().is_empty(), "pmin must gate the notify");
    }
    clock.advance(1_000);
    e.registry_mut()
     .set_float(&Path::resource(3303, 0, 5700), 5.0)
     .unwrap();
    e.step().unwrap();
    assert!(sock.sent().is_empty());

    // ...and at the pmin boundary one notify carries the last value
    clock.advance(1_000);
    e.step().unwrap();
    let sent = sock.sent();
    assert_eq!(sent.len(), 1);
    let notify = parse(&sent[0]);
    assert_eq!(observe_counter(&notify), 2, "counter is strictly increasing");
    assert_eq!(core::str::from_utf8(&notify.payload.0).unwrap(), "5");
  }

  #[test]
  fn reset_cancels_the_observation() {
    let (mut e, clock, sock) = registered(Config::default());
    observe(&mut e, &sock, tok(4));

    clock.advance(10_000);
    e.registry_mut()
     .set_float(&Path::resource(3303, 0, 5700), 7.5)
     .unwrap();
    e.step().unwrap();
    let notify = parse(&sock.sent().pop().unwrap());

    // RESET instead of ACK: the observer dies
    let reset = Packet::new(Type::Reset,
                            toad_msg::Code::EMPTY,
                            notify.id,
                            Token(Default::default()));
    sock.push_rx(reset.try_into_bytes::<Vec<u8>>().unwrap());
    e.step().unwrap();
    assert!(e.ctx.observers.is_empty());
    assert!(matches!(e.poll_notice(), Some(Notice::ObserverRemoved(_))));

    // a later write produces no traffic at all
    clock.advance(10_000);
    e.registry_mut()
     .set_float(&Path::resource(3303, 0, 5700), 8.5)
     .unwrap();
    e.step().unwrap();
    assert!(sock.sent().is_empty());
  }

  struct Slow;
  impl ObjectHandler for Slow {
    fn resource(&mut self, _: u16, event: ResourceEvent<'_>) -> Result<Handled, ProtoError> {
      match event {
        | ResourceEvent::Read { .. } => Ok(Handled::Fresh(Value::String("done".into()))),
        | _ => Ok(Handled::Ignored),
      }
    }

    fn needs_separate_response(&mut self, _: u16, _: u16) -> bool {
      true
    }
  }

  #[test]
  fn slow_handlers_get_an_empty_ack_and_a_separate_con_response() {
    let (mut e, _clock, sock) = registered(Config::default());
    e.registry_mut()
     .register_object(Object::new(3400,
                                  (1, 0),
                                  vec![Field::new(0, ResourceKind::String, Perm::R).capacity(16)],
                                  1).handler(Box::new(Slow)))
     .unwrap();
    e.registry_mut().create_instance(3400, 0).unwrap();
    e.registry_mut().take_dirty();

    let mut req = Packet::new(Type::Con, code::GET, Id(600), tok(6));
    req.set_path("3400/0/0").unwrap();
    req.set_accept(codec::PLAIN_TEXT).unwrap();
    sock.push_rx(req.try_into_bytes::<Vec<u8>>().unwrap());
    e.step().unwrap();

    let sent = sock.sent();
    assert_eq!(sent.len(), 2);

    let ack = parse(&sent[0]);
    assert_eq!(ack.ty, Type::Ack);
    assert_eq!(ack.code, toad_msg::Code::EMPTY);
    assert_eq!(ack.id, Id(600), "empty ACK carries the request MID");

    let separate = parse(&sent[1]);
    assert_eq!(separate.ty, Type::Con, "response was promoted to CON");
    assert_ne!(separate.id, Id(600), "...with a fresh MID");
    assert_eq!(separate.token, tok(6));
    assert_eq!(separate.code, code::CONTENT);
    assert_eq!(core::str::from_utf8(&separate.payload.0).unwrap(), "done");

    // the separate response has its own retransmission slot until the
    // server ACKs its MID
    assert_eq!(e.ctx.pendings.len(), 1);
    let ack = Packet::new(Type::Ack,
                          toad_msg::Code::EMPTY,
                          separate.id,
                          Token(Default::default()));
    sock.push_rx(ack.try_into_bytes::<Vec<u8>>().unwrap());
    e.step().unwrap();
    assert!(e.ctx.pendings.is_empty());
  }

  #[test]
  fn coap_ping_gets_a_reset() {
    let (mut e, _clock, sock) = registered(Config::default());

    let ping = Packet::new(Type::Con,
                           toad_msg::Code::EMPTY,
                           Id(77),
                           Token(Default::default()));
    sock.push_rx(ping.try_into_bytes::<Vec<u8>>().unwrap());
    e.step().unwrap();

    let rst = parse(&sock.sent().pop().unwrap());
    assert_eq!(rst.ty, Type::Reset);
    assert_eq!(rst.id, Id(77));
  }

  #[test]
  fn unregistering_an_object_evicts_its_observers() {
    let (mut e, _clock, sock) = registered(Config::default());
    observe(&mut e, &sock, tok(5));
    assert_eq!(e.ctx.observers.len(), 1);

    e.unregister_object(3303).unwrap();
    assert!(e.ctx.observers.is_empty());
    assert!(e.registry().object(3303).is_none());
  }
}
