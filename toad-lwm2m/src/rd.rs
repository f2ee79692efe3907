//! The registration ("RD") client: a single-event-loop automaton owning a
//! server's lifecycle — bootstrap, registration, periodic updates,
//! queue-mode sleep, retry backoff, fallback across configured servers,
//! and graceful shutdown.
//!
//! The machine is driven from [`Engine::step`](crate::Engine::step): each
//! state either does work immediately or parks `next_event` at the moment
//! something must happen (update due, retry backoff over, exchange
//! timeout).

use toad_msg::{MessageOptions, Type};

use crate::codec::link_format::{LinkFormatWriter, LinkMode};
use crate::codec::{self, OutBuf, Writer};
use crate::config::{ACK_DELAY_MS, CLOSE_DELAY_MS, EXCHANGE_LIFETIME, MIN_UPDATE_PERIOD};
use crate::engine::{Engine, Error as EngineError, Notice, Outgoing};
use crate::msg::{code, Packet, ReplyKind};
use crate::obj::{security, server};
use crate::path::Path;
use crate::platform::PlatformTypes;

/// The states of the registration machine. Declaration order matters: a
/// few range checks ("is registered", "is bootstrapping") follow the
/// original's enum ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[allow(missing_docs)]
pub enum State {
  Idle,
  Init,
  DoBootstrapReg,
  BootstrapRegSent,
  BootstrapRegDone,
  BootstrapTransDone,
  DoRegistration,
  SendRegistration,
  RegistrationSent,
  RegistrationDone,
  RegistrationDoneRxOff,
  UpdateRegistration,
  UpdateSent,
  ServerDisabled,
  Suspended,
  Deregister,
  DeregisterSent,
  Deregistered,
  NetworkError,
}

/// Lifecycle events surfaced to the application through
/// [`Notice::Rd`](crate::engine::Notice).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Event {
  BootstrapRegFailure,
  BootstrapRegComplete,
  BootstrapTransferComplete,
  RegistrationFailure,
  RegistrationComplete,
  RegTimeout,
  RegUpdate,
  RegUpdateComplete,
  Deregister,
  DeregisterFailure,
  Disconnect,
  QueueModeRxOff,
  EngineSuspended,
  NetworkError,
  ServerDisabled,
}

/// Registration client state (one per engine).
#[derive(Debug)]
pub(crate) struct RdClient {
  pub(crate) state: State,
  pub(crate) ep_name: toad_string::String<128>,
  pub(crate) server_ep: toad_string::String<128>,
  pub(crate) lifetime: u32,
  pub(crate) retries: u8,
  pub(crate) retry_delay: u32,
  pub(crate) last_update: Option<u64>,
  pub(crate) last_tx: u64,
  pub(crate) next_event: Option<u64>,
  pub(crate) last_state_change: u64,
  pub(crate) use_bootstrap: bool,
  pub(crate) trigger_update: bool,
  pub(crate) update_objects: bool,
  pub(crate) close_socket: bool,
  pub(crate) server_disabled: bool,
  pub(crate) suspended_state: State,
}

impl RdClient {
  pub(crate) fn new() -> Self {
    RdClient { state: State::Idle,
               ep_name: Default::default(),
               server_ep: Default::default(),
               lifetime: 0,
               retries: 0,
               retry_delay: 0,
               last_update: None,
               last_tx: 0,
               next_event: None,
               last_state_change: 0,
               use_bootstrap: false,
               trigger_update: false,
               update_objects: false,
               close_socket: false,
               server_disabled: false,
               suspended_state: State::Idle }
  }

  fn is_bootstrap(&self) -> bool {
    self.state >= State::DoBootstrapReg && self.state <= State::BootstrapTransDone
  }

  fn is_registered(&self) -> bool {
    self.state >= State::RegistrationDone && self.state <= State::DeregisterSent
  }

  fn is_suspended(&self) -> bool {
    self.state == State::Suspended
  }
}

impl<P: PlatformTypes> Engine<P> {
  /// Where the registration machine currently is.
  pub fn rd_state(&self) -> State {
    self.rd.state
  }

  /// Start the client: `ep_name` is the endpoint name sent to servers;
  /// `bootstrap` requests the bootstrap flow before registration.
  pub fn start(&mut self, ep_name: &str, bootstrap: bool) -> Result<(), EngineError<P>> {
    if bootstrap && !self.config.registration.bootstrap {
      log::error!("bootstrap support is disabled in config");
      return Err(EngineError::Protocol(crate::Error::NotImplemented));
    }

    if self.rd.state != State::Idle || self.ctx.socket.is_some() {
      log::warn!("client is already running, state {:?}", self.rd.state);
      return Err(EngineError::AlreadyRunning);
    }

    self.reset_server_disables();
    self.context_init();
    self.ctx.srv_obj_inst = None;
    self.ctx.sec_obj_inst = None;
    self.rd.ep_name = toad_string::String::from(ep_name);
    self.rd.use_bootstrap = bootstrap;
    self.rd.retries = 0;
    self.rd.retry_delay = 0;
    self.rd.server_disabled = false;

    log::info!("start LwM2M client: {}", ep_name);
    let now = self.now_ms();
    self.set_rd_state(State::Init, now);
    Ok(())
  }

  /// Stop the client, optionally deregistering first (best effort, capped
  /// by the exchange lifetime).
  pub fn stop(&mut self, deregister: bool) {
    let now = self.now_ms();
    if self.rd.is_registered() && deregister && !self.rd.server_disabled {
      self.set_rd_state(State::Deregister, now);
    } else {
      self.rd.server_disabled = false;
      self.set_rd_state(State::Deregistered, now);
    }
    log::info!("stop LwM2M client: {}", self.rd.ep_name);
  }

  /// Suspend the machine (and the socket) until [`Engine::resume`].
  pub fn pause(&mut self) {
    if self.rd.is_suspended() {
      return;
    }

    log::info!("suspend client");
    self.notice(Notice::Rd(Event::EngineSuspended));
    self.socket_suspend();
    self.rd.suspended_state = self.rd.state;
    let now = self.now_ms();
    self.set_rd_state(State::Suspended, now);
  }

  /// Resume a paused client. Registration is refreshed if the lifetime
  /// ran out while asleep, like waking from queue mode.
  pub fn resume(&mut self) {
    if !self.rd.is_suspended() {
      log::warn!("cannot resume, state is not suspended");
      return;
    }

    log::info!("resume client state");
    let now = self.now_ms();

    if self.rd.suspended_state == State::UpdateSent {
      self.rd.suspended_state = State::RegistrationDone;
    }

    self.rd.state = self.rd.suspended_state;

    if self.rd.is_bootstrap() {
      self.rd.state = State::DoBootstrapReg;
    } else if self.rd.state >= State::DoRegistration && self.rd.state <= State::ServerDisabled {
      let expired = match self.rd.last_update {
        | None => true,
        | Some(at) => self.rd.lifetime as u64 <= (now.saturating_sub(at)) / 1_000,
      };
      if expired {
        self.rd.state = State::DoRegistration;
      } else {
        self.rd.state = State::RegistrationDoneRxOff;
        self.rd_connection_resume();
      }
    }

    self.ctx.connection_suspended = false;
    self.rd_next_event_at(Some(now));
  }

  /// Ask for a registration update at the next opportunity.
  pub fn trigger_update(&mut self) {
    let now = self.now_ms();
    self.trigger_update_at(now, false);
  }

  /// Send the client's current values for `paths` to the server (the
  /// LwM2M 1.1 Send operation, `POST /dp`).
  pub fn send(&mut self, paths: &[Path]) -> Result<(), crate::Error> {
    if !self.rd.is_registered() {
      return Err(crate::Error::NotAllowed);
    }

    if let Some(srv) = self.ctx.srv_obj_inst {
      if server::mute_send(&self.registry, srv) {
        log::warn!("send is muted by the server object");
        return Err(crate::Error::NotAllowed);
      }
    }

    let mut list = crate::path::PathList::new(self.config.tables.composite_paths);
    for p in paths {
      list.insert(*p)?;
    }

    let format = codec::default_accept(self.config.version);
    let mid = self.next_mid();
    let token = self.next_token();
    let mut packet = Packet::new(Type::Con, code::POST, mid, token);
    packet.set_path("dp").map_err(|_| crate::Error::Invalid)?;
    packet.set_content_format(format)
          .map_err(|_| crate::Error::Invalid)?;

    let mut writer = codec::select_writer(format)?;
    let mut out = OutBuf::new(self.config.transfer.max_payload);
    crate::request::composite_read_to_payload(&mut self.registry, &list, writer.as_mut(), &mut out)?;
    packet.payload = toad_msg::Payload(out.into_vec());

    self.information_interface_send(Outgoing::new(packet, Some(ReplyKind::Send)));
    Ok(())
  }

  pub(crate) fn trigger_update_at(&mut self, now: u64, update_objects: bool) {
    if self.rd.state < State::RegistrationSent || self.rd.state > State::UpdateSent {
      return;
    }

    self.rd.trigger_update = true;
    if update_objects {
      self.rd.update_objects = true;
    }
    // short delay so the ACK of whatever triggered us drains first
    self.rd_next_event_at(Some(now + ACK_DELAY_MS));
  }

  /// A confirmable exchange (usually a NOTIFY) timed out: force the next
  /// contact with the server to be a full registration. Idempotent.
  pub(crate) fn rd_client_timeout(&mut self) {
    if !self.rd.is_registered() {
      return;
    }

    log::warn!("confirmable timeout -> re-connect and register");
    let now = self.now_ms();
    self.set_rd_state(State::DoRegistration, now);
  }

  /// The Disable executable ran on server instance `inst`.
  pub(crate) fn rd_server_disabled(&mut self, inst: u16) {
    if self.ctx.srv_obj_inst != Some(inst) {
      return;
    }

    self.rd.server_disabled = true;
    let now = self.now_ms();
    if self.rd.is_registered() {
      log::info!("server disabled, deregister");
      self.set_rd_state_delayed(State::Deregister, CLOSE_DELAY_MS, now);
    } else {
      log::info!("server disabled");
      self.set_rd_state(State::Deregistered, now);
    }
  }

  /// Outbound traffic wants the RX window open again (queue mode).
  pub(crate) fn rd_connection_resume(&mut self) {
    if self.rd.state != State::RegistrationDoneRxOff {
      return;
    }

    // the socket stays open across the RX-off window here, so an Update
    // is enough to re-open the window; a full handshake is never needed
    self.rd.state = State::RegistrationDone;
    self.rd.trigger_update = true;
    let now = self.now_ms();
    self.rd_next_event_at(Some(now));
  }

  /// `POST /bs` arrived: the bootstrap server is done writing.
  pub(crate) fn bootstrap_finish(&mut self) {
    log::info!("bootstrap data transfer done!");
    let now = self.now_ms();
    self.set_rd_state_delayed(State::BootstrapTransDone, CLOSE_DELAY_MS, now);
  }

  pub(crate) fn rd_next_event_at(&mut self, at: Option<u64>) {
    self.rd.next_event = match (self.rd.next_event, at) {
      | (Some(cur), Some(new)) => Some(cur.min(new)),
      | (cur, new) => new.or(cur),
    };
  }

  fn set_rd_state(&mut self, state: State, now: u64) {
    self.set_rd_state_delayed(state, 0, now);
  }

  fn set_rd_state_delayed(&mut self, state: State, delay_ms: u64, now: u64) {
    let mut event = None;

    if state == State::BootstrapRegDone {
      event = Some(Event::BootstrapRegComplete);
    } else if self.rd.state == State::BootstrapTransDone && state == State::DoRegistration {
      event = Some(Event::BootstrapTransferComplete);
    } else if self.rd.state == State::UpdateSent
              && matches!(state, State::RegistrationDone | State::RegistrationDoneRxOff)
    {
      self.ctx.buffer_outbound = false;
      self.push_queued_buffers();
      event = Some(Event::RegUpdateComplete);
    } else if state == State::RegistrationDone {
      self.ctx.buffer_outbound = false;
      self.push_queued_buffers();
      event = Some(Event::RegistrationComplete);
    } else if state == State::RegistrationDoneRxOff {
      event = Some(Event::QueueModeRxOff);
    } else if state == State::Deregistered && !self.rd.server_disabled {
      event = Some(Event::Disconnect);
    } else if state == State::UpdateRegistration {
      event = Some(Event::RegUpdate);
    } else if state == State::Deregister {
      event = Some(if self.rd.server_disabled {
                     Event::ServerDisabled
                   } else {
                     Event::Deregister
                   });
    }

    if self.rd.is_suspended() {
      self.rd.suspended_state = state;
    } else {
      self.rd.state = state;
    }

    if let Some(e) = event {
      self.notice(Notice::Rd(e));
    }

    if event == Some(Event::QueueModeRxOff) {
      self.ctx.buffer_outbound = true;
      self.socket_suspend();
    }

    self.rd.last_state_change = now;
    self.rd.next_event = Some(now + delay_ms);
  }

  /// Handle a lost connection: pick the event for where we were, then go
  /// to `state`.
  fn handle_timeout_state(&mut self, state: State, now: u64) {
    let event = match self.rd.state {
      | State::DoBootstrapReg
      | State::BootstrapRegSent
      | State::BootstrapRegDone
      | State::BootstrapTransDone => None,
      | State::SendRegistration
      | State::RegistrationSent
      | State::RegistrationDone
      | State::RegistrationDoneRxOff
      | State::UpdateRegistration
      | State::UpdateSent => Some(Event::RegTimeout),
      | State::Deregister | State::DeregisterSent => Some(Event::DeregisterFailure),
      | _ => None,
    };

    self.set_rd_state(state, now);
    if let Some(e) = event {
      self.notice(Notice::Rd(e));
    }
  }

  /// Handle a rejection from the server: emit the failure event for where
  /// we were, close the connection, go to `state`.
  fn handle_failure_state(&mut self, state: State, now: u64) {
    let event = match self.rd.state {
      | State::BootstrapRegSent => Some(Event::BootstrapRegFailure),
      | State::RegistrationSent => Some(Event::RegistrationFailure),
      | State::UpdateSent => {
        // update rejected: fall back to a full registration on the
        // existing connection
        log::warn!("registration update fail -> trigger full registration");
        self.context_reset();
        self.set_rd_state(State::SendRegistration, now);
        return;
      },
      | State::DeregisterSent => Some(Event::DeregisterFailure),
      | _ => None,
    };

    self.engine_stop();
    self.set_rd_state(state, now);
    if let Some(e) = event {
      self.notice(Notice::Rd(e));
    }
  }

  pub(crate) fn rd_socket_fault(&mut self) {
    let now = self.now_ms();

    if self.config.registration.bootstrap && self.rd.is_bootstrap() {
      self.ctx.sec_obj_inst = None;
      self.rd.last_update = None;

      if self.rd.state == State::BootstrapTransDone {
        // some servers close the connection right after ACKing
        // bootstrap-finish; that is not an error
        return;
      }
    }

    if self.rd.state > State::Idle && self.rd.state < State::ServerDisabled {
      self.handle_timeout_state(State::NetworkError, now);
    } else if self.rd.state != State::Suspended && !self.rd.server_disabled {
      self.handle_timeout_state(State::Idle, now);
    }
  }

  /// An RD exchange exhausted its retransmissions.
  pub(crate) fn rd_exchange_timed_out(&mut self, kind: ReplyKind) {
    let now = self.now_ms();
    match kind {
      | ReplyKind::Bootstrap => {
        log::warn!("bootstrap timeout");
        self.handle_timeout_state(State::NetworkError, now);
      },
      | ReplyKind::Register => {
        log::warn!("registration timeout");
        self.handle_timeout_state(State::NetworkError, now);
      },
      | ReplyKind::Update => {
        log::warn!("registration update timeout");
        if self.ctx.socket.is_some() {
          self.rd.close_socket = true;
        }
        self.handle_timeout_state(State::DoRegistration, now);
      },
      | ReplyKind::Deregister => {
        log::warn!("deregistration timeout");
        self.handle_timeout_state(State::Deregistered, now);
      },
      | ReplyKind::Notify | ReplyKind::Send => {},
    }
  }

  /// A reply to an RD exchange arrived.
  pub(crate) fn rd_reply(&mut self, kind: ReplyKind, packet: &Packet, now: u64) {
    match kind {
      | ReplyKind::Bootstrap => {
        if packet.code == code::CHANGED {
          log::info!("bootstrap registration done!");
          self.set_rd_state(State::BootstrapRegDone, now);
        } else {
          log::error!("bootstrap failed with code {}.{:02}; not retrying",
                      packet.code.class,
                      packet.code.detail);
          self.handle_failure_state(State::Idle, now);
        }
      },
      | ReplyKind::Register => {
        if packet.code == code::CREATED {
          let location: Vec<&str> = packet.location_path().unwrap_or_default();
          match location.as_slice() {
            | ["rd", ep, ..] if !ep.is_empty() && ep.len() < 128 => {
              self.rd.server_ep = toad_string::String::from(*ep);
              self.rd.last_update = Some(now);
              self.rd.server_disabled = false;
              self.rd.retries = 0;
              log::info!("registration done (EP='{}')", self.rd.server_ep);
              self.set_rd_state(State::RegistrationDone, now);
            },
            | _ => {
              log::error!("unexpected endpoint data returned");
              self.disable_current_server(now);
              self.handle_failure_state(State::NetworkError, now);
            },
          }
        } else {
          log::error!("registration failed with code {}.{:02}",
                      packet.code.class,
                      packet.code.detail);
          self.disable_current_server(now);
          self.handle_failure_state(State::NetworkError, now);
        }
      },
      | ReplyKind::Update => {
        if packet.code == code::CHANGED || packet.code == code::CREATED {
          self.rd.last_update = Some(now);
          self.rd.server_disabled = false;
          self.rd.retries = 0;
          log::info!("update done");
          self.set_rd_state(State::RegistrationDone, now);
        } else {
          log::error!("update failed with code {}.{:02}; retrying registration",
                      packet.code.class,
                      packet.code.detail);
          self.handle_failure_state(State::DoRegistration, now);
        }
      },
      | ReplyKind::Deregister => {
        if packet.code == code::DELETED {
          log::info!("deregistration success");
          self.set_rd_state(State::Deregistered, now);
        } else {
          log::error!("deregistration failed with code {}.{:02}; not retrying",
                      packet.code.class,
                      packet.code.detail);
          self.handle_failure_state(State::Deregistered, now);
        }
      },
      | ReplyKind::Notify | ReplyKind::Send => {},
    }
  }

  fn disable_current_server(&mut self, now: u64) {
    if let Some(srv) = self.ctx.srv_obj_inst {
      let window = self.config.registration.max_retries as u64 * EXCHANGE_LIFETIME as u64 * 1_000;
      self.disable_server(srv, Some(now + window));
    }
  }

  // update scheduling

  fn next_update(&self) -> u64 {
    let lifetime = self.rd.lifetime as u64;
    let mut period = self.config.registration.update_period as u64;
    let mut early = self.config.registration.seconds_to_update_early as u64;

    if period == 0 {
      period = lifetime;
    }
    if early > lifetime {
      early = lifetime;
    }

    let next = period.min(lifetime - early).max(MIN_UPDATE_PERIOD as u64);
    self.rd.last_update.unwrap_or(0) + next * 1_000
  }

  fn next_rx_off(&self) -> u64 {
    if self.config.queue_mode.enabled {
      self.rd.last_tx + self.config.queue_mode.uptime as u64 * 1_000
    } else {
      self.next_update()
    }
  }

  fn calc_next_event(&self) -> u64 {
    self.next_update().min(self.next_rx_off())
  }

  /// Read the lifetime from the Server object, flooring it to the
  /// configured default (and writing the floor back). Yields whether it
  /// changed since we last told the server.
  fn update_lifetime(&mut self, srv_obj_inst: u16) -> bool {
    let floor = self.config.registration.default_lifetime;
    let mut lifetime = server::lifetime(&self.registry, srv_obj_inst).unwrap_or_else(|_| {
                         log::info!("using default lifetime: {}", floor);
                         floor
                       });

    if lifetime < floor {
      lifetime = floor;
      let _ = server::set_lifetime(&mut self.registry, srv_obj_inst, lifetime);
      log::info!("overwriting server lifetime with default");
    }

    if lifetime != self.rd.lifetime {
      self.rd.lifetime = lifetime;
      true
    } else {
      false
    }
  }

  // state steps

  fn sm_do_init(&mut self, now: u64) {
    self.engine_stop();
    self.rd.trigger_update = false;
    self.rd.lifetime = 0;
    self.rd.last_update = None;
    self.rd.close_socket = false;

    if self.rd.use_bootstrap && self.config.registration.bootstrap {
      self.set_rd_state(State::DoBootstrapReg, now);
    } else {
      self.set_rd_state(State::DoRegistration, now);
    }
  }

  fn sm_do_bootstrap_reg(&mut self, now: u64) {
    if self.ctx.socket.is_some() {
      self.engine_stop();
    }

    self.ctx.bootstrap_mode = true;
    self.ctx.sec_obj_inst = security::next_bootstrap_inst(&self.registry, self.ctx.sec_obj_inst);
    if self.ctx.sec_obj_inst.is_none() {
      log::warn!("no bootstrap servers found");
      self.set_rd_state(State::NetworkError, now);
      return;
    }

    log::info!("bootstrap started with endpoint '{}' using security object {:?}",
               self.rd.ep_name,
               self.ctx.sec_obj_inst);

    if let Err(e) = self.engine_start() {
      log::error!("cannot init connection ({:?})", e);
      self.set_rd_state(State::NetworkError, now);
      return;
    }

    match self.send_bootstrap_registration() {
      | Ok(()) => self.set_rd_state(State::BootstrapRegSent, now),
      | Err(e) => {
        log::error!("bootstrap registration err: {:?}", e);
        self.set_rd_state(State::NetworkError, now);
      },
    }
  }

  fn send_bootstrap_registration(&mut self) -> Result<(), crate::Error> {
    let mid = self.next_mid();
    let token = self.next_token();
    let mut packet = Packet::new(Type::Con, code::POST, mid, token);
    packet.set_path("bs").map_err(|_| crate::Error::Invalid)?;
    packet.add_query(format!("ep={}", self.rd.ep_name))
          .map_err(|_| crate::Error::Invalid)?;

    if self.config.version == crate::config::Lwm2mVersion::V1_1 {
      let pct = u16::from(&codec::default_accept(self.config.version));
      packet.add_query(format!("pct={}", pct))
            .map_err(|_| crate::Error::Invalid)?;
    }

    log::debug!("register with bootstrap server as '{}'", self.rd.ep_name);
    self.send_message_async(Outgoing::new(packet, Some(ReplyKind::Bootstrap)));
    Ok(())
  }

  fn sm_bootstrap_trans_done(&mut self, now: u64) {
    self.engine_stop();
    self.ctx.sec_obj_inst = None;
    self.rd.use_bootstrap = false;
    self.set_rd_state(State::DoRegistration, now);
  }

  fn sm_do_registration(&mut self, now: u64) {
    if self.ctx.connection_suspended {
      self.ctx.connection_suspended = false;
      if self.ctx.socket.is_none() && self.engine_start().is_err() {
        self.context_close();
        self.set_rd_state(State::DoRegistration, now);
        return;
      }
    } else {
      let mut select_srv = true;

      self.rd.last_update = None;
      self.ctx.bootstrap_mode = false;

      if self.ctx.socket.is_some() {
        if self.rd.close_socket {
          self.rd.close_socket = false;
          self.engine_stop();
        } else {
          // keep the connection, retry registration with the same server
          self.context_reset();
          select_srv = false;
        }
      }

      if select_srv {
        let srv = match server::select(&self.registry, |i| self.server_enabled(i, now)) {
          | Some(s) => s,
          | None => {
            log::error!("unable to find a valid server instance");
            return self.bootstrap_or_retry(now);
          },
        };

        self.ctx.srv_obj_inst = Some(srv);
        self.update_lifetime(srv);

        let sec = server::ssid(&self.registry, srv)
                    .and_then(|ssid| security::short_id_to_inst(&self.registry, ssid));
        match sec {
          | Some(sec) => self.ctx.sec_obj_inst = Some(sec),
          | None => {
            log::error!("unable to find a valid security instance");
            self.disable_server(srv, None);
            return self.bootstrap_or_retry(now);
          },
        }

        log::info!("RD client started with endpoint '{}' with client lifetime {} using server object {}",
                   self.rd.ep_name,
                   self.rd.lifetime,
                   srv);

        if let Err(e) = self.engine_start() {
          log::error!("cannot init connection ({:?})", e);
          self.engine_stop();
          self.set_rd_state(State::NetworkError, now);
          return;
        }
      }
    }

    self.sm_send_registration_msg(now);
  }

  fn bootstrap_or_retry(&mut self, now: u64) {
    if !self.rd.server_disabled && self.fallback_to_bootstrap(now) {
      self.engine_stop();
      return;
    }

    self.engine_stop();
    self.set_rd_state(State::NetworkError, now);
  }

  fn fallback_to_bootstrap(&mut self, now: u64) -> bool {
    if !self.config.registration.bootstrap {
      return false;
    }

    let fallback = self.ctx
                       .srv_obj_inst
                       .map(|srv| server::bootstrap_on_failure(&self.registry, srv))
                       .unwrap_or(true);
    if fallback {
      self.rd.use_bootstrap = true;
      self.set_rd_state(State::Init, now);
    }
    fallback
  }

  fn sm_send_registration_msg(&mut self, now: u64) {
    match self.send_registration(true, ReplyKind::Register) {
      | Ok(()) => self.set_rd_state(State::RegistrationSent, now),
      | Err(e) => {
        log::error!("registration err: {:?}", e);
        self.set_rd_state(State::NetworkError, now);
      },
    }
  }

  /// Build and queue a register or update request. `send_obj_support`
  /// includes the link-format object payload.
  fn send_registration(&mut self, send_obj_support: bool, kind: ReplyKind) -> Result<(), crate::Error> {
    let registered = self.rd.is_registered();
    let mid = self.next_mid();
    let token = self.next_token();
    let mut packet = Packet::new(Type::Con, code::POST, mid, token);

    let path = if registered && kind == ReplyKind::Update {
      format!("rd/{}", self.rd.server_ep)
    } else {
      "rd".into()
    };
    packet.set_path(path).map_err(|_| crate::Error::Invalid)?;

    if send_obj_support {
      packet.set_content_format(codec::APP_LINK_FORMAT)
            .map_err(|_| crate::Error::Invalid)?;
    }

    if !registered {
      packet.add_query(format!("lwm2m={}", self.config.version.query_str()))
            .map_err(|_| crate::Error::Invalid)?;
      packet.add_query(format!("ep={}", self.rd.ep_name))
            .map_err(|_| crate::Error::Invalid)?;
    }

    // lifetime only when changed or on the initial registration
    let srv = self.ctx.srv_obj_inst.ok_or(crate::Error::Invalid)?;
    if self.update_lifetime(srv) || !registered {
      packet.add_query(format!("lt={}", self.rd.lifetime))
            .map_err(|_| crate::Error::Invalid)?;
    }

    if !registered {
      let queue = self.config.queue_mode.enabled;
      let binding = match (self.config.version, queue) {
        | (crate::config::Lwm2mVersion::V1_0, true) => "UQ".into(),
        | _ => server::binding(&self.registry, srv),
      };
      packet.add_query(format!("b={}", binding))
            .map_err(|_| crate::Error::Invalid)?;

      if self.config.version == crate::config::Lwm2mVersion::V1_1 && queue {
        packet.add_query("Q").map_err(|_| crate::Error::Invalid)?;
      }
    }

    if send_obj_support {
      let ct = u16::from(&codec::default_accept(self.config.version));
      let mut writer = LinkFormatWriter::new(LinkMode::Register { ct });
      let mut out = OutBuf::new(self.config.transfer.max_payload);
      self.register_payload(&mut writer, &mut out)?;
      packet.payload = toad_msg::Payload(out.into_vec());
    }

    log::debug!("registration sent [{:?}]", self.ctx.remote);
    self.send_message_async(Outgoing::new(packet, Some(kind)));
    Ok(())
  }

  /// `</>;ct=…`, every object except Security, every instance.
  fn register_payload(&mut self, writer: &mut LinkFormatWriter, out: &mut OutBuf) -> Result<(), crate::Error> {
    writer.put_begin(out, &Path::root())?;

    let objs: Vec<(u16, bool)> = self.registry
                                     .objects()
                                     .iter()
                                     .filter(|o| o.id() != security::OBJECT_ID)
                                     .map(|o| (o.id(), o.reports_version()))
                                     .collect();

    for (obj_id, reports_version) in objs {
      let instances = self.registry.instance_ids(obj_id);
      let version = self.registry
                        .object(obj_id)
                        .map(|o| o.version())
                        .unwrap_or((1, 0));

      if instances.is_empty() || reports_version {
        writer.put_corelink(out, &Path::object(obj_id))?;
        if reports_version {
          writer.put_version(out, version)?;
        }
      }

      for inst in instances {
        writer.put_corelink(out, &Path::instance(obj_id, inst))?;
      }
    }

    Ok(())
  }

  fn sm_registration_done(&mut self, now: u64) {
    if self.rd.is_registered() && (self.rd.trigger_update || now >= self.next_update()) {
      self.set_rd_state_delayed(State::UpdateRegistration, ACK_DELAY_MS, now);
    } else if self.config.queue_mode.enabled
              && self.rd.state != State::RegistrationDoneRxOff
              && now >= self.next_rx_off()
    {
      self.set_rd_state(State::RegistrationDoneRxOff, now);
      let at = self.next_update();
      self.rd.next_event = Some(at);
    } else {
      let at = self.calc_next_event();
      self.rd.next_event = Some(at);
    }
  }

  fn sm_update_registration(&mut self, now: u64) {
    let update_objects = self.rd.update_objects;
    self.rd.trigger_update = false;
    self.rd.update_objects = false;

    if self.ctx.connection_suspended {
      self.ctx.connection_suspended = false;
    }

    match self.send_registration(update_objects, ReplyKind::Update) {
      | Ok(()) => {
        self.set_rd_state(State::UpdateSent, now);
      },
      | Err(e) => {
        log::error!("registration update err: {:?}; falling back to full registration",
                    e);
        self.engine_stop();
        self.set_rd_state(State::DoRegistration, now);
      },
    }
  }

  fn sm_do_deregister(&mut self, now: u64) {
    if self.ctx.socket.is_none() {
      // connection is gone; consider ourselves deregistered
      self.context_close();
      self.set_rd_state(State::Deregistered, now);
      return;
    }

    let mid = self.next_mid();
    let token = self.next_token();
    let mut packet = Packet::new(Type::Con, code::DELETE, mid, token);
    if packet.set_path(format!("rd/{}", self.rd.server_ep)).is_err() {
      self.engine_stop();
      self.set_rd_state(State::Deregistered, now);
      return;
    }

    log::info!("deregister from '{}'", self.rd.server_ep);
    self.send_message_async(Outgoing::new(packet, Some(ReplyKind::Deregister)));
    self.set_rd_state(State::DeregisterSent, now);
  }

  fn sm_do_network_error(&mut self, now: u64) {
    log::error!("network error, retries {}", self.rd.retries);

    self.socket_close();

    if self.rd.retry_delay > 0 {
      let at = now + self.rd.retry_delay as u64 * 1_000;
      self.rd.retry_delay = 0;
      self.rd.next_event = Some(at);
      return;
    }

    self.rd.retry_delay = 1u32 << self.rd.retries;
    self.rd.retries += 1;

    if self.rd.retries > self.config.registration.max_retries {
      log::error!("network error, max retries reached ({})", self.rd.retries);

      self.disable_current_server(now);

      if self.ctx.bootstrap_mode && self.config.registration.bootstrap {
        log::debug!("in bootstrap, try fallback srv");
        match security::next_bootstrap_inst(&self.registry, self.ctx.sec_obj_inst) {
          | Some(_) => {
            self.set_rd_state(State::Init, now);
            return;
          },
          | None => return self.rd_stop_engine(now),
        }
      }

      // fall back to another server, but only to a higher-priority one
      // (or any if we have registered before) so we don't loop the list
      if let Some(next) = server::select(&self.registry, |i| self.server_enabled(i, now)) {
        let p_cur = self.ctx
                        .srv_obj_inst
                        .map(|s| server::priority(&self.registry, s))
                        .unwrap_or(u8::MAX);
        if server::priority(&self.registry, next) > p_cur || self.rd.last_update.is_some() {
          self.set_rd_state(State::Init, now);
          return;
        }
      }

      if self.rd.server_disabled {
        self.set_rd_state(State::ServerDisabled, now);
        return;
      }

      if self.fallback_to_bootstrap(now) {
        return;
      }

      return self.rd_stop_engine(now);
    }

    if self.ctx.bootstrap_mode && self.config.registration.bootstrap {
      self.context_close();
      self.ctx.sec_obj_inst = security::next_bootstrap_inst(&self.registry, self.ctx.sec_obj_inst);
      self.set_rd_state(State::DoBootstrapReg, now);
      return;
    }

    let lifetime_exceeded = match self.rd.last_update {
      | None => true,
      | Some(at) => now.saturating_sub(at) / 1_000 > self.rd.lifetime as u64,
    };
    if lifetime_exceeded {
      // no active registration left: full registration, same server
      self.set_rd_state(State::DoRegistration, now);
      return;
    }

    // connection may still be salvageable: reconnect and try an Update
    if self.ctx.socket.is_none() && self.engine_start().is_err() {
      log::error!("failed to restart socket");
      self.set_rd_state(State::NetworkError, now);
      return;
    }

    self.set_rd_state(State::UpdateRegistration, now);
  }

  fn rd_stop_engine(&mut self, now: u64) {
    let event = if self.ctx.bootstrap_mode {
      Event::BootstrapRegFailure
    } else {
      Event::NetworkError
    };
    self.notice(Notice::Rd(event));
    self.set_rd_state(State::Idle, now);
  }

  /// One pass of the registration machine; no-op until `next_event` is
  /// due.
  pub(crate) fn rd_service(&mut self, now: u64) {
    match self.rd.next_event {
      | Some(at) if now >= at => {},
      | _ => return,
    }

    self.rd.next_event = None;
    log::debug!("state: {:?}", self.rd.state);

    let mut timeout_s = 0u32;
    match self.rd.state {
      | State::Idle => {
        if self.ctx.socket.is_some() {
          self.engine_stop();
        }
      },
      | State::Init => self.sm_do_init(now),
      | State::Suspended => {},
      | State::DoBootstrapReg => self.sm_do_bootstrap_reg(now),
      | State::BootstrapRegSent | State::BootstrapRegDone => timeout_s = EXCHANGE_LIFETIME,
      | State::BootstrapTransDone => self.sm_bootstrap_trans_done(now),
      | State::DoRegistration => self.sm_do_registration(now),
      | State::SendRegistration => self.sm_send_registration_msg(now),
      | State::RegistrationSent => timeout_s = EXCHANGE_LIFETIME,
      | State::RegistrationDone | State::RegistrationDoneRxOff => self.sm_registration_done(now),
      | State::UpdateRegistration => self.sm_update_registration(now),
      | State::UpdateSent => timeout_s = EXCHANGE_LIFETIME,
      | State::ServerDisabled => {
        if server::select(&self.registry, |i| self.server_enabled(i, now)).is_some() {
          self.set_rd_state(State::Init, now);
        } else {
          // wait for a server to come back
          self.rd.next_event = Some(now + 60_000);
        }
      },
      | State::Deregister => self.sm_do_deregister(now),
      | State::DeregisterSent => timeout_s = EXCHANGE_LIFETIME,
      | State::Deregistered => {
        self.engine_stop();
        if self.rd.server_disabled {
          self.set_rd_state(State::ServerDisabled, now);
        } else {
          self.set_rd_state(State::Idle, now);
        }
      },
      | State::NetworkError => self.sm_do_network_error(now),
    }

    if timeout_s > 0 {
      let end = self.rd.last_state_change + timeout_s as u64 * 1_000;
      if end < now {
        log::debug!("state machine timed out");
        self.handle_timeout_state(State::Init, now);
      } else if self.rd.next_event.map(|at| at > end).unwrap_or(true) {
        self.rd.next_event = Some(end);
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use toad_msg::{Id, TryFromBytes, TryIntoBytes};

  use super::*;
  use crate::config::Config;
  use crate::engine::Notice;
  use crate::test::{test_engine, ClockMock, SockMock};

  fn parse(dgram: &[u8]) -> Packet {
    Packet::try_from_bytes(dgram).unwrap()
  }

  fn reply(req: &Packet, code: toad_msg::Code) -> Vec<u8> {
    Packet::new(Type::Ack, code, req.id, req.token).try_into_bytes::<Vec<u8>>()
                                                   .unwrap()
  }

  fn fast_config() -> Config {
    let mut config = Config::default();
    config.transfer.ack_timeout_ms = 100;
    config.transfer.max_retransmit = 1;
    config.registration.max_retries = 1;
    config
  }

  /// Step until the registration request is on the wire, answer 2.01,
  /// and step once more.
  fn register(e: &mut Engine<crate::test::Platform>, location: &str) -> Packet {
    e.start("ep1", false).unwrap();
    for _ in 0..4 {
      e.step().unwrap();
    }

    let sock = SockMock::last();
    let sent = sock.sent();
    assert_eq!(sent.len(), 1, "expected exactly the register request");
    let req = parse(&sent[0]);

    let mut rsp = Packet::new(Type::Ack, code::CREATED, req.id, req.token);
    rsp.add_location_path("rd").unwrap();
    rsp.add_location_path(location).unwrap();
    sock.push_rx(rsp.try_into_bytes::<Vec<u8>>().unwrap());
    e.step().unwrap();
    assert_eq!(e.rd_state(), State::RegistrationDone);
    req
  }

  #[test]
  fn registration_request_carries_the_rd_queries() {
    let (mut e, _clock) = test_engine(Config::default());
    server::set_lifetime(e.registry_mut(), 0, 86_400).unwrap();
    e.registry_mut().take_dirty();

    let req = register(&mut e, "abc");

    assert_eq!(req.code, code::POST);
    let path: Vec<&str> = req.path().unwrap();
    assert_eq!(path, vec!["rd"]);

    let queries: Vec<&str> = req.query().unwrap();
    assert!(queries.contains(&"lwm2m=1.1"), "{:?}", queries);
    assert!(queries.contains(&"ep=ep1"), "{:?}", queries);
    assert!(queries.contains(&"lt=86400"), "{:?}", queries);
    assert!(queries.contains(&"b=U"), "{:?}", queries);

    assert_eq!(req.content_format(), Some(crate::codec::APP_LINK_FORMAT));
    let body = String::from_utf8(req.payload.0.clone()).unwrap();
    assert!(body.starts_with("</>;rt=\"oma.lwm2m\";ct=112"), "{}", body);
    assert!(body.contains("</1/0>"), "{}", body);
    assert!(body.contains("</3/0>"), "{}", body);
    assert!(!body.contains("</0"), "security must not be advertised: {}", body);

    assert_eq!(drain_rd_events(&mut e).last().copied(),
               Some(Event::RegistrationComplete));
  }

  fn drain_rd_events(e: &mut Engine<crate::test::Platform>) -> Vec<Event> {
    let mut events = vec![];
    while let Some(n) = e.poll_notice() {
      if let Notice::Rd(ev) = n {
        events.push(ev);
      }
    }
    events
  }

  #[test]
  fn lifetime_write_schedules_an_update_with_the_new_lt() {
    let (mut e, clock) = test_engine(Config::default());
    server::set_lifetime(e.registry_mut(), 0, 86_400).unwrap();
    e.registry_mut().take_dirty();
    register(&mut e, "abc");
    let sock = SockMock::last();
    sock.sent();

    server::set_lifetime(e.registry_mut(), 0, 3_600).unwrap();
    e.step().unwrap();

    // the update is scheduled within the ACK grace period
    clock.advance(crate::config::ACK_DELAY_MS);
    e.step().unwrap(); // RegistrationDone -> UpdateRegistration (delayed)
    clock.advance(crate::config::ACK_DELAY_MS);
    e.step().unwrap(); // UpdateRegistration -> UpdateSent

    assert_eq!(e.rd_state(), State::UpdateSent);
    let sent = sock.sent();
    assert_eq!(sent.len(), 1);
    let update = parse(&sent[0]);
    let path: Vec<&str> = update.path().unwrap();
    assert_eq!(path, vec!["rd", "abc"]);
    let queries: Vec<&str> = update.query().unwrap();
    assert_eq!(queries, vec!["lt=3600"], "update carries only the new lifetime");

    sock.push_rx(reply(&update, code::CHANGED));
    e.step().unwrap();
    assert_eq!(e.rd_state(), State::RegistrationDone);
    assert!(drain_rd_events(&mut e).contains(&Event::RegUpdateComplete));
  }

  fn add_second_server(e: &mut Engine<crate::test::Platform>, bootstrap_inst: bool) {
    let reg = e.registry_mut();
    reg.create_instance(0, 1).unwrap();
    reg.set_string(&Path::resource(0, 1, 0), "coap://192.0.2.2").unwrap();
    reg.set_u16(&Path::resource(0, 1, 10), 102).unwrap();
    reg.create_instance(1, 1).unwrap();
    reg.set_u16(&Path::resource(1, 1, 0), 102).unwrap();

    reg.set_u8(&Path::resource(1, 0, server::REG_PRIORITY), 10).unwrap();
    reg.set_u8(&Path::resource(1, 1, server::REG_PRIORITY), 20).unwrap();

    if bootstrap_inst {
      reg.create_instance(0, 2).unwrap();
      reg.set_string(&Path::resource(0, 2, 0), "coap://192.0.2.3").unwrap();
      reg.set_bool(&Path::resource(0, 2, 1), true).unwrap();
    }
    reg.take_dirty();
  }

  fn spin(e: &mut Engine<crate::test::Platform>, clock: &ClockMock, total_ms: u64) {
    let mut elapsed = 0;
    while elapsed < total_ms {
      clock.advance(50);
      elapsed += 50;
      e.step().unwrap();
    }
  }

  #[test]
  fn unreachable_server_is_disabled_and_the_next_one_tried() {
    let (mut e, clock) = test_engine(fast_config());
    add_second_server(&mut e, true);

    e.start("ep1", false).unwrap();
    for _ in 0..4 {
      e.step().unwrap();
    }
    assert_eq!(e.rd_state(), State::RegistrationSent);
    let first = SockMock::last();
    assert_eq!(first.addr.get().map(|a| a.to_string()),
               Some("192.0.2.1:5683".into()),
               "priority 10 server goes first");

    // no reply: retransmissions exhaust, retries exhaust, the server is
    // disabled and the priority-20 server is selected
    spin(&mut e, &clock, 2_500);
    let second = SockMock::last();
    assert_eq!(second.addr.get().map(|a| a.to_string()),
               Some("192.0.2.2:5683".into()));

    // let that one fail too; with bootstrap-on-failure set the machine
    // falls back to the bootstrap server
    spin(&mut e, &clock, 30_000);
    assert!(SockMock::last().addr.get().map(|a| a.to_string())
                                 == Some("192.0.2.3:5683".into())
            || e.rd_state() == State::DoBootstrapReg
            || e.rd_state() == State::BootstrapRegSent,
            "expected a bootstrap attempt, got {:?}",
            e.rd_state());
  }

  #[test]
  fn queue_mode_closes_the_rx_window_and_buffers_sends() {
    let mut config = Config::default();
    config.queue_mode.enabled = true;
    let (mut e, clock) = test_engine(config);
    server::set_lifetime(e.registry_mut(), 0, 86_400).unwrap();
    e.registry_mut().take_dirty();
    register(&mut e, "q");
    let sock = SockMock::last();
    sock.sent();

    // silence for longer than the queue-mode uptime closes the window
    spin(&mut e, &clock, (config.queue_mode.uptime as u64 + 2) * 1_000);
    assert_eq!(e.rd_state(), State::RegistrationDoneRxOff);
    assert!(drain_rd_events(&mut e).contains(&Event::QueueModeRxOff));

    // an outbound Send is buffered and wakes the machine back up with an
    // update; the buffered message flushes once the update completes
    e.send(&[Path::resource(3, 0, 0)]).unwrap();
    assert_eq!(e.ctx.queued_messages.len(), 1);

    clock.advance(200);
    e.step().unwrap();
    clock.advance(200);
    e.step().unwrap();
    assert_eq!(e.rd_state(), State::UpdateSent);
    let update = parse(&sock.sent().pop().unwrap());
    sock.push_rx(reply(&update, code::CHANGED));
    e.step().unwrap();

    let sent = sock.sent();
    assert_eq!(sent.len(), 1, "buffered Send flushed after the update");
    let send_req = parse(&sent[0]);
    let path: Vec<&str> = send_req.path().unwrap();
    assert_eq!(path, vec!["dp"]);
  }

  #[test]
  fn stop_deregisters_first() {
    let (mut e, _clock) = test_engine(Config::default());
    register(&mut e, "abc");
    let sock = SockMock::last();
    sock.sent();

    e.stop(true);
    e.step().unwrap();
    assert_eq!(e.rd_state(), State::DeregisterSent);

    let dereg = parse(&sock.sent().pop().unwrap());
    assert_eq!(dereg.code, code::DELETE);
    let path: Vec<&str> = dereg.path().unwrap();
    assert_eq!(path, vec!["rd", "abc"]);

    sock.push_rx(reply(&dereg, code::DELETED));
    e.step().unwrap();
    e.step().unwrap();
    e.step().unwrap();
    assert_eq!(e.rd_state(), State::Idle);

    let events = drain_rd_events(&mut e);
    assert!(events.contains(&Event::Deregister), "{:?}", events);
    assert!(events.contains(&Event::Disconnect), "{:?}", events);
  }

  #[test]
  fn bootstrap_flow_reaches_registration() {
    let (mut e, _clock) = test_engine(Config::default());
    // mark instance 0's security as bootstrap-capable, add a real server
    // in instance 1
    add_second_server(&mut e, false);
    e.registry_mut()
     .set_bool(&Path::resource(0, 0, 1), true)
     .unwrap();
    e.registry_mut().take_dirty();

    e.start("ep1", true).unwrap();
    for _ in 0..4 {
      e.step().unwrap();
    }
    assert_eq!(e.rd_state(), State::BootstrapRegSent);

    let sock = SockMock::last();
    let bs_req = parse(&sock.sent().pop().unwrap());
    let path: Vec<&str> = bs_req.path().unwrap();
    assert_eq!(path, vec!["bs"]);
    let queries: Vec<&str> = bs_req.query().unwrap();
    assert!(queries.contains(&"ep=ep1"), "{:?}", queries);
    assert!(queries.contains(&"pct=112"), "{:?}", queries);

    sock.push_rx(reply(&bs_req, code::CHANGED));
    e.step().unwrap();
    assert_eq!(e.rd_state(), State::BootstrapRegDone);
    assert!(drain_rd_events(&mut e).contains(&Event::BootstrapRegComplete));

    // the bootstrap server writes config, then finishes
    let mut finish = Packet::new(Type::Con, code::POST, Id(900), toad_msg::Token(Default::default()));
    finish.set_path("bs").unwrap();
    sock.push_rx(finish.try_into_bytes::<Vec<u8>>().unwrap());
    e.step().unwrap();
    assert_eq!(e.rd_state(), State::BootstrapTransDone);

    // after the close delay the machine rolls into registration proper
    let clock = _clock;
    spin(&mut e, &clock, 2 * crate::config::CLOSE_DELAY_MS);
    assert!(matches!(e.rd_state(),
                     State::DoRegistration | State::SendRegistration | State::RegistrationSent),
            "got {:?}",
            e.rd_state());
    assert!(drain_rd_events(&mut e).contains(&Event::BootstrapTransferComplete));
  }
}
