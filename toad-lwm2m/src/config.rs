/// Sizes of the engine's fixed tables.
///
/// Every table is allocated once when the [`Engine`](crate::Engine) is
/// created; running out of a table surfaces as
/// [`Error::NoMem`](crate::Error::NoMem) naming the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tables {
  /// Outbound messages that may be queued per server at once.
  ///
  /// ```
  /// use toad_lwm2m::config::Tables;
  ///
  /// assert_eq!(Tables::default().messages, 10);
  /// ```
  pub messages: usize,
  /// In-flight confirmable messages per server.
  pub pendings: usize,
  /// Reply matchers per server.
  pub replies: usize,
  /// Observers per server.
  ///
  /// ```
  /// use toad_lwm2m::config::Tables;
  ///
  /// assert_eq!(Tables::default().observers, 10);
  /// ```
  pub observers: usize,
  /// Write-attribute pool shared by the whole registry.
  pub attributes: usize,
  /// Concurrent block-1 reassembly contexts.
  pub block1_contexts: usize,
  /// Paths per composite operation / composite observer.
  pub composite_paths: usize,
}

impl Default for Tables {
  fn default() -> Self {
    Tables { messages: 10,
             pendings: 5,
             replies: 5,
             observers: 10,
             attributes: 20,
             block1_contexts: 3,
             composite_paths: 6 }
  }
}

/// Registration lifecycle knobs, all in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Registration {
  /// Floor for the lifetime read from the Server object; a smaller value
  /// is overwritten in the registry.
  ///
  /// ```
  /// use toad_lwm2m::config::Registration;
  ///
  /// assert_eq!(Registration::default().default_lifetime, 30);
  /// ```
  pub default_lifetime: u32,
  /// Period between registration updates. `0` derives the period from the
  /// lifetime.
  pub update_period: u32,
  /// How long before the lifetime runs out an update is sent.
  pub seconds_to_update_early: u32,
  /// Consecutive network failures before the current server is disabled
  /// and the next candidate is tried.
  ///
  /// ```
  /// use toad_lwm2m::config::Registration;
  ///
  /// assert_eq!(Registration::default().max_retries, 5);
  /// ```
  pub max_retries: u8,
  /// Whether the bootstrap flow is available at all.
  pub bootstrap: bool,
}

impl Default for Registration {
  fn default() -> Self {
    Registration { default_lifetime: 30,
                   update_period: 0,
                   seconds_to_update_early: 10,
                   max_retries: 5,
                   bootstrap: true }
  }
}

/// Queue mode (`b=UQ`): sleep the receive path between exchanges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueueMode {
  /// Register with `b=UQ` and buffer notifications while the RX window is
  /// closed. Off by default.
  pub enabled: bool,
  /// Seconds of TX silence before the RX window closes.
  ///
  /// ```
  /// use toad_lwm2m::config::QueueMode;
  ///
  /// assert_eq!(QueueMode::default().uptime, 93);
  /// ```
  pub uptime: u32,
}

impl Default for QueueMode {
  fn default() -> Self {
    QueueMode { enabled: false,
                uptime: 93 }
  }
}

/// CoAP transfer parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Transfer {
  /// Preferred block size for blockwise transfers. Must be one of
  /// 16/32/64/128/256/512/1024.
  ///
  /// ```
  /// use toad_lwm2m::config::Transfer;
  ///
  /// assert_eq!(Transfer::default().block_size, 256);
  /// ```
  pub block_size: u16,
  /// Largest CoAP message we will build or accept.
  pub max_payload: usize,
  /// Retransmissions of an un-ACKed confirmable message before its
  /// timeout handler runs.
  ///
  /// ```
  /// use toad_lwm2m::config::Transfer;
  ///
  /// assert_eq!(Transfer::default().max_retransmit, 4);
  /// ```
  pub max_retransmit: u8,
  /// Delay before the first retransmission, milliseconds. Doubles per
  /// attempt.
  pub ack_timeout_ms: u64,
}

impl Default for Transfer {
  fn default() -> Self {
    Transfer { block_size: 256,
               max_payload: 1280,
               max_retransmit: 4,
               ack_timeout_ms: 2_000 }
  }
}

/// Runtime config for an [`Engine`](crate::Engine).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Config {
  /// See [`Tables`]
  pub tables: Tables,
  /// See [`Registration`]
  pub registration: Registration,
  /// See [`QueueMode`]
  pub queue_mode: QueueMode,
  /// See [`Transfer`]
  pub transfer: Transfer,
  /// See [`Lwm2mVersion`]
  pub version: Lwm2mVersion,
}

/// Which protocol version we speak (affects register queries, composite
/// operations and default content formats).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Lwm2mVersion {
  /// LwM2M 1.0
  V1_0,
  /// LwM2M 1.1
  V1_1,
}

impl Default for Lwm2mVersion {
  fn default() -> Self {
    Lwm2mVersion::V1_1
  }
}

impl Lwm2mVersion {
  /// The `lwm2m=` query value sent on register.
  pub fn query_str(&self) -> &'static str {
    match self {
      | Lwm2mVersion::V1_0 => "1.0",
      | Lwm2mVersion::V1_1 => "1.1",
    }
  }
}

/// CoAP-derived upper bound on a request/response exchange, seconds.
pub const EXCHANGE_LIFETIME: u32 = 247;

/// How often the engine tick runs when nothing else is due, milliseconds.
pub const TICK_INTERVAL_MS: u64 = 500;

/// A started blockwise transfer is abandoned after this long without a
/// block, milliseconds.
pub const BLOCK_TRANSFER_TTL_MS: u64 = 30_000;

/// Floor on the registration update period, seconds.
pub const MIN_UPDATE_PERIOD: u32 = 15;

/// Grace period between triggering an update and sending it, so the ACK of
/// the triggering exchange gets out first. Milliseconds.
pub const ACK_DELAY_MS: u64 = 100;

/// Delay before closing a connection, letting a final ACK drain.
/// Milliseconds.
pub const CLOSE_DELAY_MS: u64 = 1_000;
