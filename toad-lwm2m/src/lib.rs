//! `toad-lwm2m` is a client implementation of the OMA LightweightM2M
//! device-management protocol (LwM2M 1.0 and 1.1) built on top of the
//! [`toad-msg`](toad_msg) CoAP message types.
//!
//! ## LwM2M
//! LwM2M is a thin device-management layer on top of CoAP. A device
//! ("client") registers with one or more management servers and exposes its
//! state as a four-level tree of **Objects**, **Object Instances**,
//! **Resources** and **Resource Instances**, addressed by paths like
//! `/3/0/9` (Device object, instance 0, battery level).
//!
//! The pieces this crate provides:
//! - a [`registry`] of typed objects & resources the server operates on
//! - a [request dispatcher](crate::request) mapping CoAP methods onto
//!   Read / Write / Execute / Create / Delete / Discover / Write-Attributes
//!   and the LwM2M 1.1 composite (FETCH / iPATCH) operations
//! - an [observation engine](crate::observe) that emits NOTIFYs with
//!   `pmin`/`pmax` rate gating and attribute inheritance
//! - a [registration state machine](crate::rd) covering bootstrap,
//!   registration, periodic updates, queue mode and multi-server fallback
//! - a [message layer](crate::msg) with retransmission, reply matching and
//!   CoAP block-1 reassembly
//! - six content-format codecs (plain text, OMA-TLV, CBOR, SenML-JSON,
//!   SenML-CBOR, CoRE link-format) behind one [writer/reader seam](codec)
//!
//! The CoAP byte layout, option encoding and token machinery come from
//! `toad-msg`; sockets and clocks are abstracted behind the
//! [`net::Socket`] and [`time::Clock`] traits so the engine runs anywhere
//! the rest of the toad family does.
//!
//! ## A tiny client
//! ```no_run
//! use toad_lwm2m::{platform, Config, Engine};
//!
//! let mut engine: Engine<platform::Std> = Engine::new(Config::default());
//! toad_lwm2m::obj::register_core_objects(engine.registry_mut()).unwrap();
//! engine.registry_mut()
//!       .set_string(&"/0/0/0".parse().unwrap(), "coap://192.0.2.1:5683")
//!       .unwrap();
//! engine.start("my-endpoint", false).unwrap();
//! engine.run().unwrap();
//! ```

// docs
#![doc(html_root_url = "https://docs.rs/toad-lwm2m/0.1.0")]
#![cfg_attr(any(docsrs, feature = "docs"), feature(doc_cfg))]
// -
// style
#![allow(clippy::unused_unit)]
// -
// deny
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![cfg_attr(not(test), deny(unsafe_code))]
// -
// warnings
#![cfg_attr(not(test), warn(unreachable_pub))]

#[cfg(test)]
pub(crate) mod test;

pub(crate) mod logging;

/// errors and their CoAP response-code mapping
pub mod error;

/// the `(object, instance, resource, resource-instance)` path model
pub mod path;

/// primitive resource types and typed values
pub mod value;

/// the object / instance / resource registry
pub mod registry;

/// content-format writers & readers
pub mod codec;

/// outbound messages, retransmission, reply matching, block-1 contexts
pub mod msg;

/// inbound request dispatch
pub mod request;

/// observers & notifications
pub mod observe;

/// the registration (RD) client state machine
pub mod rd;

/// built-in Security / Server / Device objects
pub mod obj;

/// the engine: contexts, sockets, service loop
pub mod engine;

/// network abstractions
pub mod net;

/// time abstractions
pub mod time;

/// platform configuration
pub mod platform;

/// configuring runtime behavior
pub mod config;

#[doc(inline)]
pub use config::Config;
#[doc(inline)]
pub use engine::Engine;
#[doc(inline)]
pub use error::Error;
#[doc(inline)]
pub use path::{Level, Path, PathList};
#[doc(inline)]
pub use registry::Registry;
#[doc(inline)]
pub use value::{ObjLnk, ResourceKind, Value};

macro_rules! code {
  (rfc7252($section:literal) $name:ident = $c:literal*$d:literal) => {
    #[doc = toad_macros::rfc_7252_doc!($section)]
    #[allow(clippy::zero_prefixed_literal)]
    pub const $name: toad_msg::Code = toad_msg::Code::new($c, $d);
  };
  (#[doc = $doc:expr] $name:ident = $c:literal*$d:literal) => {
    #[doc = $doc]
    #[allow(clippy::zero_prefixed_literal)]
    pub const $name: toad_msg::Code = toad_msg::Code::new($c, $d);
  };
}

pub(crate) use code;
