//! The Server object (id 1).
//!
//! One instance per management server the client knows about. The
//! registration state machine reads lifetimes, priorities and the
//! bootstrap-fallback flag from here; the engine wires up the side
//! effects of Disable, the Registration Update Trigger and the Bootstrap
//! Trigger, and re-schedules updates when the lifetime resource changes.

use crate::error::Error;
use crate::path::Path;
use crate::registry::{Field, Object, Perm, Registry};
use crate::value::{ResourceKind, Value};

/// `/1`
pub const OBJECT_ID: u16 = 1;

/// 1..=65534; links to the Security instance with the same SSID
pub const SHORT_SERVER_ID: u16 = 0;
/// registration lifetime, seconds
pub const LIFETIME: u16 = 1;
/// default `pmin` for observations under this server
pub const DEFAULT_MIN_PERIOD: u16 = 2;
/// default `pmax` for observations under this server
pub const DEFAULT_MAX_PERIOD: u16 = 3;
/// executable: deregister and stay away for Disable Timeout
pub const DISABLE: u16 = 4;
/// seconds the Disable executable keeps us away
pub const DISABLE_TIMEOUT: u16 = 5;
/// store NOTIFYs while offline
pub const STORE_NOTIFY: u16 = 6;
/// "U" / "UQ"
pub const BINDING: u16 = 7;
/// executable: send a registration update now
pub const REG_UPDATE_TRIGGER: u16 = 8;
/// executable (1.1): request bootstrap
pub const BOOTSTRAP_UPDATE_TRIGGER: u16 = 9;
/// 1.1: lower value = tried first
pub const REG_PRIORITY: u16 = 13;
/// 1.1: fall back to bootstrap when registration finally fails
pub const BOOTSTRAP_ON_REGISTRATION_FAILURE: u16 = 16;
/// 1.1: suppress the Send operation toward this server
pub const MUTE_SEND: u16 = 23;

/// The object descriptor.
pub fn object() -> Object {
  Object::new(OBJECT_ID,
              (1, 1),
              vec![Field::new(SHORT_SERVER_ID, ResourceKind::U16, Perm::R),
                   Field::new(LIFETIME, ResourceKind::U32, Perm::RW).default_value(Value::U32(30)),
                   Field::new(DEFAULT_MIN_PERIOD, ResourceKind::U32, Perm::RW).optional(),
                   Field::new(DEFAULT_MAX_PERIOD, ResourceKind::U32, Perm::RW).optional(),
                   Field::new(DISABLE, ResourceKind::String, Perm::X).optional(),
                   Field::new(DISABLE_TIMEOUT, ResourceKind::U32, Perm::RW)
                     .default_value(Value::U32(86_400))
                     .optional(),
                   Field::new(STORE_NOTIFY, ResourceKind::Bool, Perm::RW),
                   Field::new(BINDING, ResourceKind::String, Perm::RW)
                     .capacity(4)
                     .default_value(Value::String("U".into())),
                   Field::new(REG_UPDATE_TRIGGER, ResourceKind::String, Perm::X),
                   Field::new(BOOTSTRAP_UPDATE_TRIGGER, ResourceKind::String, Perm::X).optional(),
                   Field::new(REG_PRIORITY, ResourceKind::U8, Perm::RW).optional(),
                   Field::new(BOOTSTRAP_ON_REGISTRATION_FAILURE, ResourceKind::Bool, Perm::RW)
                     .default_value(Value::Bool(true))
                     .optional(),
                   Field::new(MUTE_SEND, ResourceKind::Bool, Perm::RW).optional()],
              4).core()
}

/// Short Server ID of a Server instance.
pub fn ssid(reg: &Registry, inst: u16) -> Option<u16> {
  reg.get_u16(&Path::resource(OBJECT_ID, inst, SHORT_SERVER_ID))
     .ok()
}

/// Lifetime in seconds, if the instance exists.
pub fn lifetime(reg: &Registry, inst: u16) -> Result<u32, Error> {
  reg.get_u32(&Path::resource(OBJECT_ID, inst, LIFETIME))
}

/// Overwrite the lifetime (the engine floors it to the configured
/// default).
pub fn set_lifetime(reg: &mut Registry, inst: u16, seconds: u32) -> Result<(), Error> {
  reg.set_u32(&Path::resource(OBJECT_ID, inst, LIFETIME), seconds)
     .map(|_| ())
}

/// Transport binding, `"U"` when unset.
pub fn binding(reg: &Registry, inst: u16) -> String {
  reg.get_string(&Path::resource(OBJECT_ID, inst, BINDING))
     .unwrap_or_else(|_| "U".into())
}

/// Default observation `pmin` for this server, seconds.
pub fn default_pmin(reg: &Registry, inst: u16) -> i32 {
  reg.get_u32(&Path::resource(OBJECT_ID, inst, DEFAULT_MIN_PERIOD))
     .map(|v| v as i32)
     .unwrap_or(0)
}

/// Default observation `pmax` for this server, seconds.
pub fn default_pmax(reg: &Registry, inst: u16) -> i32 {
  reg.get_u32(&Path::resource(OBJECT_ID, inst, DEFAULT_MAX_PERIOD))
     .map(|v| v as i32)
     .unwrap_or(0)
}

/// Registration priority: lower tries first. Instances without the 1.1
/// resource rank by instance id.
pub fn priority(reg: &Registry, inst: u16) -> u8 {
  reg.get_u8(&Path::resource(OBJECT_ID, inst, REG_PRIORITY))
     .unwrap_or((inst % u8::MAX as u16) as u8)
}

/// Seconds a Disable execution keeps us deregistered. 86400 when unset.
pub fn disable_timeout(reg: &Registry, inst: u16) -> u32 {
  reg.get_u32(&Path::resource(OBJECT_ID, inst, DISABLE_TIMEOUT))
     .unwrap_or(86_400)
}

/// May we fall back to bootstrap once this server is out of retries?
/// Defaults to true, like the original.
pub fn bootstrap_on_failure(reg: &Registry, inst: u16) -> bool {
  reg.get_bool(&Path::resource(OBJECT_ID, inst, BOOTSTRAP_ON_REGISTRATION_FAILURE))
     .unwrap_or(true)
}

/// Is the Send operation muted toward this server?
pub fn mute_send(reg: &Registry, inst: u16) -> bool {
  reg.get_bool(&Path::resource(OBJECT_ID, inst, MUTE_SEND))
     .unwrap_or(false)
}

/// Pick the server instance to register with: enabled instances with a
/// sane SSID, lowest priority value first.
///
/// `enabled` is the engine's disable-window check.
pub fn select(reg: &Registry, enabled: impl Fn(u16) -> bool) -> Option<u16> {
  let mut candidates: Vec<u16> =
    reg.instance_ids(OBJECT_ID)
       .into_iter()
       .filter(|i| enabled(*i))
       .filter(|i| !matches!(ssid(reg, *i), None | Some(0) | Some(u16::MAX)))
       .collect();

  candidates.sort_by_key(|i| (priority(reg, *i), *i));
  let found = candidates.first().copied();
  if found.is_none() {
    log::error!("no server candidate found");
  }
  found
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::Config;

  fn reg_with_servers(insts: &[(u16, u16, u8)]) -> Registry {
    let mut reg = Registry::new(&Config::default());
    reg.register_object(object()).unwrap();
    for (inst, short_id, prio) in insts {
      reg.create_instance(OBJECT_ID, *inst).unwrap();
      reg.set_u16(&Path::resource(OBJECT_ID, *inst, SHORT_SERVER_ID), *short_id)
         .unwrap();
      reg.set_u8(&Path::resource(OBJECT_ID, *inst, REG_PRIORITY), *prio)
         .unwrap();
    }
    reg
  }

  #[test]
  fn select_prefers_low_priority_values() {
    let reg = reg_with_servers(&[(0, 101, 20), (1, 102, 10)]);
    assert_eq!(select(&reg, |_| true), Some(1));
  }

  #[test]
  fn select_skips_disabled_and_invalid_ssids() {
    let reg = reg_with_servers(&[(0, 101, 10), (1, 0, 0), (2, 102, 20)]);
    assert_eq!(select(&reg, |i| i != 0), Some(2));
    assert_eq!(select(&reg, |_| false), None);
  }

  #[test]
  fn defaults_apply_when_resources_are_unset() {
    let reg = reg_with_servers(&[(0, 101, 0)]);
    assert_eq!(disable_timeout(&reg, 0), 86_400);
    assert!(bootstrap_on_failure(&reg, 0));
    assert!(!mute_send(&reg, 0));
  }
}
