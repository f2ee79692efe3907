//! The Security object (id 0).
//!
//! Holds the server URI and credentials. Never visible to management
//! servers — the dispatcher refuses to read, discover or register it —
//! but the bootstrap server writes it freely.

use crate::error::Error;
use crate::path::Path;
use crate::registry::{Field, Object, Perm, Registry};
use crate::value::ResourceKind;

/// `/0`
pub const OBJECT_ID: u16 = 0;

/// `coap(s)://host[:port]`
pub const SERVER_URI: u16 = 0;
/// is this entry the bootstrap server?
pub const BOOTSTRAP_SERVER: u16 = 1;
/// 0 = PSK, 2 = certificate, 3 = no security
pub const SECURITY_MODE: u16 = 2;
/// public key or PSK identity
pub const PUBLIC_KEY_OR_IDENTITY: u16 = 3;
/// the server's public key
pub const SERVER_PUBLIC_KEY: u16 = 4;
/// secret key / PSK
pub const SECRET_KEY: u16 = 5;
/// links this Security instance to the Server instance with the same SSID
pub const SHORT_SERVER_ID: u16 = 10;

/// Security mode 3, "NoSec".
pub const SEC_MODE_NO_SEC: u8 = 3;

/// The object descriptor.
pub fn object() -> Object {
  Object::new(OBJECT_ID,
              (1, 1),
              vec![Field::new(SERVER_URI, ResourceKind::String, Perm::NONE).capacity(255),
                   Field::new(BOOTSTRAP_SERVER, ResourceKind::Bool, Perm::NONE),
                   Field::new(SECURITY_MODE, ResourceKind::U8, Perm::NONE),
                   Field::new(PUBLIC_KEY_OR_IDENTITY, ResourceKind::Opaque, Perm::NONE).capacity(256)
                                                                                       .optional(),
                   Field::new(SERVER_PUBLIC_KEY, ResourceKind::Opaque, Perm::NONE).capacity(256)
                                                                                  .optional(),
                   Field::new(SECRET_KEY, ResourceKind::Opaque, Perm::NONE).capacity(256)
                                                                           .optional(),
                   Field::new(SHORT_SERVER_ID, ResourceKind::U16, Perm::NONE).optional()],
              4).core()
}

/// The server URI of a Security instance.
pub fn uri(reg: &Registry, inst: u16) -> Result<String, Error> {
  reg.get_string(&Path::resource(OBJECT_ID, inst, SERVER_URI))
}

/// Does this instance describe a bootstrap server?
pub fn is_bootstrap(reg: &Registry, inst: u16) -> bool {
  reg.get_bool(&Path::resource(OBJECT_ID, inst, BOOTSTRAP_SERVER))
     .unwrap_or(false)
}

/// The SSID linking this instance to a Server instance.
pub fn ssid(reg: &Registry, inst: u16) -> Option<u16> {
  reg.get_u16(&Path::resource(OBJECT_ID, inst, SHORT_SERVER_ID))
     .ok()
}

/// The Security instance whose SSID is `short_id`.
pub fn short_id_to_inst(reg: &Registry, short_id: u16) -> Option<u16> {
  reg.instance_ids(OBJECT_ID)
     .into_iter()
     .find(|i| ssid(reg, *i) == Some(short_id))
}

/// The next bootstrap-capable Security instance that is not `current`.
///
/// When `current` no longer looks like a bootstrap server it is forgotten
/// and any bootstrap instance qualifies.
pub fn next_bootstrap_inst(reg: &Registry, current: Option<u16>) -> Option<u16> {
  let current = current.filter(|c| is_bootstrap(reg, *c));

  reg.instance_ids(OBJECT_ID)
     .into_iter()
     .find(|i| Some(*i) != current && is_bootstrap(reg, *i))
     .or(current)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::Config;

  fn reg_with_security(insts: &[(u16, bool, u16)]) -> Registry {
    let mut reg = Registry::new(&Config::default());
    reg.register_object(object()).unwrap();
    for (inst, bootstrap, short_id) in insts {
      reg.create_instance(OBJECT_ID, *inst).unwrap();
      reg.set_bool(&Path::resource(OBJECT_ID, *inst, BOOTSTRAP_SERVER), *bootstrap)
         .unwrap();
      reg.set_u16(&Path::resource(OBJECT_ID, *inst, SHORT_SERVER_ID), *short_id)
         .unwrap();
    }
    reg
  }

  #[test]
  fn ssid_lookup() {
    let reg = reg_with_security(&[(0, false, 101), (1, true, 0)]);
    assert_eq!(short_id_to_inst(&reg, 101), Some(0));
    assert_eq!(short_id_to_inst(&reg, 7), None);
  }

  #[test]
  fn bootstrap_instance_search_skips_the_current_one() {
    let reg = reg_with_security(&[(0, true, 0), (1, true, 0), (2, false, 102)]);
    assert_eq!(next_bootstrap_inst(&reg, None), Some(0));
    assert_eq!(next_bootstrap_inst(&reg, Some(0)), Some(1));
    // only one bootstrap server left: keep retrying it
    let reg = reg_with_security(&[(0, true, 0)]);
    assert_eq!(next_bootstrap_inst(&reg, Some(0)), Some(0));
    let reg = reg_with_security(&[(0, false, 101)]);
    assert_eq!(next_bootstrap_inst(&reg, Some(0)), None);
  }
}
