//! The three objects every LwM2M client carries: Security (0), Server (1)
//! and Device (3).
//!
//! They are ordinary registry objects; what makes Security and Server
//! special is that the registration state machine reads them (server
//! selection, lifetimes, bootstrap flags) and that a few of their
//! resources have engine-level side effects (Disable, the update/bootstrap
//! triggers, lifetime writes). Those side effects live in the engine; the
//! modules here own the object shapes and the typed accessors.

use crate::error::Error;
use crate::registry::Registry;

pub mod device;
pub mod security;
pub mod server;

/// Register Security, Server and Device and create instance 0 of each.
///
/// Multi-server setups create further Security/Server instances through
/// [`Registry::create_instance`] before the engine starts.
pub fn register_core_objects(reg: &mut Registry) -> Result<(), Error> {
  reg.register_object(security::object())?;
  reg.register_object(server::object())?;
  reg.register_object(device::object())?;

  reg.create_instance(security::OBJECT_ID, 0)?;
  reg.create_instance(server::OBJECT_ID, 0)?;
  device::create(reg, 0)?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::Config;
  use crate::path::Path;

  #[test]
  fn core_objects_register_and_instantiate() {
    let mut reg = Registry::new(&Config::default());
    register_core_objects(&mut reg).unwrap();

    assert!(reg.object(0).unwrap().is_core());
    assert!(reg.object(1).unwrap().is_core());
    assert!(reg.object(3).unwrap().is_core());
    assert_eq!(reg.instance_ids(1), vec![0]);

    // lifetime default is in place
    assert_eq!(reg.get_u32(&Path::resource(1, 0, server::LIFETIME)).unwrap(),
               30);
    // device manufacturer reads back
    assert_eq!(reg.get_string(&Path::resource(3, 0, device::MANUFACTURER))
                  .unwrap(),
               "toad-lib");
  }
}
