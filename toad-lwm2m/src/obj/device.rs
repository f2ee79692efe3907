//! A minimal Device object (id 3).
//!
//! Identity strings, the error-code list and the Reboot executable. Real
//! firmware replaces the handler with one that actually reboots.

use crate::error::Error;
use crate::path::Path;
use crate::registry::{Field, Object, Perm, Registry};
use crate::value::{ResourceKind, Value};

/// `/3`
pub const OBJECT_ID: u16 = 3;

#[allow(missing_docs)]
pub const MANUFACTURER: u16 = 0;
#[allow(missing_docs)]
pub const MODEL_NUMBER: u16 = 1;
#[allow(missing_docs)]
pub const SERIAL_NUMBER: u16 = 2;
#[allow(missing_docs)]
pub const FIRMWARE_VERSION: u16 = 3;
/// executable
pub const REBOOT: u16 = 4;
/// multi-instance list of active error codes; instance 0 is always live
pub const ERROR_CODE: u16 = 11;
/// supported bindings, `"U"`
pub const SUPPORTED_BINDINGS: u16 = 16;

/// The object descriptor.
pub fn object() -> Object {
  Object::new(OBJECT_ID,
              (1, 0),
              vec![Field::new(MANUFACTURER, ResourceKind::String, Perm::R)
                     .capacity(32)
                     .default_value(Value::String("toad-lib".into()))
                     .optional(),
                   Field::new(MODEL_NUMBER, ResourceKind::String, Perm::R)
                     .capacity(32)
                     .default_value(Value::String("toad-lwm2m".into()))
                     .optional(),
                   Field::new(SERIAL_NUMBER, ResourceKind::String, Perm::R).capacity(32)
                                                                           .optional(),
                   Field::new(FIRMWARE_VERSION, ResourceKind::String, Perm::R)
                     .capacity(32)
                     .default_value(Value::String(env!("CARGO_PKG_VERSION").into()))
                     .optional(),
                   Field::new(REBOOT, ResourceKind::String, Perm::X),
                   Field::new(ERROR_CODE, ResourceKind::U8, Perm::R).multi(8),
                   Field::new(SUPPORTED_BINDINGS, ResourceKind::String, Perm::R)
                     .capacity(4)
                     .default_value(Value::String("U".into()))
                     .optional()],
              1).core()
}

/// Create a Device instance with its error-code slot zero live.
pub fn create(reg: &mut Registry, inst: u16) -> Result<(), Error> {
  reg.create_instance(OBJECT_ID, inst)?;
  reg.create_resource_instance(&Path::resource_instance(OBJECT_ID, inst, ERROR_CODE, 0))?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::Config;

  #[test]
  fn error_code_slot_zero_reads_no_error() {
    let mut reg = Registry::new(&Config::default());
    reg.register_object(object()).unwrap();
    create(&mut reg, 0).unwrap();

    assert_eq!(reg.get_u8(&Path::resource_instance(OBJECT_ID, 0, ERROR_CODE, 0))
                  .unwrap(),
               0);
    assert_eq!(reg.get_string(&Path::resource(OBJECT_ID, 0, SUPPORTED_BINDINGS))
                  .unwrap(),
               "U");
  }
}
