//! The record model shared by the SenML-JSON and SenML-CBOR bindings.

use crate::error::Error;
use crate::path::Path;
use crate::value::{ObjLnk, ResourceKind, Value};

/// One SenML record's value, as it travels on the wire.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum RecordValue {
  Int(i64),
  Float(f64),
  Bool(bool),
  Str(String),
  Opaque(Vec<u8>),
  ObjLnk(ObjLnk),
}

impl RecordValue {
  /// Convert to a typed [`Value`] for the field kind at the target path.
  pub(crate) fn into_value(self, kind: ResourceKind) -> Result<Value, Error> {
    match self {
      | RecordValue::Int(v) => match kind {
        | ResourceKind::Float => Ok(Value::Float(v as f64)),
        | _ => Value::S64(v).coerce(kind),
      },
      | RecordValue::Float(v) => match kind {
        | ResourceKind::Float => Ok(Value::Float(v)),
        // a number that happens to be integral may target an integer field
        | _ => Value::S64(v as i64).coerce(kind),
      },
      | RecordValue::Bool(v) if kind == ResourceKind::Bool => Ok(Value::Bool(v)),
      | RecordValue::Str(s) if kind == ResourceKind::String => Ok(Value::String(s)),
      | RecordValue::Str(s) if kind == ResourceKind::ObjLnk => s.parse().map(Value::ObjLnk),
      | RecordValue::Opaque(b) if kind == ResourceKind::Opaque => Ok(Value::Opaque(b)),
      | RecordValue::ObjLnk(l) if kind == ResourceKind::ObjLnk => Ok(Value::ObjLnk(l)),
      | _ => Err(Error::BadRequest),
    }
  }

  /// What a [`Value`] looks like as a record.
  pub(crate) fn from_value(value: &Value) -> Result<RecordValue, Error> {
    Ok(match value {
         | Value::Opaque(b) => RecordValue::Opaque(b.clone()),
         | Value::String(s) => RecordValue::Str(s.clone()),
         | Value::Bool(b) => RecordValue::Bool(*b),
         | Value::Float(f) => RecordValue::Float(*f),
         | Value::ObjLnk(l) => RecordValue::ObjLnk(*l),
         | v => RecordValue::Int(v.as_int().map(|i| i as i64).ok_or(Error::Invalid)?),
       })
  }
}

/// Join a base name and a name into the path they address.
pub(crate) fn resolve(base: &str, name: &str) -> Result<Path, Error> {
  let joined = format!("{}{}", base, name);
  joined.parse().map_err(|_| Error::BadRequest)
}
