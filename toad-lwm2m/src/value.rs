use core::fmt;
use core::str::FromStr;

use crate::error::Error;

/// The wire/storage type of a resource, declared once per object field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
  /// raw bytes, exact length
  Opaque,
  /// UTF-8 text, stored NUL-terminated
  String,
  #[allow(missing_docs)]
  U8,
  #[allow(missing_docs)]
  U16,
  #[allow(missing_docs)]
  U32,
  #[allow(missing_docs)]
  U64,
  #[allow(missing_docs)]
  S8,
  #[allow(missing_docs)]
  S16,
  #[allow(missing_docs)]
  S32,
  #[allow(missing_docs)]
  S64,
  #[allow(missing_docs)]
  Bool,
  /// seconds since the UNIX epoch
  Time,
  /// IEEE-754 binary64
  Float,
  /// a link to an object instance (`obj:inst`)
  ObjLnk,
}

impl ResourceKind {
  /// Storage footprint for fixed-width kinds, `None` for `Opaque`/`String`.
  pub fn fixed_len(&self) -> Option<usize> {
    match self {
      | ResourceKind::Opaque | ResourceKind::String => None,
      | ResourceKind::U8 | ResourceKind::S8 | ResourceKind::Bool => Some(1),
      | ResourceKind::U16 | ResourceKind::S16 => Some(2),
      | ResourceKind::U32 | ResourceKind::S32 | ResourceKind::ObjLnk => Some(4),
      | ResourceKind::U64 | ResourceKind::S64 | ResourceKind::Time | ResourceKind::Float => Some(8),
    }
  }

  /// Integer-family kinds accept each other with truncation.
  pub(crate) fn is_integer(&self) -> bool {
    matches!(self,
             ResourceKind::U8
             | ResourceKind::U16
             | ResourceKind::U32
             | ResourceKind::U64
             | ResourceKind::S8
             | ResourceKind::S16
             | ResourceKind::S32
             | ResourceKind::S64
             | ResourceKind::Time)
  }
}

/// A link to an object instance, e.g. `10:2`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjLnk {
  /// object id
  pub obj: u16,
  /// object instance id
  pub inst: u16,
}

impl fmt::Display for ObjLnk {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.obj, self.inst)
  }
}

impl FromStr for ObjLnk {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let (obj, inst) = s.split_once(':').ok_or(Error::BadRequest)?;
    Ok(ObjLnk { obj: obj.parse().map_err(|_| Error::BadRequest)?,
                inst: inst.parse().map_err(|_| Error::BadRequest)? })
  }
}

/// A typed resource value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
  #[allow(missing_docs)]
  Opaque(Vec<u8>),
  #[allow(missing_docs)]
  String(String),
  #[allow(missing_docs)]
  U8(u8),
  #[allow(missing_docs)]
  U16(u16),
  #[allow(missing_docs)]
  U32(u32),
  #[allow(missing_docs)]
  U64(u64),
  #[allow(missing_docs)]
  S8(i8),
  #[allow(missing_docs)]
  S16(i16),
  #[allow(missing_docs)]
  S32(i32),
  #[allow(missing_docs)]
  S64(i64),
  #[allow(missing_docs)]
  Bool(bool),
  /// seconds since the UNIX epoch
  Time(i64),
  #[allow(missing_docs)]
  Float(f64),
  #[allow(missing_docs)]
  ObjLnk(ObjLnk),
}

impl Value {
  /// Which [`ResourceKind`] this value is.
  pub fn kind(&self) -> ResourceKind {
    match self {
      | Value::Opaque(_) => ResourceKind::Opaque,
      | Value::String(_) => ResourceKind::String,
      | Value::U8(_) => ResourceKind::U8,
      | Value::U16(_) => ResourceKind::U16,
      | Value::U32(_) => ResourceKind::U32,
      | Value::U64(_) => ResourceKind::U64,
      | Value::S8(_) => ResourceKind::S8,
      | Value::S16(_) => ResourceKind::S16,
      | Value::S32(_) => ResourceKind::S32,
      | Value::S64(_) => ResourceKind::S64,
      | Value::Bool(_) => ResourceKind::Bool,
      | Value::Time(_) => ResourceKind::Time,
      | Value::Float(_) => ResourceKind::Float,
      | Value::ObjLnk(_) => ResourceKind::ObjLnk,
    }
  }

  /// Integer payload widened to `i128`, if this is an integer-family value.
  pub(crate) fn as_int(&self) -> Option<i128> {
    match *self {
      | Value::U8(v) => Some(v as i128),
      | Value::U16(v) => Some(v as i128),
      | Value::U32(v) => Some(v as i128),
      | Value::U64(v) => Some(v as i128),
      | Value::S8(v) => Some(v as i128),
      | Value::S16(v) => Some(v as i128),
      | Value::S32(v) => Some(v as i128),
      | Value::S64(v) => Some(v as i128),
      | Value::Time(v) => Some(v as i128),
      | _ => None,
    }
  }

  /// Storage bytes for this value, honoring the registry invariants:
  /// integers host-endian at their natural width, floats 8 bytes, strings
  /// without their terminator, opaques verbatim.
  pub(crate) fn storage_bytes(&self) -> Vec<u8> {
    match self {
      | Value::Opaque(b) => b.clone(),
      | Value::String(s) => s.as_bytes().to_vec(),
      | Value::U8(v) => v.to_ne_bytes().to_vec(),
      | Value::U16(v) => v.to_ne_bytes().to_vec(),
      | Value::U32(v) => v.to_ne_bytes().to_vec(),
      | Value::U64(v) => v.to_ne_bytes().to_vec(),
      | Value::S8(v) => v.to_ne_bytes().to_vec(),
      | Value::S16(v) => v.to_ne_bytes().to_vec(),
      | Value::S32(v) => v.to_ne_bytes().to_vec(),
      | Value::S64(v) => v.to_ne_bytes().to_vec(),
      | Value::Bool(v) => vec![u8::from(*v)],
      | Value::Time(v) => v.to_ne_bytes().to_vec(),
      | Value::Float(v) => v.to_ne_bytes().to_vec(),
      | Value::ObjLnk(l) => {
        let mut b = l.obj.to_ne_bytes().to_vec();
        b.extend_from_slice(&l.inst.to_ne_bytes());
        b
      },
    }
  }

  /// Rebuild a value of `kind` from storage bytes.
  pub(crate) fn from_storage(kind: ResourceKind, bytes: &[u8]) -> Result<Value, Error> {
    fn arr<const N: usize>(bytes: &[u8]) -> Result<[u8; N], Error> {
      bytes.try_into().map_err(|_| Error::Invalid)
    }

    Ok(match kind {
         | ResourceKind::Opaque => Value::Opaque(bytes.to_vec()),
         | ResourceKind::String => {
           Value::String(core::str::from_utf8(bytes).map_err(|_| Error::Invalid)?
                                                    .to_owned())
         },
         | ResourceKind::U8 => Value::U8(u8::from_ne_bytes(arr(bytes)?)),
         | ResourceKind::U16 => Value::U16(u16::from_ne_bytes(arr(bytes)?)),
         | ResourceKind::U32 => Value::U32(u32::from_ne_bytes(arr(bytes)?)),
         | ResourceKind::U64 => Value::U64(u64::from_ne_bytes(arr(bytes)?)),
         | ResourceKind::S8 => Value::S8(i8::from_ne_bytes(arr(bytes)?)),
         | ResourceKind::S16 => Value::S16(i16::from_ne_bytes(arr(bytes)?)),
         | ResourceKind::S32 => Value::S32(i32::from_ne_bytes(arr(bytes)?)),
         | ResourceKind::S64 => Value::S64(i64::from_ne_bytes(arr(bytes)?)),
         | ResourceKind::Bool => Value::Bool(bytes.first().copied().unwrap_or(0) != 0),
         | ResourceKind::Time => Value::Time(i64::from_ne_bytes(arr(bytes)?)),
         | ResourceKind::Float => Value::Float(f64::from_ne_bytes(arr(bytes)?)),
         | ResourceKind::ObjLnk => {
           let b: [u8; 4] = arr(bytes)?;
           Value::ObjLnk(ObjLnk { obj: u16::from_ne_bytes([b[0], b[1]]),
                                  inst: u16::from_ne_bytes([b[2], b[3]]) })
         },
       })
  }

  /// Convert this value for storage in a resource of `target` kind.
  ///
  /// Integer-family values convert freely; a wider value lands in a
  /// narrower resource by truncation to the target width. Everything else
  /// must match exactly.
  pub(crate) fn coerce(self, target: ResourceKind) -> Result<Value, Error> {
    if self.kind() == target {
      return Ok(self);
    }

    let int = match self.as_int() {
      | Some(v) if target.is_integer() => v,
      | _ => return Err(Error::Invalid),
    };

    Ok(match target {
         | ResourceKind::U8 => Value::U8(int as u8),
         | ResourceKind::U16 => Value::U16(int as u16),
         | ResourceKind::U32 => Value::U32(int as u32),
         | ResourceKind::U64 => Value::U64(int as u64),
         | ResourceKind::S8 => Value::S8(int as i8),
         | ResourceKind::S16 => Value::S16(int as i16),
         | ResourceKind::S32 => Value::S32(int as i32),
         | ResourceKind::S64 => Value::S64(int as i64),
         | ResourceKind::Time => Value::Time(int as i64),
         | _ => return Err(Error::Invalid),
       })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn objlnk_text_form() {
    let l: ObjLnk = "10:2".parse().unwrap();
    assert_eq!(l, ObjLnk { obj: 10, inst: 2 });
    assert_eq!(l.to_string(), "10:2");
    assert!("10".parse::<ObjLnk>().is_err());
  }

  #[test]
  fn storage_round_trip_every_kind() {
    let cases = [Value::Opaque(vec![0xde, 0xad]),
                 Value::String("hello".into()),
                 Value::U8(200),
                 Value::U16(50_000),
                 Value::U32(3_000_000_000),
                 Value::U64(u64::MAX / 2),
                 Value::S8(-100),
                 Value::S16(-20_000),
                 Value::S32(-2_000_000_000),
                 Value::S64(i64::MIN + 1),
                 Value::Bool(true),
                 Value::Time(1_700_000_000),
                 Value::Float(-1234.5678),
                 Value::ObjLnk(ObjLnk { obj: 10, inst: 2 })];

    for v in cases {
      let bytes = v.storage_bytes();
      assert_eq!(Value::from_storage(v.kind(), &bytes).unwrap(), v);
    }
  }

  #[test]
  fn wide_into_narrow_truncates() {
    assert_eq!(Value::U32(0x1_02_03).coerce(ResourceKind::U8).unwrap(),
               Value::U8(0x03));
    assert_eq!(Value::S64(-1).coerce(ResourceKind::U16).unwrap(),
               Value::U16(u16::MAX));
    assert_eq!(Value::U8(7).coerce(ResourceKind::S64).unwrap(), Value::S64(7));
    assert!(Value::Float(1.0).coerce(ResourceKind::U8).is_err());
    assert!(Value::String("x".into()).coerce(ResourceKind::Opaque).is_err());
  }
}
