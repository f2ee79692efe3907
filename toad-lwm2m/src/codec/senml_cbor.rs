//! `application/senml+cbor`: the LwM2M 1.1 CBOR binding.
//!
//! Same record model as SenML-JSON with the standard integer labels
//! (`bn` = -2, `n` = 0, `v` = 2, `vs` = 3, `vb` = 4, `vd` = 8) and the
//! text label `"vlo"` for object links.

use minicbor::data::Type;
use minicbor::{Decoder, Encoder};

use crate::codec::senml::{resolve, RecordValue};
use crate::codec::{In, OpaqueCtx, OutBuf, Reader, Writer};
use crate::error::{Error, Pool};
use crate::path::{Path, PathList};
use crate::value::ObjLnk;

const LABEL_BASE_NAME: i64 = -2;
const LABEL_BASE_TIME: i64 = -3;
const LABEL_NAME: i64 = 0;
const LABEL_TIME: i64 = 6;
const LABEL_VALUE: i64 = 2;
const LABEL_STRING: i64 = 3;
const LABEL_BOOL: i64 = 4;
const LABEL_DATA: i64 = 8;
const LABEL_OBJLNK: &str = "vlo";

fn encode(records: &[(String, RecordValue)]) -> Result<Vec<u8>, Error> {
  let mut buf = vec![];
  let mut e = Encoder::new(&mut buf);

  let mut step = || -> Result<(), minicbor::encode::Error<core::convert::Infallible>> {
    e.array(records.len() as u64)?;
    for (name, value) in records {
      e.map(2)?;
      e.i64(LABEL_NAME)?.str(name)?;
      match value {
        | RecordValue::Int(v) => e.i64(LABEL_VALUE)?.i64(*v)?,
        | RecordValue::Float(v) => e.i64(LABEL_VALUE)?.f64(*v)?,
        | RecordValue::Bool(v) => e.i64(LABEL_BOOL)?.bool(*v)?,
        | RecordValue::Str(v) => e.i64(LABEL_STRING)?.str(v)?,
        | RecordValue::Opaque(v) => e.i64(LABEL_DATA)?.bytes(v)?,
        | RecordValue::ObjLnk(v) => e.str(LABEL_OBJLNK)?.str(&v.to_string())?,
      };
    }
    Ok(())
  };

  step().map_err(|_| Error::Invalid)?;
  Ok(buf)
}

fn bad<T>(_: T) -> Error {
  Error::BadRequest
}

fn decode_number(d: &mut Decoder<'_>) -> Result<RecordValue, Error> {
  match d.datatype().map_err(bad)? {
    | Type::F16 | Type::F32 | Type::F64 => {
      if d.datatype().map_err(bad)? == Type::F32 {
        d.f32().map(|v| RecordValue::Float(v as f64)).map_err(bad)
      } else {
        d.f64().map(RecordValue::Float).map_err(bad)
      }
    },
    | Type::U8 | Type::U16 | Type::U32 | Type::U64 => {
      let v = d.u64().map_err(bad)?;
      i64::try_from(v).map(RecordValue::Int).map_err(bad)
    },
    | _ => d.i64().map(RecordValue::Int).map_err(bad),
  }
}

/// Parse a SenML-CBOR payload into `(path, value)` pairs.
pub(crate) fn parse(payload: &[u8]) -> Result<Vec<(Path, Option<RecordValue>)>, Error> {
  let mut d = Decoder::new(payload);
  let count = d.array().map_err(bad)?.ok_or(Error::BadRequest)?;

  let mut base = String::new();
  let mut out = vec![];
  for _ in 0..count {
    let pairs = d.map().map_err(bad)?.ok_or(Error::BadRequest)?;

    let mut name = String::new();
    let mut value: Option<RecordValue> = None;
    for _ in 0..pairs {
      match d.datatype().map_err(bad)? {
        | Type::String => {
          let key = d.str().map_err(bad)?;
          if key == LABEL_OBJLNK {
            let lnk: ObjLnk = d.str().map_err(bad)?.parse()?;
            value = Some(RecordValue::ObjLnk(lnk));
          } else {
            d.skip().map_err(bad)?;
          }
        },
        | _ => {
          let key = match decode_number(&mut d)? {
            | RecordValue::Int(k) => k,
            | _ => return Err(Error::BadRequest),
          };
          match key {
            | LABEL_BASE_NAME => base = d.str().map_err(bad)?.to_owned(),
            | LABEL_NAME => name = d.str().map_err(bad)?.to_owned(),
            | LABEL_VALUE => value = Some(decode_number(&mut d)?),
            | LABEL_STRING => value = Some(RecordValue::Str(d.str().map_err(bad)?.to_owned())),
            | LABEL_BOOL => value = Some(RecordValue::Bool(d.bool().map_err(bad)?)),
            | LABEL_DATA => value = Some(RecordValue::Opaque(d.bytes().map_err(bad)?.to_vec())),
            | LABEL_TIME | LABEL_BASE_TIME => {
              d.skip().map_err(bad)?;
            },
            | _ => {
              d.skip().map_err(bad)?;
            },
          }
        },
      }
    }

    out.push((resolve(&base, &name)?, value));
  }

  Ok(out)
}

/// Parse just the paths (composite observe / FETCH target lists).
pub(crate) fn parse_paths(payload: &[u8], list: &mut PathList) -> Result<(), Error> {
  for (path, _) in parse(payload)? {
    list.insert(path)?;
  }
  Ok(())
}

#[allow(missing_docs)]
#[derive(Debug, Default)]
pub struct SenmlCborWriter {
  records: Vec<(String, RecordValue)>,
}

impl SenmlCborWriter {
  fn push(&mut self, path: &Path, value: RecordValue) -> Result<usize, Error> {
    self.records.push((path.to_string(), value));
    Ok(0)
  }
}

impl Writer for SenmlCborWriter {
  fn put_begin(&mut self, _: &mut OutBuf, _: &Path) -> Result<usize, Error> {
    self.records.clear();
    Ok(0)
  }

  fn put_end(&mut self, out: &mut OutBuf, _: &Path) -> Result<usize, Error> {
    let bytes = encode(&self.records)?;
    self.records.clear();
    out.put(&bytes)
  }

  fn put_s8(&mut self, _: &mut OutBuf, path: &Path, value: i8) -> Result<usize, Error> {
    self.push(path, RecordValue::Int(value as i64))
  }

  fn put_s16(&mut self, _: &mut OutBuf, path: &Path, value: i16) -> Result<usize, Error> {
    self.push(path, RecordValue::Int(value as i64))
  }

  fn put_s32(&mut self, _: &mut OutBuf, path: &Path, value: i32) -> Result<usize, Error> {
    self.push(path, RecordValue::Int(value as i64))
  }

  fn put_s64(&mut self, _: &mut OutBuf, path: &Path, value: i64) -> Result<usize, Error> {
    self.push(path, RecordValue::Int(value))
  }

  fn put_time(&mut self, _: &mut OutBuf, path: &Path, value: i64) -> Result<usize, Error> {
    self.push(path, RecordValue::Int(value))
  }

  fn put_string(&mut self, _: &mut OutBuf, path: &Path, value: &str) -> Result<usize, Error> {
    self.push(path, RecordValue::Str(value.into()))
  }

  fn put_float(&mut self, _: &mut OutBuf, path: &Path, value: f64) -> Result<usize, Error> {
    self.push(path, RecordValue::Float(value))
  }

  fn put_bool(&mut self, _: &mut OutBuf, path: &Path, value: bool) -> Result<usize, Error> {
    self.push(path, RecordValue::Bool(value))
  }

  fn put_opaque(&mut self, _: &mut OutBuf, path: &Path, value: &[u8]) -> Result<usize, Error> {
    self.push(path, RecordValue::Opaque(value.to_vec()))
  }

  fn put_objlnk(&mut self, _: &mut OutBuf, path: &Path, value: ObjLnk) -> Result<usize, Error> {
    self.push(path, RecordValue::ObjLnk(value))
  }
}

#[allow(missing_docs)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SenmlCborReader;

fn first_value(input: &mut In<'_>) -> Result<RecordValue, Error> {
  parse(input.take_all())?.into_iter()
                          .find_map(|(_, v)| v)
                          .ok_or(Error::BadRequest)
}

impl Reader for SenmlCborReader {
  fn get_s32(&mut self, input: &mut In<'_>) -> Result<i32, Error> {
    self.get_s64(input).map(|v| v as i32)
  }

  fn get_s64(&mut self, input: &mut In<'_>) -> Result<i64, Error> {
    match first_value(input)? {
      | RecordValue::Int(v) => Ok(v),
      | RecordValue::Float(v) => Ok(v as i64),
      | _ => Err(Error::BadRequest),
    }
  }

  fn get_time(&mut self, input: &mut In<'_>) -> Result<i64, Error> {
    self.get_s64(input)
  }

  fn get_string(&mut self, input: &mut In<'_>, buf: &mut [u8]) -> Result<usize, Error> {
    match first_value(input)? {
      | RecordValue::Str(s) => {
        let n = s.len().min(buf.len().saturating_sub(1));
        if n < s.len() {
          log::warn!("string truncated from {} to {} bytes", s.len(), n);
        }
        buf[..n].copy_from_slice(&s.as_bytes()[..n]);
        buf[n] = 0;
        Ok(n)
      },
      | _ => Err(Error::BadRequest),
    }
  }

  fn get_float(&mut self, input: &mut In<'_>) -> Result<f64, Error> {
    match first_value(input)? {
      | RecordValue::Float(v) => Ok(v),
      | RecordValue::Int(v) => Ok(v as f64),
      | _ => Err(Error::BadRequest),
    }
  }

  fn get_bool(&mut self, input: &mut In<'_>) -> Result<bool, Error> {
    match first_value(input)? {
      | RecordValue::Bool(v) => Ok(v),
      | _ => Err(Error::BadRequest),
    }
  }

  fn get_opaque(&mut self,
                input: &mut In<'_>,
                buf: &mut [u8],
                ctx: &mut OpaqueCtx,
                last_chunk: &mut bool)
                -> Result<usize, Error> {
    match first_value(input)? {
      | RecordValue::Opaque(b) => {
        if b.len() > buf.len() {
          return Err(Error::NoMem(Pool::Storage));
        }
        buf[..b.len()].copy_from_slice(&b);
        ctx.len = b.len();
        ctx.remaining = 0;
        *last_chunk = true;
        Ok(b.len())
      },
      | _ => Err(Error::BadRequest),
    }
  }

  fn get_objlnk(&mut self, input: &mut In<'_>) -> Result<ObjLnk, Error> {
    match first_value(input)? {
      | RecordValue::ObjLnk(l) => Ok(l),
      | _ => Err(Error::BadRequest),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn write_then_parse_every_record_kind() {
    let mut w = SenmlCborWriter::default();
    let mut out = OutBuf::new(512);
    let base = Path::instance(3, 0);
    w.put_begin(&mut out, &base).unwrap();
    w.put_s64(&mut out, &Path::resource(3, 0, 9), -40).unwrap();
    w.put_float(&mut out, &Path::resource(3, 0, 13), 1.25).unwrap();
    w.put_bool(&mut out, &Path::resource(3, 0, 21), false).unwrap();
    w.put_string(&mut out, &Path::resource(3, 0, 0), "toad").unwrap();
    w.put_opaque(&mut out, &Path::resource(3, 0, 22), &[9, 8]).unwrap();
    w.put_objlnk(&mut out, &Path::resource(3, 0, 23), ObjLnk { obj: 1, inst: 0 })
     .unwrap();
    w.put_end(&mut out, &base).unwrap();

    let parsed = parse(out.as_slice()).unwrap();
    assert_eq!(parsed,
               vec![(Path::resource(3, 0, 9), Some(RecordValue::Int(-40))),
                    (Path::resource(3, 0, 13), Some(RecordValue::Float(1.25))),
                    (Path::resource(3, 0, 21), Some(RecordValue::Bool(false))),
                    (Path::resource(3, 0, 0), Some(RecordValue::Str("toad".into()))),
                    (Path::resource(3, 0, 22), Some(RecordValue::Opaque(vec![9, 8]))),
                    (Path::resource(3, 0, 23),
                     Some(RecordValue::ObjLnk(ObjLnk { obj: 1, inst: 0 })))]);
  }

  #[test]
  fn base_name_label_resolves() {
    // [{-2: "/3303/0/", 0: "5700", 2: 21}]
    let mut buf = vec![];
    let mut e = Encoder::new(&mut buf);
    e.array(1)
     .and_then(|e| e.map(3))
     .and_then(|e| e.i64(-2))
     .and_then(|e| e.str("/3303/0/"))
     .and_then(|e| e.i64(0))
     .and_then(|e| e.str("5700"))
     .and_then(|e| e.i64(2))
     .and_then(|e| e.i64(21))
     .unwrap();

    let parsed = parse(&buf).unwrap();
    assert_eq!(parsed,
               vec![(Path::resource(3303, 0, 5700), Some(RecordValue::Int(21)))]);
  }

  #[test]
  fn junk_is_a_bad_request() {
    assert_eq!(parse(&[0xa1]), Err(Error::BadRequest));
  }
}
