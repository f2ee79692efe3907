//! `application/senml+json`: the LwM2M 1.1 JSON binding.
//!
//! The writer accumulates records while the read op walks the tree and
//! serializes everything in `put_end`; the parser resolves `bn`/`n` chains
//! into absolute paths. Opaque values travel base64url without padding.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::codec::senml::{resolve, RecordValue};
use crate::codec::{In, OpaqueCtx, OutBuf, Reader, Writer};
use crate::error::{Error, Pool};
use crate::path::{Path, PathList};
use crate::value::ObjLnk;

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct JsonRecord {
  #[serde(rename = "bn", skip_serializing_if = "Option::is_none", default)]
  bn: Option<String>,
  #[serde(rename = "n", skip_serializing_if = "Option::is_none", default)]
  n: Option<String>,
  #[serde(rename = "v", skip_serializing_if = "Option::is_none", default)]
  v: Option<serde_json::Number>,
  #[serde(rename = "vb", skip_serializing_if = "Option::is_none", default)]
  vb: Option<bool>,
  #[serde(rename = "vs", skip_serializing_if = "Option::is_none", default)]
  vs: Option<String>,
  #[serde(rename = "vd", skip_serializing_if = "Option::is_none", default)]
  vd: Option<String>,
  #[serde(rename = "vlo", skip_serializing_if = "Option::is_none", default)]
  vlo: Option<String>,
}

fn to_record(name: String, value: &RecordValue) -> Result<JsonRecord, Error> {
  let mut rec = JsonRecord { n: Some(name),
                             ..Default::default() };

  match value {
    | RecordValue::Int(v) => rec.v = Some(serde_json::Number::from(*v)),
    | RecordValue::Float(v) => {
      rec.v = Some(serde_json::Number::from_f64(*v).ok_or(Error::Invalid)?)
    },
    | RecordValue::Bool(v) => rec.vb = Some(*v),
    | RecordValue::Str(v) => rec.vs = Some(v.clone()),
    | RecordValue::Opaque(v) => rec.vd = Some(URL_SAFE_NO_PAD.encode(v)),
    | RecordValue::ObjLnk(v) => rec.vlo = Some(v.to_string()),
  }

  Ok(rec)
}

fn from_record(rec: &JsonRecord) -> Result<Option<RecordValue>, Error> {
  if let Some(v) = &rec.vs {
    return Ok(Some(RecordValue::Str(v.clone())));
  }
  if let Some(v) = rec.vb {
    return Ok(Some(RecordValue::Bool(v)));
  }
  if let Some(v) = &rec.vd {
    return URL_SAFE_NO_PAD.decode(v)
                          .map(|b| Some(RecordValue::Opaque(b)))
                          .map_err(|_| Error::BadRequest);
  }
  if let Some(v) = &rec.vlo {
    return v.parse::<ObjLnk>()
            .map(|l| Some(RecordValue::ObjLnk(l)))
            .map_err(|_| Error::BadRequest);
  }
  if let Some(v) = &rec.v {
    return Ok(Some(match (v.as_i64(), v.as_f64()) {
                     | (Some(i), _) => RecordValue::Int(i),
                     | (_, Some(f)) => RecordValue::Float(f),
                     | _ => return Err(Error::BadRequest),
                   }));
  }
  Ok(None)
}

/// Parse a SenML-JSON payload into `(path, value)` pairs; FETCH-style
/// records without a value come through as `None`.
pub(crate) fn parse(payload: &[u8]) -> Result<Vec<(Path, Option<RecordValue>)>, Error> {
  let records: Vec<JsonRecord> = serde_json::from_slice(payload).map_err(|_| Error::BadRequest)?;

  let mut base = String::new();
  let mut out = vec![];
  for rec in &records {
    if let Some(bn) = &rec.bn {
      base = bn.clone();
    }

    let path = resolve(&base, rec.n.as_deref().unwrap_or(""))?;
    out.push((path, from_record(rec)?));
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
pub struct SenmlJsonWriter {
  records: Vec<(String, RecordValue)>,
}

impl SenmlJsonWriter {
  fn push(&mut self, path: &Path, value: RecordValue) -> Result<usize, Error> {
    self.records.push((path.to_string(), value));
    Ok(0)
  }
}

impl Writer for SenmlJsonWriter {
  fn put_begin(&mut self, _: &mut OutBuf, _: &Path) -> Result<usize, Error> {
    self.records.clear();
    Ok(0)
  }

  fn put_end(&mut self, out: &mut OutBuf, _: &Path) -> Result<usize, Error> {
    let records: Vec<JsonRecord> = self.records
                                       .drain(..)
                                       .map(|(n, v)| to_record(n, &v))
                                       .collect::<Result<_, _>>()?;
    let bytes = serde_json::to_vec(&records).map_err(|_| Error::NoMem(Pool::Payload))?;
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
pub struct SenmlJsonReader;

fn first_value(input: &mut In<'_>) -> Result<RecordValue, Error> {
  parse(input.take_all())?.into_iter()
                          .find_map(|(_, v)| v)
                          .ok_or(Error::BadRequest)
}

impl Reader for SenmlJsonReader {
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
  fn write_then_parse() {
    let mut w = SenmlJsonWriter::default();
    let mut out = OutBuf::new(512);
    let base = Path::instance(3, 0);
    w.put_begin(&mut out, &base).unwrap();
    w.put_string(&mut out, &Path::resource(3, 0, 0), "toad-lib").unwrap();
    w.put_s64(&mut out, &Path::resource(3, 0, 9), 95).unwrap();
    w.put_float(&mut out, &Path::resource(3, 0, 13), 0.5).unwrap();
    w.put_bool(&mut out, &Path::resource(3, 0, 21), true).unwrap();
    w.put_opaque(&mut out, &Path::resource(3, 0, 22), &[1, 2, 3]).unwrap();
    w.put_end(&mut out, &base).unwrap();

    let parsed = parse(out.as_slice()).unwrap();
    assert_eq!(parsed.len(), 5);
    assert_eq!(parsed[0],
               (Path::resource(3, 0, 0), Some(RecordValue::Str("toad-lib".into()))));
    assert_eq!(parsed[1],
               (Path::resource(3, 0, 9), Some(RecordValue::Int(95))));
    assert_eq!(parsed[2],
               (Path::resource(3, 0, 13), Some(RecordValue::Float(0.5))));
    assert_eq!(parsed[4],
               (Path::resource(3, 0, 22), Some(RecordValue::Opaque(vec![1, 2, 3]))));
  }

  #[test]
  fn base_names_resolve_across_records() {
    let payload = br#"[{"bn":"/3303/0/","n":"5700","v":21.5},{"n":"5701","vs":"C"}]"#;
    let parsed = parse(payload).unwrap();
    assert_eq!(parsed[0].0, Path::resource(3303, 0, 5700));
    assert_eq!(parsed[1].0, Path::resource(3303, 0, 5701));
  }

  #[test]
  fn fetch_path_lists_have_no_values() {
    let payload = br#"[{"n":"/3/0/9"},{"n":"/3303/0/5700"}]"#;
    let mut list = PathList::new(4);
    parse_paths(payload, &mut list).unwrap();
    let got: Vec<Path> = list.iter().copied().collect();
    assert_eq!(got,
               vec![Path::resource(3, 0, 9), Path::resource(3303, 0, 5700)]);
  }

  #[test]
  fn junk_is_a_bad_request() {
    assert_eq!(parse(b"{"), Err(Error::BadRequest));
    assert_eq!(parse(br#"[{"n":"/x/y"}]"#), Err(Error::BadRequest));
  }
}
