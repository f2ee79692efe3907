//! OMA-TLV: the LwM2M 1.0 binary hierarchy format.
//!
//! Each record is `type/id/length` followed by the value; instance and
//! multi-resource records nest their children, so the writer back-patches
//! the enclosing header once the children's total length is known.

use crate::codec::{In, OpaqueCtx, OutBuf, Reader, Writer};
use crate::error::Error;
use crate::path::{Level, Path};
use crate::value::{ObjLnk, ResourceKind, Value};

const TYPE_OBJECT_INSTANCE: u8 = 0;
const TYPE_RESOURCE_INSTANCE: u8 = 1;
const TYPE_MULTI_RESOURCE: u8 = 2;
const TYPE_RESOURCE: u8 = 3;

fn header(ty: u8, id: u16, len: usize) -> Vec<u8> {
  let wide_id = id > 0xff;
  let len_type: u8 = if len < 8 {
    0
  } else if len < 0x100 {
    1
  } else if len < 0x1_0000 {
    2
  } else {
    3
  };

  let mut h = vec![(ty << 6)
                   | (u8::from(wide_id) << 5)
                   | (len_type << 3)
                   | if len_type == 0 { len as u8 } else { 0 }];

  if wide_id {
    h.extend_from_slice(&id.to_be_bytes());
  } else {
    h.push(id as u8);
  }

  match len_type {
    | 1 => h.push(len as u8),
    | 2 => h.extend_from_slice(&(len as u16).to_be_bytes()),
    | 3 => h.extend_from_slice(&[(len >> 16) as u8, (len >> 8) as u8, len as u8]),
    | _ => {},
  }

  h
}

fn parse_header(input: &mut In<'_>) -> Result<(u8, u16, usize), Error> {
  let b0 = input.take(1)?[0];
  let ty = b0 >> 6;
  let wide_id = b0 & 0x20 != 0;
  let len_type = (b0 >> 3) & 0x3;

  let id = if wide_id {
    let b = input.take(2)?;
    u16::from_be_bytes([b[0], b[1]])
  } else {
    input.take(1)?[0] as u16
  };

  let len = match len_type {
    | 0 => (b0 & 0x7) as usize,
    | n => {
      input.take(n as usize)?
           .iter()
           .fold(0usize, |acc, b| acc << 8 | *b as usize)
    },
  };

  Ok((ty, id, len))
}

fn int_bytes_signed(bytes: &[u8]) -> i64 {
  let mut v: i64 = if bytes.first().map(|b| b & 0x80 != 0).unwrap_or(false) {
    -1
  } else {
    0
  };
  for b in bytes {
    v = v << 8 | *b as i64;
  }
  v
}

#[allow(missing_docs)]
#[derive(Debug, Default)]
pub struct TlvWriter {
  wrap_instances: bool,
  oi_mark: Option<usize>,
  ri_mark: Option<usize>,
  in_multi: bool,
}

impl TlvWriter {
  fn put_value(&mut self, out: &mut OutBuf, path: &Path, value: &[u8]) -> Result<usize, Error> {
    let (ty, id) = if self.in_multi {
      (TYPE_RESOURCE_INSTANCE, path.res_inst)
    } else {
      (TYPE_RESOURCE, path.res)
    };

    let h = header(ty, id, value.len());
    Ok(out.put(&h)? + out.put(value)?)
  }
}

impl Writer for TlvWriter {
  fn put_begin(&mut self, _: &mut OutBuf, path: &Path) -> Result<usize, Error> {
    // whole-object reads wrap every instance in an OBJECT_INSTANCE record
    self.wrap_instances = path.level <= Level::Object;
    Ok(0)
  }

  fn put_begin_oi(&mut self, out: &mut OutBuf, _: &Path) -> Result<usize, Error> {
    if self.wrap_instances {
      self.oi_mark = Some(out.len());
    }
    Ok(0)
  }

  fn put_end_oi(&mut self, out: &mut OutBuf, path: &Path) -> Result<usize, Error> {
    match self.oi_mark.take() {
      | Some(mark) => {
        let h = header(TYPE_OBJECT_INSTANCE, path.obj_inst, out.len() - mark);
        out.splice(mark, &h)
      },
      | None => Ok(0),
    }
  }

  fn put_begin_ri(&mut self, out: &mut OutBuf, _: &Path) -> Result<usize, Error> {
    self.ri_mark = Some(out.len());
    self.in_multi = true;
    Ok(0)
  }

  fn put_end_ri(&mut self, out: &mut OutBuf, path: &Path) -> Result<usize, Error> {
    self.in_multi = false;
    match self.ri_mark.take() {
      | Some(mark) => {
        let h = header(TYPE_MULTI_RESOURCE, path.res, out.len() - mark);
        out.splice(mark, &h)
      },
      | None => Ok(0),
    }
  }

  fn put_s8(&mut self, out: &mut OutBuf, path: &Path, value: i8) -> Result<usize, Error> {
    self.put_value(out, path, &value.to_be_bytes())
  }

  fn put_s16(&mut self, out: &mut OutBuf, path: &Path, value: i16) -> Result<usize, Error> {
    self.put_value(out, path, &value.to_be_bytes())
  }

  fn put_s32(&mut self, out: &mut OutBuf, path: &Path, value: i32) -> Result<usize, Error> {
    self.put_value(out, path, &value.to_be_bytes())
  }

  fn put_s64(&mut self, out: &mut OutBuf, path: &Path, value: i64) -> Result<usize, Error> {
    self.put_value(out, path, &value.to_be_bytes())
  }

  fn put_time(&mut self, out: &mut OutBuf, path: &Path, value: i64) -> Result<usize, Error> {
    self.put_value(out, path, &value.to_be_bytes())
  }

  fn put_string(&mut self, out: &mut OutBuf, path: &Path, value: &str) -> Result<usize, Error> {
    self.put_value(out, path, value.as_bytes())
  }

  fn put_float(&mut self, out: &mut OutBuf, path: &Path, value: f64) -> Result<usize, Error> {
    self.put_value(out, path, &value.to_bits().to_be_bytes())
  }

  fn put_bool(&mut self, out: &mut OutBuf, path: &Path, value: bool) -> Result<usize, Error> {
    self.put_value(out, path, &[u8::from(value)])
  }

  fn put_opaque(&mut self, out: &mut OutBuf, path: &Path, value: &[u8]) -> Result<usize, Error> {
    self.put_value(out, path, value)
  }

  fn put_objlnk(&mut self, out: &mut OutBuf, path: &Path, value: ObjLnk) -> Result<usize, Error> {
    let mut b = value.obj.to_be_bytes().to_vec();
    b.extend_from_slice(&value.inst.to_be_bytes());
    self.put_value(out, path, &b)
  }
}

/// Reads the *value* of a single TLV record; the record walk for
/// hierarchical writes lives in [`decode`].
#[allow(missing_docs)]
#[derive(Debug, Default, Clone, Copy)]
pub struct TlvReader;

impl TlvReader {
  fn value<'a>(&self, input: &mut In<'a>) -> Result<&'a [u8], Error> {
    let (_, _, len) = parse_header(input)?;
    input.take(len)
  }
}

impl Reader for TlvReader {
  fn get_s32(&mut self, input: &mut In<'_>) -> Result<i32, Error> {
    self.get_s64(input).map(|v| v as i32)
  }

  fn get_s64(&mut self, input: &mut In<'_>) -> Result<i64, Error> {
    let v = self.value(input)?;
    match v.len() {
      | 1 | 2 | 4 | 8 => Ok(int_bytes_signed(v)),
      | _ => Err(Error::BadRequest),
    }
  }

  fn get_time(&mut self, input: &mut In<'_>) -> Result<i64, Error> {
    self.get_s64(input)
  }

  fn get_string(&mut self, input: &mut In<'_>, buf: &mut [u8]) -> Result<usize, Error> {
    let v = self.value(input)?;
    core::str::from_utf8(v).map_err(|_| Error::BadRequest)?;

    let n = v.len().min(buf.len().saturating_sub(1));
    if n < v.len() {
      log::warn!("string truncated from {} to {} bytes", v.len(), n);
    }
    buf[..n].copy_from_slice(&v[..n]);
    buf[n] = 0;
    Ok(n)
  }

  fn get_float(&mut self, input: &mut In<'_>) -> Result<f64, Error> {
    let v = self.value(input)?;
    decode_float(v)
  }

  fn get_bool(&mut self, input: &mut In<'_>) -> Result<bool, Error> {
    let v = self.value(input)?;
    match v {
      | [0] => Ok(false),
      | [1] => Ok(true),
      | _ => Err(Error::BadRequest),
    }
  }

  fn get_opaque(&mut self,
                input: &mut In<'_>,
                buf: &mut [u8],
                ctx: &mut OpaqueCtx,
                last_chunk: &mut bool)
                -> Result<usize, Error> {
    let v = self.value(input)?;
    if v.len() > buf.len() {
      return Err(Error::NoMem(crate::error::Pool::Storage));
    }

    buf[..v.len()].copy_from_slice(v);
    ctx.len = v.len();
    ctx.remaining = 0;
    *last_chunk = true;
    Ok(v.len())
  }

  fn get_objlnk(&mut self, input: &mut In<'_>) -> Result<ObjLnk, Error> {
    let v = self.value(input)?;
    match v {
      | [a, b, c, d] => Ok(ObjLnk { obj: u16::from_be_bytes([*a, *b]),
                                    inst: u16::from_be_bytes([*c, *d]) }),
      | _ => Err(Error::BadRequest),
    }
  }
}

fn decode_float(v: &[u8]) -> Result<f64, Error> {
  match v.len() {
    | 4 => Ok(f32::from_bits(u32::from_be_bytes([v[0], v[1], v[2], v[3]])) as f64),
    | 8 => Ok(f64::from_bits(u64::from_be_bytes([v[0], v[1], v[2], v[3], v[4], v[5], v[6], v[7]]))),
    | n => {
      log::error!("invalid float length: {}", n);
      Err(Error::BadRequest)
    },
  }
}

/// Decode a raw TLV record value into a typed [`Value`], given the target
/// field's kind.
pub(crate) fn decode_value(kind: ResourceKind, bytes: &[u8]) -> Result<Value, Error> {
  let int = || match bytes.len() {
    | 1 | 2 | 4 | 8 => Ok(int_bytes_signed(bytes)),
    | _ => Err(Error::BadRequest),
  };

  Ok(match kind {
       | ResourceKind::Opaque => Value::Opaque(bytes.to_vec()),
       | ResourceKind::String => {
         Value::String(core::str::from_utf8(bytes).map_err(|_| Error::BadRequest)?
                                                  .to_owned())
       },
       | ResourceKind::Bool => Value::Bool(bytes == [1]),
       | ResourceKind::Float => Value::Float(decode_float(bytes)?),
       | ResourceKind::ObjLnk => match bytes {
         | [a, b, c, d] => Value::ObjLnk(ObjLnk { obj: u16::from_be_bytes([*a, *b]),
                                                  inst: u16::from_be_bytes([*c, *d]) }),
         | _ => return Err(Error::BadRequest),
       },
       | _ => Value::S64(int()?).coerce(kind)?,
     })
}

/// Walk a TLV payload rooted at `base` into `(path, raw value)` records.
///
/// `base` at object level expects OBJECT_INSTANCE wrappers; at instance
/// level, bare RESOURCE / MULTI_RESOURCE records; at resource level a
/// single record.
pub(crate) fn decode<'a>(payload: &'a [u8], base: &Path) -> Result<Vec<(Path, &'a [u8])>, Error> {
  let mut records = vec![];
  let mut input = In::new(payload);

  while !input.remaining().is_empty() {
    let (ty, id, len) = parse_header(&mut input)?;
    let body = input.take(len)?;

    match ty {
      | TYPE_OBJECT_INSTANCE => {
        if base.level > Level::ObjectInstance {
          return Err(Error::BadRequest);
        }
        let inst = Path::instance(base.obj, id);
        decode_resources(body, &inst, &mut records)?;
      },
      | _ => {
        if base.level < Level::ObjectInstance {
          return Err(Error::BadRequest);
        }
        decode_one(ty, id, body, base, &mut records)?;
      },
    }
  }

  Ok(records)
}

fn decode_resources<'a>(payload: &'a [u8],
                        inst: &Path,
                        records: &mut Vec<(Path, &'a [u8])>)
                        -> Result<(), Error> {
  let mut input = In::new(payload);
  while !input.remaining().is_empty() {
    let (ty, id, len) = parse_header(&mut input)?;
    let body = input.take(len)?;
    decode_one(ty, id, body, inst, records)?;
  }
  Ok(())
}

fn decode_one<'a>(ty: u8,
                  id: u16,
                  body: &'a [u8],
                  inst: &Path,
                  records: &mut Vec<(Path, &'a [u8])>)
                  -> Result<(), Error> {
  match ty {
    | TYPE_RESOURCE => {
      records.push((Path::resource(inst.obj, inst.obj_inst, id), body));
      Ok(())
    },
    | TYPE_MULTI_RESOURCE => {
      let mut inner = In::new(body);
      while !inner.remaining().is_empty() {
        let (ity, iid, ilen) = parse_header(&mut inner)?;
        if ity != TYPE_RESOURCE_INSTANCE {
          return Err(Error::BadRequest);
        }
        let ibody = inner.take(ilen)?;
        records.push((Path::resource_instance(inst.obj, inst.obj_inst, id, iid), ibody));
      }
      Ok(())
    },
    | _ => Err(Error::BadRequest),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn headers_round_trip() {
    for (ty, id, len) in [(TYPE_RESOURCE, 5u16, 3usize),
                          (TYPE_RESOURCE, 300, 9),
                          (TYPE_OBJECT_INSTANCE, 0, 300),
                          (TYPE_MULTI_RESOURCE, 0xffff, 70_000)] {
      let h = header(ty, id, len);
      let mut input = In::new(&h);
      assert_eq!(parse_header(&mut input).unwrap(), (ty, id, len));
      assert!(input.remaining().is_empty());
    }
  }

  #[test]
  fn single_resource_record() {
    let mut w = TlvWriter::default();
    let mut out = OutBuf::new(64);
    let p = Path::resource(3, 0, 9);
    w.put_begin(&mut out, &p).unwrap();
    w.put_s8(&mut out, &p, 100).unwrap();

    // type=resource, id 9, len 1
    assert_eq!(out.as_slice(), &[0b1100_0001, 9, 100]);

    let mut r = TlvReader;
    assert_eq!(r.get_s32(&mut In::new(out.as_slice())).unwrap(), 100);
  }

  #[test]
  fn negative_integers_sign_extend() {
    let mut w = TlvWriter::default();
    let mut out = OutBuf::new(64);
    let p = Path::resource(3, 0, 9);
    w.put_begin(&mut out, &p).unwrap();
    w.put_s16(&mut out, &p, -200).unwrap();

    let mut r = TlvReader;
    assert_eq!(r.get_s64(&mut In::new(out.as_slice())).unwrap(), -200);
  }

  #[test]
  fn floats_read_back_in_both_widths() {
    let mut r = TlvReader;

    let mut w = TlvWriter::default();
    let mut out = OutBuf::new(64);
    let p = Path::resource(3303, 0, 5700);
    w.put_begin(&mut out, &p).unwrap();
    w.put_float(&mut out, &p, -12.75).unwrap();
    assert_eq!(r.get_float(&mut In::new(out.as_slice())).unwrap(), -12.75);

    // a 4-byte float from a peer still parses
    let mut four = header(TYPE_RESOURCE, 5700, 4);
    four.extend_from_slice(&(-12.75f32).to_bits().to_be_bytes());
    assert_eq!(r.get_float(&mut In::new(&four)).unwrap(), -12.75);
  }

  #[test]
  fn instance_write_decodes_to_records() {
    // server writes /1/0: lifetime (res 1) = 86400, binding (res 7) = "U"
    let mut w = TlvWriter::default();
    let mut out = OutBuf::new(64);
    w.put_begin(&mut out, &Path::instance(1, 0)).unwrap();
    w.put_s32(&mut out, &Path::resource(1, 0, 1), 86_400).unwrap();
    w.put_string(&mut out, &Path::resource(1, 0, 7), "U").unwrap();

    let records = decode(out.as_slice(), &Path::instance(1, 0)).unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].0, Path::resource(1, 0, 1));
    assert_eq!(decode_value(ResourceKind::U32, records[0].1).unwrap(),
               Value::U32(86_400));
    assert_eq!(decode_value(ResourceKind::String, records[1].1).unwrap(),
               Value::String("U".into()));
  }

  #[test]
  fn object_read_wraps_instances() {
    let mut w = TlvWriter::default();
    let mut out = OutBuf::new(128);
    w.put_begin(&mut out, &Path::object(1)).unwrap();
    for inst in [0u16, 1] {
      let ip = Path::instance(1, inst);
      w.put_begin_oi(&mut out, &ip).unwrap();
      w.put_s16(&mut out, &Path::resource(1, inst, 0), 101 + inst as i16)
       .unwrap();
      w.put_end_oi(&mut out, &ip).unwrap();
    }

    let records = decode(out.as_slice(), &Path::object(1)).unwrap();
    assert_eq!(records,
               vec![(Path::resource(1, 0, 0), &[0u8, 101][..]),
                    (Path::resource(1, 1, 0), &[0u8, 102][..])]);
  }

  #[test]
  fn multi_resource_nests_resource_instances() {
    let mut w = TlvWriter::default();
    let mut out = OutBuf::new(64);
    let rp = Path::resource(3, 0, 11);
    w.put_begin(&mut out, &Path::instance(3, 0)).unwrap();
    w.put_begin_ri(&mut out, &rp).unwrap();
    for (ri, v) in [(0u16, 0i8), (2, 5)] {
      w.put_s8(&mut out, &Path::resource_instance(3, 0, 11, ri), v)
       .unwrap();
    }
    w.put_end_ri(&mut out, &rp).unwrap();

    let records = decode(out.as_slice(), &Path::instance(3, 0)).unwrap();
    assert_eq!(records[0].0, Path::resource_instance(3, 0, 11, 0));
    assert_eq!(records[1].0, Path::resource_instance(3, 0, 11, 2));
  }

  #[test]
  fn reordered_block_style_garbage_is_rejected() {
    assert!(decode(&[0xff, 0xff], &Path::instance(1, 0)).is_err());
  }
}
