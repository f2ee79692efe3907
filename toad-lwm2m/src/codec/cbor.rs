//! `application/cbor`: a single resource value per payload.
//!
//! Time is written as a plain epoch integer; an incoming tagged epoch is
//! accepted by skipping the tag (the tagged text form is not understood).
//! Object links travel as `"obj:inst"` text, like the other single-value
//! bindings.

use minicbor::data::Type;
use minicbor::{Decoder, Encoder};

use crate::codec::{In, OpaqueCtx, OutBuf, Reader, Writer};
use crate::error::{Error, Pool};
use crate::path::Path;
use crate::value::ObjLnk;

fn encode_with<F>(f: F) -> Result<Vec<u8>, Error>
  where F: FnOnce(&mut Encoder<&mut Vec<u8>>)
                  -> Result<(), minicbor::encode::Error<core::convert::Infallible>>
{
  let mut buf = vec![];
  let mut e = Encoder::new(&mut buf);
  f(&mut e).map_err(|_| Error::Invalid)?;
  Ok(buf)
}

#[allow(missing_docs)]
#[derive(Debug, Default, Clone, Copy)]
pub struct CborWriter;

impl Writer for CborWriter {
  fn put_s8(&mut self, out: &mut OutBuf, _: &Path, value: i8) -> Result<usize, Error> {
    out.put(&encode_with(|e| e.i64(value as i64).map(|_| ()))?)
  }

  fn put_s16(&mut self, out: &mut OutBuf, _: &Path, value: i16) -> Result<usize, Error> {
    out.put(&encode_with(|e| e.i64(value as i64).map(|_| ()))?)
  }

  fn put_s32(&mut self, out: &mut OutBuf, _: &Path, value: i32) -> Result<usize, Error> {
    out.put(&encode_with(|e| e.i64(value as i64).map(|_| ()))?)
  }

  fn put_s64(&mut self, out: &mut OutBuf, _: &Path, value: i64) -> Result<usize, Error> {
    out.put(&encode_with(|e| e.i64(value).map(|_| ()))?)
  }

  fn put_time(&mut self, out: &mut OutBuf, _: &Path, value: i64) -> Result<usize, Error> {
    out.put(&encode_with(|e| e.i64(value).map(|_| ()))?)
  }

  fn put_string(&mut self, out: &mut OutBuf, _: &Path, value: &str) -> Result<usize, Error> {
    out.put(&encode_with(|e| e.str(value).map(|_| ()))?)
  }

  fn put_float(&mut self, out: &mut OutBuf, _: &Path, value: f64) -> Result<usize, Error> {
    out.put(&encode_with(|e| e.f64(value).map(|_| ()))?)
  }

  fn put_bool(&mut self, out: &mut OutBuf, _: &Path, value: bool) -> Result<usize, Error> {
    out.put(&encode_with(|e| e.bool(value).map(|_| ()))?)
  }

  fn put_opaque(&mut self, out: &mut OutBuf, _: &Path, value: &[u8]) -> Result<usize, Error> {
    out.put(&encode_with(|e| e.bytes(value).map(|_| ()))?)
  }

  fn put_objlnk(&mut self, out: &mut OutBuf, path: &Path, value: ObjLnk) -> Result<usize, Error> {
    self.put_string(out, path, &value.to_string())
  }
}

#[allow(missing_docs)]
#[derive(Debug, Default, Clone, Copy)]
pub struct CborReader;

impl CborReader {
  fn with_decoder<T>(&self,
                     input: &mut In<'_>,
                     f: impl FnOnce(&mut Decoder<'_>) -> Result<T, Error>)
                     -> Result<T, Error> {
    let mut d = Decoder::new(input.remaining());
    let v = f(&mut d)?;
    let consumed = d.position();
    input.advance(consumed);
    Ok(v)
  }
}

fn decode_i64(d: &mut Decoder<'_>) -> Result<i64, Error> {
  match d.datatype().map_err(|_| Error::BadRequest)? {
    | Type::U8 | Type::U16 | Type::U32 | Type::U64 => {
      let v = d.u64().map_err(|_| Error::BadRequest)?;
      i64::try_from(v).map_err(|_| Error::BadRequest)
    },
    | _ => d.i64().map_err(|_| Error::BadRequest),
  }
}

impl Reader for CborReader {
  fn get_s32(&mut self, input: &mut In<'_>) -> Result<i32, Error> {
    self.get_s64(input).map(|v| v as i32)
  }

  fn get_s64(&mut self, input: &mut In<'_>) -> Result<i64, Error> {
    self.with_decoder(input, decode_i64)
  }

  fn get_time(&mut self, input: &mut In<'_>) -> Result<i64, Error> {
    self.with_decoder(input, |d| {
          if d.datatype().map_err(|_| Error::BadRequest)? == Type::Tag {
            d.tag().map_err(|_| Error::BadRequest)?;
          }
          decode_i64(d)
        })
  }

  fn get_string(&mut self, input: &mut In<'_>, buf: &mut [u8]) -> Result<usize, Error> {
    self.with_decoder(input, |d| {
          let s = d.str().map_err(|_| Error::BadRequest)?;
          let n = s.len().min(buf.len().saturating_sub(1));
          if n < s.len() {
            log::warn!("string truncated from {} to {} bytes", s.len(), n);
          }
          buf[..n].copy_from_slice(&s.as_bytes()[..n]);
          buf[n] = 0;
          Ok(n)
        })
  }

  fn get_float(&mut self, input: &mut In<'_>) -> Result<f64, Error> {
    self.with_decoder(input, |d| match d.datatype().map_err(|_| Error::BadRequest)? {
          | Type::F64 => d.f64().map_err(|_| Error::BadRequest),
          | Type::F32 => d.f32().map(f64::from).map_err(|_| Error::BadRequest),
          | _ => decode_i64(d).map(|v| v as f64),
        })
  }

  fn get_bool(&mut self, input: &mut In<'_>) -> Result<bool, Error> {
    self.with_decoder(input, |d| d.bool().map_err(|_| Error::BadRequest))
  }

  fn get_opaque(&mut self,
                input: &mut In<'_>,
                buf: &mut [u8],
                ctx: &mut OpaqueCtx,
                last_chunk: &mut bool)
                -> Result<usize, Error> {
    self.with_decoder(input, |d| {
          let v = d.bytes().map_err(|_| Error::BadRequest)?;
          if v.len() > buf.len() {
            return Err(Error::NoMem(Pool::Storage));
          }

          buf[..v.len()].copy_from_slice(v);
          ctx.len = v.len();
          ctx.remaining = 0;
          *last_chunk = true;
          Ok(v.len())
        })
  }

  fn get_objlnk(&mut self, input: &mut In<'_>) -> Result<ObjLnk, Error> {
    self.with_decoder(input, |d| {
          d.str().map_err(|_| Error::BadRequest)?.parse()
        })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn primitive_round_trips() {
    let p = Path::resource(3, 0, 13);
    let mut w = CborWriter;
    let mut r = CborReader;

    let mut out = OutBuf::new(64);
    w.put_s64(&mut out, &p, -1_234_567).unwrap();
    assert_eq!(r.get_s64(&mut In::new(out.as_slice())).unwrap(), -1_234_567);

    let mut out = OutBuf::new(64);
    w.put_float(&mut out, &p, 2.625).unwrap();
    assert_eq!(r.get_float(&mut In::new(out.as_slice())).unwrap(), 2.625);

    let mut out = OutBuf::new(64);
    w.put_bool(&mut out, &p, true).unwrap();
    assert_eq!(r.get_bool(&mut In::new(out.as_slice())).unwrap(), true);

    let mut out = OutBuf::new(64);
    w.put_string(&mut out, &p, "lwm2m").unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(r.get_string(&mut In::new(out.as_slice()), &mut buf).unwrap(), 5);
    assert_eq!(&buf[..6], b"lwm2m\0");

    let mut out = OutBuf::new(64);
    w.put_objlnk(&mut out, &p, ObjLnk { obj: 10, inst: 2 }).unwrap();
    assert_eq!(r.get_objlnk(&mut In::new(out.as_slice())).unwrap(),
               ObjLnk { obj: 10, inst: 2 });

    let mut out = OutBuf::new(64);
    w.put_opaque(&mut out, &p, &[1, 2, 3]).unwrap();
    let mut buf = [0u8; 8];
    let mut ctx = OpaqueCtx::default();
    let mut last = false;
    assert_eq!(r.get_opaque(&mut In::new(out.as_slice()), &mut buf, &mut ctx, &mut last)
                .unwrap(),
               3);
    assert!(last);
    assert_eq!(&buf[..3], &[1, 2, 3]);
  }

  #[test]
  fn time_accepts_an_optional_epoch_tag() {
    let p = Path::resource(3, 0, 13);
    let mut w = CborWriter;
    let mut r = CborReader;

    let mut out = OutBuf::new(64);
    w.put_time(&mut out, &p, 1_700_000_000).unwrap();
    assert_eq!(r.get_time(&mut In::new(out.as_slice())).unwrap(),
               1_700_000_000);

    // tag 1 (epoch time) + uint
    let mut tagged = vec![0xc1, 0x1a];
    tagged.extend_from_slice(&1_700_000_000u32.to_be_bytes());
    assert_eq!(r.get_time(&mut In::new(&tagged)).unwrap(), 1_700_000_000);
  }

  #[test]
  fn an_unsigned_wider_than_i64_is_a_bad_request() {
    let mut buf = vec![0x1b];
    buf.extend_from_slice(&u64::MAX.to_be_bytes());
    let mut r = CborReader;
    assert_eq!(r.get_s64(&mut In::new(&buf)), Err(Error::BadRequest));
  }
}
