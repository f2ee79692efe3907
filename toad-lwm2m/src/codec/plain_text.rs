//! `text/plain` (and `application/octet-stream`): one resource per payload,
//! numbers rendered as decimal ASCII, opaques as raw bytes.

use crate::codec::{In, OpaqueCtx, OutBuf, Reader, Writer};
use crate::error::Error;
use crate::path::Path;
use crate::value::ObjLnk;

#[allow(missing_docs)]
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainTextWriter;

impl Writer for PlainTextWriter {
  fn put_s8(&mut self, out: &mut OutBuf, _: &Path, value: i8) -> Result<usize, Error> {
    out.put_str(&value.to_string())
  }

  fn put_s16(&mut self, out: &mut OutBuf, _: &Path, value: i16) -> Result<usize, Error> {
    out.put_str(&value.to_string())
  }

  fn put_s32(&mut self, out: &mut OutBuf, _: &Path, value: i32) -> Result<usize, Error> {
    out.put_str(&value.to_string())
  }

  fn put_s64(&mut self, out: &mut OutBuf, _: &Path, value: i64) -> Result<usize, Error> {
    out.put_str(&value.to_string())
  }

  fn put_time(&mut self, out: &mut OutBuf, _: &Path, value: i64) -> Result<usize, Error> {
    out.put_str(&value.to_string())
  }

  fn put_string(&mut self, out: &mut OutBuf, _: &Path, value: &str) -> Result<usize, Error> {
    out.put_str(value)
  }

  fn put_float(&mut self, out: &mut OutBuf, _: &Path, value: f64) -> Result<usize, Error> {
    // `Display` for f64 never uses exponent notation, which is what the
    // plain-text binding requires
    out.put_str(&value.to_string())
  }

  fn put_bool(&mut self, out: &mut OutBuf, _: &Path, value: bool) -> Result<usize, Error> {
    out.put_str(if value { "1" } else { "0" })
  }

  fn put_opaque(&mut self, out: &mut OutBuf, _: &Path, value: &[u8]) -> Result<usize, Error> {
    out.put(value)
  }

  fn put_objlnk(&mut self, out: &mut OutBuf, _: &Path, value: ObjLnk) -> Result<usize, Error> {
    out.put_str(&value.to_string())
  }
}

#[allow(missing_docs)]
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainTextReader;

fn utf8<'a>(bytes: &'a [u8]) -> Result<&'a str, Error> {
  core::str::from_utf8(bytes).map_err(|_| Error::BadRequest)
}

impl Reader for PlainTextReader {
  fn get_s32(&mut self, input: &mut In<'_>) -> Result<i32, Error> {
    utf8(input.take_all())?.trim()
                           .parse()
                           .map_err(|_| Error::BadRequest)
  }

  fn get_s64(&mut self, input: &mut In<'_>) -> Result<i64, Error> {
    utf8(input.take_all())?.trim()
                           .parse()
                           .map_err(|_| Error::BadRequest)
  }

  fn get_time(&mut self, input: &mut In<'_>) -> Result<i64, Error> {
    self.get_s64(input)
  }

  fn get_string(&mut self, input: &mut In<'_>, buf: &mut [u8]) -> Result<usize, Error> {
    let src = input.take_all();
    utf8(src)?;

    let n = src.len().min(buf.len().saturating_sub(1));
    if n < src.len() {
      log::warn!("string truncated from {} to {} bytes", src.len(), n);
    }

    buf[..n].copy_from_slice(&src[..n]);
    buf[n] = 0;
    Ok(n)
  }

  fn get_float(&mut self, input: &mut In<'_>) -> Result<f64, Error> {
    utf8(input.take_all())?.trim()
                           .parse()
                           .map_err(|_| Error::BadRequest)
  }

  fn get_bool(&mut self, input: &mut In<'_>) -> Result<bool, Error> {
    match utf8(input.take_all())?.trim() {
      | "1" => Ok(true),
      | "0" => Ok(false),
      | _ => Err(Error::BadRequest),
    }
  }

  fn get_opaque(&mut self,
                input: &mut In<'_>,
                buf: &mut [u8],
                ctx: &mut OpaqueCtx,
                last_chunk: &mut bool)
                -> Result<usize, Error> {
    if ctx.len == 0 {
      // no blockwise context handed us a total; this payload is the value
      ctx.len = input.remaining().len();
      ctx.remaining = ctx.len;
    }

    let n = input.remaining().len().min(buf.len());
    buf[..n].copy_from_slice(&input.remaining()[..n]);
    input.advance(n);
    ctx.remaining = ctx.remaining.saturating_sub(n);
    *last_chunk = input.remaining().is_empty();
    Ok(n)
  }

  fn get_objlnk(&mut self, input: &mut In<'_>) -> Result<ObjLnk, Error> {
    utf8(input.take_all())?.trim().parse()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn write_one(f: impl FnOnce(&mut PlainTextWriter, &mut OutBuf) -> Result<usize, Error>) -> Vec<u8> {
    let mut w = PlainTextWriter;
    let mut out = OutBuf::new(64);
    f(&mut w, &mut out).unwrap();
    out.into_vec()
  }

  #[test]
  fn numbers_render_as_decimal_ascii() {
    let p = Path::resource(3, 0, 9);
    assert_eq!(write_one(|w, o| w.put_s32(o, &p, -17)), b"-17");
    assert_eq!(write_one(|w, o| w.put_s64(o, &p, i64::MAX)),
               b"9223372036854775807");
    assert_eq!(write_one(|w, o| w.put_bool(o, &p, true)), b"1");
    assert_eq!(write_one(|w, o| w.put_float(o, &p, 0.0000001)), b"0.0000001");
    assert_eq!(write_one(|w, o| w.put_objlnk(o, &p, ObjLnk { obj: 10, inst: 2 })),
               b"10:2");
  }

  #[test]
  fn read_back_what_we_wrote() {
    let mut r = PlainTextReader;
    assert_eq!(r.get_s32(&mut In::new(b"-17")).unwrap(), -17);
    assert_eq!(r.get_s64(&mut In::new(b"123456789012")).unwrap(),
               123_456_789_012);
    assert_eq!(r.get_bool(&mut In::new(b"0")).unwrap(), false);
    assert!((r.get_float(&mut In::new(b"0.0000001")).unwrap() - 0.0000001).abs() < 1e-12);
    assert_eq!(r.get_objlnk(&mut In::new(b"10:2")).unwrap(),
               ObjLnk { obj: 10, inst: 2 });
    assert!(r.get_bool(&mut In::new(b"yes")).is_err());
  }

  #[test]
  fn strings_are_nul_terminated_and_truncate_with_success() {
    let mut r = PlainTextReader;
    let mut buf = [0xffu8; 8];
    let n = r.get_string(&mut In::new(b"hi"), &mut buf).unwrap();
    assert_eq!(n, 2);
    assert_eq!(&buf[..3], b"hi\0");

    let n = r.get_string(&mut In::new(b"0123456789"), &mut buf).unwrap();
    assert_eq!(n, 7);
    assert_eq!(&buf[..8], b"0123456\0");
  }

  #[test]
  fn opaque_streams_across_calls() {
    let mut r = PlainTextReader;
    let mut ctx = OpaqueCtx::default();
    let mut last = false;
    let mut buf = [0u8; 4];

    // one block, drained in two buffer-sized bites
    let mut input = In::new(&[1, 2, 3, 4, 5, 6]);
    let n = r.get_opaque(&mut input, &mut buf, &mut ctx, &mut last).unwrap();
    assert_eq!((n, last), (4, false));
    let n = r.get_opaque(&mut input, &mut buf, &mut ctx, &mut last).unwrap();
    assert_eq!((n, last), (2, true));
    assert_eq!(ctx.len, 6);
  }
}
