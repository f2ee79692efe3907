use toad_msg::ContentFormat;

use crate::config::Lwm2mVersion;
use crate::error::{Error, Pool};
use crate::path::Path;
use crate::value::ObjLnk;

pub mod cbor;
pub mod link_format;
pub mod oma_tlv;
pub mod plain_text;
pub(crate) mod senml;
pub mod senml_cbor;
pub mod senml_json;

/// `text/plain`
pub const PLAIN_TEXT: ContentFormat = ContentFormat::Text;
/// `application/link-format`
pub const APP_LINK_FORMAT: ContentFormat = ContentFormat::LinkFormat;
/// `application/octet-stream`
pub const APP_OCTET_STREAM: ContentFormat = ContentFormat::OctetStream;
/// `application/cbor`
pub const APP_CBOR: ContentFormat = ContentFormat::Other(60);
/// `application/senml+json`
pub const APP_SENML_JSON: ContentFormat = ContentFormat::Other(110);
/// `application/senml+cbor`
pub const APP_SENML_CBOR: ContentFormat = ContentFormat::Other(112);
/// `application/vnd.oma.lwm2m+text` (pre-registration id)
pub const OMA_PLAIN_TEXT: ContentFormat = ContentFormat::Other(1541);
/// `application/vnd.oma.lwm2m+tlv` (pre-registration id)
pub const OMA_OLD_TLV: ContentFormat = ContentFormat::Other(1542);
/// `application/vnd.oma.lwm2m+json` (pre-registration id)
pub const OMA_OLD_JSON: ContentFormat = ContentFormat::Other(1543);
/// `application/vnd.oma.lwm2m+tlv`
pub const OMA_TLV: ContentFormat = ContentFormat::Other(11542);
/// `application/vnd.oma.lwm2m+json`
pub const OMA_JSON: ContentFormat = ContentFormat::Other(11543);

/// The response payload under construction.
///
/// Capacity-bounded: a `put` that would overflow reports
/// [`Error::NoMem`] *without advancing*, so a partially-serialized
/// hierarchical read can be aborted cleanly.
#[derive(Debug, Clone)]
pub struct OutBuf {
  buf: Vec<u8>,
  limit: usize,
}

impl OutBuf {
  /// An empty buffer that will hold at most `limit` bytes.
  pub fn new(limit: usize) -> Self {
    OutBuf { buf: vec![], limit }
  }

  /// Append `bytes`, yielding how many were written.
  pub fn put(&mut self, bytes: &[u8]) -> Result<usize, Error> {
    if self.buf.len() + bytes.len() > self.limit {
      return Err(Error::NoMem(Pool::Payload));
    }

    self.buf.extend_from_slice(bytes);
    Ok(bytes.len())
  }

  /// Append one byte.
  pub fn put_u8(&mut self, byte: u8) -> Result<usize, Error> {
    self.put(&[byte])
  }

  /// Append a rendered string.
  pub fn put_str(&mut self, s: &str) -> Result<usize, Error> {
    self.put(s.as_bytes())
  }

  /// Splice `bytes` in at `at` (the TLV writer back-patches nesting
  /// headers this way).
  pub(crate) fn splice(&mut self, at: usize, bytes: &[u8]) -> Result<usize, Error> {
    if self.buf.len() + bytes.len() > self.limit {
      return Err(Error::NoMem(Pool::Payload));
    }

    let tail = self.buf.split_off(at);
    self.buf.extend_from_slice(bytes);
    self.buf.extend_from_slice(&tail);
    Ok(bytes.len())
  }

  #[allow(missing_docs)]
  pub fn len(&self) -> usize {
    self.buf.len()
  }

  #[allow(missing_docs)]
  pub fn is_empty(&self) -> bool {
    self.buf.is_empty()
  }

  /// The serialized payload so far.
  pub fn as_slice(&self) -> &[u8] {
    &self.buf
  }

  /// Take the payload.
  pub fn into_vec(self) -> Vec<u8> {
    self.buf
  }
}

/// An inbound payload being decoded.
#[derive(Debug)]
pub struct In<'a> {
  data: &'a [u8],
  pos: usize,
}

impl<'a> In<'a> {
  #[allow(missing_docs)]
  pub fn new(data: &'a [u8]) -> Self {
    In { data, pos: 0 }
  }

  /// Everything not consumed yet.
  pub fn remaining(&self) -> &'a [u8] {
    &self.data[self.pos..]
  }

  /// Consume and return everything left.
  pub fn take_all(&mut self) -> &'a [u8] {
    let rest = &self.data[self.pos..];
    self.pos = self.data.len();
    rest
  }

  /// Consume the next `n` bytes.
  pub fn take(&mut self, n: usize) -> Result<&'a [u8], Error> {
    if self.data.len() - self.pos < n {
      return Err(Error::BadRequest);
    }

    let taken = &self.data[self.pos..self.pos + n];
    self.pos += n;
    Ok(taken)
  }

  pub(crate) fn advance(&mut self, n: usize) {
    self.pos = (self.pos + n).min(self.data.len());
  }
}

/// State of an Opaque value streamed across blockwise chunks.
///
/// Lives inside the block-1 context so multi-block writes of large opaques
/// are resumable.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OpaqueCtx {
  /// total value length, learned from the first chunk
  pub len: usize,
  /// bytes not yet handed to storage
  pub remaining: usize,
}

/// The serializer seam: one implementation per content format.
///
/// Structural calls (`begin`/`end`) are no-ops for formats that don't need
/// them and never fail. Every `put_*` yields the bytes it wrote.
pub trait Writer {
  /// Payload starts.
  fn put_begin(&mut self, out: &mut OutBuf, path: &Path) -> Result<usize, Error> {
    let _ = (out, path);
    Ok(0)
  }

  /// Payload is complete.
  fn put_end(&mut self, out: &mut OutBuf, path: &Path) -> Result<usize, Error> {
    let _ = (out, path);
    Ok(0)
  }

  /// An object instance starts.
  fn put_begin_oi(&mut self, out: &mut OutBuf, path: &Path) -> Result<usize, Error> {
    let _ = (out, path);
    Ok(0)
  }

  /// An object instance ends.
  fn put_end_oi(&mut self, out: &mut OutBuf, path: &Path) -> Result<usize, Error> {
    let _ = (out, path);
    Ok(0)
  }

  /// A resource starts.
  fn put_begin_r(&mut self, out: &mut OutBuf, path: &Path) -> Result<usize, Error> {
    let _ = (out, path);
    Ok(0)
  }

  /// A resource ends.
  fn put_end_r(&mut self, out: &mut OutBuf, path: &Path) -> Result<usize, Error> {
    let _ = (out, path);
    Ok(0)
  }

  /// A multi-instance resource starts.
  fn put_begin_ri(&mut self, out: &mut OutBuf, path: &Path) -> Result<usize, Error> {
    let _ = (out, path);
    Ok(0)
  }

  /// A multi-instance resource ends.
  fn put_end_ri(&mut self, out: &mut OutBuf, path: &Path) -> Result<usize, Error> {
    let _ = (out, path);
    Ok(0)
  }

  #[allow(missing_docs)]
  fn put_s8(&mut self, out: &mut OutBuf, path: &Path, value: i8) -> Result<usize, Error>;

  #[allow(missing_docs)]
  fn put_s16(&mut self, out: &mut OutBuf, path: &Path, value: i16) -> Result<usize, Error>;

  #[allow(missing_docs)]
  fn put_s32(&mut self, out: &mut OutBuf, path: &Path, value: i32) -> Result<usize, Error>;

  #[allow(missing_docs)]
  fn put_s64(&mut self, out: &mut OutBuf, path: &Path, value: i64) -> Result<usize, Error>;

  /// Seconds since the epoch.
  fn put_time(&mut self, out: &mut OutBuf, path: &Path, value: i64) -> Result<usize, Error>;

  #[allow(missing_docs)]
  fn put_string(&mut self, out: &mut OutBuf, path: &Path, value: &str) -> Result<usize, Error>;

  #[allow(missing_docs)]
  fn put_float(&mut self, out: &mut OutBuf, path: &Path, value: f64) -> Result<usize, Error>;

  #[allow(missing_docs)]
  fn put_bool(&mut self, out: &mut OutBuf, path: &Path, value: bool) -> Result<usize, Error>;

  #[allow(missing_docs)]
  fn put_opaque(&mut self, out: &mut OutBuf, path: &Path, value: &[u8]) -> Result<usize, Error>;

  #[allow(missing_docs)]
  fn put_objlnk(&mut self, out: &mut OutBuf, path: &Path, value: ObjLnk) -> Result<usize, Error>;

  /// A CoRE link (`</3/0>...`); only the link-format writer has one.
  fn put_corelink(&mut self, out: &mut OutBuf, path: &Path) -> Result<usize, Error> {
    let _ = (out, path);
    Err(Error::NotImplemented)
  }
}

/// The deserializer seam.
pub trait Reader {
  #[allow(missing_docs)]
  fn get_s32(&mut self, input: &mut In<'_>) -> Result<i32, Error>;

  #[allow(missing_docs)]
  fn get_s64(&mut self, input: &mut In<'_>) -> Result<i64, Error>;

  /// Seconds since the epoch.
  fn get_time(&mut self, input: &mut In<'_>) -> Result<i64, Error>;

  /// Copy the string into `buf`, always NUL-terminating. A value longer
  /// than `buf.len() - 1` is truncated with a warning but still succeeds.
  /// Yields the string length (terminator excluded).
  fn get_string(&mut self, input: &mut In<'_>, buf: &mut [u8]) -> Result<usize, Error>;

  #[allow(missing_docs)]
  fn get_float(&mut self, input: &mut In<'_>) -> Result<f64, Error>;

  #[allow(missing_docs)]
  fn get_bool(&mut self, input: &mut In<'_>) -> Result<bool, Error>;

  /// Streaming: `ctx` persists across blockwise calls; `last_chunk` is set
  /// once the value is exhausted. Yields bytes copied into `buf`.
  fn get_opaque(&mut self,
                input: &mut In<'_>,
                buf: &mut [u8],
                ctx: &mut OpaqueCtx,
                last_chunk: &mut bool)
                -> Result<usize, Error>;

  #[allow(missing_docs)]
  fn get_objlnk(&mut self, input: &mut In<'_>) -> Result<ObjLnk, Error>;
}

/// Look up the writer for an Accept option.
///
/// An unknown format yields [`Error::UnsupportedFormat`], which the
/// dispatcher turns into 4.15.
pub fn select_writer(accept: ContentFormat) -> Result<Box<dyn Writer>, Error> {
  match accept {
    | APP_LINK_FORMAT => Ok(Box::new(link_format::LinkFormatWriter::default())),
    | PLAIN_TEXT | OMA_PLAIN_TEXT => Ok(Box::new(plain_text::PlainTextWriter::default())),
    | OMA_TLV | OMA_OLD_TLV => Ok(Box::new(oma_tlv::TlvWriter::default())),
    | APP_CBOR => Ok(Box::new(cbor::CborWriter::default())),
    | APP_SENML_JSON => Ok(Box::new(senml_json::SenmlJsonWriter::default())),
    | APP_SENML_CBOR => Ok(Box::new(senml_cbor::SenmlCborWriter::default())),
    | other => {
      log::warn!("unknown content format {:?}", other);
      Err(Error::UnsupportedFormat)
    },
  }
}

/// Look up the reader for a Content-Format option.
pub fn select_reader(format: ContentFormat) -> Result<Box<dyn Reader>, Error> {
  match format {
    | PLAIN_TEXT | OMA_PLAIN_TEXT | APP_OCTET_STREAM => {
      Ok(Box::new(plain_text::PlainTextReader::default()))
    },
    | OMA_TLV | OMA_OLD_TLV => Ok(Box::new(oma_tlv::TlvReader::default())),
    | APP_CBOR => Ok(Box::new(cbor::CborReader::default())),
    | APP_SENML_JSON => Ok(Box::new(senml_json::SenmlJsonReader::default())),
    | APP_SENML_CBOR => Ok(Box::new(senml_cbor::SenmlCborReader::default())),
    | other => {
      log::warn!("unknown content format {:?}", other);
      Err(Error::UnsupportedFormat)
    },
  }
}

/// The Accept to assume when a request carries none: SenML-CBOR under
/// LwM2M 1.1, OMA-TLV under 1.0.
pub fn default_accept(version: Lwm2mVersion) -> ContentFormat {
  match version {
    | Lwm2mVersion::V1_1 => APP_SENML_CBOR,
    | Lwm2mVersion::V1_0 => OMA_TLV,
  }
}

/// Hierarchical formats can carry whole instances / objects; single-value
/// formats serve exactly one resource (instance).
pub fn is_hierarchical(format: ContentFormat) -> bool {
  matches!(format,
           OMA_TLV | OMA_OLD_TLV | APP_SENML_JSON | APP_SENML_CBOR)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn outbuf_does_not_advance_on_overflow() {
    let mut out = OutBuf::new(4);
    out.put(&[1, 2, 3]).unwrap();
    assert_eq!(out.put(&[4, 5]), Err(Error::NoMem(Pool::Payload)));
    assert_eq!(out.as_slice(), &[1, 2, 3]);
    out.put(&[4]).unwrap();
    assert_eq!(out.as_slice(), &[1, 2, 3, 4]);
  }

  #[test]
  fn splice_inserts_in_the_middle() {
    let mut out = OutBuf::new(8);
    out.put(&[1, 4]).unwrap();
    out.splice(1, &[2, 3]).unwrap();
    assert_eq!(out.as_slice(), &[1, 2, 3, 4]);
  }

  #[test]
  fn selection_unknown_format_is_enomsg() {
    assert_eq!(select_writer(ContentFormat::Other(9999)).err(),
               Some(Error::UnsupportedFormat));
    assert_eq!(select_reader(OMA_JSON).err(),
               Some(Error::UnsupportedFormat));
  }

  #[test]
  fn default_accept_prefers_senml_cbor_on_1_1() {
    assert_eq!(default_accept(Lwm2mVersion::V1_1), APP_SENML_CBOR);
    assert_eq!(default_accept(Lwm2mVersion::V1_0), OMA_TLV);
  }
}
