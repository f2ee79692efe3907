//! `application/link-format`: registration payloads and Discover
//! responses.
//!
//! Only `put_corelink` and the structural calls do anything; asking this
//! writer for a value is a programming error and yields `NotImplemented`.

use core::fmt::Display;

use crate::codec::{OutBuf, Writer};
use crate::config::Lwm2mVersion;
use crate::error::Error;
use crate::path::Path;
use crate::value::ObjLnk;

/// What the link payload is for; the preface differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkMode {
  /// `POST /rd` payload: `</>;rt="oma.lwm2m";ct=…` then the object list
  Register {
    /// numeric id of the default content format advertised in `ct=`
    ct: u16,
  },
  /// Device-management Discover: bare links + attributes
  Discover,
  /// Bootstrap Discover: `</>;lwm2m=…` then objects and instances
  BootstrapDiscover {
    /// protocol version advertised on the root link
    version: Lwm2mVersion,
  },
}

#[allow(missing_docs)]
#[derive(Debug)]
pub struct LinkFormatWriter {
  mode: LinkMode,
  empty: bool,
}

impl Default for LinkFormatWriter {
  fn default() -> Self {
    LinkFormatWriter::new(LinkMode::Discover)
  }
}

impl LinkFormatWriter {
  #[allow(missing_docs)]
  pub fn new(mode: LinkMode) -> Self {
    LinkFormatWriter { mode, empty: true }
  }

  fn separate(&mut self, out: &mut OutBuf) -> Result<usize, Error> {
    if self.empty {
      self.empty = false;
      Ok(0)
    } else {
      out.put_str(",")
    }
  }

  /// Append `;name=value` to the link written last.
  pub fn put_attr(&mut self, out: &mut OutBuf, name: &str, value: impl Display) -> Result<usize, Error> {
    out.put_str(&format!(";{}={}", name, value))
  }

  /// Append the object version attribute, `;ver=M.m`.
  pub fn put_version(&mut self, out: &mut OutBuf, version: (u8, u8)) -> Result<usize, Error> {
    out.put_str(&format!(";ver={}.{}", version.0, version.1))
  }
}

impl Writer for LinkFormatWriter {
  fn put_begin(&mut self, out: &mut OutBuf, _: &Path) -> Result<usize, Error> {
    match self.mode {
      | LinkMode::Register { ct } => {
        self.empty = false;
        out.put_str(&format!("</>;rt=\"oma.lwm2m\";ct={}", ct))
      },
      | LinkMode::BootstrapDiscover { version } => {
        self.empty = false;
        out.put_str(&format!("</>;lwm2m={}", version.query_str()))
      },
      | LinkMode::Discover => Ok(0),
    }
  }

  fn put_corelink(&mut self, out: &mut OutBuf, path: &Path) -> Result<usize, Error> {
    Ok(self.separate(out)? + out.put_str(&format!("<{}>", path))?)
  }

  fn put_s8(&mut self, _: &mut OutBuf, _: &Path, _: i8) -> Result<usize, Error> {
    Err(Error::NotImplemented)
  }

  fn put_s16(&mut self, _: &mut OutBuf, _: &Path, _: i16) -> Result<usize, Error> {
    Err(Error::NotImplemented)
  }

  fn put_s32(&mut self, _: &mut OutBuf, _: &Path, _: i32) -> Result<usize, Error> {
    Err(Error::NotImplemented)
  }

  fn put_s64(&mut self, _: &mut OutBuf, _: &Path, _: i64) -> Result<usize, Error> {
    Err(Error::NotImplemented)
  }

  fn put_time(&mut self, _: &mut OutBuf, _: &Path, _: i64) -> Result<usize, Error> {
    Err(Error::NotImplemented)
  }

  fn put_string(&mut self, _: &mut OutBuf, _: &Path, _: &str) -> Result<usize, Error> {
    Err(Error::NotImplemented)
  }

  fn put_float(&mut self, _: &mut OutBuf, _: &Path, _: f64) -> Result<usize, Error> {
    Err(Error::NotImplemented)
  }

  fn put_bool(&mut self, _: &mut OutBuf, _: &Path, _: bool) -> Result<usize, Error> {
    Err(Error::NotImplemented)
  }

  fn put_opaque(&mut self, _: &mut OutBuf, _: &Path, _: &[u8]) -> Result<usize, Error> {
    Err(Error::NotImplemented)
  }

  fn put_objlnk(&mut self, _: &mut OutBuf, _: &Path, _: ObjLnk) -> Result<usize, Error> {
    Err(Error::NotImplemented)
  }
}
