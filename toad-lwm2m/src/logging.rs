use core::fmt::Write;

use tinyvec::ArrayVec;
use toad_writable::Writable;

use crate::msg::Packet;

pub(crate) fn msg_summary(msg: &Packet) -> Writable<ArrayVec<[u8; 64]>> {
  let mut buf: Writable<ArrayVec<[u8; 64]>> = Default::default();
  write!(buf,
         "{:?} {} with {} byte payload",
         msg.ty,
         String::from_iter(msg.code.to_human()),
         msg.payload.0.len()).ok();
  buf
}
