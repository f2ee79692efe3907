//! Outbound message plumbing: retransmission slots, reply matchers,
//! block-1 reassembly contexts, and the byte-surgery that turns a built
//! ACK into a separate CON response.

use toad_msg::{Id, Token};

use crate::codec::OpaqueCtx;
use crate::config::{Transfer, BLOCK_TRANSFER_TTL_MS};
use crate::error::{Error, Pool};

/// The CoAP message type this crate builds and parses: `toad-msg` with
/// `Vec` storage.
pub type Packet = toad_msg::alloc::Message;

/// CoAP codes used by the LwM2M interfaces.
pub mod code {
  use crate::code;

  // methods
  code!(rfc7252("5.8.1") GET = 0*01);
  code!(rfc7252("5.8.2") POST = 0*02);
  code!(rfc7252("5.8.3") PUT = 0*03);
  code!(rfc7252("5.8.4") DELETE = 0*04);
  code!(
        #[doc = concat!(
    "## [0.05 FETCH](https://www.rfc-editor.org/rfc/rfc8132#section-2)\n",
    "Used by LwM2M 1.1 for the composite Read operation: the request\n",
    "body names the paths to read instead of the URI.",
  )]
        FETCH = 0*05
  );
  code!(
        #[doc = concat!(
    "## [0.07 iPATCH](https://www.rfc-editor.org/rfc/rfc8132#section-3)\n",
    "Used by LwM2M 1.1 for the composite Write operation.",
  )]
        IPATCH = 0*07
  );

  // 2.xx
  code!(rfc7252("5.9.1.1") CREATED = 2*01);
  code!(rfc7252("5.9.1.2") DELETED = 2*02);
  code!(rfc7252("5.9.1.4") CHANGED = 2*04);
  code!(rfc7252("5.9.1.5") CONTENT = 2*05);
  code!(
        #[doc = concat!(
    "## [2.31 Continue](https://www.rfc-editor.org/rfc/rfc7959#section-2.9.1)\n",
    "The received block of the request body was accepted and more\n",
    "blocks are expected.",
  )]
        CONTINUE = 2*31
  );

  // 4.xx
  code!(rfc7252("5.9.2.1") BAD_REQUEST = 4*00);
  code!(rfc7252("5.9.2.2") UNAUTHORIZED = 4*01);
  code!(rfc7252("5.9.2.5") NOT_FOUND = 4*04);
  code!(rfc7252("5.9.2.6") METHOD_NOT_ALLOWED = 4*05);
  code!(
        #[doc = concat!(
    "## [4.08 Request Entity Incomplete](https://www.rfc-editor.org/rfc/rfc7959#section-2.9.2)\n",
    "The server has not received the blocks of the request body that\n",
    "it needs to proceed — out of order, missing, or expired.",
  )]
        REQUEST_ENTITY_INCOMPLETE = 4*08
  );
  code!(rfc7252("5.9.2.9") REQUEST_ENTITY_TOO_LARGE = 4*13);
  code!(rfc7252("5.9.2.10") UNSUPPORTED_CONTENT_FORMAT = 4*15);

  // 5.xx
  code!(rfc7252("5.9.3.1") INTERNAL_SERVER_ERROR = 5*00);
  code!(rfc7252("5.9.3.2") NOT_IMPLEMENTED = 5*01);
}

/// Why we are waiting for a reply: dispatched by the engine when the
/// matching response (or a retransmission timeout) arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
  /// `POST /bs`
  Bootstrap,
  /// `POST /rd`
  Register,
  /// `POST /rd/<server_ep>`
  Update,
  /// `DELETE /rd/<server_ep>`
  Deregister,
  /// an observation NOTIFY
  Notify,
  /// an LwM2M 1.1 Send (`POST /dp`)
  Send,
}

/// Doubling retransmission schedule for one confirmable message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Retransmit {
  next_at_ms: u64,
  delay_ms: u64,
  left: u8,
}

/// What to do with a pending confirmable right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
  /// not due yet
  Wait,
  /// send the datagram again
  Retry,
  /// attempts exhausted, run the timeout path
  Exhausted,
}

impl Retransmit {
  pub(crate) fn new(now_ms: u64, transfer: &Transfer) -> Self {
    Retransmit { next_at_ms: now_ms + transfer.ack_timeout_ms,
                 delay_ms: transfer.ack_timeout_ms,
                 left: transfer.max_retransmit }
  }

  pub(crate) fn poll(&mut self, now_ms: u64) -> Verdict {
    if now_ms < self.next_at_ms {
      return Verdict::Wait;
    }

    if self.left == 0 {
      return Verdict::Exhausted;
    }

    self.left -= 1;
    self.delay_ms *= 2;
    self.next_at_ms = now_ms + self.delay_ms;
    Verdict::Retry
  }

  /// When this pending next needs attention.
  pub(crate) fn next_at_ms(&self) -> u64 {
    self.next_at_ms
  }
}

/// An in-flight confirmable message: the serialized datagram plus its
/// retransmission schedule.
#[derive(Debug, Clone)]
pub(crate) struct Pending {
  pub(crate) id: Id,
  pub(crate) token: Token,
  pub(crate) data: Vec<u8>,
  pub(crate) retransmit: Retransmit,
  pub(crate) acknowledged: bool,
}

/// Matches an expected response by token.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Reply {
  pub(crate) token: Token,
  pub(crate) kind: ReplyKind,
}

/// Per-token blockwise-1 reassembly state.
#[derive(Debug, Clone)]
pub(crate) struct BlockContext {
  pub(crate) token: Token,
  pub(crate) created_ms: u64,
  /// next block number we will accept
  pub(crate) expected: u32,
  pub(crate) last_block: bool,
  /// bytes of payload accepted so far
  pub(crate) current: usize,
  /// value of the Size1 option, when the peer sent one
  pub(crate) total_size: usize,
  /// streamed-opaque state carried across chunks
  pub(crate) opaque: OpaqueCtx,
}

fn expired(ctx: &BlockContext, now_ms: u64) -> bool {
  now_ms.saturating_sub(ctx.created_ms) > BLOCK_TRANSFER_TTL_MS
}

/// First block (or an expired slot): start a fresh context for `token`.
pub(crate) fn init_block_ctx(table: &mut Vec<BlockContext>,
                             capacity: usize,
                             token: Token,
                             now_ms: u64)
                             -> Result<usize, Error> {
  table.retain(|c| !expired(c, now_ms) && c.token != token);

  if table.len() >= capacity {
    log::error!("cannot find free block context");
    return Err(Error::NoMem(Pool::BlockContext));
  }

  table.push(BlockContext { token,
                            created_ms: now_ms,
                            expected: 0,
                            last_block: false,
                            current: 0,
                            total_size: 0,
                            opaque: OpaqueCtx::default() });
  Ok(table.len() - 1)
}

/// The live context for `token`, refreshing its TTL.
pub(crate) fn get_block_ctx(table: &mut [BlockContext],
                            token: Token,
                            now_ms: u64)
                            -> Option<usize> {
  table.iter_mut()
       .enumerate()
       .find(|(_, c)| c.token == token && !expired(c, now_ms))
       .map(|(i, c)| {
         c.created_ms = now_ms;
         i
       })
}

pub(crate) fn free_block_ctx(table: &mut Vec<BlockContext>, token: Token) {
  table.retain(|c| c.token != token);
}

/// Encode a CoAP uint option value (Observe counter): minimal-length
/// big-endian, zero is empty.
pub(crate) fn encode_uint_option(value: u32) -> Vec<u8> {
  let bytes = value.to_be_bytes();
  let skip = bytes.iter().take_while(|b| **b == 0).count();
  bytes[skip..].to_vec()
}

/// Decode a CoAP uint option value.
pub(crate) fn decode_uint_option(bytes: &[u8]) -> u32 {
  bytes.iter().fold(0u32, |acc, b| acc << 8 | *b as u32)
}

/// Rewrite the first four bytes of a serialized ACK so it goes out as a
/// CON with a fresh message id. The caller installs a new pending slot so
/// the separate response is retransmitted and matched by its own id.
pub(crate) fn promote_to_con(data: &mut [u8], id: Id) {
  if data.len() < 4 {
    return;
  }

  // type lives in bits 4..=5 of byte 0; CON is 0
  data[0] &= !(0x3 << 4);
  data[2] = (id.0 >> 8) as u8;
  data[3] = id.0 as u8;
}
