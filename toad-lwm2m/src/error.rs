use toad_msg::Code;

use crate::msg::code;

/// A fixed-size table that ran out of entries.
///
/// Surfaced inside [`Error::NoMem`] so the log tells you which
/// [`Config`](crate::Config) knob to grow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Pool {
  /// outbound message queue
  Message,
  /// confirmable-retransmission slots
  Pending,
  /// reply matcher slots
  Reply,
  /// observer table
  Observer,
  /// write-attribute pool
  Attribute,
  /// block-1 reassembly contexts
  BlockContext,
  /// composite / observer path lists
  PathList,
  /// response payload buffer
  Payload,
  /// object instance capacity
  Instance,
  /// a resource's storage cell or resource-instance slots
  Storage,
}

/// Protocol-level failure.
///
/// Every variant has a fixed CoAP response code (see
/// [`Error::response_code`]); when a handler fails while serving a server
/// request, the dispatcher rebuilds the response with that code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Error {
  /// Unknown object, instance or resource (4.04 Not Found)
  NotFound,
  /// The operation is not allowed on this target (4.05 Method Not Allowed)
  NotAllowed,
  /// Malformed value, bad attribute combination or conflicting state,
  /// e.g. creating an instance that already exists (4.00 Bad Request)
  BadRequest,
  /// A blockwise transfer arrived out of order (4.08 Request Entity
  /// Incomplete)
  Incomplete,
  /// More payload than we can buffer (4.13 Request Entity Too Large)
  TooLarge,
  /// The feature was not built (5.01 Not Implemented)
  NotImplemented,
  /// Content format we have no codec for (4.15 Unsupported Content-Format)
  UnsupportedFormat,
  /// Read-only target or access denied (4.01 Unauthorized)
  Unauthorized,
  /// A fixed pool ran dry (5.00 Internal Server Error)
  NoMem(Pool),
  /// Invalid argument from the local caller (5.00 Internal Server Error)
  Invalid,
}

impl Error {
  /// The CoAP response code a server sees when this error aborts one of
  /// its requests.
  pub fn response_code(&self) -> Code {
    match self {
      | Error::NotFound => code::NOT_FOUND,
      | Error::NotAllowed => code::METHOD_NOT_ALLOWED,
      | Error::BadRequest => code::BAD_REQUEST,
      | Error::Incomplete => code::REQUEST_ENTITY_INCOMPLETE,
      | Error::TooLarge => code::REQUEST_ENTITY_TOO_LARGE,
      | Error::NotImplemented => code::NOT_IMPLEMENTED,
      | Error::UnsupportedFormat => code::UNSUPPORTED_CONTENT_FORMAT,
      | Error::Unauthorized => code::UNAUTHORIZED,
      | Error::NoMem(_) | Error::Invalid => code::INTERNAL_SERVER_ERROR,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn response_codes_match_the_lwm2m_table() {
    assert_eq!(Error::NotFound.response_code(), Code::new(4, 4));
    assert_eq!(Error::NotAllowed.response_code(), Code::new(4, 5));
    assert_eq!(Error::BadRequest.response_code(), Code::new(4, 0));
    assert_eq!(Error::Incomplete.response_code(), Code::new(4, 8));
    assert_eq!(Error::TooLarge.response_code(), Code::new(4, 13));
    assert_eq!(Error::NotImplemented.response_code(), Code::new(5, 1));
    assert_eq!(Error::UnsupportedFormat.response_code(), Code::new(4, 15));
    assert_eq!(Error::Unauthorized.response_code(), Code::new(4, 1));
    assert_eq!(Error::NoMem(Pool::Observer).response_code(), Code::new(5, 0));
    assert_eq!(Error::Invalid.response_code(), Code::new(5, 0));
  }
}
