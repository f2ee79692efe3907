/// A duration, in milliseconds
pub type Millis = embedded_time::duration::Milliseconds<u64>;

/// Supertrait of [`embedded_time::Clock`] pinning the
/// type of "ticks" to u64
pub trait Clock: embedded_time::Clock<T = u64> {}
impl<C: embedded_time::Clock<T = u64>> Clock for C {}

/// The clock failed, or its tick count does not fit in u64 milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockError;

/// Milliseconds since the clock's epoch.
///
/// All engine timestamps (`last_update`, observer `event_timestamp`, block
/// context TTLs, ...) are plain u64 milliseconds from this function.
pub(crate) fn uptime_ms<C: Clock>(clock: &C) -> Result<u64, ClockError> {
  let now = clock.try_now().map_err(|_| ClockError)?;
  Millis::try_from(now.duration_since_epoch()).map(|ms| ms.0)
                                              .map_err(|_| ClockError)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::test::ClockMock;

  #[test]
  fn uptime_follows_the_clock() {
    let clock = ClockMock::new();
    assert_eq!(uptime_ms(&clock), Ok(0));
    clock.advance(1_500);
    assert_eq!(uptime_ms(&clock), Ok(1_500));
  }
}
