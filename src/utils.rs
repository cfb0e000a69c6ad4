use std::time::Duration;

/// Milliseconds for millisecond-granular waits. `None` blocks forever (`-1`).
///
/// Rounds up, so a sub-millisecond timeout still sleeps instead of spinning.
#[cfg_attr(
    not(any(target_os = "linux", target_os = "android", target_os = "illumos", windows)),
    allow(dead_code)
)]
pub(crate) fn timeout_millis(timeout: Option<Duration>) -> i32 {
    match timeout {
        None => -1,
        Some(t) => {
            let mut ms = t.as_millis();
            if Duration::from_millis(ms as u64) < t {
                ms += 1;
            }
            ms.min(i32::MAX as u128) as i32
        }
    }
}

/// Whole seconds and remaining microseconds, seconds saturated at `max_secs`.
pub(crate) fn split_micros(t: Duration, max_secs: u64) -> (u64, u32) {
    if t.as_secs() > max_secs {
        (max_secs, 999_999)
    } else {
        (t.as_secs(), t.subsec_micros())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn millis_round_up_and_saturate() {
        assert_eq!(timeout_millis(None), -1);
        assert_eq!(timeout_millis(Some(Duration::ZERO)), 0);
        assert_eq!(timeout_millis(Some(Duration::from_micros(10))), 1);
        assert_eq!(timeout_millis(Some(Duration::from_millis(50))), 50);
        assert_eq!(timeout_millis(Some(Duration::from_secs(u64::MAX))), i32::MAX);
    }

    #[test]
    fn micros_split() {
        assert_eq!(split_micros(Duration::from_micros(1_500_000), 10), (1, 500_000));
        assert_eq!(split_micros(Duration::from_secs(99), 10), (10, 999_999));
    }
}
