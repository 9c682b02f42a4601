use std::time::Duration;

/// Base wait window in milliseconds.
const BASE_MS: u64 = 6;
/// The exponent never grows past this factor.
const MAX_EXP: u64 = 64;

/// Exponential backoff window for elimination attempts.
///
/// Each failed attempt on the central structure widens the window the
/// operation spends in the elimination array, up to BASE_MS * MAX_EXP.
pub(crate) struct Backoff {
    exp: u64,
}

impl Backoff {
    pub(crate) fn new() -> Self {
        Backoff { exp: 1 }
    }

    /// Return the current window, then double the exponent up to the cap.
    pub(crate) fn next_window(&mut self) -> Duration {
        let window = Duration::from_millis(BASE_MS * self.exp);
        self.exp = (self.exp * 2).min(MAX_EXP);
        window
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_to_cap() {
        let mut backoff = Backoff::new();
        assert_eq!(backoff.next_window(), Duration::from_millis(6));
        assert_eq!(backoff.next_window(), Duration::from_millis(12));
        assert_eq!(backoff.next_window(), Duration::from_millis(24));

        for _ in 0..10 {
            backoff.next_window();
        }
        assert_eq!(backoff.next_window(), Duration::from_millis(6 * 64));
        assert_eq!(backoff.next_window(), Duration::from_millis(6 * 64));
    }
}
