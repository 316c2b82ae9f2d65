//! Retryability classification over error cause chains
//!
//! A pure, side-effect-free decision: walk the `source()` chain of a failure
//! and report whether a retry could plausibly succeed.

use crate::error::{CacheMiss, HttpError, NonRetryable};
use std::error::Error as StdError;

/// Decide whether a failure is worth retrying.
///
/// The chain is walked through `source()` edges, guarded against cycles by
/// pointer identity. A failure is non-retryable iff the chain contains:
///
/// - a [`NonRetryable`] marker,
/// - an [`HttpError`] with a 4xx status, or
/// - a [`CacheMiss`].
///
/// Everything else (transport hiccups, 5xx, transient backend failures) is
/// retryable.
pub fn is_retryable(err: &(dyn StdError + 'static)) -> bool {
    let mut seen: Vec<*const ()> = Vec::new();
    let mut cur: Option<&(dyn StdError + 'static)> = Some(err);

    while let Some(e) = cur {
        let ptr = e as *const dyn StdError as *const ();
        if seen.contains(&ptr) {
            break;
        }
        seen.push(ptr);

        if e.is::<NonRetryable>() || e.is::<CacheMiss>() {
            return false;
        }
        if let Some(http) = e.downcast_ref::<HttpError>() {
            if http.is_client_error() {
                return false;
            }
        }

        cur = e.source();
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BoxError;
    use std::fmt;

    #[derive(Debug)]
    struct Transient {
        cause: Option<BoxError>,
    }

    impl fmt::Display for Transient {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "transient failure")
        }
    }

    impl StdError for Transient {
        fn source(&self) -> Option<&(dyn StdError + 'static)> {
            self.cause.as_deref().map(|e| e as &(dyn StdError + 'static))
        }
    }

    #[test]
    fn plain_errors_are_retryable() {
        let err = Transient { cause: None };
        assert!(is_retryable(&err));
    }

    #[test]
    fn marker_anywhere_in_chain_wins() {
        let err = Transient {
            cause: Some(Box::new(Transient {
                cause: Some(Box::new(NonRetryable::msg("gave up"))),
            })),
        };
        assert!(!is_retryable(&err));
    }

    #[test]
    fn client_errors_are_not_retryable() {
        assert!(!is_retryable(&HttpError::new(400, "bad request")));
        assert!(!is_retryable(&HttpError::new(422, "unprocessable")));
    }

    #[test]
    fn server_errors_are_retryable() {
        assert!(is_retryable(&HttpError::new(500, "internal")));
        assert!(is_retryable(&HttpError::new(503, "unavailable")));
    }

    #[test]
    fn nested_client_error_detected() {
        let err = Transient { cause: Some(Box::new(HttpError::new(404, "gone"))) };
        assert!(!is_retryable(&err));
    }

    #[test]
    fn cache_miss_is_terminal() {
        let err = Transient { cause: Some(Box::new(CacheMiss { key: "k".into() })) };
        assert!(!is_retryable(&err));
    }

    #[test]
    fn classification_is_pure() {
        let err = HttpError::new(429, "slow down");
        let first = is_retryable(&err);
        let second = is_retryable(&err);
        assert_eq!(first, second);
    }
}
