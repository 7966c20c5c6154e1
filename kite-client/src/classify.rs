//! Pure predicates deciding what to do with a failed operation: retry it on
//! the same broker, skip to a different broker, or fail the caller.
//!
//! The predicates walk the full error chain, descending through
//! `io::Error` payloads, so classification holds no matter how deeply an
//! error was wrapped along the way. They hold no state and never mutate the
//! error.

use std::error::Error as StdError;
use std::io;

use crate::error::{Error, NetOp};

/// True iff the chain contains a network error from the dial operation.
///
/// Dial failures get special treatment: they are not retried on the same
/// broker (fast-looping on a bad resolver helps nobody) but a different
/// broker may well be dialable.
#[must_use]
pub fn is_dial_error(err: &Error) -> bool {
    contains_client_error(err, |e| {
        matches!(
            e,
            Error::Network {
                op: NetOp::Dial,
                ..
            }
        )
    })
}

/// True iff retrying the same request on the same broker can plausibly
/// succeed.
///
/// `None` is not retriable: this evaluates whether an *error* is retriable,
/// and callers juggling several optional errors at once should not treat
/// the absent ones as retriable successes.
#[must_use]
pub fn retriable_on_same_broker(err: Option<&Error>) -> bool {
    let Some(err) = err else {
        return false;
    };

    // Anything that reached the operating system is usually worth another
    // try: what looks like a hard failure is often transient. Dial failures
    // are the exception. This check must run before the generic temporary
    // probe below, which would otherwise claim non-temporary for most
    // OS-level failures.
    if contains_os_error(err) {
        return !is_dial_error(err);
    }

    // Brokers kill connections unexpectedly; reconnecting and retrying is
    // routine.
    if is_connection_closed(err) {
        return true;
    }

    if contains_client_error(err, |e| {
        matches!(
            e,
            Error::ProducerIdLoadFail
                | Error::ChosenBrokerDead
                | Error::SaslReauthLoop
                | Error::CorrelationMismatch { .. }
        )
    }) {
        return true;
    }

    temporary_hint(err).unwrap_or(false)
}

/// True iff the request is worth trying on a *different* broker even though
/// this broker cannot serve it.
///
/// Cancellation and caller deadlines are never reclassified: they mean the
/// caller wants out, not that another broker would do better.
#[must_use]
pub fn skippable_to_next_broker(err: Option<&Error>) -> bool {
    let Some(err) = err else {
        return false;
    };

    if contains_client_error(err, |e| matches!(e, Error::UnknownBroker)) {
        return true;
    }

    let caller_intent = contains_client_error(err, |e| {
        matches!(e, Error::Cancelled | Error::RequestTimeout { .. })
    });

    contains_client_error(err, |e| matches!(e, Error::Network { .. })) && !caller_intent
}

/// Walks the error chain, descending into `io::Error` payloads, until the
/// visitor returns true.
///
/// `io::Error` is handled explicitly: its `source()` skips over the custom
/// payload it carries, and the payload is exactly what classification needs
/// to see.
fn chain_any(
    err: &(dyn StdError + 'static),
    pred: &mut dyn FnMut(&(dyn StdError + 'static)) -> bool,
) -> bool {
    if pred(err) {
        return true;
    }
    if let Some(io_err) = err.downcast_ref::<io::Error>() {
        return match io_err.get_ref() {
            Some(inner) => chain_any(inner as &(dyn StdError + 'static), pred),
            None => false,
        };
    }
    match err.source() {
        Some(source) => chain_any(source, pred),
        None => false,
    }
}

/// True if any client error in the chain satisfies the predicate.
fn contains_client_error(err: &Error, mut pred: impl FnMut(&Error) -> bool) -> bool {
    chain_any(err, &mut |e| {
        e.downcast_ref::<Error>().is_some_and(|e| pred(e))
    })
}

/// True if the chain contains an I/O error that came out of the operating
/// system (it carries an OS error code).
///
/// Synthetic I/O errors the client fabricates itself, a wrapped caller
/// deadline for instance, carry no OS code and do not count.
fn contains_os_error(err: &Error) -> bool {
    chain_any(err, &mut |e| {
        e.downcast_ref::<io::Error>()
            .is_some_and(|io_err| io_err.raw_os_error().is_some())
    })
}

/// True if the chain says the peer closed the connection or the stream hit
/// end-of-file.
fn is_connection_closed(err: &Error) -> bool {
    if contains_client_error(err, |e| matches!(e, Error::ConnectionClosed)) {
        return true;
    }
    chain_any(err, &mut |e| {
        e.downcast_ref::<io::Error>().is_some_and(|io_err| {
            matches!(
                io_err.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            )
        })
    })
}

/// Probes the chain for a transience hint.
///
/// Rust errors expose no `Temporary` capability, so the closest analog is
/// the I/O error kinds that by definition clear on their own. Errors
/// without any such hint report `None` and default to non-temporary.
fn temporary_hint(err: &Error) -> Option<bool> {
    let mut hint = None;
    chain_any(err, &mut |e| {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            hint = Some(matches!(
                io_err.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ));
            return true;
        }
        false
    });
    hint
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A dial failure the way the connector produces one.
    fn dial_refused() -> Error {
        Error::Network {
            op: NetOp::Dial,
            source: io::Error::from_raw_os_error(111), // ECONNREFUSED
        }
    }

    /// A read failure straight from the operating system.
    fn read_reset() -> Error {
        Error::Network {
            op: NetOp::Read,
            source: io::Error::from_raw_os_error(104), // ECONNRESET
        }
    }

    /// A caller deadline buried inside a network operation, as when the
    /// deadline fires mid-dial.
    fn dial_wrapping_deadline() -> Error {
        Error::Network {
            op: NetOp::Dial,
            source: io::Error::new(
                io::ErrorKind::TimedOut,
                Error::RequestTimeout { waited_ms: 100 },
            ),
        }
    }

    #[test]
    fn test_none_is_not_retriable() {
        assert!(!retriable_on_same_broker(None));
        assert!(!skippable_to_next_broker(None));
    }

    #[test]
    fn test_syscall_errors_are_retriable() {
        assert!(retriable_on_same_broker(Some(&read_reset())));
    }

    #[test]
    fn test_dial_errors_skip_instead_of_retry() {
        let err = dial_refused();
        assert!(is_dial_error(&err));
        assert!(!retriable_on_same_broker(Some(&err)));
        assert!(skippable_to_next_broker(Some(&err)));
    }

    #[test]
    fn test_connection_closed_is_retriable() {
        assert!(retriable_on_same_broker(Some(&Error::ConnectionClosed)));

        let eof = Error::Network {
            op: NetOp::Read,
            source: io::Error::new(io::ErrorKind::UnexpectedEof, "early eof"),
        };
        assert!(retriable_on_same_broker(Some(&eof)));
    }

    #[test]
    fn test_internal_sentinels_are_retriable() {
        for err in [
            Error::ProducerIdLoadFail,
            Error::ChosenBrokerDead,
            Error::SaslReauthLoop,
            Error::CorrelationMismatch { observed: 42 },
        ] {
            assert!(
                retriable_on_same_broker(Some(&err)),
                "{err} should be retriable"
            );
        }
    }

    #[test]
    fn test_plain_failures_are_not_retriable() {
        for err in [
            Error::ClientClosed,
            Error::BrokerTooOld { key: 0, version: 9 },
            Error::UnknownRequestKey { key: 99 },
            Error::RequestTimeout { waited_ms: 100 },
            Error::Cancelled,
        ] {
            assert!(
                !retriable_on_same_broker(Some(&err)),
                "{err} should not be retriable"
            );
        }
    }

    #[test]
    fn test_unknown_broker_is_skippable() {
        assert!(skippable_to_next_broker(Some(&Error::UnknownBroker)));
    }

    #[test]
    fn test_network_errors_are_skippable() {
        assert!(skippable_to_next_broker(Some(&read_reset())));
    }

    #[test]
    fn test_caller_intent_is_never_skippable() {
        // A deadline wrapped inside a network error still reads as caller
        // intent, not as a broker problem.
        let err = dial_wrapping_deadline();
        assert!(is_dial_error(&err));
        assert!(!skippable_to_next_broker(Some(&err)));

        assert!(!skippable_to_next_broker(Some(&Error::Cancelled)));
        assert!(!skippable_to_next_broker(Some(&Error::RequestTimeout {
            waited_ms: 5
        })));
    }

    #[test]
    fn test_wrapped_deadline_is_not_retriable() {
        // No OS error code, no closed-connection hint, no sentinel: the
        // synthetic timeout wrapper changes nothing.
        assert!(!retriable_on_same_broker(Some(&dial_wrapping_deadline())));
    }

    #[test]
    fn test_temporary_hint_is_probed_last() {
        let interrupted = Error::Network {
            op: NetOp::Read,
            source: io::Error::new(io::ErrorKind::Interrupted, "interrupted"),
        };
        assert!(retriable_on_same_broker(Some(&interrupted)));

        let would_block_os = Error::Network {
            op: NetOp::Read,
            source: io::Error::from_raw_os_error(11), // EAGAIN
        };
        // The OS-error rule fires first and agrees.
        assert!(retriable_on_same_broker(Some(&would_block_os)));
    }

    #[test]
    fn test_broker_too_old_is_not_skippable_by_predicate() {
        // The selector layer may still try a newer broker on its own
        // policy; the predicate itself only skips on network evidence.
        assert!(!skippable_to_next_broker(Some(&Error::BrokerTooOld {
            key: 3,
            version: 12
        })));
    }
}
