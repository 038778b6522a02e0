use std::collections::BTreeSet;
use std::time::Duration;

use crate::error::TransportErrorKind;

const DEFAULT_MAX_ATTEMPTS: usize = 5;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(1500);

/// Outcome of a single retry decision.
#[derive(Clone, Copy, Debug)]
pub struct RetryVerdict {
    pub retry: bool,
    pub delay: Duration,
}

impl RetryVerdict {
    fn no_retry() -> Self {
        Self {
            retry: false,
            delay: Duration::ZERO,
        }
    }
}

/// Pure retry decision function over transport error categories.
///
/// The whitelist holds categories expected under transient conditions and the
/// blacklist holds categories that are never transient. Both registries are
/// additive only. A category present in both lists does not retry: the
/// blacklist is authoritative and is consulted first.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    max_attempts: usize,
    retry_delay: Duration,
    whitelist: BTreeSet<TransportErrorKind>,
    blacklist: BTreeSet<TransportErrorKind>,
}

impl RetryPolicy {
    /// Default policy: up to five retries with a fixed 1500ms delay.
    pub fn standard() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
            whitelist: default_whitelist(),
            blacklist: default_blacklist(),
        }
    }

    /// Policy that never retries.
    pub fn disabled() -> Self {
        Self {
            max_attempts: 0,
            retry_delay: Duration::ZERO,
            whitelist: default_whitelist(),
            blacklist: default_blacklist(),
        }
    }

    pub fn max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Adds a category expected to be transient. Additive only.
    pub fn whitelist(mut self, kind: TransportErrorKind) -> Self {
        self.whitelist.insert(kind);
        self
    }

    /// Adds a category that must never be retried. Additive only.
    pub fn blacklist(mut self, kind: TransportErrorKind) -> Self {
        self.blacklist.insert(kind);
        self
    }

    /// Decides whether a failed attempt should be retried.
    ///
    /// `attempt` is the number of failed attempts so far, starting at 1.
    /// `request_sent` reports whether the request bytes had already been put
    /// on the wire; a fully transmitted request is only retried when its
    /// error category is whitelisted.
    pub fn decide(
        &self,
        kind: TransportErrorKind,
        attempt: usize,
        request_sent: bool,
    ) -> RetryVerdict {
        if attempt > self.max_attempts {
            return RetryVerdict::no_retry();
        }
        if self.blacklist.contains(&kind) {
            return RetryVerdict::no_retry();
        }
        let retry = self.whitelist.contains(&kind) || !request_sent;
        RetryVerdict {
            retry,
            delay: if retry {
                self.retry_delay
            } else {
                Duration::ZERO
            },
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

fn default_whitelist() -> BTreeSet<TransportErrorKind> {
    [
        TransportErrorKind::NoResponse,
        TransportErrorKind::UnknownHost,
        TransportErrorKind::Socket,
    ]
    .into_iter()
    .collect()
}

fn default_blacklist() -> BTreeSet<TransportErrorKind> {
    [TransportErrorKind::Timeout, TransportErrorKind::Tls]
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitelisted_error_retries_until_attempt_ceiling() {
        let policy = RetryPolicy::standard().max_attempts(5);
        for attempt in 1..=5 {
            let verdict = policy.decide(TransportErrorKind::NoResponse, attempt, true);
            assert!(verdict.retry, "attempt {attempt} should retry");
            assert_eq!(verdict.delay, Duration::from_millis(1500));
        }
        assert!(!policy.decide(TransportErrorKind::NoResponse, 6, true).retry);
    }

    #[test]
    fn blacklisted_error_never_retries() {
        let policy = RetryPolicy::standard().max_attempts(100);
        for attempt in 1..10 {
            assert!(!policy.decide(TransportErrorKind::Timeout, attempt, false).retry);
            assert!(!policy.decide(TransportErrorKind::Tls, attempt, true).retry);
        }
    }

    #[test]
    fn unlisted_error_retries_only_if_request_was_not_sent() {
        let policy = RetryPolicy::standard();
        assert!(policy.decide(TransportErrorKind::OtherIo, 1, false).retry);
        assert!(!policy.decide(TransportErrorKind::OtherIo, 1, true).retry);
    }

    #[test]
    fn blacklist_wins_over_whitelist_for_a_category_in_both() {
        let policy = RetryPolicy::standard()
            .whitelist(TransportErrorKind::Timeout)
            .blacklist(TransportErrorKind::Timeout);
        assert!(!policy.decide(TransportErrorKind::Timeout, 1, false).retry);
    }

    #[test]
    fn disabled_policy_rejects_the_first_failure() {
        let policy = RetryPolicy::disabled();
        assert!(!policy.decide(TransportErrorKind::NoResponse, 1, false).retry);
    }
}
