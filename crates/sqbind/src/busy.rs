use core::ffi::c_int;
use std::time::{Duration, Instant};

use tracing::{trace, warn};

use crate::error;

/// Backoff curve applied between retries of a busy/locked engine call.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Backoff {
	/// Wait `step * attempt` before the next try.
	Linear { step: Duration },
	/// Double the wait each attempt, starting at `initial`, capped at `max`.
	Exponential { initial: Duration, max: Duration },
}

/// Retry discipline for transient busy/locked conditions. Bounded by wall
/// clock and optionally by attempt count; the default never retries forever.
#[derive(Debug, Clone)]
pub struct BusyPolicy {
	pub timeout: Duration,
	pub max_attempts: Option<u32>,
	pub backoff: Backoff,
}

impl Default for BusyPolicy {
	fn default() -> Self {
		Self {
			timeout: Duration::from_secs(5),
			max_attempts: None,
			backoff: Backoff::Exponential {
				initial: Duration::from_millis(1),
				max: Duration::from_millis(100),
			},
		}
	}
}

impl BusyPolicy {
	/// Fail on the first busy signal instead of retrying.
	#[must_use]
	pub const fn no_retry() -> Self {
		Self {
			timeout: Duration::ZERO,
			max_attempts: Some(1),
			backoff: Backoff::Linear { step: Duration::ZERO },
		}
	}

	#[must_use]
	pub const fn with_timeout(mut self, timeout: Duration) -> Self {
		self.timeout = timeout;
		self
	}

	#[must_use]
	pub const fn with_max_attempts(mut self, attempts: u32) -> Self {
		self.max_attempts = Some(attempts);
		self
	}

	#[must_use]
	pub const fn with_backoff(mut self, backoff: Backoff) -> Self {
		self.backoff = backoff;
		self
	}

	fn delay(&self, attempt: u32) -> Duration {
		match self.backoff {
			Backoff::Linear { step } => step.saturating_mul(attempt),
			Backoff::Exponential { initial, max } => {
				let doublings = attempt.saturating_sub(1).min(16);
				initial.saturating_mul(1 << doublings).min(max)
			}
		}
	}
}

pub(crate) struct RetryOutcome {
	pub rc: c_int,
	pub attempts: u32,
	pub waited: Duration,
}

/// Drive one engine call through the busy policy: re-issue it while the
/// engine reports busy/locked and the budget has room, sleeping between
/// attempts. The final result code is returned either way; callers surface
/// `Error::Busy` when the budget ran out.
pub(crate) fn retry(policy: &BusyPolicy, mut call: impl FnMut() -> c_int) -> RetryOutcome {
	let started = Instant::now();
	let mut attempts: u32 = 0;

	loop {
		let rc = call();
		attempts = attempts.saturating_add(1);

		if !error::is_busy_code(rc) {
			return RetryOutcome { rc, attempts, waited: started.elapsed() };
		}

		let waited = started.elapsed();
		let attempts_exhausted = policy.max_attempts.is_some_and(|cap| attempts >= cap);
		if attempts_exhausted || waited >= policy.timeout {
			warn!(attempts, ?waited, "busy retry budget exhausted");
			return RetryOutcome { rc, attempts, waited };
		}

		let remaining = policy.timeout.saturating_sub(waited);
		let delay = policy.delay(attempts).min(remaining);
		trace!(attempts, ?delay, "engine busy, backing off");
		std::thread::sleep(delay);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn exponential_delay_doubles_and_caps() {
		let policy = BusyPolicy::default().with_backoff(Backoff::Exponential {
			initial: Duration::from_millis(2),
			max: Duration::from_millis(10),
		});
		assert_eq!(policy.delay(1), Duration::from_millis(2));
		assert_eq!(policy.delay(2), Duration::from_millis(4));
		assert_eq!(policy.delay(3), Duration::from_millis(8));
		assert_eq!(policy.delay(4), Duration::from_millis(10));
		assert_eq!(policy.delay(30), Duration::from_millis(10));
	}

	#[test]
	fn linear_delay_grows_with_attempts() {
		let policy =
			BusyPolicy::default().with_backoff(Backoff::Linear { step: Duration::from_millis(3) });
		assert_eq!(policy.delay(1), Duration::from_millis(3));
		assert_eq!(policy.delay(4), Duration::from_millis(12));
	}

	#[test]
	fn retry_stops_on_first_success() {
		let policy = BusyPolicy::default();
		let mut calls = 0;
		let outcome = retry(&policy, || {
			calls += 1;
			crate::SQLITE_OK
		});
		assert_eq!(outcome.rc, crate::SQLITE_OK);
		assert_eq!(outcome.attempts, 1);
		assert_eq!(calls, 1);
	}

	#[test]
	fn retry_respects_attempt_cap() {
		let policy = BusyPolicy::default().with_max_attempts(3);
		let mut calls = 0;
		let outcome = retry(&policy, || {
			calls += 1;
			crate::SQLITE_BUSY
		});
		assert_eq!(outcome.rc, crate::SQLITE_BUSY);
		assert_eq!(outcome.attempts, 3);
		assert_eq!(calls, 3);
	}

	#[test]
	fn retry_respects_wall_clock_budget() {
		let policy = BusyPolicy::default()
			.with_timeout(Duration::from_millis(30))
			.with_backoff(Backoff::Linear { step: Duration::from_millis(5) });
		let started = Instant::now();
		let outcome = retry(&policy, || crate::SQLITE_BUSY);
		assert_eq!(outcome.rc, crate::SQLITE_BUSY);
		assert!(started.elapsed() >= Duration::from_millis(30));
		assert!(outcome.waited >= Duration::from_millis(30));
	}

	#[test]
	fn no_retry_policy_gives_up_immediately() {
		let policy = BusyPolicy::no_retry();
		let mut calls = 0;
		let outcome = retry(&policy, || {
			calls += 1;
			crate::SQLITE_BUSY
		});
		assert_eq!(calls, 1);
		assert_eq!(outcome.attempts, 1);
	}
}
