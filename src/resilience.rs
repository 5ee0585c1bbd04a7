use crate::entry::ExceptionInfo;
use crate::rng::JITTER;
use crate::time;

use std::time::Duration;

/// Decides how long a load failure is suppressed in favor of the previous
/// value, and when a retry may be attempted.
///
/// Timestamps are epoch-relative nanoseconds as exposed by
/// [`ExceptionInfo::load_time_nanos`]; `0` means "not at all" and `u64::MAX`
/// means "without time bound".
pub trait ResiliencePolicy: Send + Sync + 'static {
  /// Until when the previous value may keep being served instead of
  /// surfacing the failure. Only consulted when a previous value exists.
  fn suppress_until(&self, info: &ExceptionInfo) -> u64;

  /// Until when the cached failure is re-raised without starting a new
  /// load. Once passed, the next access loads again.
  fn retry_at(&self, info: &ExceptionInfo) -> u64;
}

/// Raw resilience configuration as collected by the builder. `None` fields
/// are derived at build time.
#[derive(Debug, Clone, Default)]
pub(crate) struct ResilienceConfig {
  pub(crate) enabled: bool,
  pub(crate) retry_interval: Option<Duration>,
  pub(crate) max_retry_interval: Option<Duration>,
  pub(crate) resilience_duration: Option<Duration>,
  pub(crate) multiplier: Option<f64>,
  pub(crate) randomization: Option<f64>,
  pub(crate) suppress_exceptions: Option<bool>,
}

/// Exponential back-off with randomized retry intervals.
///
/// Derivation of unset knobs: the resilience duration defaults to the
/// expire-after-write duration (0 when eternal); the retry interval defaults
/// to 10% of the resilience duration capped at the maximum; the maximum
/// defaults to the larger of retry interval and resilience duration. With
/// suppression disabled the duration is forced to 0 and failures surface
/// immediately.
#[derive(Debug)]
pub struct UniversalResiliencePolicy {
  retry_interval: u64,
  max_retry_interval: u64,
  resilience_duration: u64,
  multiplier: f64,
  randomization: f64,
}

const RETRY_PERCENT_OF_RESILIENCE_DURATION: u64 = 10;

impl UniversalResiliencePolicy {
  pub(crate) fn from_config(
    cfg: &ResilienceConfig,
    expire_after_write: Option<Duration>,
  ) -> Self {
    let suppress = cfg.suppress_exceptions.unwrap_or(true);
    let mut duration = cfg.resilience_duration.map(time::duration_to_nanos);
    let mut max_retry = cfg.max_retry_interval.map(time::duration_to_nanos);
    let mut retry = cfg.retry_interval.map(time::duration_to_nanos);

    match duration {
      None => {
        duration = Some(
          expire_after_write
            .map(time::duration_to_nanos)
            .unwrap_or(0),
        );
      }
      Some(d) => {
        if max_retry.is_none() {
          max_retry = Some(d);
        }
      }
    }
    let mut duration = duration.unwrap_or(0);
    if max_retry.is_none() && retry.is_none() {
      max_retry = Some(duration);
    }
    let mut max_retry = max_retry.unwrap_or(u64::MAX);
    if retry.is_none() {
      let derived = (duration / 100) * RETRY_PERCENT_OF_RESILIENCE_DURATION;
      retry = Some(derived.min(max_retry));
    }
    let retry = retry.unwrap_or(0);
    if retry > max_retry {
      max_retry = retry;
    }
    if max_retry > duration && duration != 0 {
      duration = max_retry;
    }
    if !suppress {
      duration = 0;
    }

    UniversalResiliencePolicy {
      retry_interval: retry,
      max_retry_interval: max_retry,
      resilience_duration: duration,
      multiplier: cfg.multiplier.unwrap_or(1.5),
      randomization: cfg.randomization.unwrap_or(0.5),
    }
  }

  /// True when the derived knobs make the policy a no-op; failures are then
  /// neither suppressed nor cached for retry back-off.
  pub(crate) fn is_noop(&self) -> bool {
    self.retry_interval == 0 && self.resilience_duration == 0
  }

  pub fn retry_interval(&self) -> Duration {
    Duration::from_nanos(self.retry_interval)
  }

  pub fn max_retry_interval(&self) -> Duration {
    Duration::from_nanos(self.max_retry_interval)
  }

  pub fn resilience_duration(&self) -> Duration {
    Duration::from_nanos(self.resilience_duration)
  }

  fn retry_delta(&self, info: &ExceptionInfo) -> u64 {
    let mut delta =
      self.retry_interval as f64 * self.multiplier.powi(info.retry_count() as i32);
    delta += JITTER.next_f64() * self.randomization * delta;
    let capped = delta.min(self.max_retry_interval as f64);
    if capped >= u64::MAX as f64 {
      u64::MAX
    } else {
      capped as u64
    }
  }
}

impl ResiliencePolicy for UniversalResiliencePolicy {
  fn suppress_until(&self, info: &ExceptionInfo) -> u64 {
    if self.resilience_duration == 0 || self.resilience_duration == u64::MAX {
      return self.resilience_duration;
    }
    let max_suppress_until = info
      .since_nanos()
      .saturating_add(self.resilience_duration);
    let delta = self.retry_delta(info);
    info
      .load_time_nanos()
      .saturating_add(delta)
      .min(max_suppress_until)
  }

  fn retry_at(&self, info: &ExceptionInfo) -> u64 {
    if self.retry_interval == 0 || self.retry_interval == u64::MAX {
      return self.retry_interval;
    }
    info.load_time_nanos().saturating_add(self.retry_delta(info))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::SharedError;
  use std::sync::Arc;

  fn info(load_time: u64, since: u64, retry_count: u32) -> ExceptionInfo {
    let error: SharedError = Arc::new(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
    ExceptionInfo {
      error,
      since,
      load_time,
      retry_count,
    }
  }

  fn cfg() -> ResilienceConfig {
    ResilienceConfig {
      enabled: true,
      ..Default::default()
    }
  }

  const SEC: u64 = 1_000_000_000;

  #[test]
  fn duration_defaults_to_expire_after_write() {
    let p = UniversalResiliencePolicy::from_config(&cfg(), Some(Duration::from_secs(100)));
    assert_eq!(p.resilience_duration, 100 * SEC);
    assert_eq!(p.retry_interval, 10 * SEC);
    assert_eq!(p.max_retry_interval, 100 * SEC);
    assert!(!p.is_noop());
  }

  #[test]
  fn eternal_expiry_disables_policy() {
    let p = UniversalResiliencePolicy::from_config(&cfg(), None);
    assert_eq!(p.resilience_duration, 0);
    assert_eq!(p.retry_interval, 0);
    assert!(p.is_noop());
  }

  #[test]
  fn max_retry_defaults_to_duration() {
    let mut c = cfg();
    c.resilience_duration = Some(Duration::from_secs(60));
    let p = UniversalResiliencePolicy::from_config(&c, None);
    assert_eq!(p.max_retry_interval, 60 * SEC);
    assert_eq!(p.retry_interval, 6 * SEC);
  }

  #[test]
  fn retry_interval_caps_and_raises_max() {
    let mut c = cfg();
    c.resilience_duration = Some(Duration::from_secs(10));
    c.retry_interval = Some(Duration::from_secs(30));
    let p = UniversalResiliencePolicy::from_config(&c, None);
    // An explicit retry interval above the maximum pulls everything up.
    assert_eq!(p.retry_interval, 30 * SEC);
    assert_eq!(p.max_retry_interval, 30 * SEC);
    assert_eq!(p.resilience_duration, 30 * SEC);
  }

  #[test]
  fn suppression_disabled_forces_zero_duration() {
    let mut c = cfg();
    c.resilience_duration = Some(Duration::from_secs(60));
    c.suppress_exceptions = Some(false);
    let p = UniversalResiliencePolicy::from_config(&c, None);
    assert_eq!(p.resilience_duration, 0);
    let i = info(5 * SEC, 5 * SEC, 0);
    assert_eq!(p.suppress_until(&i), 0);
  }

  #[test]
  fn delta_grows_with_retry_count_and_stays_capped() {
    let mut c = cfg();
    c.retry_interval = Some(Duration::from_secs(1));
    c.max_retry_interval = Some(Duration::from_secs(8));
    c.resilience_duration = Some(Duration::from_secs(600));
    c.randomization = Some(0.0);
    let p = UniversalResiliencePolicy::from_config(&c, None);
    let d0 = p.retry_delta(&info(0, 0, 0));
    let d1 = p.retry_delta(&info(0, 0, 1));
    let d20 = p.retry_delta(&info(0, 0, 20));
    assert_eq!(d0, SEC);
    assert_eq!(d1, (1.5 * SEC as f64) as u64);
    assert_eq!(d20, 8 * SEC, "delta is capped at the maximum interval");
  }

  #[test]
  fn randomization_stays_within_bound() {
    let mut c = cfg();
    c.retry_interval = Some(Duration::from_secs(1));
    c.resilience_duration = Some(Duration::from_secs(600));
    let p = UniversalResiliencePolicy::from_config(&c, None);
    for _ in 0..1000 {
      let d = p.retry_delta(&info(0, 0, 0));
      assert!(d >= SEC);
      assert!(d <= (1.5 * SEC as f64) as u64);
    }
  }

  #[test]
  fn suppress_until_bounded_by_streak_start() {
    let mut c = cfg();
    c.retry_interval = Some(Duration::from_secs(10));
    c.resilience_duration = Some(Duration::from_secs(30));
    c.randomization = Some(0.0);
    let p = UniversalResiliencePolicy::from_config(&c, None);
    // Failure streak started at t=0; the load at t=25s may only be
    // suppressed up to t=30s even though the delta would reach past it.
    let i = info(25 * SEC, 0, 3);
    assert_eq!(p.suppress_until(&i), 30 * SEC);
  }
}
