//! Pipeline configuration.
//!
//! Every operational constant observed in production (the 5-minute archival
//! poll, the 5-minute stuck-reset threshold) is configuration with a default,
//! not a hard invariant.

use chrono::Duration;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
  /// Length of a reconciliation window; also the fixed reconciliation lag.
  pub reconcile_interval_secs:       u64,
  /// How long a count-reset flag may be held before it is reported as an
  /// operational fault.
  pub reset_stuck_threshold_secs:    u64,
  /// Delay between archival completion checks.
  pub archive_poll_interval_secs:    u64,
  /// Delay between a petition's terminal transition and the start of its
  /// migration.
  pub archive_delay_secs:            u64,
  /// Signatures copied per archival batch task.
  pub signature_batch_size:          usize,
  /// Interval between anonymization sweeps.
  pub anonymize_sweep_interval_secs: u64,
  /// Retention period after the terminal transition, in days.
  pub retention_period_days:         i64,
  /// Optional per-pass redaction bound; unbounded when `None`.
  pub anonymize_batch_limit:         Option<u32>,
  /// Worker loops polling the task queue.
  pub workers:                       usize,
  /// Idle sleep between queue polls.
  pub queue_poll_interval_secs:      u64,
}

impl Default for PipelineConfig {
  fn default() -> Self {
    Self {
      reconcile_interval_secs:       30,
      reset_stuck_threshold_secs:    300,
      archive_poll_interval_secs:    300,
      archive_delay_secs:            86_400,
      signature_batch_size:          1000,
      anonymize_sweep_interval_secs: 3600,
      retention_period_days:         183,
      anonymize_batch_limit:         None,
      workers:                       4,
      queue_poll_interval_secs:      1,
    }
  }
}

impl PipelineConfig {
  pub fn reconcile_interval(&self) -> Duration {
    Duration::seconds(self.reconcile_interval_secs as i64)
  }

  pub fn reset_stuck_threshold(&self) -> Duration {
    Duration::seconds(self.reset_stuck_threshold_secs as i64)
  }

  pub fn archive_poll_interval(&self) -> Duration {
    Duration::seconds(self.archive_poll_interval_secs as i64)
  }

  pub fn archive_delay(&self) -> Duration {
    Duration::seconds(self.archive_delay_secs as i64)
  }

  pub fn anonymize_sweep_interval(&self) -> Duration {
    Duration::seconds(self.anonymize_sweep_interval_secs as i64)
  }

  pub fn retention_period(&self) -> Duration {
    Duration::days(self.retention_period_days)
  }

  pub fn queue_poll_interval(&self) -> Duration {
    Duration::seconds(self.queue_poll_interval_secs as i64)
  }
}
