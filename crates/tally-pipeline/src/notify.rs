//! The notification sink.
//!
//! A `Notify` task carries only a [`NotificationKind`]; the template name
//! and recipient strategy are looked up here at delivery time, so adding an
//! event means adding a lookup row rather than a task type. Actual delivery
//! is behind the [`Notifier`] trait; the pipeline ships a logging sink and
//! deployments plug in a real one.

use std::future::Future;

use tally_core::task::NotificationKind;
use tracing::info;

/// Who a notification goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
  /// Every validated signer of the petition.
  Signers,
  /// The petition's creator only.
  Creator,
}

/// A resolved notification, ready for a delivery backend.
#[derive(Debug, Clone)]
pub struct Notification {
  pub kind:      NotificationKind,
  pub template:  &'static str,
  pub recipient: Recipient,
}

/// Resolve a kind to its template and recipient strategy.
pub fn resolve(kind: NotificationKind) -> Notification {
  let (template, recipient) = match &kind {
    NotificationKind::SignaturesInvalidated { .. } => {
      ("signatures_invalidated", Recipient::Creator)
    }
    NotificationKind::PetitionClosed { .. } => {
      ("petition_closed", Recipient::Signers)
    }
    NotificationKind::GovernmentResponseReceived { .. } => {
      ("government_response", Recipient::Signers)
    }
    NotificationKind::DebateOutcomeRecorded { .. } => {
      ("debate_outcome", Recipient::Signers)
    }
  };
  Notification {
    kind,
    template,
    recipient,
  }
}

/// What a delivery attempt came back with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
  Delivered,
  /// Transient failure; the caller may re-enqueue the task.
  RetryLater,
  /// Permanent failure; drop the notification.
  Failed,
}

/// A delivery backend.
pub trait Notifier: Send + Sync {
  fn deliver(
    &self,
    notification: Notification,
  ) -> impl Future<Output = Delivery> + Send + '_;
}

/// A sink that only logs. The default for tests and local runs.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
  async fn deliver(&self, notification: Notification) -> Delivery {
    info!(
      template = notification.template,
      recipient = ?notification.recipient,
      kind = ?notification.kind,
      "notification delivered to log sink"
    );
    Delivery::Delivered
  }
}
