//! Decides whether a presence change deserves a notification.

use crate::relay::snapshot::PresenceSnapshot;

/// What the lifecycle manager should do for every destination of a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum NotifyAction {
    /// Channel is empty: tear down any live notification.
    Clear,
    /// Membership or flags changed: show or refresh the notification.
    Update(PresenceSnapshot),
    /// Nothing changed.
    NoOp,
}

/// Full re-diff of two snapshots. Channels hold tens of members, not thousands.
pub fn decide(previous: Option<&PresenceSnapshot>, current: &PresenceSnapshot) -> NotifyAction {
    if previous.is_some_and(|prev| prev == current) {
        return NotifyAction::NoOp;
    }
    if current.is_empty() {
        return NotifyAction::Clear;
    }
    NotifyAction::Update(current.clone())
}
