use crate::domain::{LocalStatus, Session, SessionMode};

/// Decides whether a session should have a live event stream at all.
///
/// The backend's `mode` is authoritative and can force streaming on even when
/// local state is stale or absent. Locally-known pause/resume state keeps an
/// already-open stream alive when the last fetched `mode` predates the local
/// action. A completed session with no local activity streams nothing.
pub fn is_live_eligible(session: &Session) -> bool {
    if session.mode == SessionMode::Live {
        return true;
    }
    matches!(
        session.local_status,
        Some(LocalStatus::Running) | Some(LocalStatus::Paused)
    )
}
