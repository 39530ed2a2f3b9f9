use std::fmt::Display;

use tracing::debug;

/// Run a best-effort cleanup action, logging and discarding any failure.
///
/// Used for work that may legitimately fail because the resource is already
/// gone: signalling an exited bridge process, removing a scratch file twice.
/// Operations that must succeed propagate their errors instead.
pub fn try_cleanup<E, F>(label: &str, action: F)
where
    E: Display,
    F: FnOnce() -> Result<(), E>,
{
    if let Err(e) = action() {
        debug!("Best-effort cleanup '{}' failed: {}", label, e);
    }
}
