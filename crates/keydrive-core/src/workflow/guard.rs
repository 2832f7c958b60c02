//! Release actions bound to a scope.

use crate::error::KeydriveResult;
use log::warn;

/// Runs a release action exactly once when the owning scope ends.
///
/// The normal path calls [`ScopedRelease::finish`] so a failing release is
/// reported to the caller. Early returns and `?` fall through to `Drop`,
/// which still runs the action and logs a failure. A guard created with
/// `enabled == false` does nothing.
pub(crate) struct ScopedRelease<F>
where
    F: FnOnce() -> KeydriveResult<()>,
{
    label: String,
    release: Option<F>,
}

impl<F> ScopedRelease<F>
where
    F: FnOnce() -> KeydriveResult<()>,
{
    pub(crate) fn new(enabled: bool, label: impl Into<String>, release: F) -> Self {
        Self {
            label: label.into(),
            release: enabled.then_some(release),
        }
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.release.is_some()
    }

    pub(crate) fn finish(mut self) -> KeydriveResult<()> {
        match self.release.take() {
            Some(release) => release(),
            None => Ok(()),
        }
    }
}

impl<F> Drop for ScopedRelease<F>
where
    F: FnOnce() -> KeydriveResult<()>,
{
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            if let Err(err) = release() {
                warn!("failed to {}: {err}", self.label);
            }
        }
    }
}
