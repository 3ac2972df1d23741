//! Fail-open helper for best-effort operations
//!
//! Use for work whose failure must not disturb job processing or the
//! transport: mirroring login state into storage, periodic login probes,
//! advisory sends.
//!
//! DO NOT use fail-open for:
//! - persisting the job queue (navigation correctness depends on it)
//! - terminal job reports (they go through the result outbox)

use std::future::Future;
use tracing::warn;

use crate::Result;

/// Run `f`, logging a failure via `tracing::warn!` and returning `None`.
///
/// ```no_run
/// use applier_core::fail_open::fail_open;
/// use applier_core::Result;
///
/// async fn mirror_login_state() -> Result<()> {
///     Ok(())
/// }
///
/// async fn example() {
///     let stored = fail_open("mirror_login_state", || mirror_login_state()).await;
///     assert!(stored.is_some());
/// }
/// ```
pub async fn fail_open<F, Fut, T>(operation_name: &str, f: F) -> Option<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match f().await {
        Ok(val) => Some(val),
        Err(e) => {
            warn!("{} failed (fail-open): {}", operation_name, e);
            None
        }
    }
}
