use std::future::Future;

use sentry::{Hub, SentryFutureExt};
use tokio::runtime::Handle;

/// Execute a callback on dropping of the container type.
///
/// The callback must not panic under any circumstance. Since it is called while dropping an item,
/// this might result in aborting program execution.
pub struct CallOnDrop {
    f: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl CallOnDrop {
    /// Creates a new `CallOnDrop`.
    pub fn new<F: FnOnce() + Send + 'static>(f: F) -> CallOnDrop {
        CallOnDrop {
            f: Some(Box::new(f)),
        }
    }
}

impl Drop for CallOnDrop {
    fn drop(&mut self) {
        if let Some(f) = self.f.take() {
            f();
        }
    }
}

/// Spawns `future` onto the current tokio runtime, bound to a fresh sentry hub.
///
/// Returns `false` without running the future when called outside of a runtime.
pub(crate) fn spawn_bound<F>(future: F) -> bool
where
    F: Future<Output = ()> + Send + 'static,
{
    match Handle::try_current() {
        Ok(handle) => {
            handle.spawn(future.bind_hub(Hub::new_from_top(Hub::current())));
            true
        }
        Err(_) => false,
    }
}
