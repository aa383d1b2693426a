use tokio::task::JoinHandle;

use std::time::Duration;

pub(crate) struct OwnedTaskHandle(Option<JoinHandle<()>>);

impl OwnedTaskHandle {
    pub fn new(inner: JoinHandle<()>) -> Self {
        Self(Some(inner))
    }

    /// Wait up to `grace` for the task to finish on its own, then abort.
    pub async fn stop_with_grace(mut self, grace: Duration) {
        if let Some(mut handle) = self.0.take() {
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                handle.abort();
                let _ = handle.await;
            }
        }
    }
}

impl Drop for OwnedTaskHandle {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
        }
    }
}
