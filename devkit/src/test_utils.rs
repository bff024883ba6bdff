/*!
Small helpers shared by integration tests
*/

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Installs `env_logger` once; later calls are no-ops.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Thread-safe append-only log of whatever a test double observed.
#[derive(Debug)]
pub struct Recorder<T> {
    items: Arc<Mutex<Vec<T>>>,
}

impl<T> Clone for Recorder<T> {
    fn clone(&self) -> Self {
        Self {
            items: Arc::clone(&self.items),
        }
    }
}

impl<T> Default for Recorder<T> {
    fn default() -> Self {
        Self {
            items: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<T: Clone> Recorder<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, item: T) {
        self.items.lock().unwrap().push(item);
    }

    pub fn items(&self) -> Vec<T> {
        self.items.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Polls `check` every 10 ms until it holds or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            log::warn!("condition not met within {:?}", timeout);
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_items() {
        let recorder = Recorder::new();
        let other = recorder.clone();
        other.push(1);
        recorder.push(2);
        assert_eq!(recorder.items(), vec![1, 2]);
    }

    #[tokio::test]
    async fn wait_until_gives_up() {
        assert!(!wait_until(Duration::from_millis(30), || async { false }).await);
        assert!(wait_until(Duration::from_millis(30), || async { true }).await);
    }
}
