use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use futures::stream;
use tokio::sync::Mutex;
use tokio::time::sleep;

use super::{
    ImageRef, LogOptions, LogStream, ProviderError, ProviderFuture, SandboxHandle, SandboxId,
    SandboxProvider,
};

/// Every call the mock provider has served, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderCall {
    Create(String),
    Stop(SandboxId),
    Remove(SandboxId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MockSandboxState {
    Running,
    Stopped,
}

#[derive(Debug, Default)]
struct MockState {
    next_id: u64,
    sandboxes: HashMap<SandboxId, MockSandboxState>,
    calls: Vec<ProviderCall>,
    fail_next_create: Option<String>,
    failing_stops: usize,
    failing_removes: usize,
    logs: HashMap<SandboxId, Vec<Bytes>>,
}

/// In-memory sandbox provider. Backs `--provider mock` and the test suite.
#[derive(Debug, Default)]
pub struct MockProvider {
    state: Mutex<MockState>,
    create_delay: Option<Duration>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every `create` call, so tests can observe a session mid-provisioning.
    pub fn with_create_delay(delay: Duration) -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            create_delay: Some(delay),
        }
    }

    pub async fn fail_next_create(&self, message: impl Into<String>) {
        self.state.lock().await.fail_next_create = Some(message.into());
    }

    /// Make the next `count` stop calls fail with a runtime error.
    pub async fn fail_stops(&self, count: usize) {
        self.state.lock().await.failing_stops = count;
    }

    /// Make the next `count` remove calls fail with a runtime error.
    pub async fn fail_removes(&self, count: usize) {
        self.state.lock().await.failing_removes = count;
    }

    pub async fn push_log(&self, id: &SandboxId, chunk: impl Into<Bytes>) {
        self.state
            .lock()
            .await
            .logs
            .entry(id.clone())
            .or_default()
            .push(chunk.into());
    }

    pub async fn calls(&self) -> Vec<ProviderCall> {
        self.state.lock().await.calls.clone()
    }

    pub async fn stop_calls(&self, id: &SandboxId) -> usize {
        self.count_calls(|call| matches!(call, ProviderCall::Stop(stopped) if stopped == id))
            .await
    }

    pub async fn remove_calls(&self, id: &SandboxId) -> usize {
        self.count_calls(|call| matches!(call, ProviderCall::Remove(removed) if removed == id))
            .await
    }

    pub async fn create_calls(&self) -> usize {
        self.count_calls(|call| matches!(call, ProviderCall::Create(_)))
            .await
    }

    /// Sandboxes that were created and not yet removed.
    pub async fn live_sandboxes(&self) -> Vec<SandboxId> {
        let mut ids: Vec<SandboxId> = self.state.lock().await.sandboxes.keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn count_calls(&self, predicate: impl Fn(&ProviderCall) -> bool) -> usize {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter(|call| predicate(call))
            .count()
    }
}

impl SandboxProvider for MockProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn create<'a>(&'a self, image: &'a ImageRef) -> ProviderFuture<'a, SandboxHandle> {
        Box::pin(async move {
            if let Some(delay) = self.create_delay {
                sleep(delay).await;
            }
            let mut state = self.state.lock().await;
            state.calls.push(ProviderCall::Create(image.to_string()));
            if let Some(message) = state.fail_next_create.take() {
                return Err(ProviderError::Provision {
                    image: image.to_string(),
                    message,
                });
            }
            state.next_id += 1;
            let id = SandboxId::new(format!("mock-{}", state.next_id));
            state.sandboxes.insert(id.clone(), MockSandboxState::Running);
            state.logs.insert(
                id.clone(),
                vec![Bytes::from(format!("mock sandbox {id} started from {image}\n"))],
            );
            Ok(SandboxHandle::new(id, image.clone()))
        })
    }

    fn fetch_logs<'a>(&'a self, id: &'a SandboxId, options: LogOptions) -> ProviderFuture<'a, LogStream> {
        Box::pin(async move {
            let state = self.state.lock().await;
            if !state.sandboxes.contains_key(id) {
                return Err(ProviderError::NotFound { id: id.to_string() });
            }
            let mut chunks = state.logs.get(id).cloned().unwrap_or_default();
            if let Some(tail) = options.tail {
                let lines: Vec<String> = chunks
                    .iter()
                    .flat_map(|chunk| {
                        String::from_utf8_lossy(chunk)
                            .lines()
                            .map(|line| format!("{line}\n"))
                            .collect::<Vec<_>>()
                    })
                    .collect();
                let skip = lines.len().saturating_sub(tail);
                chunks = lines.into_iter().skip(skip).map(Bytes::from).collect();
            }
            let stream: LogStream = Box::pin(stream::iter(chunks.into_iter().map(Ok)));
            Ok(stream)
        })
    }

    fn stop<'a>(&'a self, handle: &'a SandboxHandle) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let id = handle.id().clone();
            state.calls.push(ProviderCall::Stop(id.clone()));
            if state.failing_stops > 0 {
                state.failing_stops -= 1;
                return Err(ProviderError::Runtime {
                    operation: "stop",
                    id: id.to_string(),
                    message: "mock stop failure".to_string(),
                });
            }
            match state.sandboxes.get_mut(&id) {
                None => Err(ProviderError::NotFound { id: id.to_string() }),
                Some(MockSandboxState::Stopped) => {
                    Err(ProviderError::AlreadyStopped { id: id.to_string() })
                }
                Some(sandbox) => {
                    *sandbox = MockSandboxState::Stopped;
                    Ok(())
                }
            }
        })
    }

    fn remove<'a>(&'a self, handle: &'a SandboxHandle) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let id = handle.id().clone();
            state.calls.push(ProviderCall::Remove(id.clone()));
            if state.failing_removes > 0 {
                state.failing_removes -= 1;
                return Err(ProviderError::Runtime {
                    operation: "remove",
                    id: id.to_string(),
                    message: "mock remove failure".to_string(),
                });
            }
            state.logs.remove(&id);
            match state.sandboxes.remove(&id) {
                Some(_) => Ok(()),
                None => Err(ProviderError::NotFound { id: id.to_string() }),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    #[tokio::test]
    async fn stop_and_remove_are_idempotent_on_failure() {
        let provider = MockProvider::new();
        let handle = provider
            .create(&ImageRef::new("alpine:3"))
            .await
            .expect("create");

        provider.stop(&handle).await.expect("first stop");
        let again = provider.stop(&handle).await.expect_err("second stop");
        assert!(again.is_tolerable());

        provider.remove(&handle).await.expect("first remove");
        let again = provider.remove(&handle).await.expect_err("second remove");
        assert!(again.is_tolerable());
        assert!(provider.live_sandboxes().await.is_empty());
    }

    #[tokio::test]
    async fn failed_create_leaves_nothing_behind() {
        let provider = MockProvider::new();
        provider.fail_next_create("image not found").await;
        let err = provider
            .create(&ImageRef::new("missing:latest"))
            .await
            .expect_err("create fails");
        assert!(matches!(err, ProviderError::Provision { .. }));
        assert!(provider.live_sandboxes().await.is_empty());
        assert_eq!(provider.create_calls().await, 1);
    }

    #[tokio::test]
    async fn logs_honor_tail() {
        let provider = MockProvider::new();
        let handle = provider
            .create(&ImageRef::new("alpine:3"))
            .await
            .expect("create");
        provider.push_log(handle.id(), "one\ntwo\n").await;
        provider.push_log(handle.id(), "three\n").await;

        let stream = provider
            .fetch_logs(
                handle.id(),
                LogOptions {
                    follow: false,
                    tail: Some(2),
                },
            )
            .await
            .expect("logs");
        let chunks: Vec<Bytes> = stream.map(|chunk| chunk.expect("chunk")).collect().await;
        let text: String = chunks
            .iter()
            .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
            .collect();
        assert_eq!(text, "two\nthree\n");

        provider.remove(&handle).await.expect("remove");
        let missing = provider
            .fetch_logs(handle.id(), LogOptions::default())
            .await;
        assert!(matches!(missing, Err(ProviderError::NotFound { .. })));
    }
}
