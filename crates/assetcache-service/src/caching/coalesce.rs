use std::collections::BTreeMap;
use std::sync::Arc;

use futures::channel::oneshot;
use futures::future::{BoxFuture, FutureExt, Shared, TryFutureExt};
use parking_lot::Mutex;

use crate::sources::SourceError;
use crate::utils::defer::CallOnDrop;

use super::remote::FetchResult;
use super::CacheError;

type ComputationChannel = Shared<oneshot::Receiver<FetchResult>>;
type ComputationMap = Arc<Mutex<BTreeMap<String, ComputationChannel>>>;

/// Deduplicates concurrent fetches of the same asset.
///
/// At most one computation per key is running at any time. Every caller asking for a key while
/// its computation runs gets a handle to that same computation, and thus the very same result.
/// Entries are removed as soon as the computation settles, successfully or not, so the next call
/// starts over.
#[derive(Debug, Clone, Default)]
pub struct RequestCoalescer {
    current_computations: ComputationMap,
}

impl RequestCoalescer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the running computation for `key`, or spawns the one created by `produce`.
    ///
    /// `produce` is only called if there is no computation for `key` yet.
    ///
    /// NOTE: This function itself is *not* `async`, because it should eagerly spawn the computation
    /// on an executor, even if you don’t explicitly `await` its results.
    pub fn coalesce<F>(&self, key: String, produce: F) -> BoxFuture<'static, FetchResult>
    where
        F: FnOnce() -> BoxFuture<'static, FetchResult>,
    {
        let channel = {
            let mut current_computations = self.current_computations.lock();
            if let Some(channel) = current_computations.get(&key) {
                metric!(counter("caches.channel.hit") += 1);
                tracing::trace!(key = %key, "Joining in-flight computation");
                channel.clone()
            } else {
                metric!(counter("caches.channel.miss") += 1);
                let channel = self.create_channel(key.clone(), produce());
                current_computations.insert(key.clone(), channel.clone());
                channel
            }
        };

        let future = channel.unwrap_or_else(move |_cancelled_error| {
            Err(CacheError::SourceFailure {
                display: key,
                cause: SourceError::msg("computation was cancelled"),
            })
        });

        Box::pin(future)
    }

    fn create_channel(
        &self,
        key: String,
        computation: BoxFuture<'static, FetchResult>,
    ) -> ComputationChannel {
        let (sender, receiver) = oneshot::channel();

        let current_computations = self.current_computations.clone();
        let remove_computation_token = CallOnDrop::new(move || {
            current_computations.lock().remove(&key);
        });

        let channel = async move {
            let result = computation.await;
            // Drop the token first to evict from the map.  This ensures that callers either
            // get a channel that will receive data, or they create a new channel.
            drop(remove_computation_token);
            sender.send(result).ok();
        };

        tokio::spawn(channel);

        receiver.shared()
    }

    /// The number of computations currently in flight.
    pub fn in_flight(&self) -> usize {
        self.current_computations.lock().len()
    }
}
