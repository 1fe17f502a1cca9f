use std::collections::HashMap;
use std::future::Future;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

/// Coalesces concurrent calls with the same key into one execution whose
/// result every caller receives.
pub struct SingleFlight<T, E>
where
    T: Clone,
    E: Clone,
{
    calls: Mutex<HashMap<String, Shared<BoxFuture<'static, Result<T, E>>>>>,
}

impl<T, E> Default for SingleFlight<T, E>
where
    T: Clone,
    E: Clone,
{
    fn default() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
        }
    }
}

impl<T, E> SingleFlight<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` unless a call for `key` is already in flight, in which case
    /// wait for that call instead.
    pub async fn run<F, Fut>(&self, key: &str, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let call = {
            let mut calls = self.calls.lock();
            match calls.get(key) {
                Some(call) => call.clone(),
                None => {
                    let call = f().boxed().shared();
                    calls.insert(key.to_string(), call.clone());
                    call
                }
            }
        };

        let result = call.clone().await;

        let mut calls = self.calls.lock();
        if calls.get(key).is_some_and(|current| current.ptr_eq(&call)) {
            calls.remove(key);
        }
        result
    }
}
