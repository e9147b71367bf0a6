use std::{
    any::Any,
    collections::HashMap,
    fmt::{self, Debug},
    future::Future,
    hash::Hash,
    panic::{resume_unwind, AssertUnwindSafe},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use futures::FutureExt;
use tokio::sync::watch::{channel as watch_channel, Receiver, Sender};

use crate::{
    derive::{make_key, Args, Callable},
    CoalescerConfig, Error, Key,
};

/// Final state of one execution, shared with every attached caller.
#[derive(Clone)]
enum Settled<T, E> {
    Done(Result<T, E>),
    Panicked(Arc<str>),
}

type Handle<T, E> = Receiver<Option<Settled<T, E>>>;
type Table<K, T, E> = Arc<Mutex<HashMap<K, Handle<T, E>>>>;

fn lock<K, T, E>(table: &Table<K, T, E>) -> MutexGuard<'_, HashMap<K, Handle<T, E>>> {
    // Entries are inserted and removed whole, a panic cannot leave one half-written.
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes the in-flight entry once the execution is over, however it ended.
struct Registration<K, T, E>
where
    K: Hash + Eq + Debug,
{
    key: K,
    handle: Handle<T, E>,
    inflight: Table<K, T, E>,
}

impl<K, T, E> Drop for Registration<K, T, E>
where
    K: Hash + Eq + Debug,
{
    fn drop(&mut self) {
        let mut inflight = lock(&self.inflight);

        if inflight
            .get(&self.key)
            .is_some_and(|current| current.same_channel(&self.handle))
        {
            inflight.remove(&self.key);
            tracing::trace!(key = ?self.key, "removed in-flight entry");
        }
    }
}

/// Deduplicates concurrent executions of the same unit of work.
///
/// The first caller for a key starts the operation, every caller arriving
/// before it settles receives the same outcome. Once the outcome is known the
/// key is released and the next call starts a fresh execution. Nothing is
/// cached.
///
/// Operations run on their own task, so a caller that stops waiting does not
/// cancel the work for the others. A panic inside an operation is re-raised in
/// every caller that was waiting on it.
///
/// Cloning yields another handle onto the same set of in-flight operations.
pub struct Coalescer<T, E, K = Key>
where
    K: Hash + Eq,
{
    config: Arc<CoalescerConfig>,
    inflight: Table<K, T, E>,
}

impl<T, E, K> Coalescer<T, E, K>
where
    K: Hash + Eq + Clone + Debug + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: CoalescerConfig) -> Self {
        Self {
            config: Arc::new(config),
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run `operation` under `key`, or wait for the execution already in flight.
    ///
    /// `operation` is only invoked when no execution for `key` is in flight,
    /// otherwise it is dropped untouched. Errors are passed through as-is.
    ///
    /// # Panics
    ///
    /// Panics when starting an operation outside a Tokio runtime and no
    /// [`CoalescerConfig::runtime`] is set. Re-raises the panic of an
    /// operation in every caller waiting on it, and panics if the operation's
    /// task is torn down (runtime shutdown) before it settles.
    pub async fn execute<F, Fut>(&self, key: K, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let (handle, sender) = {
            let mut inflight = lock(&self.inflight);

            if let Some(handle) = inflight.get(&key) {
                (handle.clone(), None)
            } else {
                let (sender, handle) = watch_channel(None);
                inflight.insert(key.clone(), handle.clone());
                (handle, Some(sender))
            }
        };

        match sender {
            Some(sender) => {
                tracing::debug!(
                    coalescer = self.config.label.as_deref(),
                    key = ?key,
                    "starting operation"
                );

                let registration = Registration {
                    key: key.clone(),
                    handle: handle.clone(),
                    inflight: self.inflight.clone(),
                };

                self.spawn(settle(registration, sender, operation));
            }
            None => {
                tracing::debug!(
                    coalescer = self.config.label.as_deref(),
                    key = ?key,
                    "attaching to in-flight operation"
                );
            }
        }

        wait_for(&key, handle).await
    }

    /// Call `func` with `args`, keyed by the function name and encoded arguments.
    ///
    /// See [`make_key`] for how keys are derived and where they may collide.
    /// If the arguments cannot be encoded, `func` is not called.
    pub async fn execute_auto<F, A>(&self, func: F, args: A) -> Result<T, E>
    where
        F: Callable<A> + Send + 'static,
        F::Future: Future<Output = Result<T, E>> + Send + 'static,
        A: Args + Send + 'static,
        K: From<String>,
        E: From<Error>,
    {
        let key = make_key(&func, &args)?;

        self.execute(K::from(key), move || Callable::call(func, args))
            .await
    }

    /// Number of keys with an execution in flight.
    pub fn in_flight(&self) -> usize {
        lock(&self.inflight).len()
    }

    pub fn is_in_flight(&self, key: &K) -> bool {
        lock(&self.inflight).contains_key(key)
    }

    fn spawn<Fut>(&self, task: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        match &self.config.runtime {
            Some(runtime) => drop(runtime.spawn(task)),
            None => drop(tokio::spawn(task)),
        }
    }
}

async fn settle<K, T, E, F, Fut>(
    registration: Registration<K, T, E>,
    sender: Sender<Option<Settled<T, E>>>,
    operation: F,
) where
    K: Hash + Eq + Debug,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let settled = match AssertUnwindSafe(async move { operation().await })
        .catch_unwind()
        .await
    {
        Ok(result) => Settled::Done(result),
        Err(payload) => {
            let message = panic_message(&*payload);
            tracing::warn!(key = ?registration.key, %message, "operation panicked");
            Settled::Panicked(message.into())
        }
    };

    // Release the key before anyone observes the outcome.
    drop(registration);
    sender.send_replace(Some(settled));
}

async fn wait_for<K, T, E>(key: &K, mut handle: Handle<T, E>) -> Result<T, E>
where
    K: Debug,
    T: Clone,
    E: Clone,
{
    let settled = match handle.wait_for(Option::is_some).await {
        Ok(settled) => (*settled).clone(),
        Err(_) => None,
    };

    match settled {
        Some(Settled::Done(result)) => result,
        Some(Settled::Panicked(message)) => resume_unwind(Box::new(message.to_string())),
        None => panic!("operation for {key:?} was dropped before it settled"),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "operation panicked".to_owned()
    }
}

impl<T, E, K> Clone for Coalescer<T, E, K>
where
    K: Hash + Eq,
{
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            inflight: self.inflight.clone(),
        }
    }
}

impl<T, E, K> Debug for Coalescer<T, E, K>
where
    K: Hash + Eq,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coalescer")
            .field("config", &self.config)
            .field("in_flight", &lock(&self.inflight).len())
            .finish()
    }
}

impl<T, E, K> Default for Coalescer<T, E, K>
where
    K: Hash + Eq + Clone + Debug + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::from_config(CoalescerConfig::default())
    }
}
