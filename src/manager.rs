//! The process-wide cache manager.
//!
//! One [`CacheManager`] per process owns the Redis connection, the pub/sub
//! subscriber, the two internal work queues, the reconciliation ticker, and a
//! registry of named [`Cache`](crate::Cache) instances. Everything is lazy:
//! constructing the manager only connects to Redis; the background machinery
//! starts when the first cache calls `start()`.
//!
//! Two queues decouple the moving parts:
//! - the **message queue** feeds decoded pub/sub records to the cache they
//!   target, and is paused for the span of each reconciliation pass so a
//!   bucket is never torn between a replay and a pull;
//! - the **notification queue** runs user `on_change` callbacks, so a slow or
//!   panicking callback never blocks replication.
//!
//! Both are bounded and drop on overflow — the reconciler repairs whatever a
//! dropped message would have delivered.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache::Cache;
use crate::config::ManagerConfig;
use crate::entry::CacheValue;
use crate::errors::CacheError;
use crate::lock::RedisMutex;
use crate::message::{ChangeMessage, CHANNEL};
use crate::metrics;
use crate::options::CacheOptions;
use crate::queue::TaskQueue;
use crate::retry::{retry, RetryConfig};

/// Lock-key group for everything this crate locks.
const LOCK_GROUP: &str = "DistdCache";

/// How long queued work may keep draining during shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// A queued `on_change` invocation with its arguments already bound.
pub(crate) type Notification = Box<dyn FnOnce() + Send>;

/// Type-erased view of a [`Cache<T>`] used for registry dispatch: the
/// subscriber and the ticker route to caches without knowing value types.
#[async_trait]
pub(crate) trait ReplicaCache: Send + Sync + 'static {
    fn cache_name(&self) -> &str;
    fn is_started(&self) -> bool;
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
    /// Apply a remote mutation received over pub/sub.
    async fn apply_message(&self, msg: ChangeMessage);
    /// One reconciliation pass: compare ETags, pull divergent buckets.
    async fn check_sync(&self) -> Result<(), CacheError>;
}

pub(crate) struct ManagerShared {
    pub(crate) client_id: String,
    pub(crate) config: ManagerConfig,
    pub(crate) conn: ConnectionManager,
    pub(crate) lock: RedisMutex,
    client: redis::Client,
    caches: RwLock<HashMap<String, Arc<dyn ReplicaCache>>>,
    msg_queue: OnceLock<TaskQueue<ChangeMessage>>,
    notify_queue: OnceLock<TaskQueue<Notification>>,
    start_guard: tokio::sync::Mutex<bool>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

/// Owner of the replication machinery and the registry of named caches.
///
/// # Example
///
/// ```rust,no_run
/// use distd_cache::{CacheManager, CacheOptions, ManagerConfig};
///
/// # async fn example() -> Result<(), distd_cache::CacheError> {
/// let manager = CacheManager::connect(
///     Some("node-a"),
///     "redis://localhost:6379",
///     ManagerConfig::default(),
/// )
/// .await?;
///
/// let users = manager
///     .new_cache::<serde_json::Value>("users", CacheOptions::new())
///     .await?;
/// users.start().await?;
/// # Ok(())
/// # }
/// ```
pub struct CacheManager {
    shared: Arc<ManagerShared>,
}

impl CacheManager {
    /// Connect to Redis and build the manager.
    ///
    /// `client_id` must differ between processes sharing a Redis instance;
    /// two nodes with the same id ignore each other's broadcasts and end up
    /// with incomplete data. Pass `None` to generate one.
    pub async fn connect(
        client_id: Option<&str>,
        redis_url: &str,
        config: ManagerConfig,
    ) -> Result<Self, CacheError> {
        let client = redis::Client::open(redis_url)?;
        let conn = retry("redis_connect", &RetryConfig::startup(), || {
            let client = client.clone();
            async move { ConnectionManager::new(client).await }
        })
        .await?;

        let client_id = match client_id.map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => Uuid::new_v4().simple().to_string(),
        };

        let lock = RedisMutex::new(conn.clone(), LOCK_GROUP);

        Ok(Self {
            shared: Arc::new(ManagerShared {
                client_id,
                config: config.normalized(),
                conn,
                lock,
                client,
                caches: RwLock::new(HashMap::new()),
                msg_queue: OnceLock::new(),
                notify_queue: OnceLock::new(),
                start_guard: tokio::sync::Mutex::new(false),
                background: Mutex::new(Vec::new()),
            }),
        })
    }

    /// The stable unique identifier of this process.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.shared.client_id
    }

    /// Get or create the cache named `name`.
    ///
    /// Idempotent: a second call with the same name returns the existing
    /// instance and ignores `options`. Fails if the existing instance was
    /// created with a different value type.
    pub async fn new_cache<T: CacheValue>(
        &self,
        name: &str,
        options: CacheOptions<T>,
    ) -> Result<Arc<Cache<T>>, CacheError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(CacheError::EmptyName);
        }

        let mut caches = self.shared.caches.write().await;
        if let Some(existing) = caches.get(name) {
            return Arc::clone(existing)
                .as_any()
                .downcast::<Cache<T>>()
                .map_err(|_| CacheError::TypeMismatch(name.to_string()));
        }

        let cache = Arc::new(Cache::new(name, options, Arc::clone(&self.shared)));
        caches.insert(name.to_string(), Arc::clone(&cache) as Arc<dyn ReplicaCache>);
        info!(cache = name, client_id = %self.shared.client_id, "cache registered");
        Ok(cache)
    }

    /// Names of every cache this manager owns, sorted. Diagnostics only.
    pub async fn all_caches(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shared.caches.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Stop the subscriber and ticker, then drain both queues, waiting at
    /// most 5 seconds each before aborting. Local data stays readable.
    pub async fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = self.shared.background.lock().drain(..).collect();
        for handle in handles {
            handle.abort();
        }
        if let Some(queue) = self.shared.msg_queue.get() {
            queue.shutdown(DRAIN_TIMEOUT).await;
        }
        if let Some(queue) = self.shared.notify_queue.get() {
            queue.shutdown(DRAIN_TIMEOUT).await;
        }
        info!(client_id = %self.shared.client_id, "cache manager shut down");
    }
}

impl ManagerShared {
    /// Bring up the subscriber, the work queues, and the reconciliation
    /// ticker. Idempotent; called by `Cache::start`.
    pub(crate) async fn ensure_start(self: Arc<Self>) -> Result<(), CacheError> {
        let mut started = self.start_guard.lock().await;
        if *started {
            return Ok(());
        }

        // Redis must be reachable before any cache claims to be started.
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;

        let capacity = self.config.queue_capacity;

        let dispatcher = Arc::clone(&self);
        let msg_queue = TaskQueue::spawn("distd-cache-messages", capacity, move |msg: ChangeMessage| {
            let shared = Arc::clone(&dispatcher);
            async move {
                // A poisoned message must not kill the worker.
                let task = tokio::spawn(async move { shared.dispatch_message(msg).await });
                if let Err(err) = task.await {
                    if err.is_panic() {
                        error!("message dispatch panicked; continuing");
                    }
                }
            }
        });
        let _ = self.msg_queue.set(msg_queue);

        let notify_queue = TaskQueue::spawn("distd-cache-notify", capacity, |job: Notification| async move {
            if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)) {
                // The panic hook has already printed location and backtrace.
                error!(reason = panic_message(&panic), "on_change callback panicked; continuing");
            }
        });
        let _ = self.notify_queue.set(notify_queue);

        let subscriber = tokio::spawn(run_subscriber(self.client.clone(), Arc::clone(&self)));
        let ticker = tokio::spawn(run_ticker(Arc::clone(&self)));
        self.background.lock().extend([subscriber, ticker]);

        *started = true;
        info!(client_id = %self.client_id, "replication started");
        Ok(())
    }

    /// Hand a change notification to the callback worker. Returns `false`
    /// when the job was dropped (queue full or manager not started).
    pub(crate) fn enqueue_notification(&self, job: Notification) -> bool {
        match self.notify_queue.get() {
            Some(queue) => queue.try_push(job),
            None => false,
        }
    }

    /// Filter and enqueue one raw pub/sub payload.
    async fn consume_payload(&self, payload: &str) {
        let msg: ChangeMessage = match serde_json::from_str(payload) {
            Ok(msg) => msg,
            Err(err) => {
                metrics::record_malformed_message();
                warn!(error = %err, payload, "dropping undecodable replication message");
                return;
            }
        };

        if msg.client_id == self.client_id {
            // Our own broadcast coming back around.
            return;
        }

        if !msg.is_well_formed() {
            metrics::record_malformed_message();
            warn!(?msg, "dropping malformed replication message");
            return;
        }

        if !self.caches.read().await.contains_key(&msg.cache) {
            // Some other subsystem's cache shares the channel.
            return;
        }

        if let Some(queue) = self.msg_queue.get() {
            if !queue.try_push(msg) {
                metrics::record_queue_drop("messages");
                warn!(
                    capacity = queue.capacity(),
                    "message queue full, dropping; reconciler will repair"
                );
            }
        }
    }

    /// Route a queued message to its cache.
    async fn dispatch_message(&self, msg: ChangeMessage) {
        let cache = self.caches.read().await.get(&msg.cache).cloned();
        if let Some(cache) = cache {
            if cache.is_started() {
                cache.apply_message(msg).await;
            }
        }
    }

    /// One ticker firing: suspend message delivery, reconcile every cache.
    async fn run_sync_pass(&self) {
        let Some(msg_queue) = self.msg_queue.get() else {
            return;
        };
        let _paused = msg_queue.pause().await;

        let caches = self.caches.read().await;
        for cache in caches.values() {
            if !cache.is_started() {
                continue;
            }
            metrics::record_sync_check(cache.cache_name());
            if let Err(err) = cache.check_sync().await {
                warn!(
                    cache = cache.cache_name(),
                    error = %err,
                    "sync check failed; retrying next tick"
                );
            }
        }
    }
}

/// Receive loop: a dedicated pub/sub connection, reconnected forever with
/// exponential backoff on transport failure.
async fn run_subscriber(client: redis::Client, shared: Arc<ManagerShared>) {
    let config = RetryConfig::daemon();
    let mut delay = config.initial_delay;

    loop {
        match pump_messages(&client, &shared).await {
            Ok(()) => {
                warn!(client_id = %shared.client_id, "pub/sub stream ended, reconnecting");
                delay = config.initial_delay;
            }
            Err(err) => {
                warn!(
                    client_id = %shared.client_id,
                    error = %err,
                    retry_in = ?delay,
                    "pub/sub connection failed"
                );
            }
        }
        sleep(delay).await;
        delay = config.next_delay(delay);
    }
}

async fn pump_messages(
    client: &redis::Client,
    shared: &Arc<ManagerShared>,
) -> Result<(), redis::RedisError> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(CHANNEL).await?;
    debug!(channel = CHANNEL, "subscribed");

    let mut stream = pubsub.on_message();
    while let Some(msg) = stream.next().await {
        let payload: String = match msg.get_payload() {
            Ok(payload) => payload,
            Err(err) => {
                metrics::record_malformed_message();
                warn!(error = %err, "dropping non-text pub/sub payload");
                continue;
            }
        };
        shared.consume_payload(&payload).await;
    }
    Ok(())
}

/// Reconciliation ticker. Each firing runs in its own task so a panic in one
/// pass cannot stop the loop.
async fn run_ticker(shared: Arc<ManagerShared>) {
    let period = shared.config.sync_check_interval();
    let mut ticks = tokio::time::interval_at(Instant::now() + period, period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticks.tick().await;
        let pass = Arc::clone(&shared);
        let task = tokio::spawn(async move { pass.run_sync_pass().await });
        if let Err(err) = task.await {
            if err.is_panic() {
                error!("reconciliation pass panicked; continuing");
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "<non-string panic payload>"
    }
}
