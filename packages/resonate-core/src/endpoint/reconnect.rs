//! URL-keyed reconnect driver for client-initiated endpoints.
//!
//! One background task per URL owns the dial/backoff loop. The retry
//! `Notify` is owned by that task: the loop only ever waits on its own
//! local handle, never a re-lookup through the registry, so a
//! `disconnect(url)` / `connect(url)` pair cannot make an old task clear a
//! new task's event. At termination a task deregisters only if the registry
//! entry still maps to its own handle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;

use crate::protocol_constants::{RECONNECT_BACKOFF_INITIAL, RECONNECT_BACKOFF_MAX};

use super::transport::{self, BoxFrameSink, BoxFrameSource, TransportError};
use super::{CloseReason, Endpoint};

/// Dials a URL into a transport pair. Abstracted for tests.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, url: &str) -> Result<(BoxFrameSink, BoxFrameSource), TransportError>;
}

/// Production dialer over tokio-tungstenite.
pub struct WsDialer;

#[async_trait]
impl Dialer for WsDialer {
    async fn dial(&self, url: &str) -> Result<(BoxFrameSink, BoxFrameSource), TransportError> {
        transport::connect(url).await
    }
}

/// Builds an endpoint session over a freshly dialed transport.
///
/// The implementation must arrange for `done` to fire with the close
/// reason and retry flag when the endpoint terminates (typically from its
/// observer's `on_disconnected`).
pub trait SessionFactory: Send + Sync {
    fn establish(
        &self,
        url: &str,
        sink: BoxFrameSink,
        source: BoxFrameSource,
        done: oneshot::Sender<(CloseReason, bool)>,
    ) -> Arc<Endpoint>;
}

/// Handle to a reconnect entry's retry event. Signaling it short-circuits
/// the current backoff wait.
#[derive(Clone)]
pub struct RetryHandle(Arc<Notify>);

impl RetryHandle {
    /// Wakes the reconnect task if it is waiting out a backoff.
    pub fn signal(&self) {
        self.0.notify_one();
    }

    /// True when both handles refer to the same reconnect entry.
    pub fn same_entry(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Wraps a session observer so the reconnect task learns when the
/// endpoint terminates. Forwards everything; fires `done` exactly once
/// from `on_disconnected`.
pub struct MonitoredObserver {
    inner: Arc<dyn super::EndpointObserver>,
    done: Mutex<Option<oneshot::Sender<(CloseReason, bool)>>>,
}

impl MonitoredObserver {
    pub fn new(
        inner: Arc<dyn super::EndpointObserver>,
        done: oneshot::Sender<(CloseReason, bool)>,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner,
            done: Mutex::new(Some(done)),
        })
    }
}

impl super::EndpointObserver for MonitoredObserver {
    fn accept_hello(
        &self,
        hello: &crate::protocol::messages::ClientHello,
    ) -> crate::error::ResonateResult<crate::protocol::messages::ServerHello> {
        self.inner.accept_hello(hello)
    }

    fn on_established(&self, endpoint: &Arc<Endpoint>) {
        self.inner.on_established(endpoint);
    }

    fn on_message(&self, endpoint: &Arc<Endpoint>, message: crate::protocol::Message) {
        self.inner.on_message(endpoint, message);
    }

    fn on_binary(&self, endpoint: &Arc<Endpoint>, frame: crate::protocol::BinaryFrame) {
        self.inner.on_binary(endpoint, frame);
    }

    fn on_disconnected(&self, endpoint: &Arc<Endpoint>, reason: CloseReason, will_retry: bool) {
        self.inner.on_disconnected(endpoint, reason, will_retry);
        if let Some(done) = self.done.lock().take() {
            let _ = done.send((reason, will_retry));
        }
    }
}

struct Entry {
    retry: Arc<Notify>,
    cancel: CancellationToken,
}

/// Registry of reconnect tasks, one per URL.
pub struct ReconnectDriver {
    entries: Mutex<HashMap<String, Entry>>,
    dialer: Arc<dyn Dialer>,
    factory: Arc<dyn SessionFactory>,
    max_backoff: Duration,
}

impl ReconnectDriver {
    pub fn new(dialer: Arc<dyn Dialer>, factory: Arc<dyn SessionFactory>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            dialer,
            factory,
            max_backoff: RECONNECT_BACKOFF_MAX,
        }
    }

    /// Caps the backoff ceiling (mostly for tests).
    pub fn with_max_backoff(mut self, max: Duration) -> Self {
        self.max_backoff = max;
        self
    }

    /// Ensures a reconnect task exists for `url`.
    ///
    /// Atomic check-and-create: if an entry already exists its retry event
    /// is signalled; otherwise the event and the task are created together
    /// under the registry lock. All callers for the same URL observe the
    /// same retry handle.
    pub fn connect(self: &Arc<Self>, url: &str) -> RetryHandle {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(url) {
            entry.retry.notify_one();
            return RetryHandle(Arc::clone(&entry.retry));
        }

        let retry = Arc::new(Notify::new());
        let cancel = CancellationToken::new();
        entries.insert(
            url.to_string(),
            Entry {
                retry: Arc::clone(&retry),
                cancel: cancel.clone(),
            },
        );
        log::info!("[Reconnect] New reconnect task for {}", url);
        tokio::spawn(reconnect_task(
            Arc::clone(self),
            url.to_string(),
            Arc::clone(&retry),
            cancel,
        ));
        RetryHandle(retry)
    }

    /// Stops and forgets the reconnect task for `url`, if any.
    pub fn disconnect(&self, url: &str) {
        let entry = self.entries.lock().remove(url);
        if let Some(entry) = entry {
            log::info!("[Reconnect] Cancelling reconnect task for {}", url);
            entry.cancel.cancel();
        }
    }

    /// Stops every reconnect task.
    pub fn shutdown(&self) {
        let entries: Vec<Entry> = {
            let mut map = self.entries.lock();
            map.drain().map(|(_, e)| e).collect()
        };
        for entry in entries {
            entry.cancel.cancel();
        }
    }

    /// Number of live registry entries.
    pub fn active_count(&self) -> usize {
        self.entries.lock().len()
    }
}

/// Exponential backoff with jitter, clamped to the driver maximum.
fn jittered(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.5..1.0);
    delay.mul_f64(factor)
}

async fn reconnect_task(
    driver: Arc<ReconnectDriver>,
    url: String,
    my_retry: Arc<Notify>,
    cancel: CancellationToken,
) {
    let mut delay = RECONNECT_BACKOFF_INITIAL;

    loop {
        if cancel.is_cancelled() {
            break;
        }

        match driver.dialer.dial(&url).await {
            Ok((sink, source)) => {
                let (done_tx, done_rx) = oneshot::channel();
                let endpoint = driver.factory.establish(&url, sink, source, done_tx);
                delay = RECONNECT_BACKOFF_INITIAL;

                tokio::select! {
                    _ = cancel.cancelled() => {
                        // Teardown completes on its own task.
                        endpoint.close(CloseReason::Shutdown, false);
                        break;
                    }
                    done = done_rx => {
                        if !matches!(done, Ok((_, true))) {
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                log::warn!("[Reconnect] Dial {} failed: {}", url, e);
            }
        }

        // Backoff wait on this task's own retry handle only.
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(jittered(delay)) => {
                delay = (delay * 2).min(driver.max_backoff);
            }
            _ = my_retry.notified() => {
                log::debug!("[Reconnect] Retry signal for {}, skipping backoff", url);
                delay = RECONNECT_BACKOFF_INITIAL;
            }
        }
    }

    // Compare-and-remove: only clear the registry entry if it is still ours.
    let mut entries = driver.entries.lock();
    if let Some(entry) = entries.get(&url) {
        if Arc::ptr_eq(&entry.retry, &my_retry) {
            entries.remove(&url);
            log::debug!("[Reconnect] Task for {} deregistered", url);
        }
    }
}
