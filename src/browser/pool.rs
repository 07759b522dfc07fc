//! Bounded, self-healing pool of long-lived headless-browser processes.
//!
//! Capacity is a counting semaphore; a single mutex guards the idle queue,
//! the tracking map, and the counters. Browser teardown always happens
//! outside that lock.

use std::cmp;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::RenderError;

use super::driver::{BrowserDriver, BrowserHandle};

const MIN_REAP_CADENCE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Warm instances retained by the idle reaper.
    pub min_size: usize,
    /// Hard cap on concurrent leases.
    pub max_size: usize,
    pub acquire_timeout: Duration,
    /// `None` disables idle reaping.
    pub idle_timeout: Option<Duration>,
    /// Renders before a forced recycle; `0` disables recycling.
    pub max_renders_per_instance: u32,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 4,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Some(Duration::from_secs(300)),
            max_renders_per_instance: 100,
        }
    }
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("timed out waiting for a browser lease")]
    AcquireTimeout,
    #[error("browser pool is shut down")]
    Disposed,
    #[error("lease acquisition cancelled")]
    Cancelled,
    #[error("browser launch failed: {0}")]
    Launch(String),
}

impl From<PoolError> for RenderError {
    fn from(error: PoolError) -> Self {
        match error {
            PoolError::AcquireTimeout => RenderError::PoolTimeout,
            PoolError::Disposed => RenderError::PoolDisposed,
            PoolError::Cancelled => RenderError::Cancelled,
            PoolError::Launch(message) => RenderError::BrowserLaunch(message),
        }
    }
}

struct PooledBrowser {
    id: u64,
    browser: Arc<dyn BrowserHandle>,
    render_count: u32,
    last_returned_at: Instant,
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<PooledBrowser>,
    tracked: HashMap<u64, Arc<dyn BrowserHandle>>,
    active: usize,
    disposed: bool,
}

struct PoolCore {
    driver: Arc<dyn BrowserDriver>,
    settings: PoolSettings,
    permits: Arc<Semaphore>,
    state: Mutex<PoolState>,
    next_id: AtomicU64,
    reaper_cancel: CancellationToken,
}

pub struct BrowserPool {
    core: Arc<PoolCore>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl BrowserPool {
    pub fn new(driver: Arc<dyn BrowserDriver>, settings: PoolSettings) -> Self {
        let core = Arc::new(PoolCore {
            driver,
            permits: Arc::new(Semaphore::new(settings.max_size)),
            state: Mutex::new(PoolState::default()),
            next_id: AtomicU64::new(1),
            reaper_cancel: CancellationToken::new(),
            settings,
        });

        let reaper = core.settings.idle_timeout.map(|idle_timeout| {
            let core = Arc::clone(&core);
            tokio::spawn(async move {
                let cadence = cmp::max(MIN_REAP_CADENCE, idle_timeout / 2);
                loop {
                    tokio::select! {
                        _ = core.reaper_cancel.cancelled() => break,
                        _ = tokio::time::sleep(cadence) => {}
                    }
                    core.reap(idle_timeout).await;
                }
            })
        });

        Self {
            core,
            reaper: Mutex::new(reaper),
        }
    }

    /// Borrow a browser, waiting up to `acquire_timeout` for capacity.
    ///
    /// A caller-side cancel while waiting surfaces as `Cancelled` and
    /// consumes no permit.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<BrowserLease, PoolError> {
        if self.core.state().disposed {
            return Err(PoolError::Disposed);
        }

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PoolError::Cancelled),
            acquired = timeout(
                self.core.settings.acquire_timeout,
                Arc::clone(&self.core.permits).acquire_owned(),
            ) => match acquired {
                Err(_elapsed) => return Err(PoolError::AcquireTimeout),
                Ok(Err(_closed)) => return Err(PoolError::Disposed),
                Ok(Ok(permit)) => permit,
            },
        };

        match self.core.checkout().await {
            Ok(entry) => Ok(BrowserLease {
                core: Arc::clone(&self.core),
                entry: Some(entry),
                permit: Some(permit),
            }),
            Err(error) => {
                // The permit must be given back before surfacing.
                drop(permit);
                Err(error)
            }
        }
    }

    pub fn pool_size(&self) -> usize {
        self.core.state().tracked.len()
    }

    pub fn active_count(&self) -> usize {
        self.core.state().active
    }

    pub fn idle_count(&self) -> usize {
        self.core.state().idle.len()
    }

    pub fn max_size(&self) -> usize {
        self.core.settings.max_size
    }

    /// Stop the reaper, tear down every tracked browser, and refuse all
    /// further leases.
    pub async fn shutdown(&self) {
        self.core.reaper_cancel.cancel();
        let handle = self.reaper.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        let browsers: Vec<Arc<dyn BrowserHandle>> = {
            let mut state = self.core.state();
            state.disposed = true;
            state.idle.clear();
            state.tracked.drain().map(|(_, browser)| browser).collect()
        };
        for browser in browsers {
            browser.close().await;
        }
        self.core.permits.close();
        debug!(target: "platen::browser", "browser pool shut down");
    }

    #[cfg(test)]
    fn free_capacity(&self) -> usize {
        self.core.permits.available_permits()
    }
}

impl PoolCore {
    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take an idle browser or launch a fresh one. Runs with a permit
    /// already held.
    async fn checkout(self: &Arc<Self>) -> Result<PooledBrowser, PoolError> {
        loop {
            let candidate = {
                let mut state = self.state();
                if state.disposed {
                    return Err(PoolError::Disposed);
                }
                state.idle.pop_front()
            };

            match candidate {
                Some(entry) if !entry.browser.is_connected() => {
                    debug!(target: "platen::browser", id = entry.id, "dropping disconnected idle browser");
                    self.state().tracked.remove(&entry.id);
                    entry.browser.close().await;
                }
                Some(entry) => {
                    self.state().active += 1;
                    return Ok(entry);
                }
                None => break,
            }
        }

        let browser = self
            .driver
            .launch()
            .await
            .map_err(|err| PoolError::Launch(err.to_string()))?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let disposed = {
            let mut state = self.state();
            if state.disposed {
                true
            } else {
                state.tracked.insert(id, Arc::clone(&browser));
                state.active += 1;
                false
            }
        };
        if disposed {
            browser.close().await;
            return Err(PoolError::Disposed);
        }

        let weak: Weak<PoolCore> = Arc::downgrade(self);
        browser.set_disconnect_hook(Box::new(move || {
            if let Some(core) = weak.upgrade() {
                let mut state = core.state();
                state.tracked.remove(&id);
                state.idle.retain(|entry| entry.id != id);
                debug!(target: "platen::browser", id, "browser disconnected; untracked");
            }
        }));

        debug!(target: "platen::browser", id, "launched browser");
        Ok(PooledBrowser {
            id,
            browser,
            render_count: 0,
            last_returned_at: Instant::now(),
        })
    }

    /// Book-keeping for a returned lease. Gives back the browser when it
    /// must be torn down (recycle threshold, disconnect, disposal).
    fn finish_release(&self, mut entry: PooledBrowser) -> Option<Arc<dyn BrowserHandle>> {
        entry.render_count += 1;
        entry.last_returned_at = Instant::now();

        let recycle = self.settings.max_renders_per_instance > 0
            && entry.render_count >= self.settings.max_renders_per_instance;

        let mut state = self.state();
        state.active = state.active.saturating_sub(1);
        if recycle || state.disposed || !entry.browser.is_connected() {
            state.tracked.remove(&entry.id);
            if recycle {
                debug!(
                    target: "platen::browser",
                    id = entry.id,
                    renders = entry.render_count,
                    "recycling browser at render threshold"
                );
            }
            Some(entry.browser)
        } else {
            state.idle.push_back(entry);
            None
        }
    }

    /// Book-keeping for an invalidated lease; the browser is always
    /// handed back for teardown.
    fn finish_discard(&self, entry: PooledBrowser) -> Arc<dyn BrowserHandle> {
        let mut state = self.state();
        state.active = state.active.saturating_sub(1);
        state.tracked.remove(&entry.id);
        entry.browser
    }

    /// One reaper pass: discard idle entries past the timeout while the
    /// tracked count stays at or above the configured floor.
    async fn reap(&self, idle_timeout: Duration) {
        let now = Instant::now();
        let discards: Vec<Arc<dyn BrowserHandle>> = {
            let mut state = self.state();
            if state.disposed {
                return;
            }

            let mut entries: Vec<PooledBrowser> = state.idle.drain(..).collect();
            entries.sort_by(|a, b| b.last_returned_at.cmp(&a.last_returned_at));

            let mut discards = Vec::new();
            loop {
                let expired = entries.last().is_some_and(|oldest| {
                    now.saturating_duration_since(oldest.last_returned_at) > idle_timeout
                });
                if !expired || state.tracked.len() <= self.settings.min_size {
                    break;
                }
                if let Some(entry) = entries.pop() {
                    state.tracked.remove(&entry.id);
                    discards.push(entry.browser);
                }
            }

            state.idle.extend(entries);
            discards
        };

        if !discards.is_empty() {
            debug!(target: "platen::browser", count = discards.len(), "reaping idle browsers");
        }
        for browser in discards {
            browser.close().await;
        }
    }
}

/// Exclusive grant of one pooled browser. Must be terminated exactly
/// once; going out of scope performs a best-effort release.
pub struct BrowserLease {
    core: Arc<PoolCore>,
    entry: Option<PooledBrowser>,
    permit: Option<OwnedSemaphorePermit>,
}

impl std::fmt::Debug for BrowserLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrowserLease")
            .field("id", &self.entry.as_ref().map(|entry| entry.id))
            .finish()
    }
}

impl BrowserLease {
    pub fn browser(&self) -> &Arc<dyn BrowserHandle> {
        &self.entry.as_ref().expect("lease is live").browser
    }

    /// Hand the browser back for reuse.
    pub async fn release(mut self) {
        let (Some(entry), Some(permit)) = (self.entry.take(), self.permit.take()) else {
            return;
        };
        let closable = self.core.finish_release(entry);
        drop(permit);
        if let Some(browser) = closable {
            browser.close().await;
        }
    }

    /// Mark the browser unfit; the pool tears it down instead of reusing
    /// it.
    pub async fn invalidate(mut self) {
        let (Some(entry), Some(permit)) = (self.entry.take(), self.permit.take()) else {
            return;
        };
        warn!(target: "platen::browser", id = entry.id, "invalidating leased browser");
        let browser = self.core.finish_discard(entry);
        drop(permit);
        browser.close().await;
    }
}

impl Drop for BrowserLease {
    fn drop(&mut self) {
        let (Some(entry), Some(permit)) = (self.entry.take(), self.permit.take()) else {
            return;
        };
        let closable = self.core.finish_release(entry);
        drop(permit);
        if let Some(browser) = closable {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { browser.close().await });
            }
        }
    }
}
