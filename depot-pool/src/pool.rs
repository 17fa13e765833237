//! Endpoint pool for content downloads

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use depot_proto::{AppId, Endpoint, SessionProvider};
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::{PoolError, Result};

/// Endpoint pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Refill the stock when fewer endpoints than this are available
    pub min_cached_endpoints: usize,
    /// Delay between two replenishment cycles
    pub poll_interval: Duration,
    /// How long the session may stay disconnected before the pool gives up
    pub disconnect_grace: Duration,
    /// Cell hint passed to the content directory
    pub cell_id: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_cached_endpoints: 8,
            poll_interval: Duration::from_secs(1),
            disconnect_grace: Duration::from_secs(10),
            cell_id: 0,
        }
    }
}

/// Snapshot of pool occupancy for monitoring
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub available: usize,
    pub active: usize,
    pub broken: usize,
}

struct PoolShared {
    session: Arc<dyn SessionProvider>,
    app_id: AppId,
    config: PoolConfig,
    /// Fresh entries from the directory, in weighted order
    available: Mutex<VecDeque<Arc<Endpoint>>>,
    /// Endpoints returned healthy by callers, reused last-in-first-out
    active: Mutex<Vec<Arc<Endpoint>>>,
    broken: RwLock<HashSet<String>>,
    preferred_relay: RwLock<Option<Arc<Endpoint>>>,
    /// Wakes the monitor before its next scheduled cycle
    populate: Notify,
    /// Wakes callers blocked in `acquire` after a refill or a release
    supplied: Notify,
    exhausted: CancellationToken,
    shutdown: CancellationToken,
}

/// Thread-safe pool of delivery endpoints with background replenishment
pub struct EndpointPool {
    shared: Arc<PoolShared>,
    monitor_handle: Mutex<Option<JoinHandle<()>>>,
}

impl EndpointPool {
    /// Create a pool for `app_id` and start its replenishment task
    pub fn start(session: Arc<dyn SessionProvider>, app_id: AppId, config: PoolConfig) -> Self {
        let shared = Arc::new(PoolShared {
            session,
            app_id,
            config,
            available: Mutex::new(VecDeque::new()),
            active: Mutex::new(Vec::new()),
            broken: RwLock::new(HashSet::new()),
            preferred_relay: RwLock::new(None),
            populate: Notify::new(),
            supplied: Notify::new(),
            exhausted: CancellationToken::new(),
            shutdown: CancellationToken::new(),
        });

        let handle = tokio::spawn(monitor_loop(shared.clone()));

        Self {
            shared,
            monitor_handle: Mutex::new(Some(handle)),
        }
    }

    /// Get an endpoint, waiting for replenishment if the stock is empty
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<Arc<Endpoint>> {
        loop {
            if cancel.is_cancelled() {
                return Err(PoolError::Cancelled);
            }
            if self.shared.exhausted.is_cancelled() {
                return Err(PoolError::Exhausted);
            }

            // Register interest before looking so a refill in between is not missed
            let supplied = self.shared.supplied.notified();
            tokio::pin!(supplied);
            supplied.as_mut().enable();

            if let Some(endpoint) = self.shared.active.lock().await.pop() {
                debug!("Reusing endpoint {}", endpoint);
                return Ok(endpoint);
            }
            if let Some(endpoint) = self.take_available().await {
                debug!("Acquired endpoint {}", endpoint);
                return Ok(endpoint);
            }

            self.shared.populate.notify_one();

            tokio::select! {
                _ = cancel.cancelled() => return Err(PoolError::Cancelled),
                _ = self.shared.exhausted.cancelled() => return Err(PoolError::Exhausted),
                _ = &mut supplied => {}
                _ = tokio::time::sleep(self.shared.config.poll_interval) => {}
            }
        }
    }

    /// Return a healthy endpoint for reuse
    pub async fn release(&self, endpoint: Arc<Endpoint>) {
        if self.is_broken(&endpoint).await {
            debug!("Dropping released endpoint {} (marked broken)", endpoint);
            return;
        }
        self.shared.active.lock().await.push(endpoint);
        self.shared.supplied.notify_one();
    }

    /// Discard an endpoint permanently
    pub async fn mark_broken(&self, endpoint: &Endpoint) {
        let inserted = self.shared.broken.write().await.insert(endpoint_key(endpoint));
        if inserted {
            warn!("Endpoint {} marked broken", endpoint);
        }
        self.shared
            .active
            .lock()
            .await
            .retain(|e| endpoint_key(e) != endpoint_key(endpoint));
    }

    /// Relay-capable endpoint seen in the most recent directory listing
    pub async fn preferred_relay(&self) -> Option<Arc<Endpoint>> {
        self.shared.preferred_relay.read().await.clone()
    }

    pub fn is_exhausted(&self) -> bool {
        self.shared.exhausted.is_cancelled()
    }

    pub async fn stats(&self) -> PoolStats {
        PoolStats {
            available: self.shared.available.lock().await.len(),
            active: self.shared.active.lock().await.len(),
            broken: self.shared.broken.read().await.len(),
        }
    }

    /// Stop the replenishment task and wait for it to exit
    pub async fn shutdown(&self) {
        info!("Shutting down endpoint pool");
        self.shared.shutdown.cancel();

        if let Some(handle) = self.monitor_handle.lock().await.take() {
            if let Err(e) = handle.await {
                warn!("Endpoint pool monitor ended abnormally: {}", e);
            }
        }
    }

    async fn take_available(&self) -> Option<Arc<Endpoint>> {
        let broken = self.shared.broken.read().await;
        let mut available = self.shared.available.lock().await;
        while let Some(endpoint) = available.pop_front() {
            if !broken.contains(&endpoint_key(&endpoint)) {
                return Some(endpoint);
            }
        }
        None
    }

    async fn is_broken(&self, endpoint: &Endpoint) -> bool {
        self.shared
            .broken
            .read()
            .await
            .contains(&endpoint_key(endpoint))
    }
}

impl Drop for EndpointPool {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

fn endpoint_key(endpoint: &Endpoint) -> String {
    endpoint.to_string()
}

/// Background task keeping the available stock filled
async fn monitor_loop(shared: Arc<PoolShared>) {
    let mut did_populate = false;
    let mut disconnected_since: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = shared.populate.notified() => {}
            _ = tokio::time::sleep(shared.config.poll_interval) => {}
        }

        let available = shared.available.lock().await.len();
        let connected = shared.session.is_connected();

        if connected {
            disconnected_since = None;
        } else if disconnected_since.is_none() {
            disconnected_since = Some(Instant::now());
        }

        if available < shared.config.min_cached_endpoints && connected {
            match shared.session.directory_servers(shared.config.cell_id).await {
                Ok(servers) => {
                    let added = shared.replenish(servers).await;
                    if added == 0 {
                        warn!(
                            "Content directory returned no usable endpoints for app {}",
                            shared.app_id
                        );
                        shared.exhausted.cancel();
                        break;
                    }
                    did_populate = true;
                    shared.supplied.notify_waiters();
                }
                Err(e) => {
                    warn!("Failed to query content directory: {}", e);
                }
            }
        } else if available == 0 && did_populate {
            let grace_elapsed = disconnected_since
                .map(|since| since.elapsed() >= shared.config.disconnect_grace)
                .unwrap_or(false);
            if grace_elapsed {
                warn!("Session disconnected and endpoint stock is empty, giving up");
                shared.exhausted.cancel();
                break;
            }
        }
    }

    debug!("Endpoint pool monitor stopped");
}

impl PoolShared {
    /// Filter, order and enqueue a directory listing; returns the number of slots added
    async fn replenish(&self, servers: Vec<Endpoint>) -> usize {
        let mut eligible: Vec<Endpoint> = {
            let broken = self.broken.read().await;
            servers
                .into_iter()
                .filter(|s| s.is_eligible_for(self.app_id) && s.is_usable())
                .filter(|s| !broken.contains(&endpoint_key(s)))
                .collect()
        };
        eligible.sort_by(|a, b| a.weighted_load.total_cmp(&b.weighted_load));

        if let Some(relay) = eligible.iter().find(|s| s.relay_capable) {
            debug!("Using {} as preferred relay", relay);
            *self.preferred_relay.write().await = Some(Arc::new(relay.clone()));
        }

        let mut available = self.available.lock().await;
        let mut added = 0;
        for server in eligible {
            let server = Arc::new(server);
            // Repeated slots approximate weighted random selection
            for _ in 0..server.entries {
                available.push_back(server.clone());
                added += 1;
            }
        }

        debug!(
            "Replenished endpoint pool with {} slots ({} available)",
            added,
            available.len()
        );
        added
    }
}
