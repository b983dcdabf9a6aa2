use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::FutureExt as _;
use futures::future::{BoxFuture, OptionFuture, Shared};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use url::Url;

use crate::api::ws::SwapUpdateSocket;
use crate::api::{StatusUpdate, SwapApi};
use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::swap::store::SwapStore;
use crate::swap::{Swap, SwapStatus};

#[derive(Debug, Clone)]
enum WaitOutcome {
    Reached(Box<Swap>),
    Terminal(SwapStatus),
    Timeout(Duration),
}

struct InFlightWait {
    target: SwapStatus,
    confirm: bool,
    token: u64,
    waiters: usize,
    outcome: Shared<BoxFuture<'static, WaitOutcome>>,
}

#[derive(Default)]
struct SyncState {
    generation: u64,
    polling: bool,
    paused: bool,
    /// Set when a swap is tracked while the loop runs; the loop scans again
    /// instead of stopping.
    rescan: bool,
    next_wait_token: u64,
    last_polled: HashMap<String, Instant>,
    subscribed: HashSet<String>,
    waits: HashMap<String, InFlightWait>,
}

impl SyncState {
    /// Claims a new loop generation, or flags the running loop to rescan.
    fn start_polling(&mut self) -> Option<u64> {
        if self.paused {
            return None;
        }
        if self.polling {
            self.rescan = true;
            return None;
        }
        self.polling = true;
        self.generation += 1;
        Some(self.generation)
    }

    /// The loop of `generation` found nothing pending. Returns whether it
    /// should exit.
    fn stop_polling(&mut self, generation: u64) -> bool {
        if self.generation != generation {
            return true;
        }
        if std::mem::take(&mut self.rescan) {
            return false;
        }
        self.polling = false;
        self.last_polled.clear();
        true
    }
}

struct Inner<A> {
    api: Arc<A>,
    store: SwapStore,
    config: SyncConfig,
    changes: watch::Sender<u64>,
    updates: broadcast::Sender<StatusUpdate>,
    socket: Mutex<Option<SwapUpdateSocket>>,
    state: Mutex<SyncState>,
}

impl<A> Inner<A> {
    fn state(&self) -> std::sync::MutexGuard<'_, SyncState> {
        self.state.lock().expect("sync state mutex poisoned")
    }
}

/// Keeps stored swap statuses current from two channels: the coordinator's
/// websocket push and a periodic poll of the status endpoint.
pub struct StatusSync<A> {
    inner: Arc<Inner<A>>,
}

impl<A> Clone for StatusSync<A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Status changes of one swap. Dropping it ends the subscription.
pub struct SwapWatch {
    swap_id: String,
    rx: broadcast::Receiver<StatusUpdate>,
}

impl SwapWatch {
    pub fn swap_id(&self) -> &str {
        &self.swap_id
    }

    /// Next merged status of this swap, `None` once the engine is gone.
    pub async fn next(&mut self) -> Option<SwapStatus> {
        loop {
            match self.rx.recv().await {
                Ok(update) if update.id == self.swap_id => return Some(update.status),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(swap_id = %self.swap_id, skipped, "swap watch lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

struct WaitGuard<A> {
    inner: Arc<Inner<A>>,
    swap_id: String,
    token: u64,
}

impl<A> Drop for WaitGuard<A> {
    fn drop(&mut self) {
        let mut state = self.inner.state();
        if let Some(wait) = state.waits.get_mut(&self.swap_id)
            && wait.token == self.token
        {
            wait.waiters -= 1;
            if wait.waiters == 0 {
                state.waits.remove(&self.swap_id);
            }
        }
    }
}

pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

fn swap_age(swap: &Swap) -> Duration {
    Duration::from_secs(u64::try_from(unix_now() - swap.common().date).unwrap_or_default())
}

impl<A: SwapApi> StatusSync<A> {
    pub fn new(api: Arc<A>, store: SwapStore, config: SyncConfig) -> Self {
        let (changes, _) = watch::channel(0);
        let (updates, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                api,
                store,
                config,
                changes,
                updates,
                socket: Mutex::new(None),
                state: Mutex::new(SyncState::default()),
            }),
        }
    }

    pub fn store(&self) -> &SwapStore {
        &self.inner.store
    }

    /// Opens the push channel. Already tracked swaps are subscribed at once.
    pub fn connect_socket(&self, url: Url) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<StatusUpdate>>();
        let socket = SwapUpdateSocket::spawn(url, tx);
        let known: Vec<String> = self.inner.state().subscribed.iter().cloned().collect();
        if !known.is_empty() {
            socket.subscribe(known);
        }
        *self.inner.socket.lock().expect("socket mutex poisoned") = Some(socket);

        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(batch) = rx.recv().await {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if let Err(err) = apply_updates(&inner, &batch) {
                    tracing::warn!(error = %err, "apply pushed swap updates");
                }
            }
        });
    }

    /// Subscribes `swap_id` to push updates and makes sure polling runs.
    /// Repeated calls for the same id are no-ops.
    pub fn track(&self, swap_id: &str) {
        let fresh = self.inner.state().subscribed.insert(swap_id.to_string());
        if fresh {
            tracing::debug!(%swap_id, "tracking swap");
            if let Some(socket) = self.inner.socket.lock().expect("socket mutex poisoned").as_ref()
                && !socket.subscribe(vec![swap_id.to_string()])
            {
                tracing::warn!(%swap_id, "swap update socket is gone");
            }
        }
        self.ensure_polling();
    }

    /// Tracks every pending swap in the store, e.g. after a restart.
    pub fn resume_pending(&self) -> Result<usize> {
        let pending = self.inner.store.pending()?;
        for swap in &pending {
            self.track(swap.id());
        }
        Ok(pending.len())
    }

    /// Merges a batch of reported statuses into the store and notifies
    /// listeners once for the batch. Returns the swaps that changed.
    pub fn apply_updates(&self, updates: &[StatusUpdate]) -> Result<Vec<Swap>> {
        apply_updates(&self.inner, updates)
    }

    /// Polls the coordinator for one swap right away.
    pub async fn refresh(&self, swap_id: &str) -> Result<Swap> {
        poll_one(&self.inner, swap_id).await?;
        self.inner.store.require(swap_id)
    }

    pub fn changes(&self) -> watch::Receiver<u64> {
        self.inner.changes.subscribe()
    }

    pub fn watch_swap(&self, swap_id: &str) -> SwapWatch {
        SwapWatch {
            swap_id: swap_id.to_string(),
            rx: self.inner.updates.subscribe(),
        }
    }

    pub fn is_polling(&self) -> bool {
        self.inner.state().polling
    }

    /// Stops background polling until [`StatusSync::resume`]. Push updates
    /// keep flowing.
    pub fn pause(&self) {
        let mut state = self.inner.state();
        state.paused = true;
        state.polling = false;
        state.generation += 1;
        tracing::debug!("status polling paused");
    }

    pub fn resume(&self) {
        self.inner.state().paused = false;
        tracing::debug!("status polling resumed");
        self.ensure_polling();
    }

    fn ensure_polling(&self) {
        let Some(generation) = self.inner.state().start_polling() else {
            return;
        };
        tokio::spawn(poll_loop(Arc::downgrade(&self.inner), generation));
    }

    /// Resolves once the swap has reached or passed `target`. Fails when the
    /// swap sits in a terminal status that cannot reach it, or after
    /// `timeout` (the configured default when `None`). Concurrent waits on
    /// the same swap and target share one wait; a different target while one
    /// is in flight is refused.
    pub async fn wait_for_swap_until_state(
        &self,
        swap_id: &str,
        target: SwapStatus,
        timeout: Option<Duration>,
    ) -> Result<Swap> {
        self.wait(swap_id, target, timeout, false).await
    }

    /// Like [`StatusSync::wait_for_swap_until_state`], but the stored status
    /// alone does not count: the coordinator has to report `target` (or a
    /// later status) during the wait.
    pub async fn confirm_swap_state(
        &self,
        swap_id: &str,
        target: SwapStatus,
        timeout: Option<Duration>,
    ) -> Result<Swap> {
        self.wait(swap_id, target, timeout, true).await
    }

    async fn wait(
        &self,
        swap_id: &str,
        target: SwapStatus,
        timeout: Option<Duration>,
        confirm: bool,
    ) -> Result<Swap> {
        self.inner.store.require(swap_id)?;
        let timeout = timeout.unwrap_or_else(|| self.inner.config.wait_timeout());

        let (outcome, _guard) = {
            let mut state = self.inner.state();
            let (outcome, token) = match state.waits.get_mut(swap_id) {
                Some(wait) if wait.target == target && wait.confirm == confirm => {
                    wait.waiters += 1;
                    (wait.outcome.clone(), wait.token)
                }
                Some(wait) => {
                    return Err(Error::WaitInFlight {
                        swap_id: swap_id.to_string(),
                        in_flight: wait.target,
                    });
                }
                None => {
                    state.next_wait_token += 1;
                    let token = state.next_wait_token;
                    let outcome =
                        wait_until(self.inner.clone(), swap_id.to_string(), target, timeout, confirm)
                            .boxed()
                            .shared();
                    state.waits.insert(
                        swap_id.to_string(),
                        InFlightWait {
                            target,
                            confirm,
                            token,
                            waiters: 1,
                            outcome: outcome.clone(),
                        },
                    );
                    (outcome, token)
                }
            };
            let guard = WaitGuard {
                inner: self.inner.clone(),
                swap_id: swap_id.to_string(),
                token,
            };
            (outcome, guard)
        };

        match outcome.await {
            WaitOutcome::Reached(swap) => Ok(*swap),
            WaitOutcome::Terminal(status) => Err(Error::TerminalStatus {
                swap_id: swap_id.to_string(),
                status,
                target,
            }),
            WaitOutcome::Timeout(elapsed) => Err(Error::Timeout {
                swap_id: swap_id.to_string(),
                target,
                elapsed,
            }),
        }
    }
}

fn apply_updates<A>(inner: &Inner<A>, updates: &[StatusUpdate]) -> Result<Vec<Swap>> {
    if updates.is_empty() {
        return Ok(Vec::new());
    }
    let changed = inner.store.apply_status_updates(updates)?;
    for swap in &changed {
        // No receivers is fine.
        let _ = inner.updates.send(StatusUpdate {
            id: swap.id().to_string(),
            status: swap.status(),
        });
    }
    if !changed.is_empty() {
        inner.changes.send_modify(|batches| *batches += 1);
    }
    Ok(changed)
}

async fn fetch_status<A: SwapApi>(inner: &Inner<A>, swap_id: &str) -> Result<StatusUpdate> {
    let response = inner.api.swap_status(swap_id).await?;
    Ok(StatusUpdate {
        id: swap_id.to_string(),
        status: response.parsed_status()?,
    })
}

/// Fetches and merges one swap's status. Returns the status as reported.
async fn poll_one<A: SwapApi>(inner: &Inner<A>, swap_id: &str) -> Result<SwapStatus> {
    let update = fetch_status(inner, swap_id).await?;
    inner
        .state()
        .last_polled
        .insert(swap_id.to_string(), Instant::now());
    let reported = update.status;
    apply_updates(inner, &[update])?;
    Ok(reported)
}

async fn poll_loop<A: SwapApi>(weak: Weak<Inner<A>>, generation: u64) {
    let tick = match weak.upgrade() {
        Some(inner) => inner.config.tick(),
        None => return,
    };
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tracing::debug!(generation, "status polling started");

    loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else {
            return;
        };
        {
            let mut state = inner.state();
            if state.generation != generation {
                return;
            }
            state.rescan = false;
        }

        let pending = match inner.store.pending() {
            Ok(pending) => pending,
            Err(err) => {
                tracing::warn!(error = %err, "list pending swaps");
                continue;
            }
        };
        if pending.is_empty() {
            if inner.state().stop_polling(generation) {
                tracing::debug!(generation, "no pending swaps; status polling stopped");
                return;
            }
            continue;
        }

        let now = Instant::now();
        let due: Vec<String> = {
            let mut state = inner.state();
            let pending_ids: HashSet<&str> = pending.iter().map(Swap::id).collect();
            state
                .last_polled
                .retain(|id, _| pending_ids.contains(id.as_str()));
            pending
                .iter()
                .filter(|swap| {
                    let interval = inner.config.interval_for_age(swap_age(swap));
                    state
                        .last_polled
                        .get(swap.id())
                        .is_none_or(|last| now.duration_since(*last) >= interval)
                })
                .map(|swap| swap.id().to_string())
                .collect()
        };

        let mut batch = Vec::with_capacity(due.len());
        for swap_id in due {
            match fetch_status(&inner, &swap_id).await {
                Ok(update) => batch.push(update),
                Err(err) => tracing::warn!(%swap_id, error = %err, "poll swap status"),
            }
            inner.state().last_polled.insert(swap_id, now);
        }

        // A pause or restart while the requests were in flight drops the batch.
        if inner.state().generation != generation {
            return;
        }
        if let Err(err) = apply_updates(&inner, &batch) {
            tracing::warn!(error = %err, "apply polled swap updates");
        }
    }
}

async fn wait_until<A: SwapApi>(
    inner: Arc<Inner<A>>,
    swap_id: String,
    target: SwapStatus,
    timeout: Duration,
    confirm: bool,
) -> WaitOutcome {
    let started = Instant::now();
    let mut updates = inner.updates.subscribe();
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    let mut poll = tokio::time::interval(inner.config.wait_poll());
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut in_flight: Option<BoxFuture<'_, Result<SwapStatus>>> = None;
    // Latest status the coordinator reported during this wait.
    let mut reported: Option<SwapStatus> = None;

    let check = |inner: &Inner<A>, reported: Option<SwapStatus>| -> Option<WaitOutcome> {
        let swap = match inner.store.get(&swap_id) {
            Ok(Some(swap)) => swap,
            Ok(None) => return None,
            Err(err) => {
                tracing::warn!(%swap_id, error = %err, "read swap while waiting");
                return None;
            }
        };
        let status = swap.status();
        let confirmed = !confirm || reported.is_some_and(|r| r.has_reached(target));
        if status.has_reached(target) {
            confirmed.then(|| WaitOutcome::Reached(Box::new(swap)))
        } else if !status.can_reach(target) {
            Some(WaitOutcome::Terminal(status))
        } else {
            None
        }
    };

    if let Some(outcome) = check(&inner, reported) {
        return outcome;
    }

    loop {
        tokio::select! {
            _ = &mut deadline => {
                tracing::debug!(%swap_id, %target, "wait for swap status timed out");
                return WaitOutcome::Timeout(started.elapsed());
            }
            update = updates.recv() => match update {
                Ok(update) if update.id != swap_id => continue,
                Ok(update) => reported = Some(update.status),
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    deadline.as_mut().await;
                    return WaitOutcome::Timeout(started.elapsed());
                }
            },
            _ = poll.tick(), if in_flight.is_none() => {
                in_flight = Some(poll_one(&inner, &swap_id).boxed());
                continue;
            }
            Some(polled) = OptionFuture::from(in_flight.as_mut()), if in_flight.is_some() => {
                in_flight = None;
                match polled {
                    Ok(status) => reported = Some(status),
                    Err(err) => tracing::warn!(%swap_id, error = %err, "poll while waiting"),
                }
            }
        }
        if let Some(outcome) = check(&inner, reported) {
            return outcome;
        }
    }
}
