// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of FluxION.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

//! Polling coordinator owning the cached inverter snapshot
//!
//! All mutation paths into the cache live here: full replacement after a
//! fetch, and local command expiry through [`CommandExpiryScheduler`].
//! Consumers read through [`Coordinator::read`] or follow changes with
//! [`Coordinator::subscribe`].

use crate::client::ProteusClient;
use crate::config::ProteusConfig;
use crate::errors::{CoordinatorError, CoordinatorResult, ProteusError, ProteusResult};
use crate::scheduler::CommandExpiryScheduler;
use crate::traits::SnapshotSource;
use crate::types::{ControlMode, ControlType, Snapshot};
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

type SharedRefresh = Shared<BoxFuture<'static, CoordinatorResult<Snapshot>>>;

/// Handle returned by [`Coordinator::configure`]
pub type CoordinatorHandle = Coordinator;

/// Outcome bookkeeping of recent refreshes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshStatus {
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

impl RefreshStatus {
    /// True while the cached snapshot is older than the latest refresh attempt
    pub fn is_stale(&self) -> bool {
        self.consecutive_failures > 0
    }

    fn record_success(&mut self, at: DateTime<Utc>) {
        self.last_success = Some(at);
        self.consecutive_failures = 0;
    }

    fn record_failure(&mut self, at: DateTime<Utc>, error: &ProteusError) {
        self.last_failure = Some(at);
        self.last_error = Some(error.to_string());
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }
}

struct Inner {
    source: Arc<dyn SnapshotSource>,
    poll_interval: Duration,
    refresh_debounce: Duration,
    state: watch::Sender<Option<Snapshot>>,
    status: Mutex<RefreshStatus>,
    in_flight: Mutex<Option<SharedRefresh>>,
    scheduler: CommandExpiryScheduler,
    shutdown: watch::Sender<bool>,
    poller: Mutex<Option<JoinHandle<()>>>,
    write_generation: AtomicU64,
    closed: AtomicBool,
}

impl Inner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Join the running refresh, or start one if none is in flight.
    ///
    /// The fetch runs as its own task, so it completes and releases `Inner`
    /// even when every waiter is dropped.
    fn refresh(self: &Arc<Self>) -> SharedRefresh {
        let mut slot = self.in_flight.lock();
        if let Some(running) = slot.as_ref() {
            debug!("🔄 [PROTEUS POLL] Joining in-flight refresh");
            return running.clone();
        }

        let inner = Arc::clone(self);
        let task = tokio::spawn(async move {
            let result = inner.fetch_and_replace().await;
            inner.in_flight.lock().take();
            result
        });
        let refresh = async move {
            task.await
                .unwrap_or_else(|e| Err(CoordinatorError::RefreshAborted(e.to_string())))
        }
        .boxed()
        .shared();

        *slot = Some(refresh.clone());
        refresh
    }

    async fn fetch_and_replace(&self) -> CoordinatorResult<Snapshot> {
        let result = self.source.fetch_snapshot().await;
        if self.is_closed() {
            return Err(CoordinatorError::Closed);
        }

        match result {
            Ok(mut snapshot) => {
                let now = Utc::now();
                if snapshot.expire_command(now) {
                    debug!("⏱️ [PROTEUS CMD] Command already ended when fetched, normalized to NONE");
                }

                self.state.send_replace(Some(snapshot.clone()));
                self.scheduler.rearm(&snapshot, &self.state);
                self.status.lock().record_success(now);

                info!(
                    "✅ [PROTEUS POLL] Snapshot from {}: flexibility {}, mode {}, command {}",
                    self.source.name(),
                    snapshot.flexibility_state,
                    snapshot.control_mode,
                    snapshot.active_command
                );
                Ok(snapshot)
            }
            Err(e) => {
                let e = Arc::new(e);
                self.status.lock().record_failure(Utc::now(), &e);
                warn!(
                    "⚠️ [PROTEUS POLL] Refresh from {} failed, keeping last snapshot: {}",
                    self.source.name(),
                    e
                );
                Err(CoordinatorError::RefreshFailed(e))
            }
        }
    }
}

/// Cheaply cloneable handle to one inverter's polling state.
///
/// Each coordinator owns its own session, transport and expiry timer; nothing
/// is shared between instances.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coordinator")
            .field("source", &self.inner.source.name())
            .field("poll_interval", &self.inner.poll_interval)
            .field("has_snapshot", &self.inner.state.borrow().is_some())
            .field("closed", &self.inner.is_closed())
            .finish()
    }
}

impl Coordinator {
    /// Build a coordinator backed by the Proteus API
    pub fn configure(config: ProteusConfig) -> ProteusResult<CoordinatorHandle> {
        let client = ProteusClient::new(&config)?;
        Self::with_source(
            Arc::new(client),
            config.poll_interval(),
            config.refresh_debounce(),
        )
    }

    pub fn from_credentials(
        inverter_id: impl Into<String>,
        email: impl Into<String>,
        password: impl Into<String>,
    ) -> ProteusResult<CoordinatorHandle> {
        Self::configure(ProteusConfig::new(inverter_id, email, password))
    }

    pub fn with_source(
        source: Arc<dyn SnapshotSource>,
        poll_interval: Duration,
        refresh_debounce: Duration,
    ) -> ProteusResult<Self> {
        if poll_interval.is_zero() {
            return Err(ProteusError::Config(
                "poll interval must be greater than zero".to_owned(),
            ));
        }

        let (state, _) = watch::channel(None);
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(Inner {
                source,
                poll_interval,
                refresh_debounce,
                state,
                status: Mutex::new(RefreshStatus::default()),
                in_flight: Mutex::new(None),
                scheduler: CommandExpiryScheduler::new(),
                shutdown,
                poller: Mutex::new(None),
                write_generation: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Latest snapshot, or `None` before the first successful refresh. Never blocks on I/O.
    pub fn read(&self) -> Option<Snapshot> {
        self.inner.state.borrow().clone()
    }

    /// Receiver notified on every replacement and every local command expiry
    pub fn subscribe(&self) -> watch::Receiver<Option<Snapshot>> {
        self.inner.state.subscribe()
    }

    pub fn status(&self) -> RefreshStatus {
        self.inner.status.lock().clone()
    }

    pub fn poll_interval(&self) -> Duration {
        self.inner.poll_interval
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Fetch now and replace the cache. A refresh already in flight is joined
    /// instead of issuing a second round-trip. On failure the cache is kept.
    pub async fn refresh_now(&self) -> CoordinatorResult<Snapshot> {
        self.ensure_open()?;
        Inner::refresh(&self.inner).await
    }

    /// Start periodic refresh at the configured interval
    pub fn start(&self) -> CoordinatorResult<()> {
        self.start_with_interval(self.inner.poll_interval)
    }

    pub fn start_with_interval(&self, period: Duration) -> CoordinatorResult<()> {
        self.ensure_open()?;
        if period.is_zero() {
            return Err(CoordinatorError::InvalidInterval);
        }

        let mut poller = self.inner.poller.lock();
        if poller.as_ref().is_some_and(|handle| !handle.is_finished()) {
            warn!("[PROTEUS POLL] Polling already running, ignoring start");
            return Ok(());
        }

        info!("🔄 [PROTEUS POLL] Polling every {:?}", period);
        let shutdown = self.inner.shutdown.subscribe();
        *poller = Some(tokio::spawn(poll_loop(
            Arc::downgrade(&self.inner),
            period,
            shutdown,
        )));
        Ok(())
    }

    pub async fn set_manual_control(
        &self,
        control_type: ControlType,
        enabled: bool,
    ) -> CoordinatorResult<()> {
        self.mutate(
            format!("manual control {control_type} = {enabled}"),
            self.inner.source.set_manual_control(control_type, enabled),
        )
        .await
    }

    pub async fn set_control_enabled(&self, enabled: bool) -> CoordinatorResult<()> {
        self.mutate(
            format!("control enabled = {enabled}"),
            self.inner.source.set_control_enabled(enabled),
        )
        .await
    }

    pub async fn set_control_mode(&self, mode: ControlMode) -> CoordinatorResult<()> {
        self.mutate(
            format!("control mode = {mode}"),
            self.inner.source.set_control_mode(mode),
        )
        .await
    }

    pub async fn set_flexibility_capabilities(
        &self,
        capabilities: &[String],
    ) -> CoordinatorResult<()> {
        self.mutate(
            format!("flexibility capabilities = {capabilities:?}"),
            self.inner.source.set_flexibility_capabilities(capabilities),
        )
        .await
    }

    /// Stop polling, cancel the expiry timer and release the session.
    /// Requests already on the wire finish on their own timeout.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.inner.shutdown.send_replace(true);
        self.inner.scheduler.shutdown();
        self.inner.in_flight.lock().take();
        drop(self.inner.poller.lock().take());
        self.inner.source.close().await;

        info!("🛑 [PROTEUS POLL] Coordinator for {} closed", self.inner.source.name());
    }

    fn ensure_open(&self) -> CoordinatorResult<()> {
        if self.inner.is_closed() {
            Err(CoordinatorError::Closed)
        } else {
            Ok(())
        }
    }

    async fn mutate<F>(&self, description: String, call: F) -> CoordinatorResult<()>
    where
        F: Future<Output = ProteusResult<()>>,
    {
        self.ensure_open()?;

        match call.await {
            Ok(()) => {
                info!("🎛️ [PROTEUS CMD] Applied {}", description);
                self.schedule_refresh();
                Ok(())
            }
            Err(e) => {
                error!("❌ [PROTEUS CMD] Could not apply {}: {}", description, e);
                Err(CoordinatorError::ControlFailed(Arc::new(e)))
            }
        }
    }

    /// Refresh after the debounce delay, unless a later write restarts the wait
    fn schedule_refresh(&self) {
        let generation = self.inner.write_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = self.inner.refresh_debounce;
        let inner = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let Some(inner) = inner.upgrade() else {
                return;
            };
            if inner.is_closed() || inner.write_generation.load(Ordering::SeqCst) != generation {
                return;
            }
            if let Err(e) = Inner::refresh(&inner).await {
                warn!("⚠️ [PROTEUS CMD] Refresh after write failed: {}", e);
            }
        });
    }
}

async fn poll_loop(inner: Weak<Inner>, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                if let Err(e) = Inner::refresh(&inner).await {
                    debug!("[PROTEUS POLL] Tick failed, will retry next interval: {}", e);
                }
            }
        }
    }

    debug!("[PROTEUS POLL] Polling loop stopped");
}
