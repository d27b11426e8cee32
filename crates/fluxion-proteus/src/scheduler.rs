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

//! Local expiry of the active flexibility command between polls

use crate::types::Snapshot;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Debug)]
struct ArmedTimer {
    end: DateTime<Utc>,
    handle: JoinHandle<()>,
}

/// One-shot timer that flips the cached command to NONE when it ends.
/// At most one timer is armed at a time. Once shut down it never arms again.
#[derive(Debug, Default)]
pub struct CommandExpiryScheduler {
    timer: Mutex<Option<ArmedTimer>>,
    stopped: AtomicBool,
}

impl CommandExpiryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the armed timer, then arm a new one if the snapshot carries a
    /// command ending strictly in the future.
    pub fn rearm(&self, snapshot: &Snapshot, state: &watch::Sender<Option<Snapshot>>) {
        let mut slot = self.timer.lock();
        if let Some(previous) = slot.take() {
            previous.handle.abort();
        }
        if self.is_stopped() {
            return;
        }

        let Some(end) = snapshot.active_command_end() else {
            return;
        };
        let delay = match (end - Utc::now()).to_std() {
            Ok(delay) if !delay.is_zero() => delay,
            _ => return,
        };

        debug!(
            "⏱️ [PROTEUS CMD] Command {} expires at {} (in {:?})",
            snapshot.active_command, end, delay
        );

        let state = state.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            expire_command(&state, end);
        });
        *slot = Some(ArmedTimer { end, handle });
    }

    /// Cancel the armed timer and refuse every later `rearm`
    pub fn shutdown(&self) {
        let mut slot = self.timer.lock();
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(timer) = slot.take() {
            timer.handle.abort();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        if let Some(timer) = self.timer.lock().take() {
            timer.handle.abort();
            debug!("Command expiry timer for {} cancelled", timer.end);
        }
    }

    /// End time of the pending timer, if one is armed and has not fired
    pub fn armed_until(&self) -> Option<DateTime<Utc>> {
        self.timer
            .lock()
            .as_ref()
            .filter(|timer| !timer.handle.is_finished())
            .map(|timer| timer.end)
    }
}

impl Drop for CommandExpiryScheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Clear the command only if the cached snapshot still ends at `end`; a newer
/// snapshot with a different command is left alone.
fn expire_command(state: &watch::Sender<Option<Snapshot>>, end: DateTime<Utc>) {
    let changed = state.send_if_modified(|current| match current {
        Some(snapshot) if snapshot.active_command_end() == Some(end) => {
            snapshot.clear_command();
            true
        }
        _ => false,
    });

    if changed {
        info!("⏱️ [PROTEUS CMD] Flexibility command ended at {}, state is now NONE", end);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_snapshot;
    use crate::test_fixtures::read_body;
    use crate::transport::BatchResponse;
    use crate::types::ActiveCommand;
    use std::time::Duration;

    fn snapshot(command: Option<(&str, DateTime<Utc>)>) -> Snapshot {
        parse_snapshot(&BatchResponse::decode(read_body(command)).unwrap()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_at_end_not_before() {
        let end = Utc::now() + chrono::Duration::seconds(5);
        let snap = snapshot(Some(("CHARGE", end)));
        let end = snap.active_command_end().unwrap();
        let (tx, rx) = watch::channel(Some(snap.clone()));

        let scheduler = CommandExpiryScheduler::new();
        scheduler.rearm(&snap, &tx);
        assert_eq!(scheduler.armed_until(), Some(end));

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(tx.borrow().as_ref().unwrap().active_command.is_active());
        assert!(!rx.has_changed().unwrap());

        tokio::time::sleep(Duration::from_secs(2)).await;
        let current = tx.borrow().clone().unwrap();
        assert_eq!(current.active_command, ActiveCommand::None);
        assert!(current.command_end.is_none());
        assert_eq!(current.manual_controls, snap.manual_controls);
        assert!(rx.has_changed().unwrap());
        assert!(scheduler.armed_until().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_cancels_previous_timer() {
        let first_end = Utc::now() + chrono::Duration::seconds(5);
        let second_end = Utc::now() + chrono::Duration::seconds(60);
        let first = snapshot(Some(("CHARGE", first_end)));
        let second = snapshot(Some(("DISCHARGE", second_end)));
        let (tx, _rx) = watch::channel(Some(first.clone()));

        let scheduler = CommandExpiryScheduler::new();
        scheduler.rearm(&first, &tx);
        tx.send_replace(Some(second.clone()));
        scheduler.rearm(&second, &tx);
        assert_eq!(scheduler.armed_until(), second.active_command_end());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(
            tx.borrow().as_ref().unwrap().active_command,
            ActiveCommand::Active("DISCHARGE".to_owned())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_timer_without_command() {
        let (tx, _rx) = watch::channel(None);
        let scheduler = CommandExpiryScheduler::new();
        scheduler.rearm(&snapshot(None), &tx);
        assert!(scheduler.armed_until().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_past_end_arms_nothing() {
        let snap = snapshot(Some(("CHARGE", Utc::now() - chrono::Duration::seconds(1))));
        let (tx, _rx) = watch::channel(Some(snap.clone()));
        let scheduler = CommandExpiryScheduler::new();
        scheduler.rearm(&snap, &tx);
        assert!(scheduler.armed_until().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_pending_expiry() {
        let end = Utc::now() + chrono::Duration::seconds(5);
        let snap = snapshot(Some(("CHARGE", end)));
        let (tx, _rx) = watch::channel(Some(snap.clone()));
        let scheduler = CommandExpiryScheduler::new();
        scheduler.rearm(&snap, &tx);
        scheduler.cancel();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(tx.borrow().as_ref().unwrap().active_command.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_after_shutdown_is_ignored() {
        let end = Utc::now() + chrono::Duration::seconds(5);
        let snap = snapshot(Some(("CHARGE", end)));
        let (tx, _rx) = watch::channel(Some(snap.clone()));
        let scheduler = CommandExpiryScheduler::new();
        scheduler.rearm(&snap, &tx);

        scheduler.shutdown();
        assert!(scheduler.is_stopped());
        scheduler.rearm(&snap, &tx);
        assert!(scheduler.armed_until().is_none());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(tx.borrow().as_ref().unwrap().active_command.is_active());
    }
}
