//! Consolidated device status snapshot.
//!
//! Each field group (`pointing`, `pi`, `view`, `stack`, `connection`) is
//! guarded so a reader can never observe a torn mix of an old and a new
//! write within one group -- group-shaped updates replace the whole group
//! in one lock acquisition. Mutated only by reader tasks; observers get
//! copy-on-read snapshots.

use std::time::SystemTime;

use tokio::sync::RwLock;

use crate::event::{
    Event, KIND_FOCUSER_MOVE, KIND_INTERNAL_DISCONNECTED, KIND_INTERNAL_RECONNECTED,
    KIND_PI_STATUS, KIND_STACKING_STATUS, KIND_VIEW_STATE_CHANGED,
};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pointing {
    pub ra: Option<f64>,
    pub dec: Option<f64>,
    pub updated_at: Option<SystemTime>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PiStatus {
    pub focus_position: Option<i64>,
    pub battery_pct: Option<f64>,
    pub internal_temp_c: Option<f64>,
    pub updated_at: Option<SystemTime>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewState {
    pub view_mode: Option<String>,
    pub updated_at: Option<SystemTime>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StackCounters {
    pub stacked: u64,
    pub dropped: u64,
    pub skipped: u64,
    pub updated_at: Option<SystemTime>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionFlags {
    pub control_connected: bool,
    pub imaging_connected: bool,
    pub updated_at: Option<SystemTime>,
}

/// An immutable copy of the store at one instant.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub pointing: Pointing,
    pub pi: PiStatus,
    pub view: ViewState,
    pub stack: StackCounters,
    pub connection: ConnectionFlags,
}

#[derive(Default)]
struct State {
    pointing: Pointing,
    pi: PiStatus,
    view: ViewState,
    stack: StackCounters,
    connection: ConnectionFlags,
}

/// Owned, mutated only by reader tasks; observers get [`Snapshot`]s.
pub struct StatusStore {
    state: RwLock<State>,
}

impl Default for StatusStore {
    fn default() -> Self {
        StatusStore::new()
    }
}

impl StatusStore {
    pub fn new() -> StatusStore {
        StatusStore { state: RwLock::new(State::default()) }
    }

    pub async fn snapshot(&self) -> Snapshot {
        let state = self.state.read().await;
        Snapshot {
            pointing: state.pointing.clone(),
            pi: state.pi.clone(),
            view: state.view.clone(),
            stack: state.stack.clone(),
            connection: state.connection.clone(),
        }
    }

    pub async fn set_pointing(&self, ra: f64, dec: f64) {
        let mut state = self.state.write().await;
        state.pointing = Pointing { ra: Some(ra), dec: Some(dec), updated_at: Some(SystemTime::now()) };
    }

    pub async fn set_pi_status(&self, focus_position: i64, battery_pct: f64, internal_temp_c: f64) {
        let mut state = self.state.write().await;
        state.pi = PiStatus {
            focus_position: Some(focus_position),
            battery_pct: Some(battery_pct),
            internal_temp_c: Some(internal_temp_c),
            updated_at: Some(SystemTime::now()),
        };
    }

    pub async fn set_view_mode(&self, view_mode: impl Into<String>) {
        let mut state = self.state.write().await;
        state.view = ViewState { view_mode: Some(view_mode.into()), updated_at: Some(SystemTime::now()) };
    }

    /// Whole-group replacement, mirroring `set_pi_status`: a device
    /// `StackingStatus` event carries the full counter triple, not a delta.
    pub async fn set_stack_counters(&self, stacked: u64, dropped: u64, skipped: u64) {
        let mut state = self.state.write().await;
        state.stack = StackCounters { stacked, dropped, skipped, updated_at: Some(SystemTime::now()) };
    }

    pub async fn record_stacked(&self) {
        let mut state = self.state.write().await;
        state.stack.stacked += 1;
        state.stack.updated_at = Some(SystemTime::now());
    }

    pub async fn record_dropped(&self) {
        let mut state = self.state.write().await;
        state.stack.dropped += 1;
        state.stack.updated_at = Some(SystemTime::now());
    }

    pub async fn record_skipped(&self) {
        let mut state = self.state.write().await;
        state.stack.skipped += 1;
        state.stack.updated_at = Some(SystemTime::now());
    }

    /// Cleared when a new streaming session starts.
    pub async fn reset_stack_counters(&self) {
        let mut state = self.state.write().await;
        state.stack = StackCounters { updated_at: Some(SystemTime::now()), ..Default::default() };
    }

    pub async fn set_control_connected(&self, connected: bool) {
        let mut state = self.state.write().await;
        state.connection.control_connected = connected;
        state.connection.updated_at = Some(SystemTime::now());
    }

    pub async fn set_imaging_connected(&self, connected: bool) {
        let mut state = self.state.write().await;
        state.connection.imaging_connected = connected;
        state.connection.updated_at = Some(SystemTime::now());
    }

    /// Dispatch a device/internal event into the relevant field group.
    /// Unrecognized kinds are ignored here -- the event still reaches bus
    /// subscribers regardless of whether the store understands it.
    pub async fn apply_event(&self, event: &Event) {
        match event.kind.as_str() {
            KIND_PI_STATUS => {
                let focus = event.payload.get("focus_position").and_then(|v| v.as_i64()).unwrap_or_default();
                let battery = event.payload.get("battery_pct").and_then(|v| v.as_f64()).unwrap_or_default();
                let temp = event.payload.get("internal_temp_c").and_then(|v| v.as_f64()).unwrap_or_default();
                self.set_pi_status(focus, battery, temp).await;
            }
            KIND_VIEW_STATE_CHANGED => {
                if let Some(mode) = event.payload.get("view_mode").and_then(|v| v.as_str()) {
                    self.set_view_mode(mode).await;
                }
            }
            KIND_STACKING_STATUS => {
                let stacked = event.payload.get("stacked").and_then(|v| v.as_u64()).unwrap_or_default();
                let dropped = event.payload.get("dropped").and_then(|v| v.as_u64()).unwrap_or_default();
                let skipped = event.payload.get("skipped").and_then(|v| v.as_u64()).unwrap_or_default();
                self.set_stack_counters(stacked, dropped, skipped).await;
            }
            KIND_FOCUSER_MOVE => {
                if let Some(pos) = event.payload.get("position").and_then(|v| v.as_i64()) {
                    let mut state = self.state.write().await;
                    state.pi.focus_position = Some(pos);
                    state.pi.updated_at = Some(SystemTime::now());
                }
            }
            KIND_INTERNAL_DISCONNECTED => {
                self.set_control_connected(false).await;
            }
            KIND_INTERNAL_RECONNECTED => {
                self.set_control_connected(true).await;
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn pointing_group_updates_atomically() {
        let store = StatusStore::new();
        store.set_pointing(1.0, 2.0).await;
        let snap = store.snapshot().await;
        assert_eq!(snap.pointing.ra, Some(1.0));
        assert_eq!(snap.pointing.dec, Some(2.0));
        assert!(snap.pointing.updated_at.is_some());
    }

    #[tokio::test]
    async fn disconnect_flips_control_connected_only() {
        let store = StatusStore::new();
        store.set_pointing(5.0, 6.0).await;
        store.apply_event(&Event::new(KIND_INTERNAL_DISCONNECTED, json!(null))).await;
        let snap = store.snapshot().await;
        assert!(!snap.connection.control_connected);
        assert_eq!(snap.pointing.ra, Some(5.0), "stale values are retained, not reset");
    }

    #[tokio::test]
    async fn reset_stack_counters_zeroes_all_three() {
        let store = StatusStore::new();
        store.record_stacked().await;
        store.record_dropped().await;
        store.record_skipped().await;
        store.reset_stack_counters().await;
        let snap = store.snapshot().await;
        assert_eq!(snap.stack.stacked, 0);
        assert_eq!(snap.stack.dropped, 0);
        assert_eq!(snap.stack.skipped, 0);
    }

    #[tokio::test]
    async fn stacking_status_event_updates_stack_group_not_pointing() {
        let store = StatusStore::new();
        store.set_pointing(1.0, 2.0).await;
        store
            .apply_event(&Event::new(KIND_STACKING_STATUS, json!({"stacked": 3, "dropped": 1, "skipped": 2})))
            .await;
        let snap = store.snapshot().await;
        assert_eq!(snap.stack.stacked, 3);
        assert_eq!(snap.stack.dropped, 1);
        assert_eq!(snap.stack.skipped, 2);
        assert_eq!(snap.pointing.ra, Some(1.0), "stacking status must not touch pointing");
        assert_eq!(snap.pointing.dec, Some(2.0));
    }

    #[tokio::test]
    async fn pi_status_event_updates_pi_group() {
        let store = StatusStore::new();
        store
            .apply_event(&Event::new(
                KIND_PI_STATUS,
                json!({"focus_position": 100, "battery_pct": 87.5, "internal_temp_c": 21.0}),
            ))
            .await;
        let snap = store.snapshot().await;
        assert_eq!(snap.pi.focus_position, Some(100));
        assert_eq!(snap.pi.battery_pct, Some(87.5));
    }
}
