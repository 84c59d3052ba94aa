//! Crash-safe torque release.
//!
//! A [`DisarmSnapshot`] is handed to the safety system whenever the set of
//! servos on a bus changes. It holds its own clone of the bus handle, so the
//! safety system can still release torque after the controller task is gone.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use servo_bus::{Param, ParamValue, ServoBus, ServoId};
use std::sync::Arc;
use std::time::Duration;

pub type SharedBus = Arc<Mutex<Box<dyn ServoBus>>>;

// A wedged driver must not hang the safety system.
const DISARM_LOCK_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisarmAction {
    /// Leave torque as it is.
    Hold,
    #[default]
    DisableTorque,
}

#[derive(Clone)]
pub struct DisarmSnapshot {
    pub bus: SharedBus,
    pub known_ids: Vec<ServoId>,
    pub action: DisarmAction,
}

impl std::fmt::Debug for DisarmSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DisarmSnapshot")
            .field("known_ids", &self.known_ids)
            .field("action", &self.action)
            .finish_non_exhaustive()
    }
}

/// Release torque on every known servo. Never fails: every problem is
/// logged and the remaining steps still run.
pub fn disarm(snapshot: &DisarmSnapshot) {
    if snapshot.action == DisarmAction::Hold || snapshot.known_ids.is_empty() {
        return;
    }
    let Some(mut bus) = snapshot.bus.try_lock_for(DISARM_LOCK_TIMEOUT) else {
        tracing::error!(
            servos = snapshot.known_ids.len(),
            "disarm: bus handle unavailable, torque left unchanged"
        );
        return;
    };
    if !bus.is_alive() {
        tracing::warn!("disarm: bus already stopped");
    }

    let torque_off: Vec<(ServoId, ParamValue)> = snapshot
        .known_ids
        .iter()
        .map(|id| (*id, ParamValue::Bool(false)))
        .collect();
    if let Err(e) = bus.bulk_write(Param::TorqueEnable, &torque_off) {
        tracing::error!("disarm: torque disable failed: {}", e);
    }

    let lock: Vec<(ServoId, ParamValue)> = snapshot
        .known_ids
        .iter()
        .map(|id| (*id, ParamValue::Bool(true)))
        .collect();
    if let Err(e) = bus.bulk_write(Param::Lock, &lock) {
        tracing::error!("disarm: lock failed: {}", e);
    }
    tracing::info!(servos = snapshot.known_ids.len(), "torque released");
}

impl safety_guard::DisarmHook for DisarmSnapshot {
    fn disarm(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        disarm(self);
        Ok(())
    }
}
