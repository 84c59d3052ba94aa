use std::sync::Arc;
use tokio::sync::broadcast;

use crate::{ArmState, ComponentId, ReportedError};

/// Work a component needs done when the system disarms.
///
/// Hooks are held by the safety system itself, so they must carry every
/// piece of state they need and stay callable after the component that
/// registered them has gone away.
pub trait DisarmHook: Send + Sync {
    fn disarm(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// The interface components use to take part in arming and error reporting.
pub trait SafetySubsystem: Send + Sync {
    /// Register (or replace) the disarm hook for `component`.
    fn register(&self, component: ComponentId, hook: Arc<dyn DisarmHook>);

    fn report_error(&self, component: &ComponentId, error: ReportedError);

    fn is_armed(&self) -> bool;

    /// Receive every arm state transition from now on.
    fn subscribe(&self) -> broadcast::Receiver<ArmState>;
}
