use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::broadcast;

use crate::{
    ArmState, ComponentId, DisarmHook, DisarmReport, ReportedError, SafetyEvent, SafetyEventType,
    SafetySubsystem, ViolationSeverity,
};

const EVENT_LOG_CAPACITY: usize = 1024;
const TRANSITION_CHANNEL_CAPACITY: usize = 16;

type EventCallback = Box<dyn Fn(&SafetyEvent) + Send + Sync>;

/// In-process safety system: holds the arm state, every component's disarm
/// hook and a bounded log of safety events.
pub struct SafetyRegistry {
    state: RwLock<ArmState>,
    hooks: RwLock<BTreeMap<ComponentId, Arc<dyn DisarmHook>>>,
    events: Mutex<VecDeque<SafetyEvent>>,
    event_callback: RwLock<Option<EventCallback>>,
    transitions: broadcast::Sender<ArmState>,
}

impl Default for SafetyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SafetyRegistry {
    pub fn new() -> Self {
        let (transitions, _) = broadcast::channel(TRANSITION_CHANNEL_CAPACITY);
        Self {
            state: RwLock::new(ArmState::Disarmed),
            hooks: RwLock::new(BTreeMap::new()),
            events: Mutex::new(VecDeque::with_capacity(EVENT_LOG_CAPACITY)),
            event_callback: RwLock::new(None),
            transitions,
        }
    }

    pub fn state(&self) -> ArmState {
        *self.state.read()
    }

    /// Arm the system. Arming an armed system is a no-op.
    ///
    /// The transition is queued before the lock is released, so anyone who
    /// observes `is_armed()` also finds `Armed` waiting on their receiver.
    pub fn arm(&self) {
        {
            let mut state = self.state.write();
            if *state == ArmState::Armed {
                return;
            }
            *state = ArmState::Armed;
            let _ = self.transitions.send(ArmState::Armed);
        }
        tracing::info!("system armed");
        self.record(SafetyEvent {
            timestamp: SystemTime::now(),
            event_type: SafetyEventType::Armed,
            component: None,
            message: "system armed".to_string(),
            severity: ViolationSeverity::Warning,
            context: HashMap::new(),
        });
    }

    /// Disarm the system and run every registered hook.
    ///
    /// Hooks run even when the system is already disarmed, so this doubles
    /// as the crash path: a supervisor may call it after a component died.
    pub fn disarm(&self) -> DisarmReport {
        {
            let mut state = self.state.write();
            *state = ArmState::Disarmed;
            let _ = self.transitions.send(ArmState::Disarmed);
        }
        let hooks: Vec<(ComponentId, Arc<dyn DisarmHook>)> = self
            .hooks
            .read()
            .iter()
            .map(|(id, hook)| (id.clone(), hook.clone()))
            .collect();

        let mut report = DisarmReport::default();
        for (component, hook) in hooks {
            report.hooks_run += 1;
            if let Err(e) = hook.disarm() {
                tracing::error!("disarm hook for {} failed: {}", component, e);
                self.record(SafetyEvent {
                    timestamp: SystemTime::now(),
                    event_type: SafetyEventType::DisarmHookFailed,
                    component: Some(component.clone()),
                    message: e.to_string(),
                    severity: ViolationSeverity::Critical,
                    context: HashMap::new(),
                });
                report.failed.push(component);
            }
        }

        tracing::info!(hooks = report.hooks_run, "system disarmed");
        self.record(SafetyEvent {
            timestamp: SystemTime::now(),
            event_type: SafetyEventType::Disarmed,
            component: None,
            message: "system disarmed".to_string(),
            severity: ViolationSeverity::Warning,
            context: HashMap::new(),
        });
        report
    }

    pub fn registered(&self) -> Vec<ComponentId> {
        self.hooks.read().keys().cloned().collect()
    }

    /// Errors reported by `component`, oldest first.
    pub fn errors_for(&self, component: &ComponentId) -> Vec<SafetyEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| {
                e.event_type == SafetyEventType::ErrorReported
                    && e.component.as_ref() == Some(component)
            })
            .cloned()
            .collect()
    }

    pub fn set_event_callback<F>(&self, callback: F)
    where
        F: Fn(&SafetyEvent) + Send + Sync + 'static,
    {
        *self.event_callback.write() = Some(Box::new(callback));
    }

    fn record(&self, event: SafetyEvent) {
        if let Some(callback) = self.event_callback.read().as_ref() {
            callback(&event);
        }
        let mut events = self.events.lock();
        if events.len() == EVENT_LOG_CAPACITY {
            events.pop_front();
        }
        events.push_back(event);
    }
}

impl SafetySubsystem for SafetyRegistry {
    fn register(&self, component: ComponentId, hook: Arc<dyn DisarmHook>) {
        let replaced = self.hooks.write().insert(component.clone(), hook).is_some();
        if !replaced {
            tracing::debug!("registered safety component {}", component);
            self.record(SafetyEvent {
                timestamp: SystemTime::now(),
                event_type: SafetyEventType::ComponentRegistered,
                component: Some(component),
                message: "component registered".to_string(),
                severity: ViolationSeverity::Warning,
                context: HashMap::new(),
            });
        }
    }

    fn report_error(&self, component: &ComponentId, error: ReportedError) {
        tracing::warn!(
            "{} reported {} ({:?}): {}",
            component,
            error.kind,
            error.severity,
            error.message
        );
        self.record(SafetyEvent {
            timestamp: SystemTime::now(),
            event_type: SafetyEventType::ErrorReported,
            component: Some(component.clone()),
            message: format!("{}: {}", error.kind, error.message),
            severity: error.severity,
            context: error.context,
        });
    }

    fn is_armed(&self) -> bool {
        self.state() == ArmState::Armed
    }

    fn subscribe(&self) -> broadcast::Receiver<ArmState> {
        self.transitions.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHook {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    impl DisarmHook for CountingHook {
        fn disarm(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err("bus unplugged".into());
            }
            Ok(())
        }
    }

    fn component(name: &str) -> ComponentId {
        ComponentId::new("robot", ["controller", name])
    }

    #[test]
    fn test_register_is_idempotent() {
        let registry = SafetyRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            registry.register(
                component("a"),
                Arc::new(CountingHook {
                    calls: calls.clone(),
                    fail: false,
                }),
            );
        }
        assert_eq!(registry.registered().len(), 1);
        registry.disarm();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_disarm_runs_every_hook_even_if_one_fails() {
        let registry = SafetyRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        registry.register(
            component("a"),
            Arc::new(CountingHook {
                calls: calls.clone(),
                fail: true,
            }),
        );
        registry.register(
            component("b"),
            Arc::new(CountingHook {
                calls: calls.clone(),
                fail: false,
            }),
        );
        registry.arm();
        let report = registry.disarm();
        assert_eq!(report.hooks_run, 2);
        assert_eq!(report.failed, vec![component("a")]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!registry.is_armed());
    }

    #[tokio::test]
    async fn test_transitions_are_broadcast() {
        let registry = SafetyRegistry::new();
        let mut rx = registry.subscribe();
        registry.arm();
        registry.arm();
        registry.disarm();
        assert_eq!(rx.recv().await.unwrap(), ArmState::Armed);
        assert_eq!(rx.recv().await.unwrap(), ArmState::Disarmed);
    }

    #[test]
    fn test_armed_state_implies_queued_transition() {
        let registry = SafetyRegistry::new();
        let mut rx = registry.subscribe();
        registry.arm();
        assert!(registry.is_armed());
        assert_eq!(rx.try_recv().unwrap(), ArmState::Armed);
        registry.disarm();
        assert!(!registry.is_armed());
        assert_eq!(rx.try_recv().unwrap(), ArmState::Disarmed);
    }

    #[test]
    fn test_errors_are_logged_per_component() {
        let registry = SafetyRegistry::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        registry.set_event_callback(move |event| {
            if event.event_type == SafetyEventType::ErrorReported {
                seen_clone.fetch_add(1, Ordering::SeqCst);
            }
        });
        registry.report_error(
            &component("a"),
            ReportedError {
                kind: "hardware_alert".to_string(),
                severity: ViolationSeverity::Critical,
                message: "overload".to_string(),
                context: HashMap::new(),
            },
        );
        assert_eq!(registry.errors_for(&component("a")).len(), 1);
        assert!(registry.errors_for(&component("b")).is_empty());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
