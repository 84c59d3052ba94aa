use prometheus::{Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct ControllerMetrics {
    pub position_polls: IntCounter,
    pub status_polls: IntCounter,
    pub bus_errors: IntCounter,
    pub feedback_published: IntCounter,
    pub status_published: IntCounter,
    pub hardware_alerts: IntCounter,
    pub registered_servos: IntGauge,
}

fn counter(controller: &str, name: &str, help: &str) -> Result<IntCounter, String> {
    IntCounter::with_opts(Opts::new(name, help).const_label("controller", controller))
        .map_err(|e| format!("metrics init error: {e}"))
}

impl ControllerMetrics {
    /// Unregistered metrics for one controller.
    pub fn new(controller: &str) -> Result<Self, String> {
        Ok(Self {
            position_polls: counter(controller, "sr_servo_position_polls", "Position poll cycles run")?,
            status_polls: counter(controller, "sr_servo_status_polls", "Status poll cycles run")?,
            bus_errors: counter(controller, "sr_servo_bus_errors", "Failed bus transactions")?,
            feedback_published: counter(
                controller,
                "sr_servo_feedback_published",
                "Joint feedback messages published",
            )?,
            status_published: counter(
                controller,
                "sr_servo_status_published",
                "Servo status messages published",
            )?,
            hardware_alerts: counter(
                controller,
                "sr_servo_hardware_alerts",
                "Hardware alerts reported to the safety system",
            )?,
            registered_servos: IntGauge::with_opts(
                Opts::new("sr_servo_registered", "Servos registered with the controller")
                    .const_label("controller", controller),
            )
            .map_err(|e| format!("metrics init error: {e}"))?,
        })
    }
}

#[derive(Clone)]
pub struct MetricsHub {
    pub registry: Registry,
}

impl Default for MetricsHub {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsHub {
    pub fn new() -> Self {
        Self {
            registry: Registry::new(),
        }
    }

    /// Create and register the metrics for one controller.
    pub fn controller(&self, name: &str) -> Result<ControllerMetrics, String> {
        let m = ControllerMetrics::new(name)?;
        let collectors: [Box<dyn prometheus::core::Collector>; 7] = [
            Box::new(m.position_polls.clone()),
            Box::new(m.status_polls.clone()),
            Box::new(m.bus_errors.clone()),
            Box::new(m.feedback_published.clone()),
            Box::new(m.status_published.clone()),
            Box::new(m.hardware_alerts.clone()),
            Box::new(m.registered_servos.clone()),
        ];
        for c in collectors {
            self.registry
                .register(c)
                .map_err(|e| format!("metrics register error: {e}"))?;
        }
        Ok(m)
    }

    pub fn encode_text(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            return format!("error encoding metrics: {e}");
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_controllers_share_a_registry() {
        let hub = MetricsHub::new();
        let a = hub.controller("bus0").unwrap();
        let b = hub.controller("bus1").unwrap();
        a.bus_errors.inc();
        b.registered_servos.set(3);
        let text = hub.encode_text();
        assert!(text.contains("sr_servo_bus_errors{controller=\"bus0\"} 1"));
        assert!(text.contains("sr_servo_registered{controller=\"bus1\"} 3"));
    }

    #[test]
    fn test_duplicate_controller_is_rejected() {
        let hub = MetricsHub::new();
        assert!(hub.controller("bus0").is_ok());
        assert!(hub.controller("bus0").is_err());
    }
}
