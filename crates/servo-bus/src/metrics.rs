use crate::packet::Reply;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

#[derive(Clone)]
pub struct BusMetrics {
    pub tx_frames: IntCounter,
    pub rx_frames: IntCounter,
    pub comm_failures: IntCounter,
    pub hardware_faults: IntCounter,
    pub devices_configured: IntGauge,
}

#[derive(Clone)]
pub struct MetricsHub {
    pub registry: Registry,
    pub bus: BusMetrics,
}

impl MetricsHub {
    pub fn new() -> Result<Self, String> {
        let registry = Registry::new();
        let counter = |name: &str, help: &str| {
            IntCounter::new(name, help).map_err(|e| e.to_string())
        };
        let tx_frames = counter("servo_tx_frames", "Total request packets sent")?;
        let rx_frames = counter("servo_rx_frames", "Total status packets received")?;
        let comm_failures = counter("servo_comm_failures", "Exchanges without a valid reply")?;
        let hardware_faults =
            counter("servo_hardware_faults", "Replies carrying a nonzero error byte")?;
        let devices_configured =
            IntGauge::new("servo_devices_configured", "Number of servos on the bus")
                .map_err(|e| e.to_string())?;
        let bus = BusMetrics {
            tx_frames,
            rx_frames,
            comm_failures,
            hardware_faults,
            devices_configured,
        };
        let _ = registry.register(Box::new(bus.tx_frames.clone()));
        let _ = registry.register(Box::new(bus.rx_frames.clone()));
        let _ = registry.register(Box::new(bus.comm_failures.clone()));
        let _ = registry.register(Box::new(bus.hardware_faults.clone()));
        let _ = registry.register(Box::new(bus.devices_configured.clone()));
        Ok(Self { registry, bus })
    }

    /// Count one exchange.
    pub fn observe(&self, reply: &Reply) {
        self.bus.tx_frames.inc();
        if reply.result.is_success() {
            self.bus.rx_frames.inc();
        } else {
            self.bus.comm_failures.inc();
        }
        if reply.error != 0 {
            self.bus.hardware_faults.inc();
        }
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
