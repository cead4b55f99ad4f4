//! servo-bus: command path for serial bus servos
//!
//! Every bus operation goes through one FIFO [`CommandQueue`] that runs a single exchange
//! at a time with a fixed gap between frames. [`ServoController`] owns the queue and the
//! connection lifecycle; callers ask it for moves and watch the published
//! [`StatusSnapshot`].

pub mod protocol;
pub use protocol::{errbits, registers, CommResult, Instruction};

pub mod codec;

mod packet;
pub use packet::{build_request, build_status, parse_packet, PacketHandler, ReadReply, Reply};

mod types;
pub use types::*;

mod classify;
pub use classify::{classify, classify_and_record, FaultCause, Outcome, Severity};

mod registry;
pub use registry::{DeviceEntry, DeviceRegistry};

mod error;
pub use error::{Result, ServoError};

mod queue;
pub use queue::{CommandQueue, Ticket};

mod metrics;
pub use metrics::{BusMetrics, MetricsHub};

mod config;
pub use config::{load_config_file, BusConfig, DeviceConfig};

mod context;
pub use context::BusContext;

pub mod wheel;

mod lifecycle;
pub use lifecycle::ServoController;

#[cfg(feature = "sim")]
mod sim;

#[cfg(feature = "sim")]
pub use sim::{SimulatedServos, SIM_HOME_POSITION};
