//! Infrastructure shared by the library and the tools

pub mod cli;
pub mod error;
pub mod metrics;
pub mod shutdown;

pub use cli::{CommonArgs, EmulatorArgs, UnpackerArgs};
pub use error::{PipelineError, PipelineResult};
pub use metrics::{AtomicCounters, CounterSnapshot, RateSnapshot};
pub use shutdown::{setup_shutdown, ShutdownReceiver, ShutdownSender, ShutdownSignal};
