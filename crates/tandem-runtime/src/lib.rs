pub mod config;
pub mod emitter;
pub mod orchestrator;
pub mod registry;
pub mod storage;
pub mod timer_driver;
pub mod topology;

// Testing utilities - available when the "testing" feature is enabled or in test mode
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::{EngineConfig, TimerSection};
pub use emitter::{EventEmitter, EventListener, SubscriptionId};
pub use orchestrator::{Orchestrator, SchedulingPass, Transaction};
pub use registry::{ModelRegistry, RegisteredModel};
pub use storage::{MemoryStorage, PgStorage};
pub use timer_driver::{TimerDriver, TimerDriverConfig};
pub use topology::Topology;
