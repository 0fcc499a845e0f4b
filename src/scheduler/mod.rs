pub mod context;
pub mod run;
pub mod state;

pub use context::Context;
pub use run::{ActiveRun, QueuedRun, RunState};
pub use state::SchedulerState;
