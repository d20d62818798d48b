pub mod catalog;
pub mod engine;
pub mod fallback;
pub mod handlers;
pub mod state;
pub mod traits;
pub mod types;

pub use catalog::{Fetch, PointSpec, POINTS};
pub use engine::{
    PollEngine, PollEngineBuilder, PollHandle, PollStopper, DEFAULT_MAX_CONSECUTIVE_FAILURES,
};
pub use fallback::WaveformSource;
pub use handlers::FlumePollHandler;
pub use state::{PollConfig, PollConfigUpdate, WorkerStatus};
pub use traits::{FallbackSource, NoOpHandler, PollHandler};
pub use types::{BatchSource, Notice, NoticeKind, PollCycleResult, PollEvent};
