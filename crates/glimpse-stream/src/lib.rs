//! Screencast streaming: the frame pipeline, control-handoff state
//! machine, step recording, and pipeline metrics.

pub mod control;
pub mod pipeline;
pub mod source;
pub mod stats;
pub mod steps;

pub use control::ControlState;
pub use pipeline::{Quality, ScreencastStreamer, SessionSource};
pub use source::DebuggerSource;
pub use stats::{StatsSnapshot, StreamingMode, StreamingStats};
pub use steps::{BrowserUpdatePublisher, StepRecorder, StepUpdate};
