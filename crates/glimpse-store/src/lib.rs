pub mod ranking;
pub mod run_events;
pub mod screenshots;

pub use ranking::{rank_failures, DriverReport, Judgement, RankedFailure};
pub use run_events::{RunEvent, RunEventConfig, RunEventKind, RunEventQuery, RunEventStore};
pub use screenshots::{
    NewScreenshot, Screenshot, ScreenshotKind, ScreenshotQuery, ScreenshotStore,
    ScreenshotStoreConfig,
};
