//! Utilities: error types, logging setup, observability events, meters and metrics

pub mod error;
pub mod events;
pub mod logging;
pub mod meter;
pub mod metrics;

pub use error::{Result, SegmentationError};
pub use events::{EventSink, MemorySink, TracingSink, TrainingEvent};
pub use logging::init_logging;
pub use meter::RunningMeter;
pub use metrics::ConfusionHistogram;

/// Format a duration in a human-readable way
pub fn format_duration(seconds: f64) -> String {
    if seconds < 60.0 {
        format!("{:.1}s", seconds)
    } else if seconds < 3600.0 {
        let minutes = (seconds / 60.0).floor();
        let secs = seconds % 60.0;
        format!("{}m {:.0}s", minutes as u32, secs)
    } else {
        let hours = (seconds / 3600.0).floor();
        let minutes = ((seconds % 3600.0) / 60.0).floor();
        format!("{}h {}m", hours as u32, minutes as u32)
    }
}
