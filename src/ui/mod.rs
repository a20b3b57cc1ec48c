pub mod icons;
pub mod progress;

pub use progress::{RunProgress, StatusReport, print_status, print_summary, spawn_renderer};
