pub mod gate;
pub mod orchestrator;
pub mod plan;
pub mod result;

pub use gate::gated_extrema;
pub use orchestrator::{ScanEvent, ScanOrchestrator, ScanReport, ScanState, StopToken};
pub use plan::{MAX_SCAN_POINTS, PathPoint, ScanPath, ScanPlan};
pub use result::{PointStatus, ScanResult, ScanSample};
