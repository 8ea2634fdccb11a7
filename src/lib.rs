pub mod acquisition;
pub mod axis;
pub mod config;
pub mod error;
pub mod grid;
pub mod humidity;
pub mod scan;
pub mod stage;
pub mod store;

pub use acquisition::{AcquisitionClient, AcquisitionClientBuilder, AcquisitionConfig, PulseSource};
pub use axis::{
    Axis, AxisController, AxisLink, AxisSettings, Command, CommandTimeouts, ConnectionState,
    Direction, Frame, Opcode, SerialLink,
};
pub use config::{AppConfig, load_config, load_config_or_default};
pub use error::{AcqError, ConnectionError, MotionError, ScanError, StoreError};
pub use grid::{Reconstruction, reconstruct};
pub use humidity::{HumiditySource, NoHumiditySensor, SharedHumidity};
pub use scan::{
    PointStatus, ScanEvent, ScanOrchestrator, ScanPlan, ScanReport, ScanResult, ScanSample,
    ScanState, StopToken,
};
pub use stage::{MoveOutcome, Positioner, Stage, StagePosition};
