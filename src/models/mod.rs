pub mod loaders;
pub mod manifest;
pub mod params;
pub mod progress;
pub mod traffic;
pub mod units;

pub use loaders::load_params;
pub use manifest::{RunManifest, RunStatus, StageCounts, StageTiming};
pub use params::{ParamsSummary, PipelineParams};
pub use progress::{ProgressState, ProgressStatus};
pub use traffic::{
    BoundingRegion, NormalizedRecord, RecognizedValue, TextRegion, TrafficReading, TrafficRecord,
};
pub use units::{BandwidthUnit, TargetUnit};
