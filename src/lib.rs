pub mod aggregate;
pub mod category;
pub mod config;
pub mod engine;
pub mod error;
pub mod geo;
pub mod model;
pub mod nodata;
pub mod patch;
pub mod pipeline;
pub mod points;
pub mod reachability;
pub mod reader;
pub mod units;
pub mod writer;

pub use aggregate::{aggregate, AggregationOptions};
pub use category::CategoryTable;
pub use config::{ExportConfig, NoDataPolicy, OutputMode, ResamplingMethod, ResolutionProfile};
pub use engine::{GdalGeoprocessor, Geoprocessor};
pub use error::{ExportError, Result};
pub use model::{Extent, GeoTransform, Layer, LayerKind, Raster};
pub use nodata::{NoDataSet, NoDataSpec};
pub use patch::{compute_patches, Patch, PatchPlanner};
pub use pipeline::{check_scratch_space, ensure_scratch_space, estimate_scratch_bytes, ExportSummary, Exporter, NoProgress, ProgressSink};
pub use units::Units;
pub use writer::{GeoTiffWriter, GridFileWriter, GridHeader};
