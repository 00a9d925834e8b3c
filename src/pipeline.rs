//! Export pipeline.
//!
//! [`Exporter`] takes one layer through the stages for its kind and writes the
//! patch files:
//!
//! - raster: no-data normalization, aggregation or resampling, reprojection
//!   to EPSG:4326, patches
//! - lines and polygons: geometry repair, reprojection, rasterization,
//!   no-data normalization, patches
//! - points: reprojection, per-cell counting, no-data normalization, patches
//! - reachability: one rasterization per road class folded into a graph file
//!
//! Progress is reported at 25/50/75/100 % and cancellation is checked at the
//! same points, between patches and between road classes.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::aggregate::{aggregate, AggregationOptions};
use crate::category::CategoryTable;
use crate::config::{resolve_cell_size, ExportConfig, OutputMode};
use crate::engine::{Burn, FeatureFilter, Geoprocessor, RasterizeRequest, VectorTable, WarpRequest};
use crate::error::{ExportError, Result};
use crate::geo::{meters_to_degrees_longitude, DEG_TO_KM};
use crate::model::{Extent, Layer, LayerKind, Raster};
use crate::nodata::{normalize_raster, NoDataSpec};
use crate::patch::{clip_to_data, PatchPlanner};
use crate::points::PointGrid;
use crate::reachability::{plan_classes, GraphState};
use crate::writer::{
    graph_file_name, grid_file_name, GraphFileWriter, GridFileWriter, GridMetadata, GridSuffix, LayerRegistry,
    Registration,
};

const OUTPUT_CRS: &str = "EPSG:4326";

/// Receives progress and answers cancellation requests.
pub trait ProgressSink {
    /// `percent` is in 0..=100.
    fn set_progress(&self, percent: f64);

    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Ignores progress and never cancels.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn set_progress(&self, _percent: f64) {}
}

/// Bytes of one Float64 intermediate raster covering `extent`.
pub fn estimate_scratch_bytes(extent: &Extent, cell_size: f64) -> u64 {
    if !(cell_size > 0.0) || extent.is_degenerate() {
        return 0;
    }
    let cols = (extent.width() / cell_size).ceil() as u64;
    let rows = (extent.height() / cell_size).ceil() as u64;
    cols * rows * 8
}

/// Extra free space required on top of the estimate, as a divisor (10 %).
pub const SCRATCH_MARGIN_DIVISOR: u64 = 10;

/// Fails with [`ExportError::Resource`] when `available` bytes cannot hold
/// the estimate plus margin.
pub fn check_scratch_space(required: u64, available: u64) -> Result<()> {
    let needed = required.saturating_add(required / SCRATCH_MARGIN_DIVISOR);
    if needed > available {
        return Err(ExportError::Resource(format!(
            "not enough disk space: {} MB needed, {} MB available",
            needed / 1_048_576,
            available / 1_048_576
        )));
    }
    Ok(())
}

/// Checks the free space of the volume holding `dir`.
pub fn ensure_scratch_space(dir: &Path, required: u64) -> Result<()> {
    let available = fs2::available_space(dir)?;
    debug!("{} bytes available in {}", available, dir.display());
    check_scratch_space(required, available)
}

/// Files written by one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExportSummary {
    pub files: Vec<PathBuf>,
    /// Patches without a single valid cell.
    pub skipped_patches: usize,
    pub registration: Option<Registration>,
}

pub struct Exporter<'a> {
    config: &'a ExportConfig,
    engine: &'a dyn Geoprocessor,
    progress: &'a dyn ProgressSink,
}

impl<'a> Exporter<'a> {
    pub fn new(config: &'a ExportConfig, engine: &'a dyn Geoprocessor) -> Self {
        Self {
            config,
            engine,
            progress: &NoProgress,
        }
    }

    pub fn with_progress(mut self, progress: &'a dyn ProgressSink) -> Self {
        self.progress = progress;
        self
    }

    pub fn export(&self, layer: &Layer) -> Result<ExportSummary> {
        self.config.validate(layer.kind)?;
        if layer.kind.is_vector() {
            self.check_field(layer)?;
        }
        let output_dir = self.config.output_dir();
        fs::create_dir_all(&output_dir)?;
        info!(
            "Exporting {} ({:?}) at {} resolution to {}",
            layer.name,
            layer.kind,
            self.config.resolution.label,
            output_dir.display()
        );

        let mut summary = match (layer.kind, self.config.mode) {
            (LayerKind::Raster, _) => self.export_raster(layer, &output_dir)?,
            (LayerKind::VectorPoint, _) => self.export_points(layer, &output_dir)?,
            (LayerKind::VectorLine, OutputMode::Reachability) => self.export_reachability(layer, &output_dir)?,
            (LayerKind::VectorLine | LayerKind::VectorPolygon, _) => self.export_vector(layer, &output_dir)?,
        };

        if self.config.mode == OutputMode::Grid {
            if let Some(registry) = LayerRegistry::find(&self.config.output_root) {
                summary.registration = Some(registry.register(&self.config.name, &self.config.group, self.config.color)?);
            }
        }
        info!("Done, {} files written", summary.files.len());
        Ok(summary)
    }

    fn checkpoint(&self, percent: f64) -> Result<()> {
        self.progress.set_progress(percent);
        self.ensure_not_cancelled()
    }

    fn ensure_not_cancelled(&self) -> Result<()> {
        if self.progress.is_cancelled() {
            info!("Export cancelled");
            return Err(ExportError::Cancelled);
        }
        Ok(())
    }

    fn field(&self) -> Result<&str> {
        self.config
            .field
            .as_deref()
            .ok_or_else(|| ExportError::config("a field name is required for vector layers"))
    }

    /// 出力前に属性がレイヤーにあるか確かめる
    fn check_field(&self, layer: &Layer) -> Result<()> {
        let field = self.field()?;
        let names = self.engine.field_names(&layer.path)?;
        if names.iter().any(|name| name == field) {
            return Ok(());
        }
        Err(ExportError::config(format!(
            "field {} not found in {} (available: {})",
            field,
            layer.path.display(),
            names.join(", ")
        )))
    }

    fn no_data_spec(&self) -> NoDataSpec {
        NoDataSpec::new(self.config.no_data_values.clone(), self.config.no_data_tokens.clone())
    }

    fn export_raster(&self, layer: &Layer, output_dir: &Path) -> Result<ExportSummary> {
        let config = self.config;
        let profile = &config.resolution;
        let loaded = self.engine.load_raster(&layer.path, config.band)?;

        // カテゴリはno-dataトークンの解決より先
        let categories = match config.field.as_deref() {
            Some(field) => CategoryTable::from_sidecar(&layer.path, field, &config.no_data_tokens)?,
            None => None,
        };
        let sentinels = self.no_data_spec().with_declared(loaded.no_data).resolve(categories.as_ref());
        let mut raster = normalize_raster(loaded.raster.normalized(), &sentinels);
        if raster.crs.is_none() {
            raster.crs = layer.crs.clone();
        }
        self.checkpoint(25.0)?;

        let source_cell = raster.transform.cell_width;
        let geographic = raster.is_geographic();
        let requested = match (geographic, profile.is_metric()) {
            (true, _) => profile.cell_size_degrees(),
            (false, true) => profile.cell_size,
            // 度の段階を投影座標系の入力に当てる場合はメートルに直す
            (false, false) => profile.cell_size * DEG_TO_KM * 1000.0,
        };
        let cell_size = resolve_cell_size(requested, source_cell, config.keep_same_resolution, config.prevent_higher_resolution);
        let cell_size_degrees = if geographic {
            cell_size
        } else {
            meters_to_degrees_longitude(cell_size)
        };

        let method = config.resampling;
        let prepared = if method.is_aggregation() {
            debug!("Aggregating {} -> {} in source units", source_cell, cell_size);
            aggregate(&raster, cell_size, &AggregationOptions::from_config(config))?
        } else {
            raster
        };
        self.checkpoint(50.0)?;

        let already_output = prepared.is_geographic()
            && (prepared.transform.cell_width - cell_size_degrees).abs() <= 1e-12 * cell_size_degrees.max(1.0);
        let output = if already_output {
            prepared
        } else {
            self.engine.warp(&WarpRequest {
                raster: &prepared,
                target_crs: OUTPUT_CRS,
                cell_size: Some(cell_size_degrees),
                method,
            })?
        };
        let output = output.normalized();
        self.checkpoint(75.0)?;

        let summary = self.write_patches(&output, categories.as_ref(), output_dir)?;
        self.checkpoint(100.0)?;
        Ok(summary)
    }

    fn prepare_vector(&self, layer: &Layer, repair: bool) -> Result<(PathBuf, VectorTable)> {
        let source = if repair && self.config.fix_geometry {
            self.engine.fix_geometries(&layer.path)?
        } else {
            layer.path.clone()
        };
        let reprojected = self.engine.reproject_vector(&source, OUTPUT_CRS)?;
        let table = self.engine.read_features(&reprojected, self.field()?)?;
        debug!("{} features in {}", table.features.len(), layer.name);
        Ok((reprojected, table))
    }

    fn export_vector(&self, layer: &Layer, output_dir: &Path) -> Result<ExportSummary> {
        let field = self.field()?;
        let cell = self.config.resolution.cell_size_degrees();
        // 自治体予算データはジオメトリ修正をしない
        let repair = self.config.mode != OutputMode::MunicipalBudget;
        let (source, table) = self.prepare_vector(layer, repair)?;
        self.checkpoint(25.0)?;

        let extent = match layer.kind {
            LayerKind::VectorLine => table.extent.expanded(cell),
            _ => table.extent,
        };
        let categories = (!table.field_is_numeric()).then(|| CategoryTable::from_values(table.raw_values()));
        let raster = match &categories {
            None => self.engine.rasterize(&RasterizeRequest {
                source: &source,
                burn: Burn::Field(field.to_string()),
                filter: None,
                cell_size: cell,
                extent,
                init_value: f64::NAN,
            })?,
            Some(table_of_categories) => self.rasterize_categories(&source, &table, table_of_categories, field, cell, extent)?,
        };
        self.checkpoint(50.0)?;

        let sentinels = self.no_data_spec().resolve(categories.as_ref());
        let raster = normalize_raster(raster.normalized(), &sentinels);
        self.checkpoint(75.0)?;

        let summary = self.write_patches(&raster, categories.as_ref(), output_dir)?;
        self.checkpoint(100.0)?;
        Ok(summary)
    }

    /// One rasterization per category, burning its id.
    fn rasterize_categories(
        &self,
        source: &Path,
        table: &VectorTable,
        categories: &CategoryTable,
        field: &str,
        cell: f64,
        extent: Extent,
    ) -> Result<Raster> {
        let raw_values = table.raw_values();
        let mut merged: Option<Raster> = None;
        for (name, id) in categories.entries() {
            let mut matching: Vec<String> = raw_values
                .iter()
                .filter(|raw| categories.id_of(raw) == Some(id))
                .cloned()
                .collect();
            matching.sort();
            matching.dedup();
            debug!("Rasterizing category {} ({})", name, id);

            let layer = self.engine.rasterize(&RasterizeRequest {
                source,
                burn: Burn::Value(f64::from(id)),
                filter: Some(FeatureFilter::include(field, matching)),
                cell_size: cell,
                extent,
                init_value: f64::NAN,
            })?;
            merged = Some(match merged {
                None => layer,
                Some(mut acc) => {
                    if acc.shape() != layer.shape() {
                        return Err(ExportError::Engine(format!(
                            "category {} was rasterized to a different grid",
                            name
                        )));
                    }
                    for (cell_value, value) in acc.values.iter_mut().zip(&layer.values) {
                        if !value.is_nan() {
                            *cell_value = *value;
                        }
                    }
                    acc
                }
            });
        }
        merged.ok_or_else(|| ExportError::Format(format!("field {} has no values", field)))
    }

    fn export_points(&self, layer: &Layer, output_dir: &Path) -> Result<ExportSummary> {
        let cell = self.config.resolution.cell_size_degrees();
        let (_, table) = self.prepare_vector(layer, false)?;
        self.checkpoint(25.0)?;

        let grid = PointGrid::covering(&table.extent, cell);
        let spec = self.no_data_spec();
        if table.field_is_numeric() {
            let means = grid.mean(&table, &spec);
            self.checkpoint(50.0)?;
            let raster = normalize_raster(means, &spec.resolve(None));
            self.checkpoint(75.0)?;
            let summary = self.write_patches(&raster, None, output_dir)?;
            self.checkpoint(100.0)?;
            return Ok(summary);
        }

        let categories = CategoryTable::from_values(
            table.raw_values().into_iter().filter(|raw| !spec.matches_token(raw)),
        );
        let layers = grid.count_by_category(&table, &categories, &spec);
        self.checkpoint(50.0)?;
        self.checkpoint(75.0)?;
        let summary = self.write_multi_patches(&layers, &categories, output_dir)?;
        self.checkpoint(100.0)?;
        Ok(summary)
    }

    fn export_reachability(&self, layer: &Layer, output_dir: &Path) -> Result<ExportSummary> {
        info!("Working on reachability data");
        let field = self.field()?;
        let profile = &self.config.resolution;
        let fine_cell = profile.cell_size_degrees() / crate::reachability::SUBCELLS as f64;
        let (source, table) = self.prepare_vector(layer, false)?;

        let path = output_dir.join(graph_file_name(self.config));
        let mut writer = GraphFileWriter::create(&path)?;
        let classes = plan_classes(&self.config.network_map, field);
        let step = 100.0 / classes.len() as f64;

        classes.iter().enumerate().try_fold(GraphState::new(), |state, (i, class)| {
            let fine = self.engine.rasterize(&RasterizeRequest {
                source: &source,
                burn: Burn::Value(1.0),
                filter: Some(class.filter.clone()),
                cell_size: fine_cell,
                extent: table.extent,
                init_value: f64::NAN,
            })?;
            let (next, edges) = state.step(class, fine.normalized(), profile.cell_size);
            writer.append(&edges)?;
            info!("{} links written for class {} ({})", edges.len(), class.name, class.code);
            self.checkpoint((i + 1) as f64 * step)?;
            Ok::<_, ExportError>(next)
        })?;

        Ok(ExportSummary {
            files: vec![path],
            ..ExportSummary::default()
        })
    }

    /// Clips the raster to each patch and writes the patch files.
    fn write_patches(&self, raster: &Raster, categories: Option<&CategoryTable>, output_dir: &Path) -> Result<ExportSummary> {
        let cell = raster.transform.cell_width;
        let planner = PatchPlanner::for_profile(&self.config.resolution, cell);
        let patches = planner.plan(&raster.extent(), Some(cell));
        if patches.is_empty() {
            info!("Layer extent is empty, nothing to export");
        }

        let metadata = GridMetadata::from_config(self.config, categories, false);
        let writer = GridFileWriter::new();
        let mut summary = ExportSummary::default();
        for patch in &patches {
            self.ensure_not_cancelled()?;
            let Some(clipped) = self.clip_patch(raster, &patch.extent)? else {
                info!("Skipping patch {}, it only contains no data", patch.index);
                summary.skipped_patches += 1;
                continue;
            };
            let path = output_dir.join(grid_file_name(self.config, patch.index, GridSuffix::Grid));
            writer.write(&path, &clipped, &clipped.extent(), &metadata)?;
            info!("File patch {} generated for {}", patch.index, self.config.location);
            summary.files.push(path);
        }
        Ok(summary)
    }

    fn write_multi_patches(&self, layers: &[Raster], categories: &CategoryTable, output_dir: &Path) -> Result<ExportSummary> {
        let Some(first) = layers.first() else {
            warn!("No categories to export");
            return Ok(ExportSummary::default());
        };
        let cell = first.transform.cell_width;
        let patches = PatchPlanner::for_profile(&self.config.resolution, cell).plan(&first.extent(), Some(cell));

        let metadata = GridMetadata::from_config(self.config, Some(categories), false);
        let writer = GridFileWriter::new();
        let mut summary = ExportSummary::default();
        for patch in &patches {
            self.ensure_not_cancelled()?;
            let clipped = layers
                .iter()
                .map(|layer| self.engine.clip(layer, &patch.extent))
                .collect::<Result<Vec<_>>>()?;
            if clipped.iter().any(|layer| layer.cols == 0 || layer.rows == 0) {
                summary.skipped_patches += 1;
                continue;
            }
            let path = output_dir.join(grid_file_name(self.config, patch.index, GridSuffix::Multi));
            writer.write_multi(&path, &clipped, &clipped[0].extent(), &metadata)?;
            info!("File patch {} generated for {}", patch.index, self.config.location);
            summary.files.push(path);
        }
        Ok(summary)
    }

    /// `None` when the patch holds no valid cell.
    fn clip_patch(&self, raster: &Raster, extent: &Extent) -> Result<Option<Raster>> {
        let extent = if self.config.clip_to_data {
            match clip_to_data(raster, extent) {
                Some(data_extent) => data_extent,
                None => return Ok(None),
            }
        } else {
            *extent
        };
        let clipped = self.engine.clip(raster, &extent)?;
        if clipped.cols == 0 || clipped.rows == 0 || !clipped.has_valid_cells() {
            return Ok(None);
        }
        Ok(Some(clipped))
    }
}
