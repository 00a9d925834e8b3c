//! Geoprocessing engine boundary.
//!
//! Reprojection, rasterization, warping and geometry repair are delegated to
//! an engine behind the [`Geoprocessor`] trait. The exporter only passes
//! in-memory rasters and file paths across it. [`GdalGeoprocessor`] drives the
//! GDAL command-line programs and reads their output back with the `gdal`
//! crate.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{bail, Context};
use tempfile::TempDir;
use tracing::debug;

use crate::config::ResamplingMethod;
use crate::error::Result;
use crate::model::{Extent, Raster};
use crate::reader::{self, RasterReader};
use crate::writer::GeoTiffWriter;

/// Attribute value of a feature.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Number(f64),
    Text(String),
    Null,
}

impl FieldValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            FieldValue::Number(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Integral numbers print without a fractional part.
    pub fn to_text(&self) -> String {
        match self {
            FieldValue::Number(v) => format!("{}", v),
            FieldValue::Text(s) => s.clone(),
            FieldValue::Null => String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VectorFeature {
    /// First vertex, used for point layers.
    pub point: Option<(f64, f64)>,
    pub value: FieldValue,
}

/// Features of one layer together with the field that is exported.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorTable {
    pub extent: Extent,
    pub features: Vec<VectorFeature>,
}

impl VectorTable {
    /// Numeric fields are exported as values, everything else as categories.
    pub fn field_is_numeric(&self) -> bool {
        self.features
            .iter()
            .filter(|f| !f.value.is_null())
            .all(|f| matches!(f.value, FieldValue::Number(_)))
    }

    pub fn raw_values(&self) -> Vec<String> {
        self.features
            .iter()
            .filter(|f| !f.value.is_null())
            .map(|f| f.value.to_text())
            .collect()
    }
}

/// Selects features by the text of one attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureFilter {
    pub field: String,
    pub values: Vec<String>,
    /// Keep features whose value is *not* listed.
    pub exclude: bool,
}

impl FeatureFilter {
    pub fn include(field: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            field: field.into(),
            values,
            exclude: false,
        }
    }

    pub fn exclude(field: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            field: field.into(),
            values,
            exclude: true,
        }
    }

    pub fn matches(&self, value: &FieldValue) -> bool {
        let listed = !value.is_null() && self.values.iter().any(|v| *v == value.to_text());
        listed != self.exclude
    }

    /// OGR SQL `WHERE` clause.
    pub fn to_sql(&self) -> String {
        let field = format!("\"{}\"", self.field.replace('"', "\"\""));
        if self.values.is_empty() {
            return if self.exclude { "1 = 1".to_string() } else { "1 = 0".to_string() };
        }
        let list = self
            .values
            .iter()
            .map(|v| format!("'{}'", v.replace('\'', "''")))
            .collect::<Vec<_>>()
            .join(", ");
        if self.exclude {
            format!("{field} IS NULL OR {field} NOT IN ({list})")
        } else {
            format!("{field} IN ({list})")
        }
    }
}

/// Value written into the cells a feature covers.
#[derive(Debug, Clone, PartialEq)]
pub enum Burn {
    Field(String),
    Value(f64),
}

#[derive(Debug, Clone)]
pub struct RasterizeRequest<'a> {
    /// Vector dataset already in EPSG:4326.
    pub source: &'a Path,
    pub burn: Burn,
    pub filter: Option<FeatureFilter>,
    pub cell_size: f64,
    pub extent: Extent,
    /// Value of cells no feature touches.
    pub init_value: f64,
}

#[derive(Debug, Clone)]
pub struct WarpRequest<'a> {
    pub raster: &'a Raster,
    pub target_crs: &'a str,
    /// `None` lets the engine keep an equivalent resolution.
    pub cell_size: Option<f64>,
    pub method: ResamplingMethod,
}

/// A raster band read from disk.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedRaster {
    pub raster: Raster,
    pub no_data: Option<f64>,
}

pub trait Geoprocessor {
    fn load_raster(&self, path: &Path, band: usize) -> Result<LoadedRaster>;

    /// Attribute names of the first layer.
    fn field_names(&self, path: &Path) -> Result<Vec<String>>;

    fn read_features(&self, path: &Path, field: &str) -> Result<VectorTable>;

    fn reproject_vector(&self, path: &Path, target_crs: &str) -> Result<PathBuf>;

    fn fix_geometries(&self, path: &Path) -> Result<PathBuf>;

    fn rasterize(&self, request: &RasterizeRequest<'_>) -> Result<Raster>;

    fn warp(&self, request: &WarpRequest<'_>) -> Result<Raster>;

    fn clip(&self, raster: &Raster, extent: &Extent) -> Result<Raster> {
        Ok(raster.clip(extent))
    }
}

/// Engine backed by the GDAL utilities (`ogr2ogr`, `gdal_rasterize`, `gdalwarp`).
pub struct GdalGeoprocessor {
    scratch: TempDir,
    counter: AtomicUsize,
}

impl GdalGeoprocessor {
    pub fn new() -> Result<Self> {
        let scratch = tempfile::Builder::new().prefix("urscape-export").tempdir()?;
        debug!("Using scratch directory {}", scratch.path().display());
        Ok(Self {
            scratch,
            counter: AtomicUsize::new(0),
        })
    }

    pub fn scratch_dir(&self) -> &Path {
        self.scratch.path()
    }

    fn scratch_path(&self, stem: &str, extension: &str) -> PathBuf {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        self.scratch.path().join(format!("{}_{}.{}", stem, n, extension))
    }

    fn run(&self, program: &str, args: &[String]) -> anyhow::Result<()> {
        debug!("Running {} {}", program, args.join(" "));
        let output = Command::new(program)
            .args(args)
            .output()
            .with_context(|| format!("Failed to start {}", program))?;
        if !output.status.success() {
            bail!(
                "{} exited with {}: {}",
                program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn number_arg(value: f64) -> String {
    if value.is_nan() {
        "nan".to_string()
    } else {
        value.to_string()
    }
}

impl Geoprocessor for GdalGeoprocessor {
    fn load_raster(&self, path: &Path, band: usize) -> Result<LoadedRaster> {
        Ok(RasterReader::new(band).read(path)?)
    }

    fn field_names(&self, path: &Path) -> Result<Vec<String>> {
        Ok(reader::field_names(path)?)
    }

    fn read_features(&self, path: &Path, field: &str) -> Result<VectorTable> {
        Ok(reader::read_vector_table(path, field)?)
    }

    fn reproject_vector(&self, path: &Path, target_crs: &str) -> Result<PathBuf> {
        let output = self.scratch_path("reprojected", "gpkg");
        let args = vec![
            "-f".to_string(),
            "GPKG".to_string(),
            "-t_srs".to_string(),
            target_crs.to_string(),
            path_arg(&output),
            path_arg(path),
        ];
        self.run("ogr2ogr", &args)
            .with_context(|| format!("Failed to reproject {} to {}", path.display(), target_crs))?;
        Ok(output)
    }

    fn fix_geometries(&self, path: &Path) -> Result<PathBuf> {
        let output = self.scratch_path("fixed", "gpkg");
        let args = vec![
            "-f".to_string(),
            "GPKG".to_string(),
            "-makevalid".to_string(),
            path_arg(&output),
            path_arg(path),
        ];
        self.run("ogr2ogr", &args)
            .with_context(|| format!("Failed to fix geometries of {}", path.display()))?;
        Ok(output)
    }

    fn rasterize(&self, request: &RasterizeRequest<'_>) -> Result<Raster> {
        let output = self.scratch_path("rasterized", "tif");
        let layer = reader::first_layer_name(request.source)?;
        let extent = &request.extent;

        let mut args = vec!["-l".to_string(), layer];
        match &request.burn {
            Burn::Field(field) => args.extend(["-a".to_string(), field.clone()]),
            Burn::Value(value) => args.extend(["-burn".to_string(), number_arg(*value)]),
        }
        if let Some(filter) = &request.filter {
            args.extend(["-where".to_string(), filter.to_sql()]);
        }
        args.extend([
            "-tr".to_string(),
            request.cell_size.to_string(),
            request.cell_size.to_string(),
            "-te".to_string(),
            extent.west.to_string(),
            extent.south.to_string(),
            extent.east.to_string(),
            extent.north.to_string(),
            "-init".to_string(),
            number_arg(request.init_value),
            "-a_nodata".to_string(),
            "nan".to_string(),
            "-ot".to_string(),
            "Float64".to_string(),
            "-of".to_string(),
            "GTiff".to_string(),
            path_arg(request.source),
            path_arg(&output),
        ]);
        self.run("gdal_rasterize", &args)
            .with_context(|| format!("Failed to rasterize {}", request.source.display()))?;
        Ok(RasterReader::new(1).read(&output)?.raster)
    }

    fn warp(&self, request: &WarpRequest<'_>) -> Result<Raster> {
        let input = self.scratch_path("warp_input", "tif");
        let output = self.scratch_path("warped", "tif");
        GeoTiffWriter::new().write(request.raster, &input)?;

        let mut args = vec![
            "-overwrite".to_string(),
            "-t_srs".to_string(),
            request.target_crs.to_string(),
            "-r".to_string(),
            request.method.gdal_name().to_string(),
            "-srcnodata".to_string(),
            "nan".to_string(),
            "-dstnodata".to_string(),
            "nan".to_string(),
            "-ot".to_string(),
            "Float64".to_string(),
        ];
        if let Some(cell_size) = request.cell_size {
            args.extend(["-tr".to_string(), cell_size.to_string(), cell_size.to_string()]);
        }
        args.extend([path_arg(&input), path_arg(&output)]);
        self.run("gdalwarp", &args)
            .with_context(|| format!("Failed to warp raster to {}", request.target_crs))?;
        Ok(RasterReader::new(1).read(&output)?.raster)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_matches() {
        let filter = FeatureFilter::include("highway", vec!["motorway".to_string(), "trunk".to_string()]);
        assert!(filter.matches(&FieldValue::Text("trunk".to_string())));
        assert!(!filter.matches(&FieldValue::Text("primary".to_string())));
        assert!(!filter.matches(&FieldValue::Null));

        let other = FeatureFilter::exclude("highway", vec!["motorway".to_string()]);
        assert!(other.matches(&FieldValue::Text("residential".to_string())));
        assert!(other.matches(&FieldValue::Null));
        assert!(!other.matches(&FieldValue::Text("motorway".to_string())));
    }

    #[test]
    fn test_filter_sql() {
        let filter = FeatureFilter::include("name", vec!["O'Hare".to_string(), "x".to_string()]);
        assert_eq!(filter.to_sql(), "\"name\" IN ('O''Hare', 'x')");

        let other = FeatureFilter::exclude("highway", vec!["footway".to_string()]);
        assert_eq!(
            other.to_sql(),
            "\"highway\" IS NULL OR \"highway\" NOT IN ('footway')"
        );
    }

    #[test]
    fn test_numeric_field_detection() {
        let extent = Extent::new(0.0, 0.0, 1.0, 1.0);
        let numeric = VectorTable {
            extent,
            features: vec![
                VectorFeature {
                    point: None,
                    value: FieldValue::Number(1.0),
                },
                VectorFeature {
                    point: None,
                    value: FieldValue::Null,
                },
            ],
        };
        assert!(numeric.field_is_numeric());
        assert_eq!(numeric.raw_values(), vec!["1".to_string()]);

        let mut mixed = numeric.clone();
        mixed.features.push(VectorFeature {
            point: None,
            value: FieldValue::Text("a".to_string()),
        });
        assert!(!mixed.field_is_numeric());
    }

    #[test]
    fn test_number_text_has_no_trailing_zero() {
        assert_eq!(FieldValue::Number(3.0).to_text(), "3");
        assert_eq!(FieldValue::Number(2.5).to_text(), "2.5");
    }
}
