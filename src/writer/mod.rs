pub mod encoding;
pub mod graph;
pub mod grid;
pub mod layers;

use anyhow::{Context, Result};
use gdal::raster::Buffer;
use gdal::spatial_ref::SpatialRef;
use gdal::DriverManager;
use std::path::Path;
use tracing::debug;

use crate::config::{ExportConfig, OutputMode};
use crate::model::Raster;

pub use graph::{GraphEdge, GraphFileWriter};
pub use grid::{GridFileWriter, GridHeader, GridMetadata};
pub use layers::{LayerRegistry, Registration};

/// ファイル名の末尾
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GridSuffix {
    Grid,
    Multi,
}

impl GridSuffix {
    fn as_str(&self) -> &'static str {
        match self {
            GridSuffix::Grid => "_grid.csv",
            GridSuffix::Multi => "_multi.csv",
        }
    }
}

/// パッチのファイル名。同じ入力なら同じ名前になり上書きされる
pub fn grid_file_name(config: &ExportConfig, index: usize, suffix: GridSuffix) -> String {
    if config.mode == OutputMode::MunicipalBudget {
        return format!("{}.csv", config.location);
    }
    format!(
        "{}_{}_{}@{}_{}{}",
        config.name,
        config.resolution.sign,
        config.location,
        index,
        config.date_code(),
        suffix.as_str()
    )
}

pub fn graph_file_name(config: &ExportConfig) -> String {
    format!("{}_D_{}_{}_graph.csv", config.name, config.location, config.date_code())
}

/// エンジンに渡す中間GeoTIFF（Float64、no-dataはNaN）
#[derive(Default)]
pub struct GeoTiffWriter {}

impl GeoTiffWriter {
    pub fn new() -> Self {
        Self {}
    }

    pub fn write(&self, raster: &Raster, output_path: &Path) -> Result<()> {
        let (rows, cols) = raster.shape();
        debug!("Writing intermediate GeoTIFF: {} x {} pixels", cols, rows);

        let driver = DriverManager::get_driver_by_name("GTiff").context("Failed to get GTiff driver")?;
        let mut dataset = driver
            .create_with_band_type::<f64, _>(output_path, cols, rows, 1)
            .context("Failed to create dataset")?;

        dataset
            .set_geo_transform(&raster.transform.to_gdal())
            .context("Failed to set geo transform")?;

        // 座標系を設定（EPSGコードかWKT）
        match raster.crs.as_deref() {
            Some(crs) if crs.starts_with("EPSG:") => {
                let code: u32 = crs[5..]
                    .parse()
                    .with_context(|| format!("Invalid EPSG identifier: {}", crs))?;
                let srs = SpatialRef::from_epsg(code).context(format!("Failed to create SpatialRef from {}", crs))?;
                dataset.set_spatial_ref(&srs).context("Failed to set spatial reference")?;
            }
            Some(wkt) => {
                dataset.set_projection(wkt).context("Failed to set projection")?;
            }
            None => {
                let srs = SpatialRef::from_epsg(4326).context("Failed to create SpatialRef from EPSG:4326")?;
                dataset.set_spatial_ref(&srs).context("Failed to set spatial reference")?;
            }
        }

        let mut band = dataset.rasterband(1).context("Failed to get raster band")?;
        band.set_no_data_value(Some(f64::NAN))
            .context("Failed to set no data value")?;

        // GDALは行優先順を期待
        let mut buffer = Buffer::new((cols, rows), raster.values.clone());
        band.write((0, 0), (cols, rows), &mut buffer)
            .context("Failed to write raster data")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResolutionProfile;
    use crate::model::GeoTransform;
    use gdal::Dataset;
    use tempfile::TempDir;

    fn init_gdal() -> bool {
        // GTiffドライバーが利用可能かチェック
        DriverManager::get_driver_by_name("GTiff").is_ok()
    }

    #[test]
    fn test_write_geotiff() {
        if !init_gdal() {
            eprintln!("Skipping test: GTiff driver not available");
            return;
        }
        let temp_dir = TempDir::new().unwrap();
        let output_path = temp_dir.path().join("test.tif");

        let raster = Raster::new(
            3,
            2,
            GeoTransform::north_up(135.0, 35.0, 0.001),
            vec![100.0, 101.0, 102.0, 103.0, f64::NAN, 105.0],
        )
        .unwrap();
        GeoTiffWriter::new().write(&raster, &output_path).unwrap();

        assert!(output_path.exists());

        let dataset = Dataset::open(&output_path).unwrap();
        assert_eq!(dataset.raster_size(), (3, 2));

        let transform = dataset.geo_transform().unwrap();
        assert_eq!(transform[0], 135.0);
        assert_eq!(transform[1], 0.001);

        let band = dataset.rasterband(1).unwrap();
        assert!(band.no_data_value().unwrap().is_nan());
    }

    #[test]
    fn test_metric_crs_is_kept() {
        if !init_gdal() {
            eprintln!("Skipping test: GTiff driver not available");
            return;
        }
        let temp_dir = TempDir::new().unwrap();
        let output_path = temp_dir.path().join("mercator.tif");
        let raster = Raster::filled(2, 2, GeoTransform::north_up(0.0, 200.0, 100.0), 1.0)
            .with_crs(Some("EPSG:3395".to_string()));
        GeoTiffWriter::new().write(&raster, &output_path).unwrap();

        let dataset = Dataset::open(&output_path).unwrap();
        assert!(dataset.projection().contains("Mercator"));
    }

    #[test]
    fn test_file_names() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = ExportConfig::new(temp_dir.path(), "Population", "Palembang", ResolutionProfile::tier(3).unwrap());
        config.date = "2020.01".to_string();
        assert_eq!(
            grid_file_name(&config, 2, GridSuffix::Grid),
            "Population_C_Palembang@2_202001_grid.csv"
        );
        assert_eq!(
            grid_file_name(&config, 0, GridSuffix::Multi),
            "Population_C_Palembang@0_202001_multi.csv"
        );
        assert_eq!(graph_file_name(&config), "Population_D_Palembang_202001_graph.csv");

        config.mode = OutputMode::MunicipalBudget;
        assert_eq!(grid_file_name(&config, 5, GridSuffix::Grid), "Palembang.csv");
    }
}
