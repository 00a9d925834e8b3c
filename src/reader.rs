use std::path::Path;

use anyhow::{Context, Result};
use gdal::vector::{FieldValue as GdalFieldValue, LayerAccess};
use gdal::Dataset;
use tracing::{debug, warn};

use crate::engine::{FieldValue, LoadedRaster, VectorFeature, VectorTable};
use crate::model::{Extent, GeoTransform, LayerKind, Raster};

/// 1バンドをf64として読み込む
pub struct RasterReader {
    band: usize,
}

impl RasterReader {
    pub fn new(band: usize) -> Self {
        Self { band }
    }

    pub fn read(&self, path: &Path) -> Result<LoadedRaster> {
        let dataset = Dataset::open(path).with_context(|| format!("Failed to open raster {}", path.display()))?;
        let gt = dataset.geo_transform().context("Failed to read geo transform")?;
        if gt[2] != 0.0 || gt[4] != 0.0 {
            warn!("Raster {} is rotated, rotation terms are ignored", path.display());
        }

        let band = dataset
            .rasterband(self.band)
            .with_context(|| format!("Failed to get raster band {}", self.band))?;
        let (cols, rows) = band.size();
        let no_data = band.no_data_value();
        let buffer = band
            .read_as::<f64>((0, 0), (cols, rows), (cols, rows), None)
            .context("Failed to read raster data")?;

        let projection = dataset.projection();
        let crs = (!projection.trim().is_empty()).then_some(projection);
        debug!("Read {} x {} cells from {}", cols, rows, path.display());

        let raster = Raster::new(cols, rows, GeoTransform::from_gdal(&gt), buffer.data().to_vec())?.with_crs(crs);
        Ok(LoadedRaster { raster, no_data })
    }
}

/// 入力の範囲とCRS（WKT）。ベクターは最初のレイヤー
pub fn describe_layer(path: &Path, kind: LayerKind) -> Result<(Extent, Option<String>)> {
    let dataset = Dataset::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    if kind == LayerKind::Raster {
        let gt = dataset.geo_transform().context("Failed to read geo transform")?;
        let (cols, rows) = dataset.raster_size();
        let projection = dataset.projection();
        let crs = (!projection.trim().is_empty()).then_some(projection);
        return Ok((GeoTransform::from_gdal(&gt).extent(cols, rows), crs));
    }

    let layer = dataset.layer(0).context("Vector dataset has no layer")?;
    let envelope = layer.get_extent().context("Failed to read layer extent")?;
    let crs = layer.spatial_ref().and_then(|srs| srs.to_wkt().ok());
    Ok((Extent::new(envelope.MinX, envelope.MinY, envelope.MaxX, envelope.MaxY), crs))
}

/// 最初のレイヤーの名前（gdal_rasterize の -l に渡す）
pub fn first_layer_name(path: &Path) -> Result<String> {
    let dataset = Dataset::open(path).with_context(|| format!("Failed to open vector {}", path.display()))?;
    let layer = dataset.layer(0).context("Vector dataset has no layer")?;
    Ok(layer.name())
}

/// 最初のレイヤーの属性名
pub fn field_names(path: &Path) -> Result<Vec<String>> {
    let dataset = Dataset::open(path).with_context(|| format!("Failed to open vector {}", path.display()))?;
    let layer = dataset.layer(0).context("Vector dataset has no layer")?;
    Ok(layer.defn().fields().map(|field| field.name()).collect())
}

/// 最初のレイヤーの地物と属性`field`を読み込む
pub fn read_vector_table(path: &Path, field: &str) -> Result<VectorTable> {
    let dataset = Dataset::open(path).with_context(|| format!("Failed to open vector {}", path.display()))?;
    let mut layer = dataset.layer(0).context("Vector dataset has no layer")?;
    let envelope = layer.get_extent().context("Failed to read layer extent")?;
    let extent = Extent::new(envelope.MinX, envelope.MinY, envelope.MaxX, envelope.MaxY);

    let mut features = Vec::new();
    for feature in layer.features() {
        let index = feature
            .field_index(field)
            .with_context(|| format!("Field {} not found in {}", field, path.display()))?;
        let value = match feature.field(index)? {
            None => FieldValue::Null,
            Some(GdalFieldValue::IntegerValue(v)) => FieldValue::Number(v as f64),
            Some(GdalFieldValue::Integer64Value(v)) => FieldValue::Number(v as f64),
            Some(GdalFieldValue::RealValue(v)) => FieldValue::Number(v),
            Some(GdalFieldValue::StringValue(s)) => FieldValue::Text(s),
            Some(GdalFieldValue::StringListValue(items)) => FieldValue::Text(format!(
                "[{}]",
                items.iter().map(|s| format!("'{}'", s)).collect::<Vec<_>>().join(",")
            )),
            Some(other) => other.into_string().map(FieldValue::Text).unwrap_or(FieldValue::Null),
        };
        let point = feature.geometry().filter(|g| g.point_count() > 0).map(|g| {
            let (x, y, _) = g.get_point(0);
            (x, y)
        });
        features.push(VectorFeature { point, value });
    }
    debug!("Read {} features from {}", features.len(), path.display());

    Ok(VectorTable { extent, features })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::GeoTiffWriter;
    use gdal::DriverManager;
    use tempfile::TempDir;

    fn gtiff_available() -> bool {
        DriverManager::get_driver_by_name("GTiff").is_ok()
    }

    #[test]
    fn test_read_written_raster() {
        if !gtiff_available() {
            eprintln!("Skipping test: GTiff driver not available");
            return;
        }
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("input.tif");
        let raster = Raster::new(
            3,
            2,
            GeoTransform::north_up(104.0, -2.0, 0.5),
            vec![1.0, 2.0, f64::NAN, 4.0, 5.0, 6.0],
        )
        .unwrap()
        .with_crs(Some("EPSG:4326".to_string()));
        GeoTiffWriter::new().write(&raster, &path).unwrap();

        let loaded = RasterReader::new(1).read(&path).unwrap();
        assert_eq!(loaded.raster.shape(), (2, 3));
        assert_eq!(loaded.raster.transform, raster.transform);
        assert!(loaded.raster.values[2].is_nan());
        assert_eq!(loaded.raster.values[5], 6.0);
        assert!(loaded.raster.is_geographic());
        assert!(loaded.no_data.map_or(false, f64::is_nan));
    }

    #[test]
    fn test_describe_raster() {
        if !gtiff_available() {
            eprintln!("Skipping test: GTiff driver not available");
            return;
        }
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("input.tif");
        let raster = Raster::filled(4, 2, GeoTransform::north_up(104.0, -2.0, 0.25), 1.0);
        GeoTiffWriter::new().write(&raster, &path).unwrap();

        let (extent, crs) = describe_layer(&path, LayerKind::Raster).unwrap();
        assert_eq!(extent, Extent::new(104.0, -2.5, 105.0, -2.0));
        assert!(crs.is_some());
    }

    #[test]
    fn test_missing_band_is_error() {
        if !gtiff_available() {
            eprintln!("Skipping test: GTiff driver not available");
            return;
        }
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("input.tif");
        let raster = Raster::filled(2, 2, GeoTransform::north_up(0.0, 2.0, 1.0), 1.0);
        GeoTiffWriter::new().write(&raster, &path).unwrap();
        assert!(RasterReader::new(2).read(&path).is_err());
    }
}
