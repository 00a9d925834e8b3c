use tracing::debug;

use crate::category::CategoryTable;
use crate::engine::{FieldValue, VectorTable};
use crate::model::{Extent, GeoTransform, Raster};
use crate::nodata::NoDataSpec;

/// 点レイヤーを集計するグリッド
///
/// 範囲は点の範囲を1セル分広げたもの。端の点が最後の行・列に落ちるようにする。
#[derive(Debug, Clone, PartialEq)]
pub struct PointGrid {
    pub transform: GeoTransform,
    pub cols: usize,
    pub rows: usize,
}

impl PointGrid {
    pub fn covering(extent: &Extent, cell_size: f64) -> Self {
        let expanded = extent.expanded(cell_size);
        // gdal_rasterizeと同じ丸め
        let cols = ((expanded.width() / cell_size) + 0.5).max(1.0) as usize;
        let rows = ((expanded.height() / cell_size) + 0.5).max(1.0) as usize;
        Self {
            transform: GeoTransform::north_up(expanded.west, expanded.north, cell_size),
            cols,
            rows,
        }
    }

    fn empty(&self, value: f64) -> Raster {
        Raster::filled(self.cols, self.rows, self.transform, value).with_crs(Some("EPSG:4326".to_string()))
    }

    /// 数えてよい点のセル位置と値
    fn cells<'a>(
        &'a self,
        table: &'a VectorTable,
        no_data: &'a NoDataSpec,
    ) -> impl Iterator<Item = ((usize, usize), &'a FieldValue)> + 'a {
        let template = self.empty(0.0);
        table.features.iter().filter_map(move |feature| {
            let (x, y) = feature.point?;
            if no_data.matches_token(&feature.value.to_text()) {
                return None;
            }
            template.cell_at(x, y).map(|cell| (cell, &feature.value))
        })
    }

    /// セルごとの点の数。点の無いセルは0
    pub fn count(&self, table: &VectorTable, no_data: &NoDataSpec) -> Raster {
        let mut raster = self.empty(0.0);
        for ((x, y), _) in self.cells(table, no_data) {
            raster.values[y * self.cols + x] += 1.0;
        }
        raster
    }

    /// セルごとの数値属性の平均。点の無いセルはNaN
    pub fn mean(&self, table: &VectorTable, no_data: &NoDataSpec) -> Raster {
        let mut sums = vec![0.0; self.cols * self.rows];
        let mut counts = vec![0usize; self.cols * self.rows];
        for ((x, y), value) in self.cells(table, no_data) {
            if let Some(v) = value.as_number() {
                sums[y * self.cols + x] += v;
                counts[y * self.cols + x] += 1;
            }
        }
        let mut raster = self.empty(f64::NAN);
        for (i, (sum, n)) in sums.iter().zip(&counts).enumerate() {
            if *n > 0 {
                raster.values[i] = sum / *n as f64;
            }
        }
        raster
    }

    /// カテゴリごとの点の数（カテゴリID順）
    pub fn count_by_category(&self, table: &VectorTable, categories: &CategoryTable, no_data: &NoDataSpec) -> Vec<Raster> {
        let mut layers = vec![self.empty(0.0); categories.len()];
        for ((x, y), value) in self.cells(table, no_data) {
            if let Some(id) = categories.id_of(&value.to_text()) {
                layers[id as usize - 1].values[y * self.cols + x] += 1.0;
            }
        }
        debug!("Counted points of {} categories", layers.len());
        layers
    }
}
