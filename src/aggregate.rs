use rayon::prelude::*;
use tracing::{debug, warn};

use crate::config::{ExportConfig, NoDataPolicy};
use crate::error::{ExportError, Result};
use crate::geo::{distance_between_latitudes, distance_between_longitudes};
use crate::model::{GeoTransform, Raster};

/// 集約の挙動
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationOptions {
    /// 面積あたりの量（人口密度など）
    pub relative: bool,
    /// 平均ではなく合計する
    pub summary: bool,
    pub multiplier: f64,
    pub policy: NoDataPolicy,
}

impl AggregationOptions {
    pub fn from_config(config: &ExportConfig) -> Self {
        Self {
            relative: config.units.relative,
            summary: config.resampling.is_summary(),
            multiplier: config.units.multiplier,
            policy: config.no_data_policy,
        }
    }
}

impl Default for AggregationOptions {
    fn default() -> Self {
        Self {
            relative: false,
            summary: false,
            multiplier: 1.0,
            policy: NoDataPolicy::Propagate,
        }
    }
}

// セル数の切り捨てで丸め誤差を吸収する
const COUNT_EPSILON: f64 = 1e-9;

/// 細かいラスタを粗い解像度へ面積重み付きで集約する
///
/// `target_cell_size`は入力ラスタと同じ単位（度またはメートル）。
/// 入力と同じ解像度なら向きをそろえたラスタをそのまま返す。
pub fn aggregate(source: &Raster, target_cell_size: f64, options: &AggregationOptions) -> Result<Raster> {
    let source = source.clone().normalized();
    let in_width = source.transform.cell_width;
    let in_height = source.transform.cell_height;
    let target = target_cell_size.abs();

    if target < in_width || target < in_height.abs() {
        return Err(ExportError::config(format!(
            "target cell size {} can't be smaller than the layer resolution {}",
            target,
            in_width.max(in_height.abs())
        )));
    }
    if (target - in_width).abs() <= f64::EPSILON * target && (target - in_height.abs()).abs() <= f64::EPSILON * target {
        debug!("Target cell size equals the source cell size, nothing to aggregate");
        return Ok(source);
    }

    let scale_x = target / in_width;
    let scale_y = target / in_height.abs();
    let out_cols = (source.cols as f64 / scale_x + COUNT_EPSILON).floor() as usize;
    let out_rows = (source.rows as f64 / scale_y + COUNT_EPSILON).floor() as usize;
    let out_transform = GeoTransform::new(
        source.transform.origin_x,
        in_width * scale_x,
        source.transform.origin_y,
        in_height * scale_y,
    );

    let in_area = (source.cols as f64 * in_width) * (source.rows as f64 * in_height.abs());
    let out_area = (out_cols as f64 * target) * (out_rows as f64 * target);
    let size_percent = 100.0 * (1.0 - out_area / in_area);
    if size_percent >= 1.0 {
        warn!(
            "The output raster will be smaller ({} by {}), that's {:.1}% smaller",
            out_cols as f64 * target,
            out_rows as f64 * target,
            size_percent
        );
    }

    let mut values = vec![f64::NAN; out_cols * out_rows];
    if out_cols == 0 || out_rows == 0 {
        warn!("Raster is smaller than a single output cell");
        return Ok(Raster::new(out_cols, out_rows, out_transform, values)?.with_crs(source.crs.clone()));
    }

    let geographic = source.is_geographic();
    let grid = SourceGrid {
        raster: &source,
        scale_x,
        scale_y,
        out_transform,
        geographic,
    };
    values
        .par_chunks_mut(out_cols)
        .enumerate()
        .for_each(|(out_y, row)| {
            for (out_x, cell) in row.iter_mut().enumerate() {
                *cell = grid.aggregate_cell(out_x, out_y, options);
            }
        });

    Ok(Raster::new(out_cols, out_rows, out_transform, values)?.with_crs(source.crs.clone()))
}

struct SourceGrid<'a> {
    raster: &'a Raster,
    scale_x: f64,
    scale_y: f64,
    out_transform: GeoTransform,
    geographic: bool,
}

impl SourceGrid<'_> {
    fn aggregate_cell(&self, out_x: usize, out_y: usize, options: &AggregationOptions) -> f64 {
        let src = self.raster;
        let in_gt = &src.transform;
        let out_gt = &self.out_transform;

        let out_north = out_gt.origin_y + out_y as f64 * out_gt.cell_height;
        let out_south = out_north + out_gt.cell_height;
        let out_west = out_gt.origin_x + out_x as f64 * out_gt.cell_width;
        let out_east = out_west + out_gt.cell_width;

        let from_y = (out_y as f64 * self.scale_y).floor() as usize;
        let to_y = (((out_y + 1) as f64 * self.scale_y).ceil() as usize).min(src.rows);
        let from_x = (out_x as f64 * self.scale_x).floor() as usize;
        let to_x = (((out_x + 1) as f64 * self.scale_x).ceil() as usize).min(src.cols);

        let mut sum_value = 0.0;
        let mut sum_sq_km = 0.0;
        let mut sum_ratio = 0.0;

        'rows: for in_y in from_y..to_y {
            let in_north = in_gt.origin_y + in_y as f64 * in_gt.cell_height;
            let in_south = in_north + in_gt.cell_height;
            let south = out_south.max(in_south);
            let north = out_north.min(in_north);
            let height_km = if self.geographic {
                distance_between_latitudes(south, north)
            } else {
                (north - south) * 0.001
            };

            for in_x in from_x..to_x {
                let value = src.values[in_y * src.cols + in_x];
                if value.is_nan() {
                    match options.policy {
                        NoDataPolicy::Propagate => {
                            sum_sq_km = 0.0;
                            break 'rows;
                        }
                        NoDataPolicy::Ignore => continue,
                    }
                }

                let in_west = in_gt.origin_x + in_x as f64 * in_gt.cell_width;
                let in_east = in_west + in_gt.cell_width;
                let west = out_west.max(in_west);
                let east = out_east.min(in_east);
                let width_km = if self.geographic {
                    distance_between_longitudes(west, east)
                } else {
                    (east - west) * 0.001
                };

                // 入力セルのうち出力セルに含まれる割合
                let ratio = (east - west) / in_gt.cell_width * (north - south) / in_gt.cell_height.abs();
                let sq_km = width_km * height_km;
                sum_sq_km += sq_km;
                sum_ratio += ratio;
                sum_value += if options.relative { value * sq_km } else { value * ratio };
            }
        }

        if sum_sq_km == 0.0 {
            return f64::NAN;
        }
        match (options.relative, options.summary) {
            (true, false) => sum_value / sum_sq_km,
            (true, true) => sum_value * options.multiplier,
            (false, true) => sum_value,
            (false, false) => sum_value / sum_ratio,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn metric(cols: usize, rows: usize, cell: f64, values: Vec<f64>) -> Raster {
        Raster::new(cols, rows, GeoTransform::north_up(500_000.0, 9_000_000.0, cell), values)
            .unwrap()
            .with_crs(Some("EPSG:3395".to_string()))
    }

    #[test]
    fn test_relative_density_passes_through() {
        let raster = metric(6, 6, 100.0, vec![2.0; 36]);
        let options = AggregationOptions {
            relative: true,
            ..Default::default()
        };
        let out = aggregate(&raster, 300.0, &options).unwrap();
        assert_eq!(out.shape(), (2, 2));
        for value in &out.values {
            assert_relative_eq!(*value, 2.0, epsilon = 1e-9);
        }
        assert_eq!(out.transform.cell_width, 300.0);
        assert_eq!(out.transform.cell_height, -300.0);
    }

    #[test]
    fn test_absolute_summary_is_additive() {
        for k in [2usize, 3, 4] {
            let raster = metric(k, k, 10.0, vec![1.0; k * k]);
            let options = AggregationOptions {
                summary: true,
                ..Default::default()
            };
            let out = aggregate(&raster, 10.0 * k as f64, &options).unwrap();
            assert_eq!(out.values.len(), 1);
            assert_relative_eq!(out.values[0], (k * k) as f64, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_relative_summary_uses_multiplier() {
        // 1 人/ha を 1km² に集約すると 100 人
        let raster = metric(10, 10, 100.0, vec![1.0; 100]);
        let options = AggregationOptions {
            relative: true,
            summary: true,
            multiplier: 100.0,
            ..Default::default()
        };
        let out = aggregate(&raster, 1000.0, &options).unwrap();
        assert_relative_eq!(out.values[0], 100.0, epsilon = 1e-9);
    }

    #[test]
    fn test_percentage_sum_ignores_multiplier() {
        let units = crate::units::Units::predefined(7);
        assert_eq!(units.multiplier, 100.0);
        let raster = metric(2, 2, 10.0, vec![25.0; 4]);
        let options = AggregationOptions {
            relative: units.relative,
            summary: true,
            multiplier: units.multiplier,
            ..Default::default()
        };
        let out = aggregate(&raster, 20.0, &options).unwrap();
        assert_relative_eq!(out.values[0], 100.0, epsilon = 1e-9);
    }

    #[test]
    fn test_nan_propagates_by_default() {
        let mut values = vec![1.0; 9];
        values[4] = f64::NAN;
        let raster = metric(3, 3, 10.0, values);
        let out = aggregate(&raster, 30.0, &AggregationOptions::default()).unwrap();
        assert!(out.values[0].is_nan());
    }

    #[test]
    fn test_nan_ignored_on_request() {
        let mut values = vec![1.0; 9];
        values[4] = f64::NAN;
        let raster = metric(3, 3, 10.0, values);

        let average = AggregationOptions {
            policy: NoDataPolicy::Ignore,
            ..Default::default()
        };
        let out = aggregate(&raster, 30.0, &average).unwrap();
        assert_relative_eq!(out.values[0], 1.0, epsilon = 1e-9);

        let summary = AggregationOptions {
            policy: NoDataPolicy::Ignore,
            summary: true,
            ..Default::default()
        };
        let out = aggregate(&raster, 30.0, &summary).unwrap();
        assert_relative_eq!(out.values[0], 8.0, epsilon = 1e-9);
    }

    #[test]
    fn test_all_nan_block_is_nan_even_when_ignored() {
        let raster = metric(2, 2, 10.0, vec![f64::NAN; 4]);
        let options = AggregationOptions {
            policy: NoDataPolicy::Ignore,
            ..Default::default()
        };
        let out = aggregate(&raster, 20.0, &options).unwrap();
        assert!(out.values[0].is_nan());
    }

    #[test]
    fn test_same_cell_size_is_identity() {
        let values: Vec<f64> = (0..16).map(|v| v as f64 * 0.5).collect();
        let raster = Raster::new(4, 4, GeoTransform::north_up(100.0, 10.0, 1.0), values.clone()).unwrap();
        let out = aggregate(&raster, 1.0, &AggregationOptions::default()).unwrap();
        assert_eq!(out.values, values);
        assert_eq!(out.transform, raster.transform);
    }

    #[test]
    fn test_finer_target_is_rejected() {
        let raster = metric(2, 2, 100.0, vec![1.0; 4]);
        let result = aggregate(&raster, 10.0, &AggregationOptions::default());
        assert!(matches!(result, Err(ExportError::Config(_))));
    }

    #[test]
    fn test_geographic_average_of_uniform_raster() {
        let raster = Raster::new(4, 4, GeoTransform::north_up(100.0, 10.0, 0.25), vec![7.0; 16]).unwrap();
        let out = aggregate(&raster, 0.5, &AggregationOptions::default()).unwrap();
        assert_eq!(out.shape(), (2, 2));
        for value in &out.values {
            assert_relative_eq!(*value, 7.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_non_integer_ratio_drops_partial_cells() {
        // 5セルを2セル幅で集約すると2セル（端の1セルは捨てる）
        let raster = metric(5, 5, 10.0, vec![1.0; 25]);
        let out = aggregate(&raster, 20.0, &AggregationOptions::default()).unwrap();
        assert_eq!(out.shape(), (2, 2));
    }

    #[test]
    fn test_inverted_source_is_normalized_first() {
        // 南西原点・正の高さ
        let raster = Raster::new(2, 2, GeoTransform::new(0.0, 1.0, 0.0, 1.0), vec![1.0, 1.0, 3.0, 3.0]).unwrap();
        let out = aggregate(&raster, 2.0, &AggregationOptions::default()).unwrap();
        assert_eq!(out.transform.origin_y, 2.0);
        assert!(out.transform.cell_height < 0.0);
        assert_relative_eq!(out.values[0], 2.0, epsilon = 1e-6);
    }
}
