use tracing::{debug, warn};

use crate::config::ResolutionProfile;
use crate::model::{Extent, Raster};

/// Mercator投影で扱える緯度の上限
pub const MAX_LATITUDE: f64 = 85.0;

/// 1つの出力ファイルに対応する範囲
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Patch {
    /// ファイル名の `@<index>` に使う。データ無しで飛ばしたパッチも番号は消費する
    pub index: usize,
    pub extent: Extent,
}

/// レイヤー範囲をmax_patch_size以下のパッチに分割する
#[derive(Debug, Clone, PartialEq)]
pub struct PatchPlanner {
    pub max_patch_size: f64,
    /// これ以下の幅・高さのパッチは捨てる
    pub min_size: f64,
    pub is_world_tier: bool,
}

impl PatchPlanner {
    pub fn new(max_patch_size: f64, cell_size: f64, is_world_tier: bool) -> Self {
        Self {
            max_patch_size,
            min_size: cell_size,
            is_world_tier,
        }
    }

    /// メートル系の段階では1セル分のパッチを捨てないよう閾値を小さくする
    pub fn for_profile(profile: &ResolutionProfile, cell_size_degrees: f64) -> Self {
        let min_size = if profile.is_metric() {
            cell_size_degrees * 0.00001
        } else {
            cell_size_degrees
        };
        Self {
            max_patch_size: profile.max_patch_size,
            min_size,
            is_world_tier: profile.is_world_tier(),
        }
    }

    /// パッチを計算する。`pixel_size`があれば緯度の切り詰めをピクセル単位にそろえる
    pub fn plan(&self, extent: &Extent, pixel_size: Option<f64>) -> Vec<Patch> {
        if !(self.max_patch_size > 0.0 && self.max_patch_size.is_finite()) {
            warn!("Invalid max patch size {}, nothing to export", self.max_patch_size);
            return Vec::new();
        }
        if extent.is_degenerate() {
            debug!("Extent is degenerate, nothing to export");
            return Vec::new();
        }
        let clamped = clamp_latitudes(extent, pixel_size);
        if clamped.is_degenerate() {
            debug!("Extent lies outside ±{} degrees, nothing to export", MAX_LATITUDE);
            return Vec::new();
        }

        let max = self.max_patch_size;
        if self.is_world_tier || (clamped.width() <= max && clamped.height() <= max) {
            return vec![Patch {
                index: 0,
                extent: clamped,
            }];
        }

        // 整数度の格子に合わせる
        let west = clamped.west.floor();
        let south = clamped.south.floor();
        let columns = ((clamped.east.ceil() - west) / max).ceil() as usize;
        let rows = ((clamped.north.ceil() - south) / max).ceil() as usize;

        let mut patches = Vec::new();
        for i in 0..columns {
            let x = west + i as f64 * max;
            for j in 0..rows {
                let y = south + j as f64 * max;
                let candidate = Extent::new(
                    clamped.west.max(x),
                    clamped.south.max(y),
                    clamped.east.min(x + max),
                    clamped.north.min(y + max),
                );
                if candidate.width() > self.min_size && candidate.height() > self.min_size {
                    patches.push(Patch {
                        index: patches.len(),
                        extent: candidate,
                    });
                }
            }
        }
        debug!("Planned {} patches of at most {} degrees", patches.len(), max);
        patches
    }
}

/// 北端・南端を±85度に収める
///
/// `pixel_size`が与えられた場合はピクセル単位で削り、パッチ境界が元の
/// ピクセル格子からずれないようにする。
pub fn clamp_latitudes(extent: &Extent, pixel_size: Option<f64>) -> Extent {
    let pixel = pixel_size.map(f64::abs).filter(|p| *p > 0.0);
    let north = match (extent.north > MAX_LATITUDE, pixel) {
        (false, _) => extent.north,
        (true, Some(p)) => extent.north - ((extent.north - MAX_LATITUDE) / p).ceil() * p,
        (true, None) => MAX_LATITUDE,
    };
    let south = match (extent.south < -MAX_LATITUDE, pixel) {
        (false, _) => extent.south,
        (true, Some(p)) => extent.south - ((extent.south + MAX_LATITUDE) / p).floor() * p,
        (true, None) => -MAX_LATITUDE,
    };
    Extent::new(extent.west, south, extent.east, north)
}

/// 範囲内の有効セルを囲む最小範囲。有効セルが無ければ`None`
pub fn clip_to_data(raster: &Raster, extent: &Extent) -> Option<Extent> {
    let window = raster.clip(extent);
    let cols = window.cols;

    let mut min_col = usize::MAX;
    let mut max_col = 0;
    let mut min_row = usize::MAX;
    let mut max_row = 0;
    for (i, value) in window.values.iter().enumerate() {
        if value.is_nan() {
            continue;
        }
        let (row, col) = (i / cols, i % cols);
        min_col = min_col.min(col);
        max_col = max_col.max(col);
        min_row = min_row.min(row);
        max_row = max_row.max(row);
    }
    if min_col == usize::MAX {
        return None;
    }

    let gt = &window.transform;
    let west = gt.origin_x + gt.cell_width * min_col as f64;
    let east = gt.origin_x + gt.cell_width * (max_col + 1) as f64;
    let north = gt.origin_y + gt.cell_height * min_row as f64;
    let south = gt.origin_y + gt.cell_height * (max_row + 1) as f64;
    Some(Extent::new(west, south, east, north))
}

/// 段階の既定値で計算する
pub fn compute_patches(extent: &Extent, max_patch_size: f64, cell_size: f64, is_world_tier: bool) -> Vec<Patch> {
    PatchPlanner::new(max_patch_size, cell_size, is_world_tier).plan(extent, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::GeoTransform;

    #[test]
    fn test_small_extent_is_single_patch() {
        let extent = Extent::new(104.3, -3.2, 105.1, -2.7);
        let patches = compute_patches(&extent, 1.0, 0.01, false);
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].extent, extent);
    }

    #[test]
    fn test_degenerate_extent_has_no_patches() {
        assert!(compute_patches(&Extent::new(1.0, 1.0, 1.0, 2.0), 1.0, 0.01, false).is_empty());
    }

    #[test]
    fn test_non_positive_patch_size_has_no_patches() {
        let extent = Extent::new(0.5, 0.5, 2.5, 1.5);
        assert!(compute_patches(&extent, 0.0, 0.01, false).is_empty());
        assert!(compute_patches(&extent, -1.0, 0.01, false).is_empty());
        assert!(compute_patches(&extent, f64::NAN, 0.01, true).is_empty());
    }

    #[test]
    fn test_tiles_on_whole_degree_grid() {
        let extent = Extent::new(0.5, 0.5, 2.5, 1.5);
        let patches = compute_patches(&extent, 1.0, 0.01, false);
        let extents: Vec<_> = patches.iter().map(|p| p.extent).collect();
        assert_eq!(
            extents,
            vec![
                Extent::new(0.5, 0.5, 1.0, 1.0),
                Extent::new(0.5, 1.0, 1.0, 1.5),
                Extent::new(1.0, 0.5, 2.0, 1.0),
                Extent::new(1.0, 1.0, 2.0, 1.5),
                Extent::new(2.0, 0.5, 2.5, 1.0),
                Extent::new(2.0, 1.0, 2.5, 1.5),
            ]
        );
        let indices: Vec<_> = patches.iter().map(|p| p.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_slivers_are_rejected() {
        // 東端の幅 0.005 は閾値 0.01 以下
        let extent = Extent::new(0.0, 0.0, 2.005, 0.5);
        let patches = compute_patches(&extent, 1.0, 0.01, false);
        assert_eq!(patches.len(), 2);
        for patch in &patches {
            assert!(patch.extent.width() > 0.01);
        }
    }

    #[test]
    fn test_patches_stay_inside_clamped_extent() {
        let extent = Extent::new(-180.0, -90.0, 180.0, 90.0);
        let clamped = clamp_latitudes(&extent, None);
        let patches = compute_patches(&extent, 50.0, 5.0 / 60.0, false);
        assert!(!patches.is_empty());
        for patch in &patches {
            assert!(clamped.contains(&patch.extent));
            assert!(patch.extent.north <= MAX_LATITUDE);
            assert!(patch.extent.south >= -MAX_LATITUDE);
            assert!(patch.extent.width() > 0.0 && patch.extent.height() > 0.0);
        }
    }

    #[test]
    fn test_world_tier_is_single_patch() {
        let extent = Extent::new(-180.0, -90.0, 180.0, 90.0);
        let patches = compute_patches(&extent, 360.0, 25.0 / 60.0, true);
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].extent, Extent::new(-180.0, -85.0, 180.0, 85.0));
    }

    #[test]
    fn test_pixel_aligned_clamp() {
        let extent = Extent::new(0.0, -89.7, 1.0, 88.3);
        let clamped = clamp_latitudes(&extent, Some(2.0));
        // 88.3 - ceil(3.3/2)*2 = 84.3, -89.7 - floor(-4.7/2)*2 = -83.7
        assert!((clamped.north - 84.3).abs() < 1e-9);
        assert!((clamped.south + 83.7).abs() < 1e-9);
    }

    #[test]
    fn test_metric_profile_threshold() {
        let profile = ResolutionProfile::tier(1).unwrap();
        let planner = PatchPlanner::for_profile(&profile, profile.cell_size_degrees());
        assert!(planner.min_size < profile.cell_size_degrees());
        assert_eq!(planner.max_patch_size, 2.0);
    }

    #[test]
    fn test_clip_to_data() {
        // 4x3、1度セル、北西(0, 3)
        let nan = f64::NAN;
        let raster = Raster::new(
            4,
            3,
            GeoTransform::north_up(0.0, 3.0, 1.0),
            vec![nan, nan, nan, nan, nan, 1.0, 2.0, nan, nan, nan, 3.0, nan],
        )
        .unwrap();
        let extent = clip_to_data(&raster, &raster.extent()).unwrap();
        assert_eq!(extent, Extent::new(1.0, 0.0, 3.0, 2.0));

        let empty = Raster::filled(2, 2, GeoTransform::north_up(0.0, 2.0, 1.0), nan);
        assert_eq!(clip_to_data(&empty, &empty.extent()), None);
    }
}
