use std::path::PathBuf;

use tracing::debug;

use crate::error::{ExportError, Result};

/// 入力レイヤーの種別
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    Raster,
    VectorPoint,
    VectorLine,
    VectorPolygon,
}

impl LayerKind {
    pub fn is_vector(&self) -> bool {
        !matches!(self, LayerKind::Raster)
    }
}

/// エクスポート対象のレイヤー
#[derive(Debug, Clone)]
pub struct Layer {
    pub name: String,
    pub kind: LayerKind,
    pub path: PathBuf,
    /// 例: "EPSG:4326"
    pub crs: Option<String>,
    pub extent: Extent,
}

impl Layer {
    pub fn new(name: impl Into<String>, kind: LayerKind, path: impl Into<PathBuf>, extent: Extent) -> Self {
        Self {
            name: name.into(),
            kind,
            path: path.into(),
            crs: None,
            extent,
        }
    }

    pub fn with_crs(mut self, crs: impl Into<String>) -> Self {
        self.crs = Some(crs.into());
        self
    }

    pub fn is_geographic(&self) -> bool {
        is_geographic_crs(self.crs.as_deref())
    }
}

/// CRSが度単位（EPSG:4326）かどうか。未設定はWGS84とみなす
pub fn is_geographic_crs(crs: Option<&str>) -> bool {
    match crs {
        None => true,
        Some(crs) => {
            let crs = crs.trim();
            crs.eq_ignore_ascii_case("EPSG:4326") || crs.starts_with("GEOGCS") || crs.starts_with("GEOGCRS")
        }
    }
}

/// 西/南/東/北の範囲（CRS単位）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Extent {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl Extent {
    pub fn new(west: f64, south: f64, east: f64, north: f64) -> Self {
        Self {
            west,
            south,
            east,
            north,
        }
    }

    pub fn width(&self) -> f64 {
        self.east - self.west
    }

    pub fn height(&self) -> f64 {
        self.north - self.south
    }

    pub fn is_degenerate(&self) -> bool {
        !(self.width() > 0.0 && self.height() > 0.0)
    }

    pub fn contains(&self, other: &Extent) -> bool {
        other.west >= self.west && other.east <= self.east && other.south >= self.south && other.north <= self.north
    }

    pub fn intersection(&self, other: &Extent) -> Option<Extent> {
        let extent = Extent::new(
            self.west.max(other.west),
            self.south.max(other.south),
            self.east.min(other.east),
            self.north.min(other.north),
        );
        (!extent.is_degenerate()).then_some(extent)
    }

    /// 各辺を`margin`だけ外側に広げる
    pub fn expanded(&self, margin: f64) -> Extent {
        Extent::new(self.west - margin, self.south - margin, self.east + margin, self.north + margin)
    }
}

/// GDAL形式のジオトランスフォーム（回転なし）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoTransform {
    pub origin_x: f64,
    pub cell_width: f64,
    pub origin_y: f64,
    pub cell_height: f64,
}

impl GeoTransform {
    pub fn new(origin_x: f64, cell_width: f64, origin_y: f64, cell_height: f64) -> Self {
        Self {
            origin_x,
            cell_width,
            origin_y,
            cell_height,
        }
    }

    /// 北が上のグリッド（セル高さは負）
    pub fn north_up(west: f64, north: f64, cell_size: f64) -> Self {
        Self::new(west, cell_size.abs(), north, -cell_size.abs())
    }

    pub fn from_gdal(gt: &[f64; 6]) -> Self {
        Self::new(gt[0], gt[1], gt[3], gt[5])
    }

    pub fn to_gdal(&self) -> [f64; 6] {
        [self.origin_x, self.cell_width, 0.0, self.origin_y, 0.0, self.cell_height]
    }

    pub fn is_normalized(&self) -> bool {
        self.cell_width > 0.0 && self.cell_height < 0.0
    }

    pub fn extent(&self, cols: usize, rows: usize) -> Extent {
        let x2 = self.origin_x + self.cell_width * cols as f64;
        let y2 = self.origin_y + self.cell_height * rows as f64;
        Extent::new(self.origin_x.min(x2), self.origin_y.min(y2), self.origin_x.max(x2), self.origin_y.max(y2))
    }
}

/// 値配列を持つラスタ。無効セルはNaN
#[derive(Debug, Clone, PartialEq)]
pub struct Raster {
    pub cols: usize,
    pub rows: usize,
    pub transform: GeoTransform,
    /// 行優先（北の行から）
    pub values: Vec<f64>,
    pub crs: Option<String>,
}

impl Raster {
    pub fn new(cols: usize, rows: usize, transform: GeoTransform, values: Vec<f64>) -> Result<Self> {
        if values.len() != cols * rows {
            return Err(ExportError::Format(format!(
                "raster of {}x{} cells needs {} values, got {}",
                cols,
                rows,
                cols * rows,
                values.len()
            )));
        }
        Ok(Self {
            cols,
            rows,
            transform,
            values,
            crs: None,
        })
    }

    pub fn filled(cols: usize, rows: usize, transform: GeoTransform, value: f64) -> Self {
        Self {
            cols,
            rows,
            transform,
            values: vec![value; cols * rows],
            crs: None,
        }
    }

    pub fn with_crs(mut self, crs: Option<String>) -> Self {
        self.crs = crs;
        self
    }

    /// (rows, cols)
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn get(&self, x: usize, y: usize) -> Option<f64> {
        (x < self.cols && y < self.rows).then(|| self.values[y * self.cols + x])
    }

    pub fn set(&mut self, x: usize, y: usize, value: f64) {
        if x < self.cols && y < self.rows {
            self.values[y * self.cols + x] = value;
        }
    }

    pub fn extent(&self) -> Extent {
        self.transform.extent(self.cols, self.rows)
    }

    pub fn is_geographic(&self) -> bool {
        is_geographic_crs(self.crs.as_deref())
    }

    /// 有効セルはtrue（NaNでない）
    pub fn mask(&self) -> Vec<bool> {
        self.values.iter().map(|v| !v.is_nan()).collect()
    }

    pub fn has_valid_cells(&self) -> bool {
        self.values.iter().any(|v| !v.is_nan())
    }

    /// 地理座標(x, y)を含むセルの列・行
    pub fn cell_at(&self, x: f64, y: f64) -> Option<(usize, usize)> {
        let col = ((x - self.transform.origin_x) / self.transform.cell_width).floor();
        let row = ((y - self.transform.origin_y) / self.transform.cell_height).floor();
        if col < 0.0 || row < 0.0 || col >= self.cols as f64 || row >= self.rows as f64 {
            return None;
        }
        Some((col as usize, row as usize))
    }

    /// 反転した軸を正の幅・負の高さに直す（値配列も並べ替える）
    pub fn normalized(mut self) -> Self {
        let cols = self.cols;
        let rows = self.rows;
        if self.transform.cell_width < 0.0 {
            debug!("Changing negative cell width to positive");
            self.transform.origin_x += self.transform.cell_width * cols as f64;
            self.transform.cell_width = -self.transform.cell_width;
            for row in self.values.chunks_mut(cols.max(1)) {
                row.reverse();
            }
        }
        if self.transform.cell_height > 0.0 {
            debug!("Changing positive cell height to negative");
            self.transform.origin_y += self.transform.cell_height * rows as f64;
            self.transform.cell_height = -self.transform.cell_height;
            let mut flipped = Vec::with_capacity(self.values.len());
            for row in self.values.chunks(cols.max(1)).rev() {
                flipped.extend_from_slice(row);
            }
            self.values = flipped;
        }
        self
    }

    /// 列・行のウィンドウを切り出す。範囲外は切り詰める
    pub fn window(&self, col_off: usize, row_off: usize, cols: usize, rows: usize) -> Raster {
        let col_off = col_off.min(self.cols);
        let row_off = row_off.min(self.rows);
        let cols = cols.min(self.cols - col_off);
        let rows = rows.min(self.rows - row_off);

        let mut values = Vec::with_capacity(cols * rows);
        for y in row_off..row_off + rows {
            let start = y * self.cols + col_off;
            values.extend_from_slice(&self.values[start..start + cols]);
        }

        let transform = GeoTransform::new(
            self.transform.origin_x + self.transform.cell_width * col_off as f64,
            self.transform.cell_width,
            self.transform.origin_y + self.transform.cell_height * row_off as f64,
            self.transform.cell_height,
        );

        Raster {
            cols,
            rows,
            transform,
            values,
            crs: self.crs.clone(),
        }
    }

    /// 範囲でラスタを切り出す（セル境界に合わせる、北が上のラスタ前提）
    pub fn clip(&self, extent: &Extent) -> Raster {
        let gt = &self.transform;
        let width = gt.cell_width.abs();
        let height = gt.cell_height.abs();
        // 丸め誤差でセルを取りこぼさないための許容値
        let eps = 1e-9;

        let col_start = ((extent.west - gt.origin_x) / width + eps).floor().max(0.0) as usize;
        let col_end = ((extent.east - gt.origin_x) / width - eps).ceil().max(0.0) as usize;
        let row_start = ((gt.origin_y - extent.north) / height + eps).floor().max(0.0) as usize;
        let row_end = ((gt.origin_y - extent.south) / height - eps).ceil().max(0.0) as usize;

        self.window(
            col_start,
            row_start,
            col_end.saturating_sub(col_start),
            row_end.saturating_sub(row_start),
        )
    }
}
