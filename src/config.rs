use std::path::PathBuf;

use chrono::NaiveDate;
use tracing::warn;

use crate::error::{ExportError, Result};
use crate::geo::meters_to_degrees_longitude;
use crate::model::LayerKind;
use crate::units::Units;

/// セルサイズの単位
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellUnit {
    Meters,
    Degrees,
}

/// 解像度の段階。実行中は変更しない
#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionProfile {
    pub index: usize,
    pub label: &'static str,
    /// `unit`で表したセルサイズ
    pub cell_size: f64,
    pub unit: CellUnit,
    pub epsg: u32,
    /// 度単位
    pub max_patch_size: f64,
    pub sign: char,
}

const TIERS: &[(&str, f64, CellUnit, u32, f64, char)] = &[
    ("neighbourhood", 10.0, CellUnit::Meters, 3395, 1.0, 'D'),
    ("city", 100.0, CellUnit::Meters, 3395, 2.0, 'D'),
    ("metropolitan", 300.0, CellUnit::Meters, 3395, 5.0, 'D'),
    ("national", 0.5 / 60.0, CellUnit::Degrees, 4326, 10.0, 'C'),
    ("continental", 5.0 / 60.0, CellUnit::Degrees, 4326, 50.0, 'B'),
    ("global", 25.0 / 60.0, CellUnit::Degrees, 4326, 360.0, 'A'),
];

impl ResolutionProfile {
    pub fn tier(index: usize) -> Result<Self> {
        let (label, cell_size, unit, epsg, max_patch_size, sign) = TIERS
            .get(index)
            .copied()
            .ok_or_else(|| ExportError::config(format!("resolution index {} is invalid (0-{})", index, TIERS.len() - 1)))?;
        Ok(Self {
            index,
            label,
            cell_size,
            unit,
            epsg,
            max_patch_size,
            sign,
        })
    }

    pub fn tiers() -> impl Iterator<Item = ResolutionProfile> {
        (0..TIERS.len()).filter_map(|index| Self::tier(index).ok())
    }

    /// パッチサイズの上書き
    pub fn with_max_patch_size(mut self, max_patch_size: f64) -> Self {
        self.max_patch_size = max_patch_size;
        self
    }

    pub fn is_metric(&self) -> bool {
        self.unit == CellUnit::Meters
    }

    pub fn is_world_tier(&self) -> bool {
        self.max_patch_size >= 360.0
    }

    pub fn target_crs(&self) -> String {
        format!("EPSG:{}", self.epsg)
    }

    /// 出力グリッドのセルサイズ（度）
    pub fn cell_size_degrees(&self) -> f64 {
        match self.unit {
            CellUnit::Meters => meters_to_degrees_longitude(self.cell_size),
            CellUnit::Degrees => self.cell_size,
        }
    }

    /// 境界座標の桁数の元になるセルサイズ（メートルは 1m ≒ 0.0000111度）
    pub fn precision_cell_size(&self) -> f64 {
        match self.unit {
            CellUnit::Meters => self.cell_size * 0.0000111,
            CellUnit::Degrees => self.cell_size,
        }
    }

    pub fn coordinate_precision(&self) -> usize {
        coordinate_precision(self.precision_cell_size())
    }
}

/// 科学表記の指数の絶対値を小数桁数として使う
pub fn coordinate_precision(cell_size: f64) -> usize {
    if !(cell_size.is_finite() && cell_size > 0.0) {
        return 0;
    }
    let formatted = format!("{:E}", cell_size);
    formatted
        .rsplit('E')
        .next()
        .and_then(|exponent| exponent.parse::<i32>().ok())
        .map(|exponent| exponent.unsigned_abs() as usize)
        .unwrap_or(0)
}

/// 出力解像度を入力ラスタの解像度と照合して決める
pub fn resolve_cell_size(target: f64, source: f64, keep_same: bool, prevent_higher: bool) -> f64 {
    if keep_same {
        warn!("Keeping the same resolution as the input raster ({})", source);
        return source;
    }
    if prevent_higher && target < source {
        warn!(
            "Requested cell size {} is finer than the input raster cell size {}; exporting at the input resolution",
            target, source
        );
        return source;
    }
    target
}

/// 外部エンジンに渡すリサンプリング方法。Average/Summaryは内部の集約で処理する
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResamplingMethod {
    #[default]
    Nearest,
    Bilinear,
    Average,
    Maximum,
    Minimum,
    Summary,
}

impl ResamplingMethod {
    /// gdalwarp の -r に渡す名前
    pub fn gdal_name(&self) -> &'static str {
        match self {
            ResamplingMethod::Nearest => "near",
            ResamplingMethod::Bilinear => "bilinear",
            ResamplingMethod::Average | ResamplingMethod::Summary => "average",
            ResamplingMethod::Maximum => "max",
            ResamplingMethod::Minimum => "min",
        }
    }

    pub fn is_aggregation(&self) -> bool {
        matches!(self, ResamplingMethod::Average | ResamplingMethod::Summary)
    }

    pub fn is_summary(&self) -> bool {
        matches!(self, ResamplingMethod::Summary)
    }
}

impl std::str::FromStr for ResamplingMethod {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "nearest" | "near" | "0" => Ok(ResamplingMethod::Nearest),
            "bilinear" | "1" => Ok(ResamplingMethod::Bilinear),
            "average" | "5" => Ok(ResamplingMethod::Average),
            "max" | "maximum" | "7" => Ok(ResamplingMethod::Maximum),
            "min" | "minimum" | "8" => Ok(ResamplingMethod::Minimum),
            "sum" | "summary" | "9" => Ok(ResamplingMethod::Summary),
            other => Err(ExportError::config(format!("unknown resampling method: {}", other))),
        }
    }
}

/// 集約時のno-dataセルの扱い
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NoDataPolicy {
    /// 1つでもno-dataがあれば出力セルもno-data
    #[default]
    Propagate,
    /// no-dataセルを無視して残りで集約
    Ignore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    #[default]
    Grid,
    MunicipalBudget,
    Reachability,
}

/// 道路クラス（優先度の高い順に並べる）
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkClass {
    pub name: String,
    pub values: Vec<String>,
}

impl NetworkClass {
    pub fn new(name: impl Into<String>, values: &[&str]) -> Self {
        Self {
            name: name.into(),
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }
}

/// OSM向けの既定の道路クラス
pub fn default_network_map() -> Vec<NetworkClass> {
    vec![
        NetworkClass::new("Highway", &["motorway", "trunk"]),
        NetworkClass::new("Highway Link", &["motorway_link", "trunk_link"]),
        NetworkClass::new("Primary", &["primary"]),
        NetworkClass::new("Secondary", &["secondary"]),
        NetworkClass::new("Ignore", &["footway"]),
    ]
}

/// 1回のエクスポートの設定。実行中は変更しない
#[derive(Debug, Clone)]
pub struct ExportConfig {
    pub output_root: PathBuf,
    pub name: String,
    pub field: Option<String>,
    pub location: String,
    pub source: Option<String>,
    pub citation: Option<String>,
    pub mandatory_citation: bool,
    pub link: Option<String>,
    /// YYYY[.MM[.DD]]
    pub date: String,
    pub only_year: bool,
    pub color: u8,
    pub group: String,
    pub units: Units,
    pub resolution: ResolutionProfile,
    pub resampling: ResamplingMethod,
    pub no_data_policy: NoDataPolicy,
    pub mode: OutputMode,
    pub no_data_values: Vec<f64>,
    pub no_data_tokens: Vec<String>,
    pub band: usize,
    pub keep_same_resolution: bool,
    pub prevent_higher_resolution: bool,
    pub clip_to_data: bool,
    pub fix_geometry: bool,
    pub network_map: Vec<NetworkClass>,
}

impl ExportConfig {
    pub fn new(output_root: impl Into<PathBuf>, name: impl Into<String>, location: impl Into<String>, resolution: ResolutionProfile) -> Self {
        Self {
            output_root: output_root.into(),
            name: name.into(),
            field: None,
            location: location.into(),
            source: None,
            citation: None,
            mandatory_citation: false,
            link: None,
            date: String::new(),
            only_year: false,
            color: 1,
            group: "Exported From QGIS".to_string(),
            units: Units::default(),
            resolution,
            resampling: ResamplingMethod::default(),
            no_data_policy: NoDataPolicy::default(),
            mode: OutputMode::default(),
            no_data_values: Vec::new(),
            no_data_tokens: Vec::new(),
            band: 1,
            keep_same_resolution: false,
            prevent_higher_resolution: true,
            clip_to_data: false,
            fix_geometry: true,
            network_map: default_network_map(),
        }
    }

    /// 処理開始前のチェック。問題があれば最初のものを返す
    pub fn validate(&self, kind: LayerKind) -> Result<()> {
        if !self.output_root.is_dir() {
            return Err(ExportError::config(format!(
                "output path does not exist: {}",
                self.output_root.display()
            )));
        }
        if self.name.trim().is_empty() {
            return Err(ExportError::config("layer name is empty"));
        }
        if self.location.trim().is_empty() {
            return Err(ExportError::config("location is empty"));
        }
        if self.band == 0 {
            return Err(ExportError::config("band index starts at 1"));
        }
        if !(self.resolution.max_patch_size > 0.0) {
            return Err(ExportError::config("maximum patch size must be positive"));
        }
        validate_date(&self.date)?;

        if kind.is_vector() && self.field.as_deref().map_or(true, |f| f.trim().is_empty()) {
            return Err(ExportError::config("a field name is required for vector layers"));
        }
        match self.mode {
            OutputMode::MunicipalBudget if kind != LayerKind::VectorPolygon => {
                Err(ExportError::config("municipal budget can be created only from polygons"))
            }
            OutputMode::Reachability if kind != LayerKind::VectorLine => {
                Err(ExportError::config("reachability can be created only from lines"))
            }
            OutputMode::Reachability if self.network_map.is_empty() => {
                Err(ExportError::config("network map is empty"))
            }
            _ => Ok(()),
        }
    }

    /// ファイル名に使う日付コード
    pub fn date_code(&self) -> String {
        if self.only_year {
            let chars: Vec<char> = self.date.chars().collect();
            chars[chars.len().saturating_sub(2)..].iter().collect()
        } else {
            self.date.replace('.', "")
        }
    }

    pub fn output_dir(&self) -> PathBuf {
        match self.mode {
            OutputMode::MunicipalBudget => self.output_root.join("Municipal Budget"),
            _ => self.output_root.join("Sites").join(&self.location),
        }
    }
}

/// YYYY、YYYY.MM、YYYY.MM.DD のいずれか
pub fn validate_date(date: &str) -> Result<()> {
    let invalid = || ExportError::config(format!("date must be YYYY[.MM[.DD]]: {:?}", date));
    let parts: Vec<&str> = date.trim().split('.').collect();
    if parts.is_empty() || parts.len() > 3 || parts[0].len() != 4 {
        return Err(invalid());
    }
    let mut numbers = Vec::with_capacity(3);
    for part in &parts {
        numbers.push(part.parse::<u32>().map_err(|_| invalid())?);
    }
    let year = numbers[0] as i32;
    let month = numbers.get(1).copied().unwrap_or(1);
    let day = numbers.get(2).copied().unwrap_or(1);
    NaiveDate::from_ymd_opt(year, month, day).map(|_| ()).ok_or_else(invalid)
}
