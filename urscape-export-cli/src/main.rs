use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use rayon::ThreadPoolBuilder;
use std::path::PathBuf;
use tracing::{error, info};
use urscape_export::config::validate_date;
use urscape_export::geo::DEG_TO_KM;
use urscape_export::reader::describe_layer;
use urscape_export::{
    ensure_scratch_space, estimate_scratch_bytes, ExportConfig, ExportError, Exporter, GdalGeoprocessor, Layer, LayerKind, NoDataPolicy,
    OutputMode, ResamplingMethod, ResolutionProfile, Units,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Kind {
    Raster,
    Point,
    Line,
    Polygon,
}

impl From<Kind> for LayerKind {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Raster => LayerKind::Raster,
            Kind::Point => LayerKind::VectorPoint,
            Kind::Line => LayerKind::VectorLine,
            Kind::Polygon => LayerKind::VectorPolygon,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    Grid,
    Municipal,
    Reachability,
}

impl From<Mode> for OutputMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Grid => OutputMode::Grid,
            Mode::Municipal => OutputMode::MunicipalBudget,
            Mode::Reachability => OutputMode::Reachability,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 入力レイヤー（GeoTIFFなどのラスター、またはベクターデータ）
    #[arg(value_name = "INPUT")]
    input: PathBuf,

    /// 出力先のデータディレクトリ（layers.csvがある場所）
    #[arg(short, long, value_name = "DIR")]
    output: PathBuf,

    /// レイヤー名
    #[arg(short, long)]
    name: String,

    /// 地域名（サブディレクトリ名になる）
    #[arg(short, long)]
    location: String,

    /// 入力の種類
    #[arg(short, long, value_enum, default_value_t = Kind::Raster)]
    kind: Kind,

    /// 出力モード
    #[arg(short, long, value_enum, default_value_t = Mode::Grid)]
    mode: Mode,

    /// ベクターの属性フィールド
    #[arg(short, long)]
    field: Option<String>,

    /// 解像度ティア（0: neighbourhood ... 5: global）
    #[arg(short, long, default_value_t = 3)]
    resolution: usize,

    /// パッチの最大サイズ（ティアの既定値を上書き）
    #[arg(long)]
    max_patch_size: Option<f64>,

    /// 日付（YYYY、YYYY.MM、YYYY.MM.DD）
    #[arg(long, value_name = "YYYY[.MM[.DD]]")]
    date: String,

    /// 年のみを使う
    #[arg(long)]
    only_year: bool,

    #[arg(long)]
    source: Option<String>,

    #[arg(long)]
    citation: Option<String>,

    #[arg(long)]
    mandatory_citation: bool,

    #[arg(long)]
    link: Option<String>,

    /// 単位（定義済みのインデックスまたは任意の文字列）
    #[arg(long)]
    units: Option<String>,

    /// layers.csvに登録する色のインデックス
    #[arg(long, default_value_t = 1)]
    color: u8,

    /// layers.csvのグループ
    #[arg(long, default_value = "Exported From QGIS")]
    group: String,

    /// リサンプリング方法（nearest, bilinear, average, max, min, sum）
    #[arg(long, default_value = "nearest")]
    resampling: String,

    /// 集約時にno-dataセルを無視する
    #[arg(long)]
    ignore_no_data: bool,

    /// no-dataとして扱う値（複数指定可）
    #[arg(long = "no-data", allow_hyphen_values = true)]
    no_data_values: Vec<f64>,

    /// no-dataとして扱うカテゴリ名（複数指定可）
    #[arg(long = "no-data-token")]
    no_data_tokens: Vec<String>,

    /// ラスターのバンド番号
    #[arg(long, default_value_t = 1)]
    band: usize,

    /// 入力と同じ解像度を保つ
    #[arg(long)]
    keep_same_resolution: bool,

    /// 入力より細かい解像度を許す
    #[arg(long)]
    allow_higher_resolution: bool,

    /// パッチをデータのある範囲に切り詰める
    #[arg(long)]
    clip_to_data: bool,

    /// ジオメトリの修復を行わない
    #[arg(long)]
    no_fix_geometry: bool,

    /// 並列処理スレッド数（デフォルト: CPUコア数）
    #[arg(short, long)]
    threads: Option<usize>,
}

fn build_config(args: &Args) -> Result<ExportConfig> {
    let mut resolution = ResolutionProfile::tier(args.resolution)?;
    if let Some(size) = args.max_patch_size {
        resolution = resolution.with_max_patch_size(size);
    }

    let mut config = ExportConfig::new(&args.output, &args.name, &args.location, resolution);
    config.field = args.field.clone();
    config.source = args.source.clone();
    config.citation = args.citation.clone();
    config.mandatory_citation = args.mandatory_citation;
    config.link = args.link.clone();
    validate_date(&args.date)?;
    config.date = args.date.clone();
    config.only_year = args.only_year;
    config.color = args.color;
    config.group = args.group.clone();
    if let Some(units) = &args.units {
        config.units = Units::parse(units);
    }
    config.resampling = args.resampling.parse::<ResamplingMethod>()?;
    if args.ignore_no_data {
        config.no_data_policy = NoDataPolicy::Ignore;
    }
    config.mode = args.mode.into();
    config.no_data_values = args.no_data_values.clone();
    config.no_data_tokens = args.no_data_tokens.clone();
    config.band = args.band;
    config.keep_same_resolution = args.keep_same_resolution;
    config.prevent_higher_resolution = !args.allow_higher_resolution;
    config.clip_to_data = args.clip_to_data;
    config.fix_geometry = !args.no_fix_geometry;
    Ok(config)
}

/// 失敗時は原因の連鎖の最後の2つだけを表示する
fn report(error: ExportError) {
    if error.is_precondition() {
        error!("{}", error);
        return;
    }
    let chain: Vec<String> = anyhow::Error::from(error).chain().map(|e| e.to_string()).collect();
    let start = chain.len().saturating_sub(2);
    error!("Export failed: {}", chain[start..].join(": "));
}

fn main() -> Result<()> {
    // ログの初期化
    tracing_subscriber::fmt::init();

    // CLI引数の解析
    let args = Args::parse();

    // 処理開始時間を記録
    let start_time = std::time::Instant::now();

    // スレッドプールの設定
    if let Some(threads) = args.threads {
        ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
            .context("Failed to build thread pool")?;
    }

    if !args.input.is_file() && !args.input.is_dir() {
        error!("Invalid input path: {:?}", args.input);
        anyhow::bail!("Input path must be an existing file or dataset directory");
    }

    let config = build_config(&args)?;
    let kind = LayerKind::from(args.kind);
    let (extent, crs) = describe_layer(&args.input, kind)?;
    let mut layer = Layer::new(&args.name, kind, &args.input, extent);
    if let Some(crs) = crs {
        layer = layer.with_crs(crs);
    }
    info!("Processing {:?}: {:?}", args.input, layer.extent);

    // 中間ラスターの大きさの見積もり
    let cell_size = if layer.is_geographic() {
        config.resolution.cell_size_degrees()
    } else if config.resolution.is_metric() {
        config.resolution.cell_size
    } else {
        config.resolution.cell_size * DEG_TO_KM * 1000.0
    };
    let scratch = estimate_scratch_bytes(&layer.extent, cell_size);
    info!("Estimated scratch space: {:.1} MB", scratch as f64 / 1_048_576.0);

    let engine = GdalGeoprocessor::new()?;
    let result = ensure_scratch_space(engine.scratch_dir(), scratch)
        .and_then(|()| Exporter::new(&config, &engine).export(&layer));
    let summary = match result {
        Ok(summary) => summary,
        Err(e) => {
            report(e);
            anyhow::bail!("Export of {} failed", args.name);
        }
    };

    for file in &summary.files {
        info!("Written: {:?}", file);
    }
    if summary.skipped_patches > 0 {
        info!("Skipped {} empty patches", summary.skipped_patches);
    }

    // 処理時間を表示
    let elapsed = start_time.elapsed();
    info!("Total processing time: {:?}", elapsed);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Result<Args, clap::Error> {
        let mut argv = vec!["urscape-export", "population.tif", "-o", "data", "-n", "Population", "-l", "Jakarta"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv)
    }

    #[test]
    fn test_date_is_required() {
        let error = parse(&[]).unwrap_err();
        assert_eq!(error.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn test_documented_date_formats_are_accepted() {
        for date in ["2020", "2020.06", "2020.06.30"] {
            let config = build_config(&parse(&["--date", date]).unwrap()).unwrap();
            assert_eq!(config.date, date);
        }
    }

    #[test]
    fn test_compact_date_is_rejected_early() {
        let args = parse(&["--date", "20200101"]).unwrap();
        let error = build_config(&args).unwrap_err();
        assert!(error.to_string().contains("YYYY[.MM[.DD]]"));
    }

    #[test]
    fn test_flags_reach_config() {
        let args = parse(&[
            "--date",
            "2021",
            "--resolution",
            "1",
            "--resampling",
            "sum",
            "--ignore-no-data",
            "--no-data",
            "-9999",
            "--mode",
            "municipal",
            "--no-fix-geometry",
        ])
        .unwrap();
        let config = build_config(&args).unwrap();
        assert_eq!(config.resolution.label, "city");
        assert_eq!(config.resampling, ResamplingMethod::Summary);
        assert_eq!(config.no_data_policy, NoDataPolicy::Ignore);
        assert_eq!(config.no_data_values, vec![-9999.0]);
        assert_eq!(config.mode, OutputMode::MunicipalBudget);
        assert!(!config.fix_geometry);
        assert!(config.prevent_higher_resolution);
    }
}
