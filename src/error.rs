use thiserror::Error;

/// エクスポート処理で発生するエラー
#[derive(Error, Debug)]
pub enum ExportError {
    /// 処理開始前のチェックで検出される設定エラー
    #[error("configuration error: {0}")]
    Config(String),

    /// ディスク容量不足やロックされた出力ファイル
    #[error("resource error: {0}")]
    Resource(String),

    /// グリッドファイルやlayers.csvの書式エラー
    #[error("format error: {0}")]
    Format(String),

    /// 外部ジオプロセッシングエンジンの失敗
    #[error("geoprocessing engine error: {0}")]
    Engine(String),

    #[error("export cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Gdal(#[from] gdal::errors::GdalError),
}

impl ExportError {
    pub fn config(message: impl Into<String>) -> Self {
        ExportError::Config(message.into())
    }

    /// 処理開始前に検出されるエラーかどうか（部分的な出力が存在しない）
    pub fn is_precondition(&self) -> bool {
        matches!(self, ExportError::Config(_) | ExportError::Resource(_))
    }
}

impl From<anyhow::Error> for ExportError {
    fn from(error: anyhow::Error) -> Self {
        // 原因の連鎖を一行にまとめる
        ExportError::Engine(format!("{:#}", error))
    }
}

pub type Result<T> = std::result::Result<T, ExportError>;
