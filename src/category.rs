use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{ExportError, Result};
use crate::writer::encoding;

/// ur-scapeで正しく表示できるカテゴリ数の上限
pub const MAX_DISPLAYABLE_CATEGORIES: usize = 128;

/// リスト表記の値を "a & b" の形にそろえる
///
/// `['residential','commercial']` -> `residential & commercial`のように
/// 括弧と引用符を外して要素を " & " でつなぐ。要素前後の空白はそのまま残す。
pub fn clean_category_string(raw: &str) -> String {
    let trimmed = raw.trim();
    let without_brackets = trimmed.trim_start_matches('[').trim_end_matches(']');
    without_brackets
        .split(',')
        .map(|part| {
            if part.len() >= 2 && part.starts_with('\'') && part.ends_with('\'') {
                part.trim_matches('\'')
            } else {
                part
            }
        })
        .collect::<Vec<_>>()
        .join(" & ")
}

/// カテゴリ名と整数IDの対応（IDは1から）
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CategoryTable {
    names: Vec<String>,
}

impl CategoryTable {
    /// 生の属性値から作る。整形、重複除去、辞書順に並べてからIDを振る
    pub fn from_values<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let names: BTreeSet<String> = values.into_iter().map(|v| clean_category_string(v.as_ref())).collect();
        let table = Self {
            names: names.into_iter().collect(),
        };
        table.warn_if_too_many();
        table
    }

    /// 並び順をそのまま使う（ラスタの付属CSV向け）
    pub fn from_ordered(names: Vec<String>) -> Self {
        let table = Self { names };
        table.warn_if_too_many();
        table
    }

    /// ラスタと同名の `<raster>.csv` からカテゴリを読む
    ///
    /// ヘッダー行で`field`を含む列を探し、その列の値を行順に並べる。
    /// no-dataトークンと一致する値は除外する。付属ファイルが無い、または
    /// 該当する列が無い場合は`None`（カテゴリ無しのラスタ）。
    pub fn from_sidecar(raster_path: &Path, field: &str, no_data_tokens: &[String]) -> Result<Option<Self>> {
        let sidecar = sidecar_path(raster_path);
        if !sidecar.is_file() {
            debug!("No category file found at {}", sidecar.display());
            return Ok(None);
        }
        info!("Reading categories from {}", sidecar.display());

        let (content, _) = encoding::read_text(&sidecar)?;
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(content.as_bytes());

        let headers = reader.headers()?;
        if headers.is_empty() {
            return Err(ExportError::Format(format!("category file is empty: {}", sidecar.display())));
        }
        // 最後に一致した列を使う
        let column = headers
            .iter()
            .enumerate()
            .filter(|(_, name)| name.contains(field))
            .map(|(idx, _)| idx)
            .last();
        let Some(column) = column else {
            warn!("Field {} not found in {}", field, sidecar.display());
            return Ok(None);
        };

        let mut names = Vec::new();
        for record in reader.records() {
            let record = record?;
            let Some(value) = record.get(column) else {
                continue;
            };
            if no_data_tokens.iter().any(|token| token == value) {
                continue;
            }
            names.push(value.to_string());
        }
        Ok(Some(Self::from_ordered(names)))
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// (名前, ID) をID順に返す
    pub fn entries(&self) -> impl Iterator<Item = (&str, u32)> {
        self.names.iter().enumerate().map(|(i, name)| (name.as_str(), i as u32 + 1))
    }

    pub fn name(&self, id: u32) -> Option<&str> {
        let index = (id as usize).checked_sub(1)?;
        self.names.get(index).map(String::as_str)
    }

    /// 生の属性値に割り当てられたID
    pub fn id_of(&self, raw: &str) -> Option<u32> {
        let cleaned = clean_category_string(raw);
        self.names.iter().position(|name| *name == cleaned).map(|i| i as u32 + 1)
    }

    fn warn_if_too_many(&self) {
        if self.names.len() > MAX_DISPLAYABLE_CATEGORIES {
            warn!(
                "Using {} categories; ur-scape shows at most {} correctly",
                self.names.len(),
                MAX_DISPLAYABLE_CATEGORIES
            );
        }
    }
}

pub fn sidecar_path(raster_path: &Path) -> PathBuf {
    let mut name = raster_path.as_os_str().to_owned();
    name.push(".csv");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_clean_category_string() {
        assert_eq!(clean_category_string("forest"), "forest");
        assert_eq!(clean_category_string("  forest "), "forest");
        assert_eq!(clean_category_string("['a','b']"), "a & b");
        assert_eq!(clean_category_string("[x,y]"), "x & y");
    }

    #[test]
    fn test_from_values_sorted_and_deduplicated() {
        let table = CategoryTable::from_values(["water", "forest", "water", "urban"]);
        let entries: Vec<_> = table.entries().collect();
        assert_eq!(entries, vec![("forest", 1), ("urban", 2), ("water", 3)]);
        assert_eq!(table.id_of("water"), Some(3));
        assert_eq!(table.id_of(" water "), Some(3));
        assert_eq!(table.id_of("desert"), None);
        assert_eq!(table.name(1), Some("forest"));
        assert_eq!(table.name(0), None);
    }

    #[test]
    fn test_list_values_share_an_id() {
        let table = CategoryTable::from_values(["['a','b']", "[a,b]"]);
        assert_eq!(table.len(), 1);
        assert_eq!(table.id_of("['a','b']"), table.id_of("[a,b]"));
    }

    #[test]
    fn test_sidecar_keeps_order_and_skips_tokens() {
        let temp_dir = TempDir::new().unwrap();
        let raster = temp_dir.path().join("landuse.tif");
        fs::write(sidecar_path(&raster), "Value,LandUse_Class\n1,water\n2,forest\n3,unknown\n4,urban\n").unwrap();

        let table = CategoryTable::from_sidecar(&raster, "LandUse", &["unknown".to_string()])
            .unwrap()
            .unwrap();
        let names: Vec<_> = table.entries().map(|(name, _)| name.to_string()).collect();
        assert_eq!(names, vec!["water", "forest", "urban"]);
    }

    #[test]
    fn test_sidecar_quoted_category_with_comma() {
        let temp_dir = TempDir::new().unwrap();
        let raster = temp_dir.path().join("landuse.tif");
        fs::write(sidecar_path(&raster), "Value,Class\n1,\"forest, dense\"\n2,water\n").unwrap();

        let table = CategoryTable::from_sidecar(&raster, "Class", &[]).unwrap().unwrap();
        let entries: Vec<_> = table.entries().collect();
        assert_eq!(entries, vec![("forest, dense", 1), ("water", 2)]);
    }

    #[test]
    fn test_sidecar_missing_field() {
        let temp_dir = TempDir::new().unwrap();
        let raster = temp_dir.path().join("landuse.tif");
        fs::write(sidecar_path(&raster), "Value,Name\n1,water\n").unwrap();
        assert!(CategoryTable::from_sidecar(&raster, "LandUse", &[]).unwrap().is_none());
    }

    #[test]
    fn test_no_sidecar() {
        let temp_dir = TempDir::new().unwrap();
        let raster = temp_dir.path().join("dem.tif");
        assert!(CategoryTable::from_sidecar(&raster, "height", &[]).unwrap().is_none());
    }
}
