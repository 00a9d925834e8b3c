use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::Result;

/// 列名は既存の読み込み側に合わせて `lenght` のまま
pub const GRAPH_HEADER: &str = "lenght,source,target,x1,y1,x2,y2,classification";

/// 道路網の1辺。ノード番号は `y * count_x + x`
#[derive(Debug, Clone, PartialEq)]
pub struct GraphEdge {
    pub length: f64,
    pub source: usize,
    pub target: usize,
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
    pub classification: u32,
}

impl GraphEdge {
    pub fn to_row(&self) -> String {
        format!(
            "{},{},{},{},{},{},{},{}",
            self.length, self.source, self.target, self.x1, self.y1, self.x2, self.y2, self.classification
        )
    }
}

/// `_graph.csv` への書き込み。作成時にヘッダーを書き、クラスごとに追記する
pub struct GraphFileWriter {
    path: PathBuf,
    edges_written: usize,
}

impl GraphFileWriter {
    pub fn create(path: &Path) -> Result<Self> {
        fs::write(path, format!("{}\n", GRAPH_HEADER))?;
        debug!("Created graph file {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            edges_written: 0,
        })
    }

    pub fn append(&mut self, edges: &[GraphEdge]) -> Result<()> {
        if edges.is_empty() {
            return Ok(());
        }
        let mut text = String::with_capacity(edges.len() * 64);
        for edge in edges {
            text.push_str(&edge.to_row());
            text.push('\n');
        }
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        file.write_all(text.as_bytes())?;
        self.edges_written += edges.len();
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn edges_written(&self) -> usize {
        self.edges_written
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_header_then_appended_rows() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("Roads_D_Palembang_2020_graph.csv");
        let mut writer = GraphFileWriter::create(&path).unwrap();

        let edge = GraphEdge {
            length: 100.0,
            source: 7,
            target: 6,
            x1: 104.5,
            y1: -2.5,
            x2: 104.25,
            y2: -2.5,
            classification: 16,
        };
        writer.append(&[edge.clone()]).unwrap();
        writer.append(&[]).unwrap();
        writer.append(&[GraphEdge { classification: 8, ..edge }]).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[0], GRAPH_HEADER);
        assert_eq!(lines[1], "100,7,6,104.5,-2.5,104.25,-2.5,16");
        assert_eq!(lines[2], "100,7,6,104.5,-2.5,104.25,-2.5,8");
        assert_eq!(writer.edges_written(), 2);
    }

    #[test]
    fn test_create_truncates_previous_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("graph.csv");
        fs::write(&path, "old content\n").unwrap();
        GraphFileWriter::create(&path).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), format!("{}\n", GRAPH_HEADER));
    }
}
