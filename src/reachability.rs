//! Road network graph for reachability analysis.
//!
//! Each road class is rasterized at a third of the output cell size. The fine
//! raster is reduced to output cells ("supercells") and every set supercell is
//! linked to its set neighbours to the top-left, top, top-right and left. A
//! link is only emitted when the fine raster shows the road actually crossing
//! the shared border, except for the highest-priority class which always
//! connects.
//!
//! Classes are processed in priority order as a fold over [`GraphState`], which
//! carries the rasters of the previous class so links into it can be found.

use crate::config::NetworkClass;
use crate::engine::FeatureFilter;
use crate::model::{GeoTransform, Raster};
use crate::writer::GraphEdge;

/// Fine cells per supercell side.
pub const SUBCELLS: usize = 3;

/// A road class ready to be rasterized.
#[derive(Debug, Clone, PartialEq)]
pub struct RoadClass {
    pub name: String,
    /// `2^(reversed position)`, so 16 is the first of five classes.
    pub code: u32,
    pub filter: FeatureFilter,
    pub always_connects: bool,
}

/// Turns the network map into classes. The last class collects every feature
/// whose value is not listed by any class.
pub fn plan_classes(network_map: &[NetworkClass], field: &str) -> Vec<RoadClass> {
    let n = network_map.len();
    let mut listed: Vec<String> = Vec::new();
    network_map
        .iter()
        .enumerate()
        .map(|(i, class)| {
            let last = i + 1 == n;
            let filter = if last {
                let mut values = listed.clone();
                values.extend(class.values.iter().cloned());
                FeatureFilter::exclude(field, values)
            } else {
                listed.extend(class.values.iter().cloned());
                FeatureFilter::include(field, class.values.clone())
            };
            RoadClass {
                name: class.name.clone(),
                code: 1 << (n - 1 - i),
                filter,
                always_connects: i == 0,
            }
        })
        .collect()
}

fn is_set(raster: &Raster, col: usize, row: usize) -> bool {
    raster.get(col, row).map_or(false, |v| v > 0.0)
}

/// Reduces a fine raster to supercells.
///
/// A supercell is set when any subcell of its centre cross (top-middle,
/// middle-left, middle, middle-right, bottom-middle) is set. Corners alone do
/// not count. Incomplete trailing subcell rows and columns are dropped.
pub fn reduce_supercells(fine: &Raster) -> Raster {
    let cols = fine.cols / SUBCELLS;
    let rows = fine.rows / SUBCELLS;
    let mut values = vec![0.0; cols * rows];
    for y in 0..rows {
        for x in 0..cols {
            let (r, c) = (y * SUBCELLS, x * SUBCELLS);
            let cross = [(r, c + 1), (r + 1, c), (r + 1, c + 1), (r + 1, c + 2), (r + 2, c + 1)];
            if cross.iter().any(|&(row, col)| is_set(fine, col, row)) {
                values[y * cols + x] = 1.0;
            }
        }
    }
    let gt = &fine.transform;
    Raster {
        cols,
        rows,
        transform: GeoTransform::new(
            gt.origin_x,
            gt.cell_width * SUBCELLS as f64,
            gt.origin_y,
            gt.cell_height * SUBCELLS as f64,
        ),
        values,
        crs: fine.crs.clone(),
    }
}

/// Rasters of one processed class.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassRasters {
    pub coarse: Raster,
    pub fine: Raster,
}

impl ClassRasters {
    pub fn from_fine(fine: Raster) -> Self {
        Self {
            coarse: reduce_supercells(&fine),
            fine,
        }
    }
}

/// Neighbour offsets (dy, dx) and the fine cells (row, col) proving the link.
fn neighbours(x: usize, y: usize) -> [((isize, isize), [(usize, usize); 3]); 4] {
    let s = SUBCELLS;
    [
        // 左上
        ((-1, -1), [((y - 1) * s + 2, (x - 1) * s + 2), (y * s, (x - 1) * s + 2), ((y - 1) * s + 2, x * s)]),
        // 上
        ((-1, 0), [((y - 1) * s + 2, x * s), ((y - 1) * s + 2, x * s + 1), ((y - 1) * s + 2, x * s + 2)]),
        // 右上
        ((-1, 1), [((y - 1) * s + 2, (x + 1) * s), ((y - 1) * s + 2, x * s + 2), (y * s, (x + 1) * s)]),
        // 左
        ((0, -1), [(y * s, (x - 1) * s + 2), (y * s + 1, (x - 1) * s + 2), (y * s + 2, (x - 1) * s + 2)]),
    ]
}

/// Links of one class, checked against itself and the previous class.
pub fn detect_edges(current: &ClassRasters, previous: Option<&ClassRasters>, class: &RoadClass, length: f64) -> Vec<GraphEdge> {
    let coarse = &current.coarse;
    let (count_x, count_y) = (coarse.cols, coarse.rows);
    let gt = &coarse.transform;
    let diagonal = (length * length * 2.0).sqrt();
    let centre = |x: usize, y: usize| {
        (
            gt.origin_x + gt.cell_width * x as f64 + gt.cell_width * 0.5,
            gt.origin_y + gt.cell_height * y as f64 + gt.cell_height * 0.5,
        )
    };

    let mut edges = Vec::new();
    // 端の行・列は飛ばす
    for y in 1..count_y {
        for x in 1..count_x.saturating_sub(1) {
            if !is_set(coarse, x, y) {
                continue;
            }
            let source = y * count_x + x;
            let (x1, y1) = centre(x, y);

            for ((dy, dx), proof) in neighbours(x, y) {
                let nx = (x as isize + dx) as usize;
                let ny = (y as isize + dy) as usize;
                let fine = if is_set(coarse, nx, ny) {
                    &current.fine
                } else {
                    match previous {
                        Some(prev) if is_set(&prev.coarse, nx, ny) => &prev.fine,
                        _ => continue,
                    }
                };
                if !(class.always_connects || proof.iter().any(|&(row, col)| is_set(fine, col, row))) {
                    continue;
                }
                let (x2, y2) = centre(nx, ny);
                edges.push(GraphEdge {
                    length: if dx != 0 && dy != 0 { diagonal } else { length },
                    source,
                    target: ny * count_x + nx,
                    x1,
                    y1,
                    x2,
                    y2,
                    classification: class.code,
                });
            }
        }
    }
    edges
}

/// Accumulator of the class fold.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphState {
    previous: Option<ClassRasters>,
}

impl GraphState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn previous(&self) -> Option<&ClassRasters> {
        self.previous.as_ref()
    }

    /// Processes one class and hands its rasters on to the next.
    pub fn step(self, class: &RoadClass, fine: Raster, length: f64) -> (GraphState, Vec<GraphEdge>) {
        let current = ClassRasters::from_fine(fine);
        let edges = detect_edges(&current, self.previous.as_ref(), class, length);
        (
            GraphState {
                previous: Some(current),
            },
            edges,
        )
    }
}
