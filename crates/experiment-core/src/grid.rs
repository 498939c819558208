//! Grid topology: walkable/blocked cells, exact-distance placement, occupancy, and layout sources.

use std::collections::BTreeSet;
use std::path::PathBuf;

use contracts::{GridPos, LayoutConfig};
use rand::seq::SliceRandom;
use rand::Rng;
use thiserror::Error;

pub const DEFAULT_ROOM_WIDTH: usize = 18;
pub const DEFAULT_ROOM_HEIGHT: usize = 10;

#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("layout has zero width or height")]
    Empty,
    #[error("layout has no walkable cells")]
    NoWalkableCells,
    #[error("failed to read layout {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementQuality {
    Exact,
    Relaxed,
    Fallback,
}

impl PlacementQuality {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Relaxed => "relaxed",
            Self::Fallback => "fallback",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub position: GridPos,
    pub requested_distance: u32,
    pub actual_distance: u32,
    pub tolerance: u32,
    pub quality: PlacementQuality,
}

impl Placement {
    pub fn is_degraded(&self) -> bool {
        self.quality != PlacementQuality::Exact
    }
}

#[derive(Debug, Clone)]
pub struct GridTopology {
    width: usize,
    height: usize,
    walkable: Vec<bool>,
    occupied: BTreeSet<GridPos>,
    free_list: Vec<GridPos>,
}

impl GridTopology {
    /// Parses a character grid. `floor` marks walkable cells; anything else, and
    /// any cell missing from a short row or absent row, is wall.
    pub fn from_layout<S: AsRef<str>>(
        rows: &[S],
        width: Option<usize>,
        height: Option<usize>,
        floor: char,
    ) -> Result<Self, LayoutError> {
        let width = width.unwrap_or_else(|| {
            rows.iter()
                .map(|row| row.as_ref().chars().count())
                .max()
                .unwrap_or(0)
        });
        let height = height.unwrap_or(rows.len());
        if width == 0 || height == 0 {
            return Err(LayoutError::Empty);
        }

        let mut walkable = vec![false; width * height];
        for (y, row) in rows.iter().take(height).enumerate() {
            for (x, symbol) in row.as_ref().chars().take(width).enumerate() {
                walkable[y * width + x] = symbol == floor;
            }
        }
        if !walkable.iter().any(|cell| *cell) {
            return Err(LayoutError::NoWalkableCells);
        }

        Ok(Self {
            width,
            height,
            walkable,
            occupied: BTreeSet::new(),
            free_list: Vec::new(),
        })
    }

    /// 18x10 room: wall ring around an open interior.
    pub fn default_room() -> Self {
        let rows = default_room_rows();
        Self::from_layout(&rows, None, None, '.').unwrap_or_else(|_| Self {
            width: DEFAULT_ROOM_WIDTH,
            height: DEFAULT_ROOM_HEIGHT,
            walkable: vec![true; DEFAULT_ROOM_WIDTH * DEFAULT_ROOM_HEIGHT],
            occupied: BTreeSet::new(),
            free_list: Vec::new(),
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn in_bounds(&self, pos: GridPos) -> bool {
        pos.x >= 0 && pos.y >= 0 && (pos.x as usize) < self.width && (pos.y as usize) < self.height
    }

    pub fn is_walkable(&self, pos: GridPos) -> bool {
        self.in_bounds(pos) && self.walkable[pos.y as usize * self.width + pos.x as usize]
    }

    /// Interior cells exclude the outer ring of the declared grid.
    pub fn is_interior(&self, pos: GridPos) -> bool {
        pos.x >= 1
            && pos.y >= 1
            && (pos.x as usize) + 1 < self.width
            && (pos.y as usize) + 1 < self.height
    }

    pub fn is_occupied(&self, pos: GridPos) -> bool {
        self.occupied.contains(&pos)
    }

    /// Returns false if the cell is not walkable or already occupied.
    pub fn occupy(&mut self, pos: GridPos) -> bool {
        if !self.is_walkable(pos) {
            return false;
        }
        self.occupied.insert(pos)
    }

    pub fn release(&mut self, pos: GridPos) -> bool {
        self.occupied.remove(&pos)
    }

    pub fn occupied_count(&self) -> usize {
        self.occupied.len()
    }

    pub fn walkable_cells(&self) -> impl Iterator<Item = GridPos> + '_ {
        (0..self.height).flat_map(move |y| {
            (0..self.width).filter_map(move |x| {
                let pos = GridPos::new(x as i32, y as i32);
                self.is_walkable(pos).then_some(pos)
            })
        })
    }

    fn is_placeable(&self, pos: GridPos, start: GridPos) -> bool {
        pos != start && self.is_walkable(pos) && self.is_interior(pos) && !self.is_occupied(pos)
    }

    /// Picks a cell at exactly `distance` steps (Manhattan) from `start`. When no
    /// such cell is usable the tolerance widens one step at a time up to
    /// `distance`; the result is then `Relaxed`, or `Fallback` (the start itself)
    /// when nothing qualifies at all.
    pub fn position_at_distance<R: Rng + ?Sized>(
        &self,
        start: GridPos,
        distance: u32,
        rng: &mut R,
    ) -> Placement {
        let exact = self.placeable_ring(start, distance);
        if let Some(position) = exact.choose(rng).copied() {
            return Placement {
                position,
                requested_distance: distance,
                actual_distance: distance,
                tolerance: 0,
                quality: PlacementQuality::Exact,
            };
        }

        for tolerance in 1..=distance {
            let mut candidates = Vec::new();
            if tolerance < distance {
                candidates.extend(self.placeable_ring(start, distance - tolerance));
            }
            candidates.extend(self.placeable_ring(start, distance + tolerance));
            if let Some(position) = candidates.choose(rng).copied() {
                return Placement {
                    position,
                    requested_distance: distance,
                    actual_distance: start.manhattan(position),
                    tolerance,
                    quality: PlacementQuality::Relaxed,
                };
            }
        }

        Placement {
            position: start,
            requested_distance: distance,
            actual_distance: 0,
            tolerance: distance,
            quality: PlacementQuality::Fallback,
        }
    }

    /// Draws a walkable, unoccupied cell without replacement. The free list is
    /// rebuilt from every walkable cell once exhausted, so cells repeat across a
    /// long session.
    pub fn random_available_position<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<GridPos> {
        for _ in 0..2 {
            if self.free_list.is_empty() {
                self.rebuild_free_list();
            }
            while !self.free_list.is_empty() {
                let index = rng.gen_range(0..self.free_list.len());
                let candidate = self.free_list.swap_remove(index);
                if !self.is_occupied(candidate) {
                    return Some(candidate);
                }
            }
        }
        None
    }

    pub fn free_list_len(&self) -> usize {
        self.free_list.len()
    }

    fn rebuild_free_list(&mut self) {
        self.free_list = self.walkable_cells().collect();
    }

    fn placeable_ring(&self, start: GridPos, distance: u32) -> Vec<GridPos> {
        manhattan_ring(start, distance)
            .into_iter()
            .filter(|pos| self.is_placeable(*pos, start))
            .collect()
    }

    /// Renders the grid with `#` walls, `.` floor and `o` occupied cells.
    pub fn render(&self) -> Vec<String> {
        (0..self.height)
            .map(|y| {
                (0..self.width)
                    .map(|x| {
                        let pos = GridPos::new(x as i32, y as i32);
                        if self.is_occupied(pos) {
                            'o'
                        } else if self.is_walkable(pos) {
                            '.'
                        } else {
                            '#'
                        }
                    })
                    .collect()
            })
            .collect()
    }
}

/// Lattice cells with `|dx| + |dy| == distance`, in ascending `dx` then `dy` order.
pub fn manhattan_ring(start: GridPos, distance: u32) -> Vec<GridPos> {
    let d = distance as i32;
    let mut ring = Vec::with_capacity((4 * distance.max(1)) as usize);
    for dx in -d..=d {
        let rest = d - dx.abs();
        if rest == 0 {
            ring.push(GridPos::new(start.x + dx, start.y));
        } else {
            ring.push(GridPos::new(start.x + dx, start.y - rest));
            ring.push(GridPos::new(start.x + dx, start.y + rest));
        }
    }
    ring
}

pub fn default_room_rows() -> Vec<String> {
    (0..DEFAULT_ROOM_HEIGHT)
        .map(|y| {
            (0..DEFAULT_ROOM_WIDTH)
                .map(|x| {
                    let edge = x == 0
                        || y == 0
                        || x + 1 == DEFAULT_ROOM_WIDTH
                        || y + 1 == DEFAULT_ROOM_HEIGHT;
                    if edge {
                        '#'
                    } else {
                        '.'
                    }
                })
                .collect()
        })
        .collect()
}

/// External provider of the live grid.
pub trait LayoutSource: Send {
    fn load(&mut self) -> Result<GridTopology, LayoutError>;

    fn describe(&self) -> String;
}

#[derive(Debug, Clone)]
pub struct StaticLayout {
    pub rows: Vec<String>,
    pub width: Option<usize>,
    pub height: Option<usize>,
    pub floor_symbol: char,
}

impl StaticLayout {
    pub fn default_room() -> Self {
        Self {
            rows: default_room_rows(),
            width: None,
            height: None,
            floor_symbol: '.',
        }
    }
}

impl LayoutSource for StaticLayout {
    fn load(&mut self) -> Result<GridTopology, LayoutError> {
        GridTopology::from_layout(&self.rows, self.width, self.height, self.floor_symbol)
    }

    fn describe(&self) -> String {
        format!("static layout ({} rows)", self.rows.len())
    }
}

#[derive(Debug, Clone)]
pub struct FileLayout {
    pub path: PathBuf,
    pub width: Option<usize>,
    pub height: Option<usize>,
    pub floor_symbol: char,
}

impl LayoutSource for FileLayout {
    fn load(&mut self) -> Result<GridTopology, LayoutError> {
        let raw = std::fs::read_to_string(&self.path).map_err(|source| LayoutError::Io {
            path: self.path.display().to_string(),
            source,
        })?;
        let rows = raw
            .lines()
            .map(|line| line.trim_end_matches('\r').to_string())
            .collect::<Vec<_>>();
        GridTopology::from_layout(&rows, self.width, self.height, self.floor_symbol)
    }

    fn describe(&self) -> String {
        format!("layout file {}", self.path.display())
    }
}

pub fn layout_source_from_config(config: &LayoutConfig) -> Box<dyn LayoutSource> {
    if let Some(path) = config.path.as_ref().filter(|path| !path.trim().is_empty()) {
        return Box::new(FileLayout {
            path: PathBuf::from(path),
            width: config.width,
            height: config.height,
            floor_symbol: config.floor_symbol,
        });
    }
    if config.rows.is_empty() {
        return Box::new(StaticLayout::default_room());
    }
    Box::new(StaticLayout {
        rows: config.rows.clone(),
        width: config.width,
        height: config.height,
        floor_symbol: config.floor_symbol,
    })
}
