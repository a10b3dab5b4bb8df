//! Rectangular lattice geometry: site flattening and the 4-neighbour topology.
//!
//! Sites are flattened column-major: row `i` and column `j` (both zero-based)
//! map to `site = j * rows + i`. The precision builder relies on this layout,
//! since lattice neighbours then sit at index offsets `1` and `rows`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GridError {
    #[error(
        "Grid shape {rows}x{cols} is degenerate: the 2-D random walk needs at least 2 rows and 2 columns."
    )]
    DegenerateShape { rows: usize, cols: usize },
}

/// Position of a neighbour relative to a site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

impl Direction {
    pub const ALL: [Direction; 4] = [
        Direction::Up,
        Direction::Down,
        Direction::Left,
        Direction::Right,
    ];
}

/// The four lattice neighbours of a site, `None` where the lattice ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Neighbors {
    pub up: Option<usize>,
    pub down: Option<usize>,
    pub left: Option<usize>,
    pub right: Option<usize>,
}

impl Neighbors {
    pub fn get(&self, direction: Direction) -> Option<usize> {
        match direction {
            Direction::Up => self.up,
            Direction::Down => self.down,
            Direction::Left => self.left,
            Direction::Right => self.right,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + use<> {
        [self.up, self.down, self.left, self.right]
            .into_iter()
            .flatten()
    }

    pub fn count(&self) -> usize {
        self.iter().count()
    }
}

/// A validated grid shape. Deserialization goes through [`Grid::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "GridShape")]
pub struct Grid {
    rows: usize,
    cols: usize,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct GridShape {
    rows: usize,
    cols: usize,
}

impl TryFrom<GridShape> for Grid {
    type Error = GridError;

    fn try_from(shape: GridShape) -> Result<Self, Self::Error> {
        Grid::new(shape.rows, shape.cols)
    }
}

impl Grid {
    pub fn new(rows: usize, cols: usize) -> Result<Self, GridError> {
        if rows < 2 || cols < 2 {
            return Err(GridError::DegenerateShape { rows, cols });
        }
        Ok(Self { rows, cols })
    }

    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    #[inline]
    pub fn cols(&self) -> usize {
        self.cols
    }

    #[inline]
    pub fn site_count(&self) -> usize {
        self.rows * self.cols
    }

    /// Flat site index of `(row, col)`.
    ///
    /// # Panics
    /// If either coordinate lies outside the grid.
    #[inline]
    pub fn site_of(&self, row: usize, col: usize) -> usize {
        assert!(
            row < self.rows && col < self.cols,
            "coordinate ({row}, {col}) outside {}x{} grid",
            self.rows,
            self.cols
        );
        col * self.rows + row
    }

    /// Inverse of [`Grid::site_of`].
    ///
    /// # Panics
    /// If `site >= site_count()`.
    #[inline]
    pub fn coords_of(&self, site: usize) -> (usize, usize) {
        assert!(
            site < self.site_count(),
            "site {site} outside grid with {} sites",
            self.site_count()
        );
        (site % self.rows, site / self.rows)
    }

    pub fn neighbors(&self, row: usize, col: usize) -> Neighbors {
        let site = self.site_of(row, col);
        Neighbors {
            up: (row > 0).then(|| site - 1),
            down: (row + 1 < self.rows).then(|| site + 1),
            left: (col > 0).then(|| site - self.rows),
            right: (col + 1 < self.cols).then(|| site + self.rows),
        }
    }

    pub fn neighbors_of_site(&self, site: usize) -> Neighbors {
        let (row, col) = self.coords_of(site);
        self.neighbors(row, col)
    }

    /// Number of existing lattice neighbours: 4 inside, 3 on an edge, 2 in a corner.
    pub fn neighbor_count(&self, site: usize) -> usize {
        self.neighbors_of_site(site).count()
    }

    /// Converts a 1-based external site id into the zero-based index, if it lies on the grid.
    pub fn site_from_external(&self, external: i64) -> Option<usize> {
        let site = usize::try_from(external).ok()?.checked_sub(1)?;
        (site < self.site_count()).then_some(site)
    }
}
