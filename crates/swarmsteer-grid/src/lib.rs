//! 2D spatial hash grid used for agent neighborhood queries.
//!
//! The grid is rebuilt from scratch every simulation tick: cells are
//! cleared (keeping their allocations) and every agent is re-inserted at
//! its current cell. Queries are 2D; the Z axis is filtered at query time
//! with a half-height band around the query origin.

use glam::Vec3;
use std::cell::RefCell;
use std::collections::HashMap;
use thiserror::Error;

/// Errors emitted when constructing a grid.
#[derive(Debug, Error)]
pub enum GridError {
    /// Cell size must be a positive, finite length.
    #[error("invalid cell size: {0}")]
    InvalidCellSize(f32),
}

/// One entry stored in a grid cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridEntry<K> {
    pub key: K,
    pub position: Vec3,
}

#[derive(Debug, Default)]
struct GridCell<K> {
    entries: Vec<GridEntry<K>>,
}

/// Spatial hash over 2D cells keyed by a 64-bit coordinate product.
///
/// `K` identifies entries (typically an agent handle); the grid never
/// interprets it beyond handing it back to visitors.
#[derive(Debug)]
pub struct SpatialHashGrid<K> {
    cell_size: f32,
    inv_cell_size: f32,
    cells: HashMap<i64, GridCell<K>>,
    len: usize,
}

struct Stencil {
    r: i32,
    offsets: Vec<(i32, i32)>,
}

thread_local! {
    // Circular offset table reused across queries; regenerated only when
    // the cell radius changes.
    static STENCIL: RefCell<Stencil> = RefCell::new(Stencil {
        r: 0,
        offsets: Vec::new(),
    });
}

impl<K: Copy> SpatialHashGrid<K> {
    /// Create an empty grid with the given cell edge length.
    pub fn new(cell_size: f32) -> Result<Self, GridError> {
        if !(cell_size.is_finite() && cell_size > 0.0) {
            return Err(GridError::InvalidCellSize(cell_size));
        }
        Ok(Self {
            cell_size,
            inv_cell_size: 1.0 / cell_size,
            cells: HashMap::new(),
            len: 0,
        })
    }

    /// Edge length of one cell.
    #[must_use]
    pub const fn cell_size(&self) -> f32 {
        self.cell_size
    }

    /// Number of entries inserted since the last reset.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns true when no entries have been inserted since the last reset.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Clear all cells while retaining their allocations.
    pub fn reset(&mut self) {
        for cell in self.cells.values_mut() {
            cell.entries.clear();
        }
        self.len = 0;
    }

    /// Insert an entry at its 2D cell.
    pub fn insert(&mut self, key: K, position: Vec3) {
        let cell_key = Self::hash_coord(self.cell_coord_2d(position));
        let cell = self.cells.entry(cell_key).or_insert_with(|| GridCell {
            entries: Vec::with_capacity(8),
        });
        cell.entries.push(GridEntry { key, position });
        self.len += 1;
    }

    /// Visit entries within `radius` of `origin` in the XY plane and
    /// within `z_half_height` of it vertically.
    ///
    /// The visitor returns `false` to stop early. `max_results` caps the
    /// number of emitted entries; `None` is unbounded. A radius smaller
    /// than one cell step still scans the center ring; a zero or negative
    /// radius emits nothing.
    pub fn visit_nearby<F>(
        &self,
        origin: Vec3,
        radius: f32,
        z_half_height: f32,
        max_results: Option<usize>,
        mut visitor: F,
    ) where
        F: FnMut(&GridEntry<K>) -> bool,
    {
        let r = (radius * self.inv_cell_size).ceil() as i32;
        if r <= 0 {
            return;
        }
        if max_results == Some(0) {
            return;
        }

        let center = self.cell_coord_2d(origin);
        let radius_sq = radius * radius;
        let z_lo = origin.z - z_half_height;
        let z_hi = origin.z + z_half_height;
        let mut emitted = 0usize;

        STENCIL.with(|stencil| {
            let mut stencil = stencil.borrow_mut();
            if stencil.r != r {
                stencil.r = r;
                stencil.offsets.clear();
                let r_sq = r * r;
                for dy in -r..=r {
                    for dx in -r..=r {
                        // Keep any cell whose nearest corner can still fall
                        // inside the radius, wherever the origin sits in
                        // its own cell; the exact distance test below
                        // rejects the rest.
                        let gx = (dx.abs() - 1).max(0);
                        let gy = (dy.abs() - 1).max(0);
                        if gx * gx + gy * gy <= r_sq {
                            stencil.offsets.push((dx, dy));
                        }
                    }
                }
            }

            for &(dx, dy) in &stencil.offsets {
                let cell_key = Self::hash_coord((center.0 + dx, center.1 + dy));
                let Some(cell) = self.cells.get(&cell_key) else {
                    continue;
                };
                for entry in &cell.entries {
                    if entry.position.z < z_lo || entry.position.z > z_hi {
                        continue;
                    }
                    let ox = origin.x - entry.position.x;
                    let oy = origin.y - entry.position.y;
                    if ox * ox + oy * oy <= radius_sq {
                        if !visitor(entry) {
                            return;
                        }
                        emitted += 1;
                        if max_results.is_some_and(|cap| emitted >= cap) {
                            return;
                        }
                    }
                }
            }
        });
    }

    /// Collecting variant of [`visit_nearby`](Self::visit_nearby).
    pub fn query_nearby(
        &self,
        origin: Vec3,
        radius: f32,
        z_half_height: f32,
        max_results: Option<usize>,
        out: &mut Vec<GridEntry<K>>,
    ) {
        self.visit_nearby(origin, radius, z_half_height, max_results, |entry| {
            out.push(*entry);
            true
        });
    }

    /// Count matching entries without a result cap.
    #[must_use]
    pub fn estimate_count_at(&self, origin: Vec3, radius: f32, z_half_height: f32) -> usize {
        if self.is_empty() {
            return 0;
        }
        let mut count = 0usize;
        self.visit_nearby(origin, radius, z_half_height, None, |_| {
            count += 1;
            true
        });
        count
    }

    #[inline]
    fn cell_coord_2d(&self, position: Vec3) -> (i32, i32) {
        (
            (position.x * self.inv_cell_size).floor() as i32,
            (position.y * self.inv_cell_size).floor() as i32,
        )
    }

    #[inline]
    fn hash_coord((x, y): (i32, i32)) -> i64 {
        (x as i64).wrapping_mul(73_856_093) ^ (y as i64).wrapping_mul(19_349_663)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid_with(entries: &[(u32, Vec3)]) -> SpatialHashGrid<u32> {
        let mut grid = SpatialHashGrid::new(200.0).expect("grid");
        for &(key, position) in entries {
            grid.insert(key, position);
        }
        grid
    }

    #[test]
    fn rejects_non_positive_cell_size() {
        assert!(SpatialHashGrid::<u32>::new(0.0).is_err());
        assert!(SpatialHashGrid::<u32>::new(-5.0).is_err());
        assert!(SpatialHashGrid::<u32>::new(f32::NAN).is_err());
    }

    #[test]
    fn insert_places_entry_in_its_cell() {
        let grid = grid_with(&[(7, Vec3::new(50.0, 50.0, 0.0))]);
        assert_eq!(grid.len(), 1);

        let mut found = Vec::new();
        grid.query_nearby(Vec3::new(50.0, 50.0, 0.0), 10.0, 10.0, None, &mut found);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].key, 7);
    }

    #[test]
    fn query_enumerates_exactly_the_in_range_entries() {
        let grid = grid_with(&[
            (0, Vec3::new(0.0, 0.0, 0.0)),
            (1, Vec3::new(90.0, 0.0, 0.0)),
            (2, Vec3::new(0.0, 150.0, 0.0)),
            (3, Vec3::new(300.0, 0.0, 0.0)),
            (4, Vec3::new(-120.0, -120.0, 0.0)),
        ]);

        let mut found = Vec::new();
        grid.query_nearby(Vec3::ZERO, 200.0, 50.0, None, &mut found);
        let mut keys: Vec<u32> = found.iter().map(|entry| entry.key).collect();
        keys.sort_unstable();
        assert_eq!(keys, vec![0, 1, 2, 4]);
    }

    #[test]
    fn query_emits_no_duplicates() {
        let grid = grid_with(&[
            (0, Vec3::new(10.0, 10.0, 0.0)),
            (1, Vec3::new(390.0, 390.0, 0.0)),
        ]);
        let mut found = Vec::new();
        grid.query_nearby(Vec3::new(200.0, 200.0, 0.0), 600.0, 100.0, None, &mut found);
        let mut keys: Vec<u32> = found.iter().map(|entry| entry.key).collect();
        keys.sort_unstable();
        keys.dedup();
        assert_eq!(keys.len(), found.len());
    }

    #[test]
    fn z_band_filters_vertically() {
        let grid = grid_with(&[
            (0, Vec3::new(0.0, 0.0, 0.0)),
            (1, Vec3::new(0.0, 0.0, 119.0)),
            (2, Vec3::new(0.0, 0.0, 121.0)),
            (3, Vec3::new(0.0, 0.0, -200.0)),
        ]);
        assert_eq!(grid.estimate_count_at(Vec3::ZERO, 100.0, 120.0), 2);
    }

    #[test]
    fn zero_radius_returns_nothing() {
        let grid = grid_with(&[(0, Vec3::ZERO)]);
        assert_eq!(grid.estimate_count_at(Vec3::ZERO, 0.0, 100.0), 0);

        let mut found = Vec::new();
        grid.query_nearby(Vec3::ZERO, -10.0, 100.0, None, &mut found);
        assert!(found.is_empty());
    }

    #[test]
    fn max_results_caps_emission() {
        let entries: Vec<(u32, Vec3)> = (0..16)
            .map(|i| (i, Vec3::new(i as f32, 0.0, 0.0)))
            .collect();
        let grid = grid_with(&entries);

        let mut found = Vec::new();
        grid.query_nearby(Vec3::ZERO, 100.0, 100.0, Some(5), &mut found);
        assert_eq!(found.len(), 5);

        found.clear();
        grid.query_nearby(Vec3::ZERO, 100.0, 100.0, Some(0), &mut found);
        assert!(found.is_empty());
    }

    #[test]
    fn visitor_can_stop_early() {
        let grid = grid_with(&[(0, Vec3::ZERO), (1, Vec3::new(5.0, 0.0, 0.0))]);
        let mut seen = 0;
        grid.visit_nearby(Vec3::ZERO, 50.0, 50.0, None, |_| {
            seen += 1;
            false
        });
        assert_eq!(seen, 1);
    }

    #[test]
    fn reset_retains_capacity_and_clears_entries() {
        let mut grid = grid_with(&[(0, Vec3::ZERO), (1, Vec3::new(1000.0, 0.0, 0.0))]);
        assert!(!grid.is_empty());

        grid.reset();
        assert!(grid.is_empty());
        assert_eq!(grid.estimate_count_at(Vec3::ZERO, 500.0, 500.0), 0);

        grid.insert(9, Vec3::ZERO);
        assert_eq!(grid.estimate_count_at(Vec3::ZERO, 50.0, 50.0), 1);
    }

    #[test]
    fn estimate_count_ignores_result_caps() {
        let entries: Vec<(u32, Vec3)> = (0..32)
            .map(|i| (i, Vec3::new((i % 8) as f32, (i / 8) as f32, 0.0)))
            .collect();
        let grid = grid_with(&entries);
        assert_eq!(grid.estimate_count_at(Vec3::ZERO, 50.0, 10.0), 32);
    }
}
