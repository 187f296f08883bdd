use fpnr_common::{device::Device, ResourceKind};
use ndarray::Array3;

use crate::placement_unit::PlacementUnit;

/// Rectangular partition of the device used to estimate local density. Capacity is tracked per
/// resource sub-type in the last axis of the arrays.
#[derive(Clone, Debug)]
pub struct BinGrid {
    pub bin_width: f32,
    pub bin_height: f32,
    pub nx: usize,
    pub ny: usize,
    /// Sum of the declared capacity of the sites whose center lies in each bin
    raw_capacity: Array3<f32>,
    /// Overshoot/undershoot factor applied on top of the raw capacity
    factor: f32,
}

impl BinGrid {
    pub fn new(device: &Device, bin_width: f32, bin_height: f32, factor: f32) -> Self {
        let nx = ((device.width as f32 / bin_width).ceil() as usize).max(1);
        let ny = ((device.height as f32 / bin_height).ceil() as usize).max(1);

        let mut grid = Self {
            bin_width,
            bin_height,
            nx,
            ny,
            raw_capacity: Array3::zeros((nx, ny, ResourceKind::COUNT)),
            factor,
        };

        for site in device.sites() {
            let (cx, cy) = site.center();
            let (bx, by) = grid.bin_of(cx, cy);
            for (kind, count) in site.capacity.iter() {
                grid.raw_capacity[(bx, by, kind.index())] += count as f32;
            }
        }

        grid
    }

    pub fn set_factor(&mut self, factor: f32) {
        self.factor = factor;
    }

    pub fn factor(&self) -> f32 {
        self.factor
    }

    /// Bin containing the point, clamped onto the grid
    pub fn bin_of(&self, x: f32, y: f32) -> (usize, usize) {
        let bx = (x / self.bin_width).floor().max(0.0) as usize;
        let by = (y / self.bin_height).floor().max(0.0) as usize;
        (bx.min(self.nx - 1), by.min(self.ny - 1))
    }

    pub fn bin_origin(&self, bx: usize, by: usize) -> (f32, f32) {
        (bx as f32 * self.bin_width, by as f32 * self.bin_height)
    }

    pub fn bin_center(&self, bx: usize, by: usize) -> (f32, f32) {
        let (x, y) = self.bin_origin(bx, by);
        (x + self.bin_width / 2.0, y + self.bin_height / 2.0)
    }

    /// Effective capacity of one bin for one resource sub-type
    pub fn capacity(&self, bx: usize, by: usize, kind: ResourceKind) -> f32 {
        self.raw_capacity[(bx, by, kind.index())] * self.factor
    }

    /// Effective capacity of all bins
    pub fn capacities(&self) -> Array3<f32> {
        &self.raw_capacity * self.factor
    }

    /// Accumulate the per-row demand of `units` into a density array shaped like the grid
    pub fn splat<'a>(&self, units: impl Iterator<Item = &'a PlacementUnit>) -> Array3<f32> {
        let mut demand = Array3::zeros((self.nx, self.ny, ResourceKind::COUNT));
        for unit in units {
            self.splat_unit(&mut demand, unit, unit.x, unit.y, 1.0);
        }
        demand
    }

    /// Add (`sign = 1.0`) or remove (`sign = -1.0`) the demand of `unit` as if it were
    /// anchored at `(x, y)`.
    pub fn splat_unit(
        &self,
        demand: &mut Array3<f32>,
        unit: &PlacementUnit,
        x: f32,
        y: f32,
        sign: f32,
    ) {
        for (row, resources) in unit.rows.iter().enumerate() {
            let (bx, by) = self.bin_of(x, y + row as f32);
            for (kind, count) in resources.iter() {
                demand[(bx, by, kind.index())] += sign * count as f32;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use fpnr_common::{device::SiteKind, Resources};

    #[test]
    fn capacity_accumulates_per_bin() {
        let device = Device::uniform(
            4,
            4,
            SiteKind::Slice,
            Resources::single(ResourceKind::Lut, 8).with(ResourceKind::Ff, 16),
        );
        let mut grid = BinGrid::new(&device, 2.0, 2.0, 1.0);

        assert_eq!((grid.nx, grid.ny), (2, 2));
        assert_eq!(grid.capacity(0, 0, ResourceKind::Lut), 32.0);
        assert_eq!(grid.capacity(1, 1, ResourceKind::Ff), 64.0);
        assert_eq!(grid.capacity(1, 0, ResourceKind::Dsp), 0.0);

        grid.set_factor(0.5);
        assert_eq!(grid.capacity(0, 0, ResourceKind::Lut), 16.0);
        assert_eq!(grid.bin_of(-1.0, 9.0), (0, 1));
    }
}
