use fpnr_common::ResourceKind;
use nalgebra::Vector2;
use ndarray::{Array2, Array3};

use crate::config::DiffusionConfig;
use crate::core::{BinGrid, PlacementState};
use crate::placement_unit::{PlacementUnit, PuId};


/// Density assigned to bins demanding a resource they have no capacity for
const MAX_DENSITY: f32 = 16.0;
/// Floor on the density used to normalize the gradient
const MIN_DENSITY: f32 = 0.05;

/// Container for all data required for a diffusion-based spreading step
///
/// Density lives on the grid bins of the placement state. The density of a bin is the
/// utilization of its most demanded resource sub-type, relative to the supply ratio.
///
/// Based on:
///   - Diffusion-based placement migration, Proceedings of Design Automation Conference 2005, page 515-520
///   - DPlace2.0 - A stable and efficient analytical placement based on diffusion, Asian
///     South-Pacific Design Automation Conference 2008 Page 346 - 351
pub struct DiffusionPlacer {
    bin_width: f32,
    bin_height: f32,
    /// Normalized density of each bin
    density: Array2<f32>,
    /// X velocity field
    vel_x: Array2<f32>,
    /// Y velocity field
    vel_y: Array2<f32>,
}

impl DiffusionPlacer {
    /// Construct a diffusion placer over the given bins
    pub fn new(bins: &BinGrid) -> Self {
        let shape = (bins.nx, bins.ny);
        Self {
            bin_width: bins.bin_width,
            bin_height: bins.bin_height,
            density: Array2::zeros(shape),
            vel_x: Array2::zeros(shape),
            vel_y: Array2::zeros(shape),
        }
    }

    pub fn density(&self) -> &Array2<f32> {
        &self.density
    }

    /// Fill in the density field from per-bin demand
    pub fn splat(&mut self, bins: &BinGrid, demand: &Array3<f32>, supply_ratio: f32) {
        let capacity = bins.capacities();
        for ((bx, by), density) in self.density.indexed_iter_mut() {
            let mut worst = 0.0f32;
            for kind in 0..ResourceKind::COUNT {
                let d = demand[(bx, by, kind)];
                if d <= 0.0 {
                    continue;
                }
                let supply = capacity[(bx, by, kind)] * supply_ratio;
                let ratio = if supply > 0.0 { d / supply } else { MAX_DENSITY };
                worst = worst.max(ratio);
            }
            *density = worst.min(MAX_DENSITY);
        }
    }

    /// Whether any bin is above its supply
    pub fn is_overfull(&self) -> bool {
        self.density.iter().any(|d| *d > 1.0)
    }

    /// Velocity of each bin: the negative density gradient over the local density
    pub fn compute_velocities(&mut self) {
        let (nx, ny) = self.density.dim();
        for bx in 0..nx {
            for by in 0..ny {
                let d = self.density[(bx, by)];
                let left = self.density[(bx.saturating_sub(1), by)];
                let right = self.density[((bx + 1).min(nx - 1), by)];
                let below = self.density[(bx, by.saturating_sub(1))];
                let above = self.density[(bx, (by + 1).min(ny - 1))];

                let denom = 2.0 * d.max(MIN_DENSITY);
                self.vel_x[(bx, by)] = (-(right - left) / denom).clamp(-1.0, 1.0);
                self.vel_y[(bx, by)] = (-(above - below) / denom).clamp(-1.0, 1.0);
            }
        }
    }

    /// Advance the density field by `delta_t` with an explicit 5-point diffusion stencil.
    /// Boundaries reflect, so total density is conserved.
    pub fn step_time(&mut self, delta_t: f32) {
        let (nx, ny) = self.density.dim();
        let old = self.density.clone();
        for bx in 0..nx {
            for by in 0..ny {
                let d = old[(bx, by)];
                let neighbors = old[(bx.saturating_sub(1), by)]
                    + old[((bx + 1).min(nx - 1), by)]
                    + old[(bx, by.saturating_sub(1))]
                    + old[(bx, (by + 1).min(ny - 1))];
                self.density[(bx, by)] = d + delta_t * (neighbors - 4.0 * d);
            }
        }
    }

    /// Bilinear interpolation of the bin velocities at a device position, in device units per
    /// unit time
    pub fn velocity_at(&self, x: f32, y: f32) -> Vector2<f32> {
        let (nx, ny) = self.density.dim();
        let u = (x / self.bin_width - 0.5).max(0.0).min((nx - 1) as f32);
        let v = (y / self.bin_height - 0.5).max(0.0).min((ny - 1) as f32);
        let (i0, j0) = (u.floor() as usize, v.floor() as usize);
        let (i1, j1) = ((i0 + 1).min(nx - 1), (j0 + 1).min(ny - 1));
        let (fu, fv) = (u - i0 as f32, v - j0 as f32);

        let lerp = |field: &Array2<f32>| {
            let bottom = field[(i0, j0)] * (1.0 - fu) + field[(i1, j0)] * fu;
            let top = field[(i0, j1)] * (1.0 - fu) + field[(i1, j1)] * fu;
            bottom * (1.0 - fv) + top * fv
        };

        Vector2::new(
            lerp(&self.vel_x) * self.bin_width,
            lerp(&self.vel_y) * self.bin_height,
        )
    }

    /// Move every position along the velocity field for `delta_t`
    pub fn move_cells(&self, positions: &mut [Vector2<f32>], delta_t: f32) {
        for p in positions.iter_mut() {
            *p += self.velocity_at(p.x, p.y) * delta_t;
        }
    }
}

/// Target density: dense packing once bins are fine, looser early on
pub fn supply_ratio(config: &DiffusionConfig, bin_width: f32, progress: f32) -> f32 {
    if bin_width < config.fine_bin_width {
        config.fine_supply_ratio
    } else {
        config.coarse_supply_ratio + 0.1 * progress
    }
}

/// Fraction of the spreading displacement actually applied. Late in placement units keep
/// most of their solved position.
pub fn forget_ratio(progress: f32) -> f32 {
    if progress > 0.5 {
        1.0 - 0.8 * progress
    } else {
        1.0
    }
}

/// Spread the mobile units along the diffusion flow of the current bin density. Does nothing
/// without grid bins or when no bin exceeds its supply. Returns the number of units moved.
pub fn spread(state: &mut PlacementState<'_>, config: &DiffusionConfig, progress: f32) -> usize {
    let _span = tracing::info_span!("diffusion_spread", progress).entered();

    let bins = match state.bins() {
        Some(bins) => bins.clone(),
        None => return 0,
    };
    let demand = match state.bin_demand() {
        Some(demand) => demand.clone(),
        None => return 0,
    };

    let mut diffuser = DiffusionPlacer::new(&bins);
    diffuser.splat(&bins, &demand, supply_ratio(config, bins.bin_width, progress));
    if !diffuser.is_overfull() {
        return 0;
    }

    let mobile: Vec<PuId> = state.mobile_units().collect();
    let start: Vec<Vector2<f32>> = mobile.iter().map(|id| state.position(*id)).collect();
    let mut positions = start.clone();
    for _ in 0..config.iteration_count {
        diffuser.compute_velocities();
        diffuser.move_cells(&mut positions, config.delta_t);
        diffuser.step_time(config.delta_t);
    }

    let forget = forget_ratio(progress);
    let moves: Vec<_> = mobile
        .iter()
        .zip(start.iter().zip(positions.iter()))
        .map(|(id, (old, new))| {
            let p = old + (new - old) * forget;
            (*id, p.x, p.y)
        })
        .collect();
    let moved = moves.len();
    state.move_units(moves);
    moved
}

/// Per-bin demand of one unit, by resource sub-type
type Footprint = Vec<((usize, usize), [f32; ResourceKind::COUNT])>;

/// Per-bin demand added by `unit` anchored at `(x, y)`
fn unit_footprint(bins: &BinGrid, unit: &PlacementUnit, x: f32, y: f32) -> Footprint {
    let mut footprint: Footprint = vec![];
    for (row, resources) in unit.rows.iter().enumerate() {
        let bin = bins.bin_of(x, y + row as f32);
        let idx = match footprint.iter().position(|(b, _)| *b == bin) {
            Some(idx) => idx,
            None => {
                footprint.push((bin, [0.0; ResourceKind::COUNT]));
                footprint.len() - 1
            }
        };
        for (kind, count) in resources.iter() {
            footprint[idx].1[kind.index()] += count as f32;
        }
    }
    footprint
}

fn fits(demand: &Array3<f32>, capacity: &Array3<f32>, footprint: &Footprint) -> bool {
    footprint.iter().all(|((bx, by), add)| {
        add.iter().enumerate().all(|(kind, a)| {
            *a == 0.0 || demand[(*bx, *by, kind)] + a <= capacity[(*bx, *by, kind)] + 1e-4
        })
    })
}

fn overflows(demand: &Array3<f32>, capacity: &Array3<f32>, footprint: &Footprint) -> bool {
    footprint.iter().any(|((bx, by), add)| {
        add.iter().enumerate().any(|(kind, a)| {
            *a > 0.0 && demand[(*bx, *by, kind)] > capacity[(*bx, *by, kind)] + 1e-4
        })
    })
}

/// Move mobile units out of over-capacity bins into the nearest bins with slack for every
/// resource they demand, keeping their offset inside the bin. Units with no admissible bin stay
/// where they are. Returns the number of units moved.
pub fn resolve_overflow(state: &mut PlacementState<'_>) -> usize {
    let _span = tracing::info_span!("resolve_overflow").entered();

    let bins = match state.bins() {
        Some(bins) => bins.clone(),
        None => return 0,
    };
    let mut demand = match state.bin_demand() {
        Some(demand) => demand.clone(),
        None => return 0,
    };
    let capacity = bins.capacities();

    // Units furthest from the center of their bin leave first
    let mut candidates: Vec<(PuId, f32)> = state
        .mobile_units()
        .filter_map(|id| {
            let unit = state.unit(id);
            let footprint = unit_footprint(&bins, unit, unit.x, unit.y);
            if !overflows(&demand, &capacity, &footprint) {
                return None;
            }
            let (bx, by) = bins.bin_of(unit.x, unit.y);
            let (cx, cy) = bins.bin_center(bx, by);
            Some((id, (unit.x - cx).abs() + (unit.y - cy).abs()))
        })
        .collect();
    candidates.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

    let radius_limit = bins.nx.max(bins.ny) as isize;
    let mut moved = 0;
    for (id, _) in candidates {
        let unit = state.unit(id).clone();
        let here = unit_footprint(&bins, &unit, unit.x, unit.y);
        if !overflows(&demand, &capacity, &here) {
            continue;
        }
        bins.splat_unit(&mut demand, &unit, unit.x, unit.y, -1.0);

        let (obx, oby) = bins.bin_of(unit.x, unit.y);
        let (ox, oy) = bins.bin_origin(obx, oby);
        let (fx, fy) = (unit.x - ox, unit.y - oy);

        let mut target = None;
        'search: for radius in 0..=radius_limit {
            let mut best: Option<(f32, f32, f32)> = None;
            for dx in -radius..=radius {
                let rest = radius - dx.abs();
                for dy in [-rest, rest] {
                    let bx = obx as isize + dx;
                    let by = oby as isize + dy;
                    if bx < 0 || by < 0 || bx >= bins.nx as isize || by >= bins.ny as isize {
                        continue;
                    }
                    let (tx, ty) = bins.bin_origin(bx as usize, by as usize);
                    let (x, y) = state.clamp_position(id, tx + fx, ty + fy);
                    let footprint = unit_footprint(&bins, &unit, x, y);
                    if !fits(&demand, &capacity, &footprint) {
                        continue;
                    }
                    let dist = (x - unit.x).hypot(y - unit.y);
                    if best.map_or(true, |(d, _, _)| dist < d) {
                        best = Some((dist, x, y));
                    }
                    if rest == 0 {
                        break;
                    }
                }
            }
            if let Some((_, x, y)) = best {
                target = Some((x, y));
                break 'search;
            }
        }

        match target {
            Some((x, y)) => {
                bins.splat_unit(&mut demand, &unit, x, y, 1.0);
                state.set_position(id, x, y);
                moved += 1;
            }
            None => {
                bins.splat_unit(&mut demand, &unit, unit.x, unit.y, 1.0);
                log::warn!("No bin with slack for unit {:?} ({:?})", id, unit.kind);
            }
        }
    }

    log::debug!("Overflow resolution moved {} units", moved);
    moved
}
