//! The placement state store: placement units, their positions, unit-level nets, grid bins and
//! the cached summaries derived from them.

use std::sync::OnceLock;

use anyhow::{anyhow, Result};
use fpnr_common::{
    design::Design, device::Device, CellId, NetId, ResourceKind, SiteId,
};
use nalgebra::Vector2;
use ndarray::Array3;
use serde::Serialize;

use crate::error::PlacementError;
use crate::placement_unit::{PlacementUnit, PuId};

mod bins;
mod clock;
mod snapshot;

pub use bins::BinGrid;
pub use clock::{ClockReport, ClockScope, ClockViolation};
pub use snapshot::{PlacementSnapshot, UnitSnapshot};

#[cfg(test)]
mod test;

/// A net pin, resolved to the unit holding its cell
#[derive(Clone, Copy, Debug)]
pub struct UnitPin {
    pub unit: PuId,
    pub cell: CellId,
    /// Offset of the pin from the unit anchor
    pub offset: Vector2<f32>,
}

/// Indices into [`PlacementNet::pins`] of the extreme pins along each axis
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NetBounds {
    pub left: usize,
    pub right: usize,
    pub bottom: usize,
    pub top: usize,
}

#[derive(Clone, Debug)]
pub struct PlacementNet {
    pub net: NetId,
    pub pins: Vec<UnitPin>,
    /// Index into `pins` of the driver
    pub driver: Option<usize>,
    pub is_clock: bool,
    /// Number of pins on movable units
    pub moveable_pins: usize,
    bounds: NetBounds,
}

impl PlacementNet {
    /// Clock nets use dedicated routing and are left out of the wirelength objective
    pub fn is_wirelength_net(&self) -> bool {
        !self.is_clock && self.pins.len() > 1
    }

    pub fn bounds(&self) -> NetBounds {
        self.bounds
    }
}

/// Per-resource demand and capacity totals
#[derive(Clone, Debug, Default, Serialize)]
pub struct UtilizationReport {
    pub demand: [f32; ResourceKind::COUNT],
    pub capacity: [f32; ResourceKind::COUNT],
}

impl UtilizationReport {
    pub fn ratio(&self, kind: ResourceKind) -> f32 {
        let cap = self.capacity[kind.index()];
        if cap > 0.0 {
            self.demand[kind.index()] / cap
        } else if self.demand[kind.index()] > 0.0 {
            f32::INFINITY
        } else {
            0.0
        }
    }
}

/// Read-only copy of the placement for external observers
#[derive(Clone, Debug, Serialize)]
pub struct PlacementSample {
    pub label: String,
    pub hpwl: f64,
    pub positions: Vec<(f32, f32)>,
}

/// Owns the evolving placement. Every component receives it by reference; every mutation
/// invalidates the cached wirelength and bin demand, which are recomputed on the next query.
pub struct PlacementState<'a> {
    pub device: &'a Device,
    pub design: &'a Design,
    units: Vec<PlacementUnit>,
    nets: Vec<PlacementNet>,
    /// Map from cell to the unit holding it
    cell_units: Vec<PuId>,
    /// Map from unit to the nets touching it, as indices into `nets`
    unit_nets: Vec<Vec<usize>>,
    dirty_nets: Vec<bool>,
    /// Timing enhancement ratio per design net
    net_enhance: Vec<f32>,
    bins: Option<BinGrid>,
    utilization_factor: f32,
    y2x_ratio: f32,
    hpwl_cache: OnceLock<f64>,
    demand_cache: OnceLock<Array3<f32>>,
    /// Bumped by every [`PlacementState::replace_units`]
    unit_generation: u64,
}

impl<'a> PlacementState<'a> {
    /// Create the store from an initial set of units. Every cell of the design must belong to
    /// exactly one unit.
    pub fn new(
        device: &'a Device,
        design: &'a Design,
        units: Vec<PlacementUnit>,
        y2x_ratio: f32,
    ) -> Result<Self> {
        let mut state = Self {
            device,
            design,
            units: vec![],
            nets: vec![],
            cell_units: vec![],
            unit_nets: vec![],
            dirty_nets: vec![],
            net_enhance: vec![1.0; design.nets().len()],
            bins: None,
            utilization_factor: 1.0,
            y2x_ratio,
            hpwl_cache: OnceLock::new(),
            demand_cache: OnceLock::new(),
            unit_generation: 0,
        };
        state.replace_units(units)?;
        Ok(state)
    }

    /// Swap in a new set of units, rebuilding nets and the cell map. Positions carried by the
    /// new units are kept. On error the state is unchanged.
    pub fn replace_units(&mut self, units: Vec<PlacementUnit>) -> Result<()> {
        let design = self.design;
        let mut cell_units: Vec<Option<PuId>> = vec![None; design.cells().len()];
        for (idx, unit) in units.iter().enumerate() {
            for cell in unit.cells() {
                let slot = cell_units
                    .get_mut(cell.index())
                    .ok_or_else(|| anyhow!("Unit {} refers to unknown cell {:?}", idx, cell))?;
                if slot.is_some() {
                    return Err(anyhow!("Cell {:?} is a member of two units", cell));
                }
                *slot = Some(PuId::from(idx));
            }
        }
        let cell_units = cell_units
            .into_iter()
            .enumerate()
            .map(|(cell, unit)| {
                unit.ok_or_else(|| {
                    anyhow!("Cell {:?} is not a member of any unit", design.cells()[cell].name)
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut nets = Vec::with_capacity(design.nets().len());
        let mut unit_nets = vec![Vec::new(); units.len()];
        for (net_idx, net) in design.nets().iter().enumerate() {
            if net.pin_count() < 2 {
                continue;
            }
            let mut pins = Vec::with_capacity(net.pin_count());
            let mut driver = None;
            for pin_id in net.pins() {
                let pin = design.pin(pin_id);
                let unit_id = cell_units[pin.cell.index()];
                let unit = &units[unit_id.index()];
                let row = unit.row_of(pin.cell).unwrap_or(0) as f32;
                if Some(pin_id) == net.driver {
                    driver = Some(pins.len());
                }
                pins.push(UnitPin {
                    unit: unit_id,
                    cell: pin.cell,
                    offset: Vector2::new(pin.offset.0, row + pin.offset.1),
                });
            }
            let moveable_pins = pins
                .iter()
                .filter(|p| !units[p.unit.index()].pos_locked)
                .count();

            let placement_idx = nets.len();
            let mut touched: Vec<PuId> = pins.iter().map(|p| p.unit).collect();
            touched.sort_unstable();
            touched.dedup();
            for unit in touched {
                unit_nets[unit.index()].push(placement_idx);
            }

            nets.push(PlacementNet {
                net: NetId::from(net_idx),
                pins,
                driver,
                is_clock: net.is_clock,
                moveable_pins,
                bounds: NetBounds::default(),
            });
        }

        log::debug!(
            "Rebuilt placement state with {} units and {} nets",
            units.len(),
            nets.len()
        );

        self.dirty_nets = vec![true; nets.len()];
        self.units = units;
        self.nets = nets;
        self.cell_units = cell_units;
        self.unit_nets = unit_nets;
        self.unit_generation += 1;
        self.invalidate();
        Ok(())
    }

    /// Changes whenever the unit set is replaced. A [`PuId`] taken under another generation
    /// may name a different unit.
    pub fn unit_generation(&self) -> u64 {
        self.unit_generation
    }

    pub(crate) fn invalidate(&mut self) {
        self.hpwl_cache = OnceLock::new();
        self.demand_cache = OnceLock::new();
    }

    pub fn units(&self) -> &[PlacementUnit] {
        &self.units
    }

    pub fn unit(&self, id: PuId) -> &PlacementUnit {
        &self.units[id.index()]
    }

    pub fn unit_ids(&self) -> impl Iterator<Item = PuId> {
        (0..self.units.len()).map(PuId::from)
    }

    /// Units that may still move
    pub fn mobile_units(&self) -> impl Iterator<Item = PuId> + '_ {
        self.unit_ids().filter(move |id| !self.unit(*id).pos_locked)
    }

    pub fn unit_of(&self, cell: CellId) -> PuId {
        self.cell_units[cell.index()]
    }

    pub fn nets(&self) -> &[PlacementNet] {
        &self.nets
    }

    /// Indices into [`PlacementState::nets`] of the nets touching `unit`
    pub fn unit_nets(&self, unit: PuId) -> &[usize] {
        &self.unit_nets[unit.index()]
    }

    pub fn y2x_ratio(&self) -> f32 {
        self.y2x_ratio
    }

    pub fn position(&self, id: PuId) -> Vector2<f32> {
        self.units[id.index()].position()
    }

    /// Clamp an anchor position so every row of the unit stays on the device
    pub fn clamp_position(&self, id: PuId, x: f32, y: f32) -> (f32, f32) {
        let height = self.units[id.index()].height() as f32;
        let max_x = (self.device.width as f32 - 1e-3).max(0.0);
        let max_y = (self.device.height as f32 - height + 1.0 - 1e-3).max(0.0);
        (x.max(0.0).min(max_x), y.max(0.0).min(max_y))
    }

    /// Move a unit. Fixed units never move; the request is ignored and `false` returned.
    pub fn set_position(&mut self, id: PuId, x: f32, y: f32) -> bool {
        if self.units[id.index()].pos_locked {
            log::warn!("Ignoring move of fixed unit {:?}", id);
            return false;
        }
        let (x, y) = self.clamp_position(id, x, y);
        let unit = &mut self.units[id.index()];
        unit.x = x;
        unit.y = y;
        for net in self.unit_nets[id.index()].iter() {
            self.dirty_nets[*net] = true;
        }
        self.invalidate();
        true
    }

    /// Apply a batch of moves
    pub fn move_units(&mut self, moves: impl IntoIterator<Item = (PuId, f32, f32)>) {
        for (id, x, y) in moves {
            self.set_position(id, x, y);
        }
    }

    /// Lock a unit at its current position
    pub fn fix_unit(&mut self, id: PuId) {
        let pos = self.position(id);
        self.fix_unit_at(id, pos.x, pos.y);
    }

    /// Place a unit and lock it there
    pub fn fix_unit_at(&mut self, id: PuId, x: f32, y: f32) {
        let unit = &mut self.units[id.index()];
        unit.x = x;
        unit.y = y;
        unit.pos_locked = true;
        for net in self.unit_nets[id.index()].iter() {
            self.dirty_nets[*net] = true;
            let net = &mut self.nets[*net];
            net.moveable_pins = net
                .pins
                .iter()
                .filter(|p| p.unit != id && !self.units[p.unit.index()].pos_locked)
                .count();
        }
        self.invalidate();
    }

    pub fn set_site(&mut self, id: PuId, site: Option<SiteId>) {
        self.units[id.index()].site = site;
    }

    pub fn set_packed(&mut self, id: PuId, packed: bool) {
        self.units[id.index()].packed = packed;
    }

    pub fn pin_position(&self, pin: &UnitPin) -> Vector2<f32> {
        self.units[pin.unit.index()].position() + pin.offset
    }

    /// Combined base weight and timing enhancement of a net
    pub fn net_weight(&self, net: &PlacementNet) -> f32 {
        self.design.net(net.net).weight * self.net_enhance[net.net.index()]
    }

    pub fn net_enhance(&self, net: NetId) -> f32 {
        self.net_enhance[net.index()]
    }

    pub fn set_net_enhance(&mut self, net: NetId, ratio: f32) {
        self.net_enhance[net.index()] = ratio;
        self.invalidate();
    }

    pub fn reset_net_enhance(&mut self) {
        self.net_enhance.iter_mut().for_each(|r| *r = 1.0);
        self.invalidate();
    }

    /// Unweighted HPWL of one net, from current pin positions
    pub fn net_hpwl(&self, net: &PlacementNet) -> f32 {
        let mut lo = Vector2::new(f32::INFINITY, f32::INFINITY);
        let mut hi = Vector2::new(f32::NEG_INFINITY, f32::NEG_INFINITY);
        for pin in net.pins.iter() {
            let p = self.pin_position(pin);
            lo = lo.inf(&p);
            hi = hi.sup(&p);
        }
        if net.pins.is_empty() {
            return 0.0;
        }
        (hi.x - lo.x) + self.y2x_ratio * (hi.y - lo.y)
    }

    /// Total weighted HPWL over wirelength nets. Cached until the next mutation.
    pub fn total_hpwl(&self) -> f64 {
        *self.hpwl_cache.get_or_init(|| {
            self.nets
                .iter()
                .filter(|n| n.is_wirelength_net())
                .map(|n| (self.net_weight(n) * self.net_hpwl(n)) as f64)
                .sum()
        })
    }

    /// Refresh the bound-to-bound extreme pins of nets touched since the last update. Returns
    /// the number of nets refreshed.
    pub fn update_b2b(&mut self) -> usize {
        let mut updated = 0;
        for idx in 0..self.nets.len() {
            if !self.dirty_nets[idx] {
                continue;
            }
            let bounds = compute_bounds(&self.units, &self.nets[idx]);
            self.nets[idx].bounds = bounds;
            self.dirty_nets[idx] = false;
            updated += 1;
        }
        updated
    }

    /// Re-partition the grid bins
    pub fn rebuild_bins(&mut self, bin_width: f32, bin_height: f32) {
        let _span = tracing::info_span!("rebuild_bins", bin_width, bin_height).entered();
        self.bins = Some(BinGrid::new(
            self.device,
            bin_width,
            bin_height,
            self.utilization_factor,
        ));
        self.invalidate();
    }

    pub fn bins(&self) -> Option<&BinGrid> {
        self.bins.as_ref()
    }

    /// Set the overshoot/undershoot factor applied to legal capacity
    pub fn set_utilization_factor(&mut self, factor: f32) {
        self.utilization_factor = factor;
        if let Some(bins) = self.bins.as_mut() {
            bins.set_factor(factor);
        }
        self.invalidate();
    }

    pub fn utilization_factor(&self) -> f32 {
        self.utilization_factor
    }

    /// Current demand of every bin, or `None` before the first [`PlacementState::rebuild_bins`]
    pub fn bin_demand(&self) -> Option<&Array3<f32>> {
        let bins = self.bins.as_ref()?;
        Some(
            self.demand_cache
                .get_or_init(|| bins.splat(self.units.iter())),
        )
    }

    /// Total demand above capacity, summed over bins and resource sub-types
    pub fn bin_overflow(&self) -> f32 {
        let (bins, demand) = match (self.bins.as_ref(), self.bin_demand()) {
            (Some(b), Some(d)) => (b, d),
            _ => return 0.0,
        };
        let capacity = bins.capacities();
        demand
            .iter()
            .zip(capacity.iter())
            .map(|(d, c)| (d - c).max(0.0))
            .sum()
    }

    /// Demand against total device capacity, per resource sub-type
    pub fn utilization(&self) -> UtilizationReport {
        let mut demand = [0.0f32; ResourceKind::COUNT];
        for unit in self.units.iter() {
            for (kind, count) in unit.demand().iter() {
                demand[kind.index()] += count as f32;
            }
        }
        let capacity = self
            .device
            .total_capacity()
            .as_f32()
            .map(|c| c * self.utilization_factor);
        UtilizationReport { demand, capacity }
    }

    /// Report clock-region utilization. Violations are logged; with `strict` they become a
    /// [`PlacementError::ClockOverflow`].
    pub fn check_clock_utilization(&self, strict: bool) -> Result<ClockReport> {
        let report = self.collect_clock_usage();
        for v in report.violations.iter() {
            log::warn!(
                "Clock region {} {:?}: {} clocks exceed the budget of {}",
                v.region,
                v.scope,
                v.clocks,
                v.budget
            );
        }
        if strict && !report.is_clean() {
            return Err(PlacementError::ClockOverflow {
                violations: report.violations.len(),
            }
            .into());
        }
        Ok(report)
    }

    /// Copy out positions for a progress observer
    pub fn sample(&self, label: &str) -> PlacementSample {
        PlacementSample {
            label: label.to_owned(),
            hpwl: self.total_hpwl(),
            positions: self.units.iter().map(|u| (u.x, u.y)).collect(),
        }
    }
}

fn compute_bounds(units: &[PlacementUnit], net: &PlacementNet) -> NetBounds {
    let pos = |i: usize| {
        let pin = &net.pins[i];
        units[pin.unit.index()].position() + pin.offset
    };
    let mut b = NetBounds::default();
    for i in 1..net.pins.len() {
        let p = pos(i);
        if p.x < pos(b.left).x {
            b.left = i;
        }
        if p.x > pos(b.right).x {
            b.right = i;
        }
        if p.y < pos(b.bottom).y {
            b.bottom = i;
        }
        if p.y > pos(b.top).y {
            b.top = i;
        }
    }
    b
}
