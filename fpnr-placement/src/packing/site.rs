//! Commits placement units to concrete sites.
//!
//! Sites are split into column bands packed concurrently; every band only ever reserves its
//! own sites, so the proposals of all bands can be committed one after the other without
//! conflicts. Units a band could not place get a second, serialized chance against the whole
//! device.

use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::{anyhow, Context, Result};
use fpnr_common::{
    design::ControlSet,
    device::{Device, Site, SiteKind},
    NetId, Resources, SiteId,
};
use nalgebra::Vector2;
use rayon::prelude::*;
use rstar::{primitives::GeomWithData, RTree};
use serde::{Deserialize, Serialize};

use crate::config::SitePackerConfig;
use crate::core::PlacementState;
use crate::placement_unit::PuId;
use crate::timing::TimingGraph;

type SiteElement = GeomWithData<[f32; 2], SiteId>;

/// How the packer picks among admissible candidate sites
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectionPolicy {
    /// Take the closest admissible site
    #[serde(rename = "first")]
    FirstFit,
    /// Score every admissible candidate by wirelength change and timing-weighted displacement
    #[serde(rename = "wirelength")]
    BestFitWirelength,
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        SelectionPolicy::FirstFit
    }
}

/// Outcome of a packing pass
#[derive(Clone, Debug, Default, Serialize)]
pub struct PackingReport {
    /// Units without a site
    pub unpacked: Vec<PuId>,
    /// Resources in use on every occupied site
    pub occupancy: BTreeMap<SiteId, Resources>,
    pub hpwl: f64,
}

/// What one row of a unit asks of its site
#[derive(Clone, Debug, Default)]
struct RowDemand {
    resources: Resources,
    control_sets: Vec<ControlSet>,
    lut_inputs: Vec<NetId>,
}

fn row_demands(state: &PlacementState<'_>, id: PuId) -> Vec<RowDemand> {
    let design = state.design;
    let unit = state.unit(id);
    let mut rows: Vec<RowDemand> = unit
        .rows
        .iter()
        .map(|r| RowDemand {
            resources: *r,
            ..Default::default()
        })
        .collect();
    for member in unit.members.iter() {
        let row = &mut rows[member.row as usize];
        let cell = design.cell(member.cell);
        if let Some(control) = design.control_set(member.cell) {
            row.control_sets.push(control);
        }
        if cell.kind.is_lut() {
            row.lut_inputs.extend(design.input_nets(member.cell));
        }
    }
    for row in rows.iter_mut() {
        row.control_sets.sort_unstable();
        row.control_sets.dedup();
        row.lut_inputs.sort_unstable();
        row.lut_inputs.dedup();
    }
    rows
}

#[derive(Clone, Debug, Default)]
struct SiteUse {
    used: Resources,
    control_sets: HashSet<ControlSet>,
    lut_inputs: HashSet<NetId>,
}

impl SiteUse {
    fn admits(&self, site: &Site, row: &RowDemand) -> bool {
        if !(self.used + row.resources).fits_within(&site.capacity) {
            return false;
        }
        if let Some(max) = site.max_control_sets {
            let extra = row
                .control_sets
                .iter()
                .filter(|c| !self.control_sets.contains(c))
                .count();
            if self.control_sets.len() + extra > max as usize {
                return false;
            }
        }
        if let Some(max) = site.max_lut_inputs {
            let extra = row
                .lut_inputs
                .iter()
                .filter(|n| !self.lut_inputs.contains(n))
                .count();
            if self.lut_inputs.len() + extra > max as usize {
                return false;
            }
        }
        true
    }

    fn add(&mut self, row: &RowDemand) {
        self.used += row.resources;
        self.control_sets.extend(row.control_sets.iter().copied());
        self.lut_inputs.extend(row.lut_inputs.iter().copied());
    }
}

/// Residual state of every site on the device
#[derive(Clone)]
struct Occupancy<'d> {
    device: &'d Device,
    sites: Vec<SiteUse>,
}

impl<'d> Occupancy<'d> {
    fn new(device: &'d Device) -> Self {
        Self {
            device,
            sites: vec![SiteUse::default(); device.sites().len()],
        }
    }

    /// Sites holding each row when the unit is anchored at `anchor`, if all rows fit
    fn admissible(&self, anchor: &Site, rows: &[RowDemand]) -> Option<Vec<SiteId>> {
        rows.iter()
            .enumerate()
            .map(|(r, row)| {
                let site = self
                    .device
                    .site_at(anchor.x, anchor.y + r as u32, anchor.kind)?;
                self.sites[site.id.index()]
                    .admits(site, row)
                    .then(|| site.id)
            })
            .collect()
    }

    fn reserve(&mut self, sites: &[SiteId], rows: &[RowDemand]) {
        for (site, row) in sites.iter().zip(rows.iter()) {
            self.sites[site.index()].add(row);
        }
    }
}

/// Candidate anchor sites by kind, searchable by proximity
struct SiteIndex {
    trees: HashMap<SiteKind, RTree<SiteElement>>,
}

impl SiteIndex {
    fn new<'s>(sites: impl Iterator<Item = &'s Site>) -> Self {
        let mut points: HashMap<SiteKind, Vec<SiteElement>> = HashMap::new();
        for site in sites {
            let (x, y) = site.center();
            points
                .entry(site.kind)
                .or_default()
                .push(GeomWithData::new([x, y], site.id));
        }
        Self {
            trees: points
                .into_iter()
                .map(|(kind, p)| (kind, RTree::bulk_load(p)))
                .collect(),
        }
    }

    /// Up to `limit` sites of `kind`, closest first
    fn nearest(&self, kind: SiteKind, pos: Vector2<f32>, limit: usize) -> Vec<SiteId> {
        match self.trees.get(&kind) {
            Some(tree) => tree
                .nearest_neighbor_iter(&[pos.x, pos.y])
                .take(limit)
                .map(|e| e.data)
                .collect(),
            None => vec![],
        }
    }
}

/// A site chosen for a unit
#[derive(Clone, Debug)]
struct Proposal {
    unit: PuId,
    anchor: SiteId,
    sites: Vec<SiteId>,
}

pub struct SitePacker {
    config: SitePackerConfig,
}

impl SitePacker {
    pub fn new(config: SitePackerConfig) -> Self {
        Self { config }
    }

    /// Weighted HPWL of the nets on `unit` with the unit anchored at `pos`
    fn local_hpwl(&self, state: &PlacementState<'_>, unit: PuId, pos: Vector2<f32>) -> f32 {
        state
            .unit_nets(unit)
            .iter()
            .map(|n| &state.nets()[*n])
            .filter(|n| n.is_wirelength_net())
            .map(|net| {
                let mut lo = Vector2::new(f32::INFINITY, f32::INFINITY);
                let mut hi = Vector2::new(f32::NEG_INFINITY, f32::NEG_INFINITY);
                for pin in net.pins.iter() {
                    let p = if pin.unit == unit {
                        pos + pin.offset
                    } else {
                        state.pin_position(pin)
                    };
                    lo = lo.inf(&p);
                    hi = hi.sup(&p);
                }
                state.net_weight(net) * ((hi.x - lo.x) + state.y2x_ratio() * (hi.y - lo.y))
            })
            .sum()
    }

    /// Pick a site for one unit among the nearest candidates of `index`
    fn select(
        &self,
        state: &PlacementState<'_>,
        occupancy: &Occupancy<'_>,
        index: &SiteIndex,
        unit: PuId,
        rows: &[RowDemand],
        criticality: f32,
    ) -> Option<Proposal> {
        let device = state.device;
        let pu = state.unit(unit);
        let pos = pu.position();
        let mut candidates = index
            .nearest(pu.kind.site_kind(), pos, self.config.max_candidate_sites)
            .into_iter()
            .filter_map(|anchor| {
                let site = device.site(anchor);
                occupancy.admissible(site, rows).map(|sites| Proposal {
                    unit,
                    anchor,
                    sites,
                })
            });

        match self.config.policy {
            SelectionPolicy::FirstFit => candidates.next(),
            SelectionPolicy::BestFitWirelength => {
                let before = self.local_hpwl(state, unit, pos);
                candidates
                    .map(|p| {
                        let (x, y) = device.site(p.anchor).center();
                        let target = Vector2::new(x, y);
                        let delta = self.local_hpwl(state, unit, target) - before;
                        let displacement = (target - pos).abs().sum();
                        let score = self.config.wirelength_weight * delta
                            + self.config.timing_weight * criticality * displacement;
                        (p, score)
                    })
                    .min_by(|a, b| a.1.total_cmp(&b.1))
                    .map(|(p, _)| p)
            }
        }
    }

    /// Assign every unit to a site. Locked units are reserved first on the site under them.
    /// Units already on an admissible site keep it. Units that find no site within the candidate
    /// budget, and locked units whose site is taken, are reported unpacked and keep their
    /// position.
    pub fn pack(
        &self,
        state: &mut PlacementState<'_>,
        timing: Option<&TimingGraph>,
    ) -> Result<PackingReport> {
        let _span = tracing::info_span!("site_pack", policy = ?self.config.policy).entered();
        let device = state.device;

        let criticality: Vec<f32> = match timing {
            Some(graph) => {
                let longest = state
                    .design
                    .cell_ids()
                    .map(|c| graph.path_length(c))
                    .max()
                    .unwrap_or(1)
                    .max(1) as f32;
                state
                    .units()
                    .iter()
                    .map(|u| {
                        u.cells()
                            .map(|c| graph.path_length(c) as f32 / longest)
                            .fold(0.0, f32::max)
                    })
                    .collect()
            }
            None => vec![0.0; state.units().len()],
        };
        let rows: Vec<Vec<RowDemand>> = state
            .unit_ids()
            .map(|id| row_demands(state, id))
            .collect();

        let mut occupancy = Occupancy::new(device);
        let mut placed: Vec<Option<Proposal>> = vec![None; state.units().len()];

        let mut unpacked = vec![];

        // Locked units take the site under them or nothing; they never move
        for id in state.unit_ids().filter(|id| state.unit(*id).pos_locked) {
            let unit = state.unit(id);
            let site = match unit.site.map(|s| device.site(s)) {
                Some(site) if site.kind == unit.kind.site_kind() => Some(site),
                _ => unit.site_under(device),
            };
            let admissible = site.and_then(|site| {
                occupancy
                    .admissible(site, &rows[id.index()])
                    .map(|sites| (site, sites))
            });
            match admissible {
                Some((site, sites)) => {
                    occupancy.reserve(&sites, &rows[id.index()]);
                    placed[id.index()] = Some(Proposal {
                        unit: id,
                        anchor: site.id,
                        sites,
                    });
                }
                None => {
                    log::warn!(
                        "Locked unit {:?} at ({}, {}) has no admissible {:?} site",
                        id,
                        unit.x,
                        unit.y,
                        unit.kind.site_kind()
                    );
                    unpacked.push(id);
                }
            }
        }

        // Keep existing assignments that still fit
        let mut kept = 0;
        for id in state.unit_ids().filter(|id| !state.unit(*id).pos_locked) {
            let site = match state.unit(id).site {
                Some(s) => device.site(s),
                None => continue,
            };
            if site.kind != state.unit(id).kind.site_kind() {
                continue;
            }
            if let Some(sites) = occupancy.admissible(site, &rows[id.index()]) {
                occupancy.reserve(&sites, &rows[id.index()]);
                placed[id.index()] = Some(Proposal {
                    unit: id,
                    anchor: site.id,
                    sites,
                });
                kept += 1;
            }
        }

        let mut pending: Vec<PuId> = state
            .unit_ids()
            .filter(|id| placed[id.index()].is_none() && !state.unit(*id).pos_locked)
            .collect();
        // Tall macros first, they have the fewest options
        pending.sort_by_key(|id| (std::cmp::Reverse(state.unit(*id).height()), *id));

        let bands = self.config.bands.max(1);
        let band_width = ((device.width as usize + bands - 1) / bands).max(1);
        let band_of = |x: f32| ((x.max(0.0) as usize) / band_width).min(bands - 1);

        let mut band_units: Vec<Vec<PuId>> = vec![vec![]; bands];
        for id in pending.iter() {
            band_units[band_of(state.position(*id).x)].push(*id);
        }

        let shared: &PlacementState<'_> = state;
        let band_results: Vec<(Vec<Proposal>, Vec<PuId>)> = band_units
            .par_iter()
            .enumerate()
            .map(|(band, units)| {
                let _span = tracing::debug_span!("site_pack_band", band).entered();
                let index = SiteIndex::new(
                    device
                        .sites()
                        .iter()
                        .filter(|s| (s.x as usize / band_width).min(bands - 1) == band),
                );
                let mut local = occupancy.clone();
                let mut proposals = vec![];
                let mut failed = vec![];
                for id in units {
                    let demand = &rows[id.index()];
                    let critical = criticality[id.index()];
                    match self.select(shared, &local, &index, *id, demand, critical) {
                        Some(p) => {
                            local.reserve(&p.sites, demand);
                            proposals.push(p);
                        }
                        None => failed.push(*id),
                    }
                }
                (proposals, failed)
            })
            .collect();

        let mut retry = vec![];
        for (proposals, failed) in band_results {
            for p in proposals {
                let demand = &rows[p.unit.index()];
                // Bands never share sites, so this only fails on a broken partition
                let sites = occupancy
                    .admissible(device.site(p.anchor), demand)
                    .ok_or_else(|| anyhow!("Band proposal for {:?} conflicts on commit", p.unit))
                    .context("Commit site packing proposals")?;
                occupancy.reserve(&sites, demand);
                let unit = p.unit;
                placed[unit.index()] = Some(p);
            }
            retry.extend(failed);
        }

        retry.sort_by_key(|id| (std::cmp::Reverse(state.unit(*id).height()), *id));
        let global = SiteIndex::new(device.sites().iter());
        for id in retry {
            let demand = &rows[id.index()];
            match self.select(state, &occupancy, &global, id, demand, criticality[id.index()]) {
                Some(p) => {
                    occupancy.reserve(&p.sites, demand);
                    placed[id.index()] = Some(p);
                }
                None => {
                    log::warn!(
                        "No admissible {:?} site for unit {:?} within {} candidates",
                        state.unit(id).kind.site_kind(),
                        id,
                        self.config.max_candidate_sites
                    );
                    unpacked.push(id);
                }
            }
        }

        for (idx, proposal) in placed.iter().enumerate() {
            let id = PuId::from(idx);
            match proposal {
                Some(p) => {
                    state.set_site(id, Some(p.anchor));
                    state.set_packed(id, true);
                    if !state.unit(id).pos_locked {
                        let (x, y) = device.site(p.anchor).center();
                        state.set_position(id, x, y);
                    }
                }
                None => {
                    state.set_site(id, None);
                    state.set_packed(id, false);
                }
            }
        }

        let occupancy: BTreeMap<SiteId, Resources> = occupancy
            .sites
            .iter()
            .enumerate()
            .filter(|(_, u)| !u.used.is_zero())
            .map(|(idx, u)| (SiteId::from(idx), u.used))
            .collect();
        let report = PackingReport {
            unpacked,
            occupancy,
            hpwl: state.total_hpwl(),
        };
        log::info!(
            "Site packing: {} units kept their site, {} unpacked, {} sites in use, HPWL {:.2}",
            kept,
            report.unpacked.len(),
            report.occupancy.len(),
            report.hpwl
        );
        Ok(report)
    }
}
