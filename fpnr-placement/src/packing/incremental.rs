//! Fuses nearby singleton units during global placement

use std::collections::{BTreeMap, HashSet};

use anyhow::{Context, Result};
use fpnr_common::{
    design::{CellKind, PinRole},
    CellId,
};
use nalgebra::Vector2;
use rstar::{primitives::GeomWithData, RTree};

use crate::core::PlacementState;
use crate::placement_unit::{PlacementUnit, PuId, UnitMember};

/// Neighbours examined for every flip-flop when pairing flip-flops
const FF_NEIGHBOURS: usize = 10;
/// Nets with at most this many pins let a LUT pick the nearest of several flip-flops
const SMALL_NET_PINS: usize = 4;

type Element = GeomWithData<[f32; 2], PuId>;

/// Mobile singleton holding a cell of `kind`, not claimed by the site packer
fn free_singleton(
    state: &PlacementState<'_>,
    id: PuId,
    kind: impl Fn(&CellKind) -> bool,
) -> Option<CellId> {
    let unit = state.unit(id);
    if unit.pos_locked || unit.packed || !unit.is_singleton() {
        return None;
    }
    let cell = unit.members[0].cell;
    kind(&state.design.cell(cell).kind).then(|| cell)
}

/// Anchor of a merged unit, the average of the parts weighted by pin count
fn weighted_anchor(state: &PlacementState<'_>, parts: &[PuId]) -> Vector2<f32> {
    let mut sum = Vector2::zeros();
    let mut total = 0.0;
    for id in parts {
        let pins: usize = state
            .unit(*id)
            .cells()
            .map(|c| state.design.cell(c).pins.len())
            .sum();
        let w = pins.max(1) as f32;
        sum += state.position(*id) * w;
        total += w;
    }
    sum / total
}

/// Replace each group of units in `merges` by a single unit made of their members
fn apply_merges(state: &mut PlacementState<'_>, merges: Vec<Vec<PuId>>) -> Result<usize> {
    if merges.is_empty() {
        return Ok(0);
    }
    let merged: HashSet<PuId> = merges.iter().flatten().copied().collect();
    let mut units: Vec<PlacementUnit> = state
        .unit_ids()
        .filter(|id| !merged.contains(id))
        .map(|id| state.unit(id).clone())
        .collect();
    for group in merges.iter() {
        let members = group
            .iter()
            .flat_map(|id| state.unit(*id).cells())
            .map(|cell| UnitMember { cell, row: 0 })
            .collect();
        let anchor = weighted_anchor(state, group);
        let mut unit = PlacementUnit::new(state.design, members);
        unit.x = anchor.x;
        unit.y = anchor.y;
        units.push(unit);
    }
    state
        .replace_units(units)
        .context("Rebuild units after pairing")?;
    Ok(merges.len())
}

/// Pair LUT singletons with the flip-flop singletons they feed. A LUT driving exactly one
/// flip-flop within `max_distance` joins it; when its net has at most four pins it joins the
/// nearest flip-flop sink in range. Returns the number of pairs formed.
pub fn pair_lut_ff(state: &mut PlacementState<'_>, max_distance: f32) -> Result<usize> {
    let _span = tracing::info_span!("pair_lut_ff", max_distance).entered();
    let design = state.design;

    let mut used: HashSet<PuId> = HashSet::new();
    let mut merges = vec![];
    for lut_unit in state.unit_ids() {
        let lut = match free_singleton(state, lut_unit, CellKind::is_lut) {
            Some(c) => c,
            None => continue,
        };
        let mut driven = design.driven_nets(lut);
        let net = match (driven.next(), driven.next()) {
            (Some(n), None) => n,
            _ => continue,
        };

        let origin = state.position(lut_unit);
        let candidates: Vec<(PuId, f32)> = design
            .sink_cells(net)
            .filter(|(_, role)| *role == PinRole::Input)
            .map(|(cell, _)| state.unit_of(cell))
            .filter(|id| !used.contains(id))
            .filter(|id| free_singleton(state, *id, |k| *k == CellKind::Ff).is_some())
            .map(|id| (id, (state.position(id) - origin).norm()))
            .filter(|(_, d)| *d <= max_distance)
            .collect();

        let sinks = design.net(net).sinks.len();
        let chosen = if sinks == 1 {
            candidates.first().copied()
        } else if design.net(net).pin_count() <= SMALL_NET_PINS {
            candidates
                .iter()
                .copied()
                .min_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)))
        } else {
            None
        };

        if let Some((ff_unit, _)) = chosen {
            used.insert(lut_unit);
            used.insert(ff_unit);
            merges.push(vec![lut_unit, ff_unit]);
        }
    }

    let pairs = apply_merges(state, merges)?;
    log::info!("Formed {} LUT-FF pairs", pairs);
    Ok(pairs)
}

/// Pair flip-flop singletons sharing a control set. Each flip-flop looks at its ten nearest
/// compatible neighbours and joins the closest free one within `max_distance`. Returns the
/// number of pairs formed.
pub fn pair_ff_ff(state: &mut PlacementState<'_>, max_distance: f32) -> Result<usize> {
    let _span = tracing::info_span!("pair_ff_ff", max_distance).entered();
    let design = state.design;

    let mut groups: BTreeMap<_, Vec<PuId>> = BTreeMap::new();
    for id in state.unit_ids() {
        if let Some(cell) = free_singleton(state, id, |k| *k == CellKind::Ff) {
            if let Some(control) = design.control_set(cell) {
                groups.entry(control).or_default().push(id);
            }
        }
    }

    let mut used: HashSet<PuId> = HashSet::new();
    let mut merges = vec![];
    let limit = max_distance * max_distance;
    for members in groups.values() {
        if members.len() < 2 {
            continue;
        }
        let tree: RTree<Element> = RTree::bulk_load(
            members
                .iter()
                .map(|id| {
                    let p = state.position(*id);
                    GeomWithData::new([p.x, p.y], *id)
                })
                .collect(),
        );

        for id in members {
            if used.contains(id) {
                continue;
            }
            let p = state.position(*id);
            let partner = tree
                .nearest_neighbor_iter_with_distance_2(&[p.x, p.y])
                .take(FF_NEIGHBOURS)
                .filter(|(e, d2)| e.data != *id && *d2 <= limit && !used.contains(&e.data))
                .map(|(e, _)| e.data)
                .next();
            if let Some(other) = partner {
                used.insert(*id);
                used.insert(other);
                merges.push(vec![*id, other]);
            }
        }
    }

    let pairs = apply_merges(state, merges)?;
    log::info!("Formed {} FF-FF pairs", pairs);
    Ok(pairs)
}
