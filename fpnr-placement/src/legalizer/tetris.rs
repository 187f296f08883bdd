//! Implementation of the TETRIS legalizer, first described in "Method and system for high speed
//! detailed placement of cells within an integrated circuit design" (USPTO patent 6370673),
//! restricted to macros and searching whole site columns.

use std::{cmp::Ordering, collections::HashMap};

use fpnr_common::{device::Site, Resources, SiteId};
use itertools::Itertools;

use crate::core::PlacementState;
use crate::placement_unit::PlacementUnit;

use super::{LegalTarget, Legalizer};

pub struct TetrisLegalizer {
    /// How far from the current column of a macro we search before widening to the whole
    /// device
    window: f32,
}

impl TetrisLegalizer {
    pub fn new(window: f32) -> Self {
        TetrisLegalizer { window }
    }
}

/// Remaining capacity of every site, as macros are committed
struct Residual<'s> {
    state: &'s PlacementState<'s>,
    free: HashMap<SiteId, Resources>,
}

impl<'s> Residual<'s> {
    fn new(state: &'s PlacementState<'s>) -> Self {
        let mut residual = Self {
            state,
            free: state
                .device
                .sites()
                .iter()
                .map(|s| (s.id, s.capacity))
                .collect(),
        };
        // Locked units keep the capacity of their site, or of the site under them
        for unit in state.units().iter().filter(|u| u.pos_locked) {
            let site = match unit.site {
                Some(site) => Some(state.device.site(site)),
                None => unit.site_under(state.device),
            };
            if let Some(site) = site {
                residual.reserve(site, unit);
            }
        }
        residual
    }

    /// Sites holding every row of `unit` when anchored at `anchor`
    fn rows(&self, anchor: &Site, unit: &PlacementUnit) -> Option<Vec<SiteId>> {
        (0..unit.height() as u32)
            .map(|row| {
                let site = self
                    .state
                    .device
                    .site_at(anchor.x, anchor.y + row, anchor.kind)?;
                let free = self.free.get(&site.id)?;
                unit.rows[row as usize].fits_within(free).then(|| site.id)
            })
            .collect()
    }

    fn reserve(&mut self, anchor: &Site, unit: &PlacementUnit) {
        for (row, demand) in unit.rows.iter().enumerate() {
            let site = match self
                .state
                .device
                .site_at(anchor.x, anchor.y + row as u32, anchor.kind)
            {
                Some(site) => site,
                None => continue,
            };
            if let Some(free) = self.free.get_mut(&site.id) {
                *free = free.saturating_sub(demand);
            }
        }
    }
}

impl Legalizer for TetrisLegalizer {
    fn legalize(&self, state: &PlacementState<'_>) -> Vec<LegalTarget> {
        let _span = tracing::info_span!("tetris_legalize").entered();

        let mut residual = Residual::new(state);

        // Left to right, ties by id
        let order = state
            .mobile_units()
            .filter(|id| state.unit(*id).is_macro())
            .sorted_by(|a, b| {
                state
                    .unit(*a)
                    .x
                    .total_cmp(&state.unit(*b).x)
                    .then(a.cmp(b))
            })
            .collect_vec();

        let mut targets = Vec::with_capacity(order.len());
        for id in order {
            let unit = state.unit(id);
            let kind = unit.kind.site_kind();

            let best = |within_window: bool| {
                state
                    .device
                    .sites_of_kind(kind)
                    .filter(|site| {
                        !within_window || (site.x as f32 + 0.5 - unit.x).abs() <= self.window
                    })
                    .filter(|site| residual.rows(site, unit).is_some())
                    .map(|site| {
                        let (cx, cy) = site.center();
                        (site, (cx - unit.x).abs() + (cy - unit.y).abs())
                    })
                    .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal))
            };

            match best(true).or_else(|| best(false)) {
                Some((site, displacement)) => {
                    residual.reserve(site, unit);
                    let (x, y) = site.center();
                    targets.push(LegalTarget {
                        unit: id,
                        site: site.id,
                        x,
                        y,
                        displacement,
                    });
                }
                None => log::warn!(
                    "No legal column for {:?} macro {:?} of height {}",
                    unit.kind,
                    id,
                    unit.height()
                ),
            }
        }

        log::debug!("Legalized {} macros", targets.len());
        targets
    }
}

#[cfg(test)]
mod test {
    use fpnr_common::{
        design::{CellKind, DesignBuilder, PinRole},
        device::{Device, SiteKind},
        ResourceKind,
    };

    use super::*;
    use crate::legalizer::average_displacement;
    use crate::placement_unit::{PuId, UnitMember};
    use crate::test::slice_capacity;

    /// `count` carry chains of `height` cells each, as multi-row units
    fn carry_state<'a>(
        device: &'a Device,
        design: &'a fpnr_common::design::Design,
        height: u32,
    ) -> PlacementState<'a> {
        let units = design
            .cell_ids()
            .chunks(height as usize)
            .into_iter()
            .map(|chain| {
                let members = chain
                    .enumerate()
                    .map(|(row, cell)| UnitMember {
                        cell,
                        row: row as u32,
                    })
                    .collect();
                PlacementUnit::new(design, members)
            })
            .collect();
        PlacementState::new(device, design, units, 1.0).unwrap()
    }

    fn carry_design(count: usize, height: usize) -> fpnr_common::design::Design {
        let mut b = DesignBuilder::new();
        for chain in 0..count {
            let mut prev = None;
            for i in 0..height {
                let c = b.add_cell(&format!("c{chain}_{i}"), CellKind::Carry).unwrap();
                if let Some(p) = prev {
                    let net = format!("co{chain}_{i}");
                    b.connect(p, PinRole::CarryOut, &net);
                    b.connect(c, PinRole::CarryIn, &net);
                }
                prev = Some(c);
            }
        }
        b.build().unwrap()
    }

    #[test]
    fn overlapping_macros_get_distinct_columns() {
        let _ = tracing_subscriber::fmt::try_init();

        let device = Device::uniform(4, 4, SiteKind::Slice, slice_capacity());
        let design = carry_design(2, 4);
        let mut state = carry_state(&device, &design, 4);
        state.set_position(PuId(0), 1.5, 0.5);
        state.set_position(PuId(1), 1.6, 0.5);

        let targets = TetrisLegalizer::new(8.0).legalize(&state);

        assert_eq!(targets.len(), 2);
        let columns = targets
            .iter()
            .map(|t| device.site(t.site).x)
            .collect_vec();
        assert_eq!(columns[0], 1);
        assert_ne!(columns[0], columns[1]);
        assert!(targets.iter().all(|t| device.site(t.site).y == 0));
        approx_eq!(targets[0].displacement, 0.0);
        approx_eq!(average_displacement(&targets), 0.45, 1e-5);
    }

    #[test]
    fn tall_macro_is_kept_on_device() {
        let device = Device::uniform(2, 4, SiteKind::Slice, slice_capacity());
        let design = carry_design(1, 3);
        let mut state = carry_state(&device, &design, 3);
        state.set_position(PuId(0), 0.5, 1.9);

        let targets = TetrisLegalizer::new(1.0).legalize(&state);

        // Only anchors in rows 0 and 1 leave room for three rows
        assert_eq!(targets.len(), 1);
        let site = device.site(targets[0].site);
        assert_eq!((site.x, site.y), (0, 1));
    }

    #[test]
    fn locked_macros_reserve_their_sites() {
        let device = Device::uniform(2, 2, SiteKind::Slice, slice_capacity());
        let design = carry_design(2, 2);
        let mut state = carry_state(&device, &design, 2);
        let anchor = device.site_at(0, 0, SiteKind::Slice).unwrap().id;
        state.set_site(PuId(0), Some(anchor));
        state.fix_unit_at(PuId(0), 0.5, 0.5);
        state.set_position(PuId(1), 0.5, 0.5);

        let targets = TetrisLegalizer::new(8.0).legalize(&state);

        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].unit, PuId(1));
        assert_eq!(device.site(targets[0].site).x, 1);
    }

    #[test]
    fn locked_macros_without_site_reserve_the_site_under_them() {
        let device = Device::uniform(2, 2, SiteKind::Slice, slice_capacity());
        let design = carry_design(2, 2);
        let mut state = carry_state(&device, &design, 2);
        state.fix_unit_at(PuId(0), 0.5, 0.5);
        state.set_position(PuId(1), 0.5, 0.5);

        let targets = TetrisLegalizer::new(8.0).legalize(&state);

        assert_eq!(targets.len(), 1);
        assert_eq!(device.site(targets[0].site).x, 1);
    }

    #[test]
    fn macro_without_sites_is_skipped() {
        let device = Device::uniform(2, 2, SiteKind::Slice, slice_capacity());
        let mut b = DesignBuilder::new();
        b.add_cell("dsp", CellKind::Dsp).unwrap();
        let design = b.build().unwrap();
        let state = crate::test::singleton_state(&device, &design);

        assert!(state.unit(PuId(0)).is_macro());
        assert!(!device.offers(ResourceKind::Dsp));
        assert!(TetrisLegalizer::new(8.0).legalize(&state).is_empty());
    }
}
