//! Pattern-matching packer turning the netlist into the first set of placement units

use fpnr_common::{
    design::{CellKind, Design, PinRole},
    device::{Device, SiteKind},
    CellId, ResourceKind,
};

use crate::placement_unit::{PlacementUnit, UnitMember};

/// Cells driving nothing but `sink`, possibly through several pins
fn sole_fanout(design: &Design, cell: CellId) -> Option<CellId> {
    let mut only = None;
    for net in design.driven_nets(cell) {
        for (sink, _) in design.sink_cells(net) {
            match only {
                None => only = Some(sink),
                Some(s) if s == sink => {}
                Some(_) => return None,
            }
        }
    }
    only
}

/// Next free cell of the same kind linked through `out -> inp`
fn chain_successor(
    design: &Design,
    taken: &[bool],
    cell: CellId,
    out: PinRole,
    inp: PinRole,
) -> Option<CellId> {
    let net = design.pin_net(cell, out)?;
    let kind = design.cell(cell).kind;
    design
        .sink_cells(net)
        .find(|(sink, role)| {
            *role == inp && !taken[sink.index()] && design.cell(*sink).kind == kind
        })
        .map(|(sink, _)| sink)
}

/// Whether the `inp` pin of `cell` is fed by a free cell of the same kind
fn has_chain_predecessor(design: &Design, taken: &[bool], cell: CellId, inp: PinRole) -> bool {
    let net = match design.pin_net(cell, inp) {
        Some(n) => n,
        None => return false,
    };
    match design.driver_cell(net) {
        Some(d) => {
            d != cell && !taken[d.index()] && design.cell(d).kind == design.cell(cell).kind
        }
        None => false,
    }
}

/// Collect ordered chains of cells matching `is_link`, linked `out -> inp`. A lone cell is a
/// chain of one.
fn chains(
    design: &Design,
    taken: &mut [bool],
    is_link: impl Fn(&CellKind) -> bool,
    out: PinRole,
    inp: PinRole,
) -> Vec<Vec<CellId>> {
    let links: Vec<CellId> = design
        .cell_ids()
        .filter(|c| is_link(&design.cell(*c).kind))
        .collect();

    let walk = |head: CellId, taken: &mut [bool]| {
        let mut chain = vec![head];
        taken[head.index()] = true;
        let mut cur = head;
        while let Some(next) = chain_successor(design, taken, cur, out, inp) {
            taken[next.index()] = true;
            chain.push(next);
            cur = next;
        }
        chain
    };

    let mut result = vec![];
    // Heads first, then whatever is left on cyclic chains
    for cell in links.iter() {
        if !taken[cell.index()] && !has_chain_predecessor(design, taken, *cell, inp) {
            result.push(walk(*cell, taken));
        }
    }
    for cell in links.iter() {
        if !taken[cell.index()] {
            result.push(walk(*cell, taken));
        }
    }
    result
}

/// Build the initial placement units:
///
/// 1. User-fixed cells become locked singletons at their declared location.
/// 2. Carry cells linked `CarryOut -> CarryIn` form ordered column macros, absorbing LUTs that
///    feed nothing but one of the carries, up to the LUT capacity of a slice. A lone carry
///    still absorbs its LUTs.
/// 3. DSP and BRAM cascades linked `CascadeOut -> CascadeIn` form column macros.
/// 4. A flip-flop whose data input comes from a LUT driving nothing else joins that LUT.
/// 5. Everything else becomes a singleton.
///
/// Movable units start at the center of the device.
pub fn pack_initial(design: &Design, device: &Device) -> Vec<PlacementUnit> {
    let _span = tracing::info_span!("initial_pack").entered();

    let n = design.cells().len();
    let mut taken = vec![false; n];
    let mut units = vec![];

    for cell in design.cell_ids() {
        if let Some((x, y)) = design.cell(cell).fixed {
            let mut unit = PlacementUnit::singleton(design, cell);
            unit.x = x;
            unit.y = y;
            unit.pos_locked = true;
            unit.site = unit.site_under(device).map(|s| s.id);
            if unit.site.is_none() {
                log::warn!(
                    "Fixed cell {} at ({}, {}) is not on a {:?} site",
                    design.cell(cell).name,
                    x,
                    y,
                    unit.kind.site_kind()
                );
            }
            taken[cell.index()] = true;
            units.push(unit);
        }
    }
    let fixed = units.len();

    let row_luts = device
        .sites_of_kind(SiteKind::Slice)
        .map(|s| s.capacity.get(ResourceKind::Lut))
        .max()
        .unwrap_or(0) as usize;

    let carry_chains = chains(
        design,
        &mut taken,
        |k| *k == CellKind::Carry,
        PinRole::CarryOut,
        PinRole::CarryIn,
    );
    let carry_count = carry_chains.len();
    for chain in carry_chains {
        let mut members = vec![];
        for (row, carry) in chain.iter().enumerate() {
            members.push(UnitMember {
                cell: *carry,
                row: row as u32,
            });
            let mut absorbed = 0;
            for net in design.input_nets(*carry) {
                let lut = match design.driver_cell(net) {
                    Some(l) => l,
                    None => continue,
                };
                if absorbed >= row_luts
                    || taken[lut.index()]
                    || !design.cell(lut).kind.is_lut()
                    || sole_fanout(design, lut) != Some(*carry)
                {
                    continue;
                }
                taken[lut.index()] = true;
                absorbed += 1;
                members.push(UnitMember {
                    cell: lut,
                    row: row as u32,
                });
            }
        }
        units.push(PlacementUnit::new(design, members));
    }

    let cascades = chains(
        design,
        &mut taken,
        |k| matches!(k, CellKind::Dsp | CellKind::Bram),
        PinRole::CascadeOut,
        PinRole::CascadeIn,
    );
    let cascade_count = cascades.len();
    for chain in cascades {
        let members = chain
            .into_iter()
            .enumerate()
            .map(|(row, cell)| UnitMember {
                cell,
                row: row as u32,
            })
            .collect();
        units.push(PlacementUnit::new(design, members));
    }

    let mut lut_ff = 0;
    for ff in design.cell_ids() {
        if taken[ff.index()] || design.cell(ff).kind != CellKind::Ff {
            continue;
        }
        let lut = match design
            .pin_net(ff, PinRole::Input)
            .and_then(|net| design.driver_cell(net))
        {
            Some(l) => l,
            None => continue,
        };
        if taken[lut.index()]
            || !design.cell(lut).kind.is_lut()
            || sole_fanout(design, lut) != Some(ff)
        {
            continue;
        }
        taken[lut.index()] = true;
        taken[ff.index()] = true;
        lut_ff += 1;
        units.push(PlacementUnit::new(
            design,
            vec![
                UnitMember { cell: lut, row: 0 },
                UnitMember { cell: ff, row: 0 },
            ],
        ));
    }

    for cell in design.cell_ids() {
        if !taken[cell.index()] {
            units.push(PlacementUnit::singleton(design, cell));
        }
    }

    let (cx, cy) = device.center();
    for unit in units.iter_mut().skip(fixed) {
        unit.x = cx;
        unit.y = cy;
    }

    log::info!(
        "Initial packing: {} units from {} cells ({} fixed, {} carry chains, {} cascades, {} LUT-FF pairs)",
        units.len(),
        n,
        fixed,
        carry_count,
        cascade_count,
        lut_ff
    );
    units
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::placement_unit::UnitKind;
    use crate::test::{lut, slice_capacity, slice_device};
    use fpnr_common::design::DesignBuilder;

    fn find<'u>(units: &'u [PlacementUnit], cell: CellId) -> &'u PlacementUnit {
        units
            .iter()
            .find(|u| u.cells().any(|c| c == cell))
            .expect("cell is packed")
    }

    #[test]
    fn carry_chain_absorbs_private_luts() {
        let _ = tracing_subscriber::fmt::try_init();

        let device = slice_device(4, 4, slice_capacity());
        let mut b = DesignBuilder::new();
        let c0 = b.add_cell("c0", CellKind::Carry).unwrap();
        let c1 = b.add_cell("c1", CellKind::Carry).unwrap();
        let l0 = b.add_cell("l0", lut(4)).unwrap();
        let l1 = b.add_cell("l1", lut(4)).unwrap();
        let shared = b.add_cell("shared", lut(4)).unwrap();
        let other = b.add_cell("other", CellKind::Ff).unwrap();
        b.connect(c1, PinRole::CarryIn, "co0");
        b.connect(c0, PinRole::CarryOut, "co0");
        b.connect(l0, PinRole::Output, "a");
        b.connect(c0, PinRole::Input, "a");
        b.connect(l1, PinRole::Output, "b");
        b.connect(c1, PinRole::Input, "b");
        b.connect(shared, PinRole::Output, "s");
        b.connect(c1, PinRole::Input, "s");
        b.connect(other, PinRole::Input, "s");
        let design = b.build().unwrap();

        let units = pack_initial(&design, &device);

        let chain = find(&units, c0);
        assert_eq!(chain.kind, UnitKind::Carry);
        assert_eq!(chain.height(), 2);
        assert_eq!(chain.row_of(c0), Some(0));
        assert_eq!(chain.row_of(c1), Some(1));
        assert_eq!(chain.row_of(l0), Some(0));
        assert_eq!(chain.row_of(l1), Some(1));
        assert_eq!(chain.row_of(shared), None);
        assert_eq!(units.len(), 3);
        assert!(units.iter().all(|u| (u.x, u.y) == (2.0, 2.0)));
    }

    #[test]
    fn fixed_cells_break_patterns() {
        let device = slice_device(4, 4, slice_capacity());
        let mut b = DesignBuilder::new();
        let l = b.add_cell("l", lut(2)).unwrap();
        let ff = b.add_cell("ff", CellKind::Ff).unwrap();
        b.connect(l, PinRole::Output, "d");
        b.connect(ff, PinRole::Input, "d");
        b.fix(ff, 3.5, 0.5);
        let design = b.build().unwrap();

        let units = pack_initial(&design, &device);

        assert_eq!(units.len(), 2);
        assert!(units[0].pos_locked);
        assert_eq!((units[0].x, units[0].y), (3.5, 0.5));
        let site = device.site(units[0].site.expect("fixed unit has its site"));
        assert_eq!((site.x, site.y), (3, 0));
        assert!(find(&units, l).is_singleton());
    }

    #[test]
    fn lut_ff_pairs_and_cascades() {
        let device = slice_device(4, 4, slice_capacity());
        let mut b = DesignBuilder::new();
        let l = b.add_cell("l", lut(4)).unwrap();
        let ff = b.add_cell("ff", CellKind::Ff).unwrap();
        let busy = b.add_cell("busy", lut(4)).unwrap();
        let ff2 = b.add_cell("ff2", CellKind::Ff).unwrap();
        let d0 = b.add_cell("d0", CellKind::Dsp).unwrap();
        let d1 = b.add_cell("d1", CellKind::Dsp).unwrap();
        let d2 = b.add_cell("d2", CellKind::Dsp).unwrap();
        b.connect(l, PinRole::Output, "q");
        b.connect(ff, PinRole::Input, "q");
        b.connect(busy, PinRole::Output, "r");
        b.connect(ff2, PinRole::Input, "r");
        b.connect(d0, PinRole::Input, "r");
        b.connect(d0, PinRole::CascadeOut, "k0");
        b.connect(d1, PinRole::CascadeIn, "k0");
        b.connect(d1, PinRole::CascadeOut, "k1");
        b.connect(d2, PinRole::CascadeIn, "k1");
        let design = b.build().unwrap();

        let units = pack_initial(&design, &device);

        let pair = find(&units, ff);
        assert_eq!(pair.members.len(), 2);
        assert_eq!(pair.row_of(l), Some(0));
        assert!(find(&units, ff2).is_singleton());
        assert!(find(&units, busy).is_singleton());

        let cascade = find(&units, d1);
        assert_eq!(cascade.kind, UnitKind::Dsp);
        assert_eq!(
            [d0, d1, d2].map(|c| cascade.row_of(c)),
            [Some(0), Some(1), Some(2)]
        );
        assert_eq!(units.len(), 4);
    }

    #[test]
    fn carry_cycle_terminates() {
        let device = slice_device(4, 4, slice_capacity());
        let mut b = DesignBuilder::new();
        let c0 = b.add_cell("c0", CellKind::Carry).unwrap();
        let c1 = b.add_cell("c1", CellKind::Carry).unwrap();
        b.connect(c0, PinRole::CarryOut, "x");
        b.connect(c1, PinRole::CarryIn, "x");
        b.connect(c1, PinRole::CarryOut, "y");
        b.connect(c0, PinRole::CarryIn, "y");
        let design = b.build().unwrap();

        let units = pack_initial(&design, &device);

        assert_eq!(units.len(), 1);
        assert_eq!(units[0].height(), 2);
    }
}
