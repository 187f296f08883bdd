use fpnr_common::design::{CellKind, Design, DesignBuilder, PinRole};
use fpnr_common::device::{ClockRegion, Device, Site, SiteKind};

use super::*;
use crate::config::TimingConfig;
use crate::packing::pack_initial;
use crate::pipeline::NullSink;
use crate::test::{lut, singleton_state, slice_capacity, slice_device};

/// Six LUTs chained between two fixed LUTs on opposite edges
fn fixed_chain() -> (Design, Vec<fpnr_common::CellId>) {
    let mut b = DesignBuilder::new();
    let start = b.add_cell("start", lut(2)).unwrap();
    b.fix(start, 0.5, 4.0);
    let mut chain = vec![];
    let mut prev = start;
    for i in 0..6 {
        let l = b.add_cell(&format!("l{i}"), lut(2)).unwrap();
        b.connect(prev, PinRole::Output, &format!("n{i}"));
        b.connect(l, PinRole::Input, &format!("n{i}"));
        chain.push(l);
        prev = l;
    }
    let end = b.add_cell("end", lut(2)).unwrap();
    b.fix(end, 7.5, 4.0);
    b.connect(prev, PinRole::Output, "n6");
    b.connect(end, PinRole::Input, "n6");
    (b.build().unwrap(), chain)
}

fn carry_pairs() -> Design {
    let mut b = DesignBuilder::new();
    for chain in 0..2 {
        let c0 = b.add_cell(&format!("c{chain}_0"), CellKind::Carry).unwrap();
        let c1 = b.add_cell(&format!("c{chain}_1"), CellKind::Carry).unwrap();
        b.connect(c0, PinRole::CarryOut, &format!("co{chain}"));
        b.connect(c1, PinRole::CarryIn, &format!("co{chain}"));
    }
    b.build().unwrap()
}

#[test]
fn phase_spreads_chain_between_fixed_ends() {
    let _ = tracing_subscriber::fmt::try_init();

    let device = slice_device(8, 8, slice_capacity());
    let (design, chain) = fixed_chain();
    let mut state = singleton_state(&device, &design);
    for cell in chain.iter() {
        state.set_position(state.unit_of(*cell), 4.0, 4.0);
    }
    state.rebuild_bins(2.0, 2.0);

    let config = Config::with_iterations(3);
    let timing = TimingAnalyzer::new(TimingConfig::default());
    let mut placer = GlobalPlacer::new(&config);
    let phase = GlobalPhase {
        iterations: 3,
        decay: 1.0,
        displacement_bound: None,
        timing: false,
        macro_legalization: true,
    };

    let summary = placer
        .run_phase(&mut state, &phase, &timing, &mut NullSink)
        .expect("global phase");

    assert_eq!(summary.iterations, 3);
    let xs: Vec<f32> = chain
        .iter()
        .map(|c| state.position(state.unit_of(*c)).x)
        .collect();
    assert!(xs.windows(2).all(|w| w[0] < w[1]), "positions {:?}", xs);
    assert!(xs.iter().all(|x| (0.5..=7.5).contains(x)));
    for cell in chain.iter() {
        approx_eq!(state.position(state.unit_of(*cell)).y, 4.0, 1e-2);
    }
    assert!(placer.progress() > 0.9);
}

#[test]
fn pseudo_net_weight_follows_progress() {
    let config = Config::with_iterations(1);

    let mut placer = GlobalPlacer::new(&config);
    placer.pseudo_weight = 0.001;
    placer.update_weight(50.0, 100.0);
    approx_eq!(placer.progress(), 0.5f32.powf(0.6), 1e-6);
    approx_eq!(placer.pseudo_weight(), 0.001 * 1.825, 1e-9);

    let mut placer = GlobalPlacer::new(&config);
    placer.pseudo_weight = 0.1;
    let mut expected = 0.1f32;
    for upper in [100.0, 110.0, 120.0] {
        placer.update_weight(50.0, upper);
        let p = (50.0 / upper as f32).powf(0.6);
        expected *= 1.5 * (1.0 - p) + 1.01 * p;
    }
    // Three rising upper bounds ease the weight
    approx_eq!(placer.pseudo_weight(), expected * 0.75, 1e-6);
    assert_eq!(placer.history.len(), 1);
}

#[test]
fn close_macros_are_snapped_and_fixed() {
    let device = slice_device(4, 4, slice_capacity());
    let design = carry_pairs();
    let units = pack_initial(&design, &device);
    let mut state = PlacementState::new(&device, &design, units, 1.0).expect("state");
    state.set_position(PuId(0), 1.5, 0.5);
    state.set_position(PuId(1), 1.6, 0.5);

    let mut config = Config::with_iterations(1);
    config.legalization.snap_threshold = 100.0;
    let mut placer = GlobalPlacer::new(&config);

    let (fixed, _) = placer.legalize_macros(&mut state);

    assert_eq!(fixed, 2);
    let sites: Vec<_> = state.units().iter().map(|u| u.site).collect();
    assert!(sites.iter().all(Option::is_some));
    assert_ne!(sites[0], sites[1]);
    for unit in state.units() {
        assert!(unit.pos_locked);
        let (x, y) = device.site(unit.site.expect("site")).center();
        assert_eq!((unit.x, unit.y), (x, y));
    }
    assert!(!state.set_position(PuId(0), 3.5, 3.5));
}

#[test]
fn distant_macros_are_pulled_by_pseudo_nets() {
    let device = slice_device(4, 4, slice_capacity());
    let design = carry_pairs();
    let units = pack_initial(&design, &device);
    let mut state = PlacementState::new(&device, &design, units, 1.0).expect("state");
    state.set_position(PuId(0), 1.5, 0.5);
    state.set_position(PuId(1), 1.6, 0.5);

    let mut config = Config::with_iterations(1);
    config.legalization.snap_threshold = 0.0;
    let mut placer = GlobalPlacer::new(&config);

    assert_eq!(placer.legalize_macros(&mut state).0, 0);
    assert!(state.units().iter().all(|u| !u.pos_locked));

    let nets = placer.pseudo_nets(&state, None);
    // One anchor per mobile unit, one pull per macro target
    assert_eq!(nets.len(), 4);
    let target = placer.macro_targets[1];
    assert!(nets.iter().any(|n| matches!(
        n,
        PseudoNet::Anchor { unit, target: t, weight }
            if *unit == target.unit && *t == Vector2::new(target.x, target.y) && *weight > 0.0
    )));
}

#[test]
fn macro_targets_are_dropped_when_units_are_replaced() {
    let device = slice_device(4, 4, slice_capacity());
    let design = carry_pairs();
    let units = pack_initial(&design, &device);
    let mut state = PlacementState::new(&device, &design, units, 1.0).expect("state");
    state.set_position(PuId(0), 1.5, 0.5);
    state.set_position(PuId(1), 1.6, 0.5);
    state.rebuild_bins(2.0, 2.0);

    let mut config = Config::with_iterations(1);
    config.legalization.snap_threshold = 0.0;
    let timing = TimingAnalyzer::new(TimingConfig::default());
    let phase = GlobalPhase {
        iterations: 1,
        decay: 1.0,
        displacement_bound: None,
        timing: false,
        macro_legalization: false,
    };
    let mut placer = GlobalPlacer::new(&config);
    placer.legalize_macros(&mut state);
    assert_eq!(placer.macro_targets.len(), 2);

    // Same units: the targets survive into the next iteration
    placer
        .run_phase(&mut state, &phase, &timing, &mut NullSink)
        .expect("phase");
    assert_eq!(placer.macro_targets.len(), 2);

    // Renumbered units: targets refer to the old ids
    let mut units = state.units().to_vec();
    units.reverse();
    state.replace_units(units).expect("replace");
    placer
        .run_phase(&mut state, &phase, &timing, &mut NullSink)
        .expect("phase");
    assert!(placer.macro_targets.is_empty());
}

#[test]
fn least_used_clock_leaves_overfull_region() {
    let sites = (0..8)
        .flat_map(|x| (0..4).map(move |y| Site::new(SiteKind::Slice, x, y, slice_capacity())))
        .collect();
    let device = Device::new(
        8,
        4,
        sites,
        vec![ClockRegion::new(0, 0, 4, 4), ClockRegion::new(4, 0, 8, 4)],
    )
    .expect("valid device");

    let mut b = DesignBuilder::new();
    let mut crowded = vec![];
    for i in 0..13 {
        let ff = b.add_cell(&format!("ff{i}"), CellKind::Ff).unwrap();
        b.connect(ff, PinRole::Clock, &format!("clk{i}"));
        crowded.push(ff);
    }
    let mut away = vec![];
    for i in 0..2 {
        let ff = b.add_cell(&format!("far{i}"), CellKind::Ff).unwrap();
        b.connect(ff, PinRole::Clock, "clk12");
        away.push(ff);
    }
    let design = b.build().unwrap();
    let mut state = singleton_state(&device, &design);
    for ff in crowded.iter() {
        state.set_position(state.unit_of(*ff), 1.5, 1.0);
    }
    for ff in away.iter() {
        state.set_position(state.unit_of(*ff), 5.5, 1.0);
    }

    let targets = clock_region_targets(&state);

    assert_eq!(
        targets,
        vec![(state.unit_of(crowded[12]), Vector2::new(6.0, 2.0))]
    );
}
