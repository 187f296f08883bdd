use super::*;
use crate::test::{lut, singleton_state, slice_capacity, slice_device};
use fpnr_common::design::{CellKind, DesignBuilder, PinRole};
use fpnr_common::Resources;

#[test]
fn hpwl_tracks_moves() {
    let _ = tracing_subscriber::fmt::try_init();

    let device = slice_device(8, 8, slice_capacity());
    let (design, ids) = design![
        cells: [a => lut(4), b => lut(4), c => CellKind::Ff],
        nets: [n0: a -> [b, c]]
    ];
    let mut state = singleton_state(&device, &design);

    state.set_position(state.unit_of(ids["a"]), 1.0, 1.0);
    state.set_position(state.unit_of(ids["b"]), 4.0, 2.0);
    state.set_position(state.unit_of(ids["c"]), 2.0, 5.0);
    approx_eq!(state.total_hpwl(), 3.0 + 4.0);

    // Cached value must be dropped by the next move
    state.set_position(state.unit_of(ids["c"]), 2.0, 2.0);
    approx_eq!(state.total_hpwl(), 3.0 + 1.0);

    state.set_net_enhance(state.nets()[0].net, 2.0);
    approx_eq!(state.total_hpwl(), 8.0);
}

#[test]
fn b2b_bounds_follow_dirty_nets() {
    let device = slice_device(8, 8, slice_capacity());
    let (design, ids) = design![
        cells: [a => lut(4), b => lut(4), c => lut(4), d => lut(4)],
        nets: [n0: a -> [b, c], n1: d -> [a]]
    ];
    let mut state = singleton_state(&device, &design);
    state.move_units([
        (state.unit_of(ids["a"]), 1.0, 3.0),
        (state.unit_of(ids["b"]), 5.0, 1.0),
        (state.unit_of(ids["c"]), 3.0, 6.0),
        (state.unit_of(ids["d"]), 0.0, 0.0),
    ]);
    assert_eq!(state.update_b2b(), 2);
    assert_eq!(state.update_b2b(), 0);

    let b = state.nets()[0].bounds();
    assert_eq!((b.left, b.right, b.bottom, b.top), (0, 1, 1, 2));

    // Only n0 touches c
    state.set_position(state.unit_of(ids["c"]), 7.0, 0.5);
    assert_eq!(state.update_b2b(), 1);
    let b = state.nets()[0].bounds();
    assert_eq!((b.left, b.right, b.bottom, b.top), (0, 2, 2, 0));
}

#[test]
fn fixed_units_do_not_move() {
    let device = slice_device(4, 4, slice_capacity());
    let mut builder = DesignBuilder::new();
    let pad = builder.add_cell("pad", CellKind::Io).unwrap();
    let l = builder.add_cell("l", lut(2)).unwrap();
    builder.connect(pad, PinRole::Output, "n");
    builder.connect(l, PinRole::Input, "n");
    builder.fix(pad, 0.5, 0.5);
    let design = builder.build().unwrap();

    let mut state = singleton_state(&device, &design);
    let pad_unit = state.unit_of(pad);
    assert!(!state.set_position(pad_unit, 3.0, 3.0));
    assert_eq!(state.position(pad_unit), Vector2::new(0.5, 0.5));
    assert_eq!(state.nets()[0].moveable_pins, 1);

    // Positions are clamped into the device
    let l_unit = state.unit_of(l);
    assert!(state.set_position(l_unit, 9.0, -2.0));
    let p = state.position(l_unit);
    assert!(p.x < 4.0 && p.y == 0.0);
}

#[test]
fn bin_overflow_and_utilization_factor() {
    let device = slice_device(
        4,
        4,
        Resources::single(ResourceKind::Lut, 1),
    );
    let (design, ids) = design![
        cells: [a => lut(1), b => lut(1), c => lut(1)],
        nets: []
    ];
    let mut state = singleton_state(&device, &design);
    for name in ["a", "b", "c"] {
        state.set_position(state.unit_of(ids[name]), 0.5, 0.5);
    }

    assert_eq!(state.bin_overflow(), 0.0, "no bins yet");
    state.rebuild_bins(1.0, 1.0);
    approx_eq!(state.bin_overflow(), 2.0);

    // Over-packing allowance shrinks the reported overflow
    state.set_utilization_factor(2.0);
    approx_eq!(state.bin_overflow(), 1.0);
    approx_eq!(state.utilization().ratio(ResourceKind::Lut), 3.0 / 32.0);
}

#[test]
fn thirteen_clocks_in_one_half_column_is_a_violation() {
    let _ = tracing_subscriber::fmt::try_init();

    let device = slice_device(4, 4, slice_capacity());
    let mut builder = DesignBuilder::new();
    let mut ffs = vec![];
    for i in 0..13 {
        let ff = builder.add_cell(&format!("ff{i}"), CellKind::Ff).unwrap();
        builder.connect(ff, PinRole::Clock, &format!("clk{i}"));
        ffs.push(ff);
    }
    let design = builder.build().unwrap();
    let mut state = singleton_state(&device, &design);
    for ff in ffs.iter() {
        state.set_position(state.unit_of(*ff), 1.5, 0.5);
    }

    let report = state.check_clock_utilization(false).expect("lenient check");
    assert_eq!(report.max_half_column_clocks, 13);
    assert_eq!(report.violations.len(), 1);
    assert_eq!(report.violations[0].clocks, 13);
    assert_eq!(report.violations[0].budget, 12);
    assert!(matches!(
        report.violations[0].scope,
        ClockScope::HalfColumn { column: 1, .. }
    ));

    let err = state.check_clock_utilization(true).unwrap_err();
    assert_eq!(
        err.downcast_ref::<PlacementError>(),
        Some(&PlacementError::ClockOverflow { violations: 1 })
    );

    // Splitting the clocks across two columns resolves it
    state.set_position(state.unit_of(ffs[0]), 2.5, 0.5);
    assert!(state.check_clock_utilization(true).expect("clean").is_clean());
}

#[test]
fn snapshot_round_trip() {
    let device = slice_device(8, 8, slice_capacity());
    let (design, ids) = design![
        cells: [a => lut(4), b => lut(4), c => CellKind::Ff],
        nets: [n0: a -> [b], n1: b -> [c]]
    ];
    let mut state = singleton_state(&device, &design);
    state.set_position(state.unit_of(ids["a"]), 1.25, 2.5);
    state.set_position(state.unit_of(ids["b"]), 6.0, 3.75);
    state.set_position(state.unit_of(ids["c"]), 4.5, 7.0);
    state.set_net_enhance(state.nets()[1].net, 3.0);
    state.set_packed(state.unit_of(ids["a"]), true);

    let snapshot = state.snapshot();
    let positions: Vec<_> = state.units().iter().map(|u| u.position()).collect();
    let hpwl = state.total_hpwl();

    let json = snapshot.to_json().expect("serialize");
    let snapshot = PlacementSnapshot::from_json(&json).expect("parse");

    state.set_position(state.unit_of(ids["b"]), 0.0, 0.0);
    state.reset_net_enhance();
    state.restore(&snapshot).expect("restore");

    let restored: Vec<_> = state.units().iter().map(|u| u.position()).collect();
    assert_eq!(positions, restored);
    assert_eq!(state.total_hpwl(), hpwl);
    // The packed flag is transient
    assert!(state.units().iter().all(|u| !u.packed));
}

#[test]
fn restore_rejects_foreign_snapshot() {
    let device = slice_device(4, 4, slice_capacity());
    let (design, _) = design![
        cells: [a => lut(4), b => lut(4)],
        nets: [n0: a -> [b]]
    ];
    let mut state = singleton_state(&device, &design);
    let mut snapshot = state.snapshot();
    snapshot.units.pop();

    let err = state.restore(&snapshot).unwrap_err();
    assert_eq!(
        err.downcast_ref::<PlacementError>(),
        Some(&PlacementError::SnapshotMismatch {
            expected: 2,
            found: 1
        })
    );
    assert_eq!(state.units().len(), 2);
}
