use fpnr_common::design::{CellKind, Design, DesignBuilder, PinRole};
use fpnr_common::device::Device;
use nalgebra::Vector2;

use super::*;
use crate::test::{lut, singleton_state, slice_capacity, slice_device};

/// Two fixed pads at the origin and at (4, 4), both on one net with a single LUT
fn three_pin_design() -> Design {
    let mut b = DesignBuilder::new();
    let fixed_0 = b.add_cell("fixed_0", CellKind::Io).unwrap();
    let fixed_1 = b.add_cell("fixed_1", CellKind::Io).unwrap();
    let mobile = b.add_cell("mobile", lut(2)).unwrap();
    b.fix(fixed_0, 0.0, 0.0);
    b.fix(fixed_1, 4.0, 4.0);
    b.connect(mobile, PinRole::Output, "n");
    b.connect(fixed_0, PinRole::Input, "n");
    b.connect(fixed_1, PinRole::Input, "n");
    b.build().unwrap()
}

fn crossover() -> ThresholdCrossover<Clique, Bound2Bound> {
    ThresholdCrossover::new(3, Clique::new(), Bound2Bound::new())
}

#[test]
fn degree_factor_steps() {
    assert_eq!(b2b_degree_factor(2), 1.0);
    assert_eq!(b2b_degree_factor(10), 1.2);
    assert_eq!(b2b_degree_factor(49), 1.6);
    assert_eq!(b2b_degree_factor(50), 1.8);
    assert_eq!(b2b_degree_factor(199), 2.1);
    assert_eq!(b2b_degree_factor(1000), 2.5);
}

#[test]
fn crossover_dispatches_on_pin_count() {
    let device = slice_device(8, 8, slice_capacity());
    let (design, _) = design![
        cells: [a => lut(4), b => lut(4), c => lut(4)],
        nets: [small: a -> [b], large: b -> [a, c]]
    ];
    let state = singleton_state(&device, &design);
    let strategy = crossover();

    assert_eq!(strategy.analyze(&state.nets()[0]), NetStrategy::CliqueModel);
    assert_eq!(strategy.analyze(&state.nets()[1]), NetStrategy::Bound2Bound);
}

#[test]
fn b2b_pulls_outlier_inside_its_net() {
    let _ = tracing_subscriber::fmt::try_init();

    let device = slice_device(8, 8, slice_capacity());
    let design = three_pin_design();
    let mut state = singleton_state(&device, &design);
    let mobile = state.unit_ids().last().unwrap();
    state.set_position(mobile, 6.0, 6.0);

    crossover()
        .execute(&mut state, &[], &AnalyticConfig::default(), None)
        .expect("Strategy success");

    // Springs of weight 1/6 to the origin and 1/2 to (4, 4)
    let p = state.position(mobile);
    approx_eq!(p.x, 3.0, 1e-2);
    approx_eq!(p.y, 3.0, 1e-2);
}

#[test]
fn displacement_bound_limits_moves() {
    let device = slice_device(8, 8, slice_capacity());
    let design = three_pin_design();
    let mut state = singleton_state(&device, &design);
    let mobile = state.unit_ids().last().unwrap();
    state.set_position(mobile, 6.0, 6.0);

    crossover()
        .execute(&mut state, &[], &AnalyticConfig::default(), Some(1.0))
        .expect("Strategy success");

    let p = state.position(mobile);
    approx_eq!(p.x, 5.0, 1e-4);
    approx_eq!(p.y, 5.0, 1e-4);
}

#[test]
fn pseudo_net_pulls_toward_target() {
    let device: Device = slice_device(8, 8, slice_capacity());
    let (design, ids) = design![
        cells: [a => lut(4)],
        nets: []
    ];
    let mut state = singleton_state(&device, &design);
    let unit = state.unit_of(ids["a"]);
    state.set_position(unit, 1.0, 1.0);

    let pseudo = PseudoNet::Anchor {
        unit,
        target: Vector2::new(5.0, 3.0),
        weight: 1.0,
    };
    Bound2Bound::new()
        .execute(&mut state, &[pseudo], &AnalyticConfig::default(), None)
        .expect("Strategy success");

    let p = state.position(unit);
    approx_eq!(p.x, 5.0, 1e-2);
    approx_eq!(p.y, 3.0, 1e-2);
}

#[test]
fn fixed_units_are_not_unknowns() {
    let device = slice_device(8, 8, slice_capacity());
    let design = three_pin_design();
    let mut state = singleton_state(&device, &design);

    Clique::new()
        .execute(&mut state, &[], &AnalyticConfig::default(), None)
        .expect("Strategy success");

    assert_eq!(state.position(PuId(0)), Vector2::new(0.0, 0.0));
    assert_eq!(state.position(PuId(1)), Vector2::new(4.0, 4.0));
}

#[test]
fn pair_pseudo_net_pulls_units_together() {
    let device = slice_device(8, 8, slice_capacity());
    let (design, ids) = design![
        cells: [a => lut(4), b => lut(4)],
        nets: []
    ];
    let mut state = singleton_state(&device, &design);
    let (a, b) = (state.unit_of(ids["a"]), state.unit_of(ids["b"]));
    state.set_position(a, 1.0, 2.0);
    state.set_position(b, 5.0, 2.0);

    Bound2Bound::new()
        .execute(
            &mut state,
            &[PseudoNet::Pair { a, b, weight: 1.0 }],
            &AnalyticConfig::default(),
            None,
        )
        .expect("Strategy success");

    let gap = state.position(b).x - state.position(a).x;
    assert!(gap.abs() < 0.1, "gap {}", gap);
    approx_eq!(state.position(a).x + state.position(b).x, 6.0, 1e-2);
}
