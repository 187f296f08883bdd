use std::collections::HashMap;

use fpnr_common::{
    design::{CellKind, DesignBuilder, PinRole},
    ResourceKind, Resources,
};

use super::*;
use crate::config::{GlobalPhase, PlacementSchedule};
use crate::error::PlacementError;
use crate::test::{lut, singleton_state, slice_capacity, slice_device};

fn global(iterations: usize) -> PlacementStep {
    PlacementStep::Global(GlobalPhase {
        iterations,
        decay: 1.0,
        displacement_bound: None,
        timing: false,
        macro_legalization: true,
    })
}

fn with_schedule(iterations: usize, steps: Vec<PlacementStep>) -> Config {
    let mut config = Config::with_iterations(iterations);
    config.schedule = Some(PlacementSchedule { steps });
    config
}

/// Two carries, each fed by four private LUTs, linked by one ordinary net
fn ten_cells() -> Design {
    let mut b = DesignBuilder::new();
    let mut carries = vec![];
    for chain in 0..2 {
        let carry = b.add_cell(&format!("carry{chain}"), CellKind::Carry).unwrap();
        for i in 0..4 {
            let l = b.add_cell(&format!("lut{chain}_{i}"), lut(4)).unwrap();
            let net = format!("in{chain}_{i}");
            b.connect(l, PinRole::Output, &net);
            b.connect(carry, PinRole::Input, &net);
        }
        carries.push(carry);
    }
    b.connect(carries[0], PinRole::Output, "link");
    b.connect(carries[1], PinRole::Input, "link");
    b.build().unwrap()
}

/// A chain of `count` LUTs
fn lut_chain(count: usize) -> Design {
    let mut b = DesignBuilder::new();
    let mut prev = None;
    for i in 0..count {
        let l = b.add_cell(&format!("l{i}"), lut(4)).unwrap();
        if let Some(p) = prev {
            let net = format!("n{i}");
            b.connect(p, PinRole::Output, &net);
            b.connect(l, PinRole::Input, &net);
        }
        prev = Some(l);
    }
    b.build().unwrap()
}

/// Resources claimed on every site by the units of `state`
fn site_usage(state: &PlacementState<'_>) -> HashMap<SiteId, Resources> {
    let device = state.device;
    let mut usage: HashMap<SiteId, Resources> = HashMap::new();
    for unit in state.units() {
        let anchor = match unit.site {
            Some(s) => device.site(s),
            None => continue,
        };
        for (row, demand) in unit.rows.iter().enumerate() {
            let site = device
                .site_at(anchor.x, anchor.y + row as u32, anchor.kind)
                .expect("row site exists");
            *usage.entry(site.id).or_default() += *demand;
        }
    }
    usage
}

#[test]
fn ten_cell_carry_design() {
    let _ = tracing_subscriber::fmt::try_init();

    let device = slice_device(4, 4, slice_capacity());
    let design = ten_cells();
    let mut config = with_schedule(
        10,
        vec![
            PlacementStep::GridBins {
                width: 2.0,
                height: 2.0,
            },
            global(10),
            PlacementStep::SitePack,
            PlacementStep::ClockCheck,
        ],
    );
    config.legalization.start_iteration = 2;

    let units = pack_initial(&design, &device);
    assert_eq!(units.len(), 2);
    let mut state = PlacementState::new(&device, &design, units, 1.0).expect("state");
    state.set_position(PuId(0), 0.5, 0.5);
    state.set_position(PuId(1), 3.5, 3.5);
    let before = state.total_hpwl();

    let report = run_schedule(&config, &mut state, &mut NullSink).expect("placement");

    assert!(report.unpacked.is_empty());
    let sites: Vec<_> = state.units().iter().map(|u| u.site).collect();
    assert!(sites.iter().all(Option::is_some));
    assert_ne!(sites[0], sites[1]);
    assert!(report.hpwl <= before, "{} > {}", report.hpwl, before);
    assert!(report.clock.expect("clock report").is_clean());
}

#[test]
fn unit_without_matching_site_ends_unpacked() {
    let _ = tracing_subscriber::fmt::try_init();

    let device = slice_device(4, 4, slice_capacity());
    let (design, ids) = design![
        cells: [a => lut(4), m => CellKind::Dsp, q => CellKind::Ff],
        nets: [n0: a -> [m], n1: m -> [q]],
        clocks: [clk: [q]]
    ];
    let config = Config::with_iterations(3);

    let (state, report) = place(&config, &device, &design, &mut NullSink).expect("placement");

    let dsp = state.unit_of(ids["m"]);
    assert_eq!(report.unpacked, vec![dsp]);
    let p = state.position(dsp);
    assert!(p.x.is_finite() && p.y.is_finite());
    assert!((0.0..=4.0).contains(&p.x) && (0.0..=4.0).contains(&p.y));
    assert!(state.unit(state.unit_of(ids["a"])).site.is_some());
}

#[test]
fn standard_schedule_respects_capacity() {
    let _ = tracing_subscriber::fmt::try_init();

    let capacity = Resources::single(ResourceKind::Lut, 4)
        .with(ResourceKind::Ff, 8)
        .with(ResourceKind::Carry, 1);
    let device = slice_device(4, 4, capacity);
    let design = lut_chain(30);
    let config = Config::with_iterations(6);

    let (state, report) = place(&config, &device, &design, &mut NullSink).expect("placement");

    assert!(report.unpacked.is_empty());
    assert!(site_usage(&state)
        .values()
        .all(|used| used.fits_within(&capacity)));
    approx_eq!(state.bin_overflow(), 0.0);
    assert_eq!(report.phases.len(), 5);
}

#[test]
fn spreading_leaves_no_bin_over_capacity() {
    let device = slice_device(4, 4, Resources::single(ResourceKind::Lut, 4));
    let design = lut_chain(30);
    let mut state = singleton_state(&device, &design);
    let config = with_schedule(
        2,
        vec![
            PlacementStep::CenterUnits,
            PlacementStep::GridBins {
                width: 2.0,
                height: 2.0,
            },
            global(2),
        ],
    );

    run_schedule(&config, &mut state, &mut NullSink).expect("placement");

    approx_eq!(state.bin_overflow(), 0.0);
}

#[test]
fn site_packing_is_stable_across_runs() {
    let device = slice_device(4, 4, slice_capacity());
    let design = lut_chain(12);
    let mut state = singleton_state(&device, &design);
    let first = with_schedule(
        3,
        vec![
            PlacementStep::CenterUnits,
            PlacementStep::GridBins {
                width: 2.0,
                height: 2.0,
            },
            global(3),
            PlacementStep::SitePack,
        ],
    );
    run_schedule(&first, &mut state, &mut NullSink).expect("first run");
    let sites: Vec<_> = state.units().iter().map(|u| u.site).collect();
    let hpwl = state.total_hpwl();

    let again = with_schedule(3, vec![PlacementStep::SitePack]);
    let report = run_schedule(&again, &mut state, &mut NullSink).expect("second run");

    assert_eq!(sites, state.units().iter().map(|u| u.site).collect::<Vec<_>>());
    assert_eq!(report.hpwl, hpwl);
}

#[test]
fn strict_clock_check_fails_the_run() {
    let device = slice_device(4, 4, slice_capacity());
    let mut b = DesignBuilder::new();
    let mut ffs = vec![];
    for i in 0..13 {
        let ff = b.add_cell(&format!("ff{i}"), CellKind::Ff).unwrap();
        b.connect(ff, PinRole::Clock, &format!("clk{i}"));
        ffs.push(ff);
    }
    let design = b.build().unwrap();
    let mut state = singleton_state(&device, &design);
    for ff in ffs.iter() {
        state.set_position(state.unit_of(*ff), 0.5, 0.5);
    }

    let mut config = with_schedule(1, vec![PlacementStep::ClockCheck]);
    let report = run_schedule(&config, &mut state, &mut NullSink).expect("lenient run");
    assert_eq!(report.clock.expect("clock report").violations.len(), 1);

    config.strict_clock_check = true;
    let err = run_schedule(&config, &mut state, &mut NullSink).unwrap_err();
    assert_eq!(
        err.downcast_ref::<PlacementError>(),
        Some(&PlacementError::ClockOverflow { violations: 1 })
    );
}

#[test]
fn progress_is_sampled() {
    let device = slice_device(4, 4, slice_capacity());
    let design = lut_chain(4);
    let mut state = singleton_state(&device, &design);
    let config = with_schedule(
        2,
        vec![
            PlacementStep::GridBins {
                width: 2.0,
                height: 2.0,
            },
            global(2),
            PlacementStep::Checkpoint,
        ],
    );
    let mut recorder = SampleRecorder::default();

    let report = run_schedule(&config, &mut state, &mut recorder).expect("placement");

    assert_eq!(recorder.samples.len(), 3);
    assert_eq!(report.samples.len(), 1);
    assert_eq!(report.samples[0].label, "checkpoint 2");
    assert_eq!(report.samples[0].positions.len(), state.units().len());
}
