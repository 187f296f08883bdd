//! Runs a placement schedule from initial packing to site assignment.

use anyhow::{Context, Result};
use fpnr_common::{design::Design, device::Device, SiteId};
use serde::Serialize;

use crate::config::{Config, PlacementStep};
use crate::core::{ClockReport, PlacementSample, PlacementState, UtilizationReport};
use crate::packing::{pack_initial, pair_ff_ff, pair_lut_ff, PackingReport, SitePacker};
use crate::placement_unit::PuId;
use crate::placer::{GlobalPlacer, PhaseSummary};
use crate::timing::{TimingAnalyzer, TimingReport};

#[cfg(test)]
mod test;

/// Receives the placement after every global iteration and at every checkpoint
pub trait ProgressSink {
    fn observe(&mut self, label: &str, state: &PlacementState<'_>);
}

/// Ignores all progress
pub struct NullSink;

impl ProgressSink for NullSink {
    fn observe(&mut self, _label: &str, _state: &PlacementState<'_>) {}
}

/// Keeps a copy of every observed placement
#[derive(Default)]
pub struct SampleRecorder {
    pub samples: Vec<PlacementSample>,
}

impl ProgressSink for SampleRecorder {
    fn observe(&mut self, label: &str, state: &PlacementState<'_>) {
        self.samples.push(state.sample(label));
    }
}

/// Summary of a schedule run
#[derive(Clone, Debug, Default, Serialize)]
pub struct PlacementReport {
    /// Weighted HPWL at the end of the schedule
    pub hpwl: f64,
    /// Units left without a site by the last site packing pass
    pub unpacked: Vec<PuId>,
    /// Most recent clock utilization check
    pub clock: Option<ClockReport>,
    pub timing: TimingReport,
    /// Demand against device capacity at the end of the schedule
    pub utilization: UtilizationReport,
    pub phases: Vec<PhaseSummary>,
    pub packing: Option<PackingReport>,
    /// Samples taken at checkpoint steps
    pub samples: Vec<PlacementSample>,
}

/// Final location of one unit
#[derive(Clone, Debug, Serialize)]
pub struct PlacedUnit {
    pub cells: Vec<String>,
    pub x: f32,
    pub y: f32,
    pub site: Option<SiteId>,
    pub fixed: bool,
}

pub fn placed_units(state: &PlacementState<'_>) -> Vec<PlacedUnit> {
    state
        .units()
        .iter()
        .map(|u| PlacedUnit {
            cells: u
                .cells()
                .map(|c| state.design.cell(c).name.clone())
                .collect(),
            x: u.x,
            y: u.y,
            site: u.site,
            fixed: u.pos_locked,
        })
        .collect()
}

/// Pack the design into units and run the configured schedule over them
pub fn place<'a>(
    config: &Config,
    device: &'a Device,
    design: &'a Design,
    sink: &mut dyn ProgressSink,
) -> Result<(PlacementState<'a>, PlacementReport)> {
    let units = {
        let _span = tracing::info_span!("initial_packing").entered();
        pack_initial(design, device)
    };
    log::info!(
        "Packed {} cells into {} placement units",
        design.cells().len(),
        units.len()
    );
    let mut state = PlacementState::new(device, design, units, config.y2x_ratio)
        .context("Build placement state")?;
    let report = run_schedule(config, &mut state, sink)?;
    Ok((state, report))
}

/// Apply every step of the configured schedule to `state`
pub fn run_schedule(
    config: &Config,
    state: &mut PlacementState<'_>,
    sink: &mut dyn ProgressSink,
) -> Result<PlacementReport> {
    let _span = tracing::info_span!("placement").entered();

    let timing = TimingAnalyzer::new(config.timing.clone());
    let mut placer = GlobalPlacer::new(config);
    let mut report = PlacementReport::default();

    for (idx, step) in config.schedule().steps.iter().enumerate() {
        let _span = tracing::info_span!("step", idx).entered();
        log::debug!("Schedule step {}: {:?}", idx, step);

        match step {
            PlacementStep::CenterUnits => {
                let (x, y) = state.device.center();
                let moves: Vec<_> = state.mobile_units().map(|id| (id, x, y)).collect();
                state.move_units(moves);
            }
            PlacementStep::GridBins { width, height } => state.rebuild_bins(*width, *height),
            PlacementStep::Utilization { factor } => state.set_utilization_factor(*factor),
            PlacementStep::Global(phase) => {
                if state.bins().is_none() {
                    log::warn!("Global placement without grid bins, using 5x5 bins");
                    state.rebuild_bins(5.0, 5.0);
                }
                let summary = placer
                    .run_phase(state, phase, &timing, sink)
                    .with_context(|| format!("Global placement phase at step {}", idx))?;
                report.phases.push(summary);
            }
            PlacementStep::ClusterLongPaths { pull } => {
                let moved = timing.cluster_long_paths(state, *pull);
                log::info!("Pulled {} units on long paths into their clock region", moved);
            }
            PlacementStep::EnhanceNetWeights { level_threshold } => {
                let threshold = level_threshold
                    .unwrap_or_else(|| timing.graph(state.design).medium_threshold());
                let enhanced = timing.enhance_net_weights(state, threshold);
                log::info!("Enhanced {} nets at level threshold {}", enhanced, threshold);
            }
            PlacementStep::ResetNetWeights => timing.reset_net_weights(state),
            PlacementStep::IncrementalPack {
                lut_ff_distance,
                ff_ff_distance,
            } => {
                pair_lut_ff(state, *lut_ff_distance).context("Pair LUTs with flip-flops")?;
                pair_ff_ff(state, *ff_ff_distance).context("Pair flip-flops")?;
            }
            PlacementStep::ClockCheck => {
                let clock = state
                    .check_clock_utilization(config.strict_clock_check)
                    .context("Clock utilization check")?;
                log::info!(
                    "Clock check: {} violations, at most {} clocks per half column",
                    clock.violations.len(),
                    clock.max_half_column_clocks
                );
                report.clock = Some(clock);
            }
            PlacementStep::Checkpoint => {
                let label = format!("checkpoint {}", idx);
                sink.observe(&label, state);
                report.samples.push(state.sample(&label));
            }
            PlacementStep::SitePack => {
                let packer = SitePacker::new(config.site_packer.clone());
                let graph = timing.graph(state.design);
                let packing = packer.pack(state, Some(graph)).context("Site packing")?;
                report.unpacked = packing.unpacked.clone();
                report.packing = Some(packing);
            }
        }
    }

    report.hpwl = state.total_hpwl();
    report.timing = timing.analyze(state);
    report.utilization = state.utilization();
    log::info!(
        "Placement finished: HPWL {:.2}, {} unpacked units, worst delay {:.3}",
        report.hpwl,
        report.unpacked.len(),
        report.timing.worst_delay
    );
    Ok(report)
}
