//! Global placement driver.
//!
//! Every iteration runs three modes in sequence: a quadratic wirelength solve (the lower bound
//! on HPWL), density spreading (the upper bound), and macro legalization. Pseudo nets carry
//! the spread and legalized positions back into the next solve, and their weight grows as
//! the two bounds converge.

use std::collections::{BTreeMap, VecDeque};

use anyhow::{Context, Result};
use fpnr_common::NetId;
use nalgebra::Vector2;
use serde::Serialize;

use crate::config::{Config, GlobalPhase};
use crate::core::PlacementState;
use crate::legalizer::{average_displacement, LegalTarget, Legalizer, TetrisLegalizer};
use crate::pipeline::ProgressSink;
use crate::placement_unit::{PuId, UnitKind};
use crate::timing::TimingAnalyzer;

use self::analytical::{Bound2Bound, Clique, DecompositionStrategy, PseudoNet, ThresholdCrossover};

pub mod analytical;
pub mod diffusion;

#[cfg(test)]
mod test;

/// Pseudo-net weight below which it grows at the fixed early rate
const EARLY_WEIGHT: f32 = 0.002;
/// Upper-bound HPWL samples kept to detect divergence
const HISTORY: usize = 5;

/// HPWL bounds of one global placement iteration
#[derive(Clone, Copy, Debug, Serialize)]
pub struct IterationStats {
    pub iteration: usize,
    /// HPWL after the quadratic solve
    pub lower_hpwl: f64,
    /// HPWL after spreading and legalization
    pub upper_hpwl: f64,
    pub progress: f32,
    pub pseudo_weight: f32,
    pub macro_displacement: f32,
}

/// Outcome of one schedule phase
#[derive(Clone, Debug, Default, Serialize)]
pub struct PhaseSummary {
    pub iterations: usize,
    pub hpwl: f64,
    pub progress: f32,
    /// Macros snapped to their sites during the phase
    pub macros_fixed: usize,
}

/// Carries the pseudo-net weights and convergence history across the phases of a schedule
pub struct GlobalPlacer<'c> {
    config: &'c Config,
    pseudo_weight: f32,
    macro_weight: f32,
    /// Legalization rounds so far, ramping the macro pull
    macro_rounds: f32,
    progress: f32,
    /// Global iteration counter, shared by all phases
    iteration: usize,
    min_hpwl: f64,
    history: VecDeque<f64>,
    macro_targets: Vec<LegalTarget>,
    /// Unit generation the macro targets were computed under
    targets_generation: u64,
}

impl<'c> GlobalPlacer<'c> {
    pub fn new(config: &'c Config) -> Self {
        Self {
            config,
            pseudo_weight: config.pseudo_nets.initial_weight,
            macro_weight: config.pseudo_nets.macro_legalization_weight,
            macro_rounds: 0.0,
            progress: 0.0,
            iteration: 0,
            min_hpwl: f64::INFINITY,
            history: VecDeque::with_capacity(HISTORY + 1),
            macro_targets: vec![],
            targets_generation: 0,
        }
    }

    /// Convergence estimate in `[0, 1)`, from the ratio of the HPWL bounds
    pub fn progress(&self) -> f32 {
        self.progress
    }

    pub fn pseudo_weight(&self) -> f32 {
        self.pseudo_weight
    }

    /// Run the iterations of one phase
    pub fn run_phase(
        &mut self,
        state: &mut PlacementState<'_>,
        phase: &GlobalPhase,
        timing: &TimingAnalyzer,
        sink: &mut dyn ProgressSink,
    ) -> Result<PhaseSummary> {
        let _span = tracing::info_span!("global_phase", iterations = phase.iterations).entered();

        self.pseudo_weight *= phase.decay;
        self.macro_weight *= phase.decay;
        self.macro_rounds *= phase.decay;

        let mut summary = PhaseSummary::default();
        for _ in 0..phase.iterations {
            let stats = self
                .iterate(state, phase, timing, &mut summary.macros_fixed)
                .with_context(|| format!("Global placement iteration {}", self.iteration))?;
            log::info!(
                "Iteration {}: HPWL {:.2} / {:.2}, progress {:.3}, pseudo net weight {:.4}",
                stats.iteration,
                stats.lower_hpwl,
                stats.upper_hpwl,
                stats.progress,
                stats.pseudo_weight
            );
            sink.observe(&format!("global {}", stats.iteration), state);
            summary.iterations += 1;
        }
        summary.hpwl = state.total_hpwl();
        summary.progress = self.progress;
        Ok(summary)
    }

    /// One solve / spread / legalize round
    fn iterate(
        &mut self,
        state: &mut PlacementState<'_>,
        phase: &GlobalPhase,
        timing: &TimingAnalyzer,
        macros_fixed: &mut usize,
    ) -> Result<IterationStats> {
        let _span = tracing::info_span!("global_iteration", iteration = self.iteration).entered();
        let config = self.config;

        if self.targets_generation != state.unit_generation() {
            self.macro_targets.clear();
        }

        let strategy = ThresholdCrossover::new(
            config.analytic.clique_threshold,
            Clique::new(),
            Bound2Bound::new(),
        );
        let pseudo_nets = self.pseudo_nets(state, phase.timing.then(|| timing));
        for _ in 0..config.analytic.solves_per_iteration.max(1) {
            strategy
                .execute(
                    state,
                    &pseudo_nets,
                    &config.analytic,
                    phase.displacement_bound,
                )
                .context("Quadratic solve")?;
        }
        let lower_hpwl = state.total_hpwl();

        diffusion::spread(state, &config.diffusion, self.progress);
        diffusion::resolve_overflow(state);

        let mut macro_displacement = 0.0;
        if phase.macro_legalization && self.iteration >= config.legalization.start_iteration {
            let (fixed, displacement) = self.legalize_macros(state);
            *macros_fixed += fixed;
            macro_displacement = displacement;
        }
        let upper_hpwl = state.total_hpwl();

        self.update_weight(lower_hpwl, upper_hpwl);
        let stats = IterationStats {
            iteration: self.iteration,
            lower_hpwl,
            upper_hpwl,
            progress: self.progress,
            pseudo_weight: self.pseudo_weight,
            macro_displacement,
        };
        self.iteration += 1;
        Ok(stats)
    }

    /// Springs steering the next solve: every mobile unit toward its current (spread)
    /// position, macros toward their legal targets, units evicted from an overfull clock
    /// region toward another region, and optionally the timing arcs of long paths.
    fn pseudo_nets(
        &self,
        state: &PlacementState<'_>,
        timing: Option<&TimingAnalyzer>,
    ) -> Vec<PseudoNet> {
        let nets_of = |id: PuId| state.unit_nets(id).len().max(1) as f32;

        let mut pseudo_nets: Vec<PseudoNet> = state
            .mobile_units()
            .map(|unit| PseudoNet::Anchor {
                unit,
                target: state.position(unit),
                weight: self.pseudo_weight * nets_of(unit),
            })
            .collect();

        let enhance = self.macro_rounds / self.config.pseudo_nets.macro_enhance_count.max(1) as f32;
        for target in self.macro_targets.iter() {
            let unit = state.unit(target.unit);
            if unit.pos_locked {
                continue;
            }
            let shape = match unit.kind {
                UnitKind::Carry => 5.0,
                UnitKind::Dsp | UnitKind::Bram => 1.0,
                _ => 3.0,
            };
            pseudo_nets.push(PseudoNet::Anchor {
                unit: target.unit,
                target: Vector2::new(target.x, target.y),
                weight: enhance * self.macro_weight * self.pseudo_weight * nets_of(target.unit)
                    / shape,
            });
        }

        let region_weight =
            (4.0 - self.progress) * self.pseudo_weight * self.config.pseudo_nets.clock_region_weight;
        pseudo_nets.extend(
            clock_region_targets(state)
                .into_iter()
                .map(|(unit, target)| PseudoNet::Anchor {
                    unit,
                    target,
                    weight: region_weight * nets_of(unit),
                }),
        );

        if let Some(timing) = timing {
            pseudo_nets.extend(timing.timing_pseudo_nets(state, self.progress));
        }
        pseudo_nets
    }

    /// Find legal sites for the mobile macros. Once their average displacement is below the
    /// snap threshold they are moved onto those sites and fixed; otherwise the targets feed
    /// the next solve. Returns the number of snapped macros and the average displacement.
    fn legalize_macros(&mut self, state: &mut PlacementState<'_>) -> (usize, f32) {
        let legalizer = TetrisLegalizer::new(self.config.legalization.window);
        let targets = legalizer.legalize(state);
        if targets.is_empty() {
            self.macro_targets.clear();
            return (0, 0.0);
        }
        self.macro_rounds += 1.0;

        let displacement = average_displacement(&targets);
        if displacement >= self.config.legalization.snap_threshold {
            log::debug!(
                "{} macros average {:.2} from their legal sites",
                targets.len(),
                displacement
            );
            self.macro_targets = targets;
            self.targets_generation = state.unit_generation();
            return (0, displacement);
        }

        for target in targets.iter() {
            state.fix_unit_at(target.unit, target.x, target.y);
            state.set_site(target.unit, Some(target.site));
        }
        log::info!(
            "Snapped {} macros to their sites, average displacement {:.2}",
            targets.len(),
            displacement
        );
        self.macro_targets.clear();
        (targets.len(), displacement)
    }

    /// Grow the pseudo-net weight as the HPWL bounds converge, backing off when the upper
    /// bound keeps rising.
    fn update_weight(&mut self, lower: f64, upper: f64) {
        let ratio = if upper > 0.0 {
            (lower / upper).min(0.999) as f32
        } else {
            0.999
        };
        self.progress = ratio.max(0.0).powf(0.6);

        if self.pseudo_weight < EARLY_WEIGHT {
            self.pseudo_weight *= 1.825;
        } else {
            self.pseudo_weight *= 1.5 * (1.0 - self.progress) + 1.01 * self.progress;
        }

        self.min_hpwl = self.min_hpwl.min(upper);
        self.history.push_back(upper);
        if self.history.len() > HISTORY {
            self.history.pop_front();
        }
        let n = self.history.len();
        if n >= 3
            && self.history[n - 1] > self.history[n - 2]
            && self.history[n - 2] > self.history[n - 3]
            && self.pseudo_weight > 0.03
            && self.progress < 0.95
        {
            log::debug!("Upper bound HPWL keeps rising, easing the pseudo nets");
            self.pseudo_weight *= 0.75;
            while self.history.len() > 1 {
                self.history.pop_front();
            }
        }
    }
}

/// Targets relieving overfull clock regions. In every region with a violation the clock
/// with the fewest cells there is evicted: its units head for the region where that clock
/// is most used, or the nearest other region.
fn clock_region_targets(state: &PlacementState<'_>) -> Vec<(PuId, Vector2<f32>)> {
    let report = state.collect_clock_usage();
    if report.is_clean() {
        return vec![];
    }
    let device = state.device;
    let regions = device.clock_regions();
    if regions.len() < 2 {
        return vec![];
    }

    // (region, clock) -> cell count and the units holding those cells
    let mut usage: BTreeMap<(usize, NetId), (usize, Vec<PuId>)> = BTreeMap::new();
    for id in state.unit_ids() {
        let unit = state.unit(id);
        for member in unit.members.iter() {
            let region = match device.clock_region_at(unit.x, unit.y + member.row as f32) {
                Some(r) => r,
                None => continue,
            };
            for clock in state.design.clock_nets(member.cell) {
                let entry = usage.entry((region, clock)).or_default();
                entry.0 += 1;
                if entry.1.last() != Some(&id) {
                    entry.1.push(id);
                }
            }
        }
    }

    let mut violated: Vec<usize> = report.violations.iter().map(|v| v.region).collect();
    violated.sort_unstable();
    violated.dedup();

    let mut targets = vec![];
    for region in violated {
        let elsewhere = |clock: NetId| {
            usage
                .iter()
                .filter(|((r, c), _)| *c == clock && *r != region)
                .map(|((r, _), (count, _))| (*r, *count))
                .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
        };
        let evicted = usage
            .iter()
            .filter(|((r, _), _)| *r == region)
            .min_by_key(|((_, clock), (count, _))| {
                let away = elsewhere(*clock).map_or(0, |(_, c)| c);
                (*count, std::cmp::Reverse(away), *clock)
            })
            .map(|((_, clock), (_, units))| (*clock, units));
        let (clock, units) = match evicted {
            Some(e) => e,
            None => continue,
        };

        let destination = match elsewhere(clock) {
            Some((r, _)) => r,
            None => {
                let (cx, cy) = regions[region].center();
                let here = Vector2::new(cx, cy);
                match regions
                    .iter()
                    .enumerate()
                    .filter(|(r, _)| *r != region)
                    .map(|(r, reg)| {
                        let (x, y) = reg.center();
                        (r, (Vector2::new(x, y) - here).norm())
                    })
                    .min_by(|a, b| a.1.total_cmp(&b.1))
                {
                    Some((r, _)) => r,
                    None => continue,
                }
            }
        };
        let (x, y) = regions[destination].center();
        log::debug!(
            "Evicting clock {:?} from region {} toward region {}",
            clock,
            region,
            destination
        );
        targets.extend(
            units
                .iter()
                .filter(|id| !state.unit(**id).pos_locked)
                .map(|id| (*id, Vector2::new(x, y))),
        );
    }
    targets
}
