//! Global registry for configuration of the various placement stages.
//!
//! Every field has a documented default except [`Config::global_iterations`], which must be
//! supplied by the caller. Missing required entries and out-of-range values are rejected by
//! [`Config::from_json`] before any placement work starts.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::PlacementError;
use crate::packing::site::SelectionPolicy;

/// Configuration of the quadratic wirelength solve
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyticConfig {
    /// Nets with fewer pins than this use the clique model, larger nets the bound-to-bound
    /// model.
    pub clique_threshold: usize,
    /// Floor on the pin distance used to linearize bound-to-bound springs
    pub min_distance: f32,
    /// Floor on any spring weight and on the diagonal of the system
    pub min_weight: f32,
    /// Maximum conjugate gradient iterations per solve
    pub solver_iterations: usize,
    /// Relative residual at which conjugate gradient stops
    pub solver_tolerance: f32,
    /// Number of quadratic solves per outer iteration
    pub solves_per_iteration: usize,
}

impl Default for AnalyticConfig {
    fn default() -> Self {
        Self {
            clique_threshold: 3,
            min_distance: 0.5,
            min_weight: 1e-4,
            solver_iterations: 100,
            solver_tolerance: 1e-4,
            solves_per_iteration: 2,
        }
    }
}

/// Configuration of the diffusion spreader
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffusionConfig {
    /// Total amount of internal timesteps for 1 diffusion step
    pub iteration_count: u32,
    /// How much virtual time we should elapse per internal timestep
    pub delta_t: f32,
    /// Target density when bins are coarser than [`DiffusionConfig::fine_bin_width`]
    pub coarse_supply_ratio: f32,
    /// Target density once bins are at or below [`DiffusionConfig::fine_bin_width`]
    pub fine_supply_ratio: f32,
    pub fine_bin_width: f32,
}

impl Default for DiffusionConfig {
    fn default() -> Self {
        Self {
            iteration_count: 16,
            delta_t: 0.2,
            coarse_supply_ratio: 0.8,
            fine_supply_ratio: 0.95,
            fine_bin_width: 2.5,
        }
    }
}

/// Pseudo-net weights steering the quadratic solve toward legality
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PseudoNetConfig {
    /// Starting weight of the net anchoring every movable unit to its previous position
    pub initial_weight: f32,
    /// Weight of the net pulling macros toward their legalized site
    pub macro_legalization_weight: f32,
    /// Number of iterations over which the macro pull ramps to full strength
    pub macro_enhance_count: u32,
    /// Weight multiplier for units pulled toward a clock region
    pub clock_region_weight: f32,
}

impl Default for PseudoNetConfig {
    fn default() -> Self {
        Self {
            initial_weight: 0.002,
            macro_legalization_weight: 1.0,
            macro_enhance_count: 20,
            clock_region_weight: 1.0,
        }
    }
}

/// Macro legalization
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LegalizationConfig {
    /// Columns searched on each side of a macro before widening to the whole device
    pub window: f32,
    /// Average displacement under which macros are snapped to their sites and fixed
    pub snap_threshold: f32,
    /// Global iteration at which macro legalization first runs
    pub start_iteration: usize,
}

impl Default for LegalizationConfig {
    fn default() -> Self {
        Self {
            window: 8.0,
            snap_threshold: 1.0,
            start_iteration: 8,
        }
    }
}

/// Timing analysis and net weighting
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Fraction of timing nodes at or below the long-path threshold level
    pub long_ratio: f32,
    /// Fraction of timing nodes at or below the medium-path threshold level
    pub medium_ratio: f32,
    /// Delay per column of horizontal displacement
    pub x_delay: f32,
    /// Delay per row of vertical displacement
    pub y_delay: f32,
    /// Intrinsic delay of a combinational cell
    pub logic_delay: f32,
    /// Extra distance charged for every clock-region boundary a timing arc crosses
    pub region_crossing_distance: f32,
    /// Expected driver-to-sink distance on the shortest critical paths
    pub expected_distance: f32,
    /// Minimum path length considered by the timing pseudo nets
    pub pseudo_net_level: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            long_ratio: 0.95,
            medium_ratio: 0.8,
            x_delay: 0.1,
            y_delay: 0.05,
            logic_delay: 0.1,
            region_crossing_distance: 10.0,
            expected_distance: 30.0,
            pseudo_net_level: 20,
        }
    }
}

/// Site-level packing
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SitePackerConfig {
    pub policy: SelectionPolicy,
    /// Candidate sites examined per unit before it is declared unpacked
    pub max_candidate_sites: usize,
    /// Number of column bands packed concurrently
    pub bands: usize,
    /// Weight of the wirelength term when scoring candidates
    pub wirelength_weight: f32,
    /// Weight of the criticality-scaled displacement term when scoring candidates
    pub timing_weight: f32,
}

impl Default for SitePackerConfig {
    fn default() -> Self {
        Self {
            policy: SelectionPolicy::FirstFit,
            max_candidate_sites: 64,
            bands: 4,
            wirelength_weight: 0.1,
            timing_weight: 1.0,
        }
    }
}

/// One global placement phase
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GlobalPhase {
    /// Number of outer iterations
    pub iterations: usize,
    /// Multiplier applied to the pseudo-net and macro legalization weights before the phase
    #[serde(default = "unit_decay")]
    pub decay: f32,
    /// Upper bound on how far a unit may move in one iteration
    #[serde(default)]
    pub displacement_bound: Option<f32>,
    /// Refresh timing pseudo nets every iteration
    #[serde(default)]
    pub timing: bool,
    #[serde(default = "enabled")]
    pub macro_legalization: bool,
}

fn unit_decay() -> f32 {
    1.0
}

fn enabled() -> bool {
    true
}

/// An individual step in the placement schedule
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum PlacementStep {
    /// Move every movable unit to the center of the device
    CenterUnits,
    /// Re-partition the grid bins
    GridBins { width: f32, height: f32 },
    /// Scale legal bin capacity
    Utilization { factor: f32 },
    /// Quadratic solve, spreading, and macro legalization iterations
    Global(GlobalPhase),
    /// Pull units on long paths into a single clock region
    ClusterLongPaths { pull: f32 },
    /// Boost the weight of nets on long paths. Uses the medium threshold when no level is given.
    EnhanceNetWeights {
        #[serde(default)]
        level_threshold: Option<u32>,
    },
    ResetNetWeights,
    /// Fuse nearby LUT/FF and FF/FF singletons
    IncrementalPack {
        lut_ff_distance: f32,
        ff_ff_distance: f32,
    },
    /// Report clock-region utilization
    ClockCheck,
    /// Record a progress sample
    Checkpoint,
    /// Assign every unit to a site
    SitePack,
}

/// Overall schedule for the placement strategy
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlacementSchedule {
    pub steps: Vec<PlacementStep>,
}

impl PlacementSchedule {
    /// The standard flow. `iterations` is split 1/3, 2/9, 2/9, 2/9 and 1/2 over the global
    /// phases. Bins shrink from 5x5 to 2x2 after the first phase. LUT-FF pairing follows the
    /// second; the pseudo-net weight decays once and displacement tightens to 3.0 then 2.0 for
    /// the timing-driven phases.
    pub fn standard(iterations: usize) -> Self {
        use PlacementStep::*;
        let phase = |num: usize, den: usize, decay: f32, bound: Option<f32>, timing: bool| {
            Global(GlobalPhase {
                iterations: (iterations * num / den).max(1),
                decay,
                displacement_bound: bound,
                timing,
                macro_legalization: true,
            })
        };

        Self {
            steps: vec![
                CenterUnits,
                GridBins {
                    width: 5.0,
                    height: 5.0,
                },
                ClusterLongPaths { pull: 0.5 },
                phase(1, 3, 1.0, None, false),
                GridBins {
                    width: 2.0,
                    height: 2.0,
                },
                Utilization { factor: 1.0 },
                phase(2, 9, 1.0, None, false),
                IncrementalPack {
                    lut_ff_distance: 16.0,
                    ff_ff_distance: 4.0,
                },
                EnhanceNetWeights {
                    level_threshold: Some(10),
                },
                phase(2, 9, 0.85, Some(3.0), true),
                phase(2, 9, 1.0, Some(2.0), true),
                ResetNetWeights,
                phase(1, 2, 1.0, Some(2.0), true),
                ClockCheck,
                SitePack,
                ClockCheck,
            ],
        }
    }
}

/// Overall placement configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Total global placement iteration budget distributed over the standard schedule
    pub global_iterations: usize,
    /// Weight of vertical extent relative to horizontal extent in HPWL
    #[serde(default = "default_y2x_ratio")]
    pub y2x_ratio: f32,
    /// Turn clock utilization violations into a hard failure
    #[serde(default)]
    pub strict_clock_check: bool,
    #[serde(default)]
    pub analytic: AnalyticConfig,
    #[serde(default)]
    pub diffusion: DiffusionConfig,
    #[serde(default)]
    pub pseudo_nets: PseudoNetConfig,
    #[serde(default)]
    pub legalization: LegalizationConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub site_packer: SitePackerConfig,
    /// Explicit schedule. When absent the standard schedule is derived from
    /// [`Config::global_iterations`].
    #[serde(default)]
    pub schedule: Option<PlacementSchedule>,
}

fn default_y2x_ratio() -> f32 {
    1.0
}

const REQUIRED_ENTRIES: &[&str] = &["global_iterations"];

impl Config {
    /// Configuration with every default, running `global_iterations` through the standard
    /// schedule.
    pub fn with_iterations(global_iterations: usize) -> Self {
        Self {
            global_iterations,
            y2x_ratio: default_y2x_ratio(),
            strict_clock_check: false,
            analytic: Default::default(),
            diffusion: Default::default(),
            pseudo_nets: Default::default(),
            legalization: Default::default(),
            timing: Default::default(),
            site_packer: Default::default(),
            schedule: None,
        }
    }

    /// Parse and validate a configuration document
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        let object = value.as_object().ok_or(PlacementError::InvalidConfig {
            name: "<root>",
            reason: "configuration must be a JSON object".into(),
        })?;
        for name in REQUIRED_ENTRIES {
            if !object.contains_key(*name) {
                return Err(PlacementError::MissingConfig(name).into());
            }
        }

        let config: Config =
            serde_json::from_value(value.clone()).context("Deserialize configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), PlacementError> {
        let invalid = |name, reason: &str| PlacementError::InvalidConfig {
            name,
            reason: reason.to_owned(),
        };

        if self.global_iterations == 0 {
            return Err(invalid("global_iterations", "must be at least 1"));
        }
        if !(self.y2x_ratio > 0.0) {
            return Err(invalid("y2x_ratio", "must be positive"));
        }
        if self.analytic.min_distance <= 0.0 || self.analytic.min_weight <= 0.0 {
            return Err(invalid("analytic", "distance and weight floors must be positive"));
        }
        if self.site_packer.max_candidate_sites == 0 {
            return Err(invalid("site_packer.max_candidate_sites", "must be at least 1"));
        }
        if self.site_packer.bands == 0 {
            return Err(invalid("site_packer.bands", "must be at least 1"));
        }

        for step in self.schedule().steps.iter() {
            match step {
                PlacementStep::GridBins { width, height } if *width <= 0.0 || *height <= 0.0 => {
                    return Err(invalid("schedule.grid_bins", "bin sizes must be positive"))
                }
                PlacementStep::Utilization { factor } if *factor <= 0.0 => {
                    return Err(invalid("schedule.utilization", "factor must be positive"))
                }
                PlacementStep::ClusterLongPaths { pull } if !(0.0..=1.0).contains(pull) => {
                    return Err(invalid("schedule.cluster_long_paths", "pull must be in [0, 1]"))
                }
                PlacementStep::Global(phase) if phase.decay <= 0.0 => {
                    return Err(invalid("schedule.global", "decay must be positive"))
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// The effective schedule
    pub fn schedule(&self) -> PlacementSchedule {
        self.schedule
            .clone()
            .unwrap_or_else(|| PlacementSchedule::standard(self.global_iterations))
    }
}
