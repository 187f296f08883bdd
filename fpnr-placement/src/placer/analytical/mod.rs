//! Quadratic wirelength model and the strategies decomposing multi-pin nets into springs
use anyhow::{Context, Result};
use nalgebra::{DVector, Vector2};

use crate::config::AnalyticConfig;
use crate::core::{PlacementNet, PlacementState, UnitPin};
use crate::placement_unit::PuId;

mod bound2bound;
mod clique;
mod sparse;
mod threshold_crossover;

pub use bound2bound::Bound2Bound;
pub use clique::Clique;
pub use sparse::{conjugate_gradient, SparseMatrix};
pub use threshold_crossover::ThresholdCrossover;

#[cfg(test)]
mod test;

/// Problem statement for quadratic analytical placement along one axis. This is assuming the
/// weighted quadratic error,
///
/// $$
///  min_{x} (x^t A x + b x + c)
/// $$
///
/// We ignore $c$ because it does not move the minima, and find the minimum by solving
///
/// $$
///    A x = -b
/// $$
///
/// The matrix is kept as triplets until the solve, since every net only touches a handful of
/// entries.
pub struct AnalyticWirelengthProblem {
    size: usize,
    triplets: Vec<(usize, usize, f32)>,
    rhs: DVector<f32>,
}

impl AnalyticWirelengthProblem {
    /// Create a new problem instance of the given size
    pub fn new(size: usize) -> Self {
        Self {
            size,
            triplets: vec![],
            rhs: DVector::zeros(size),
        }
    }

    /// Adds a cost term between pins on 2 mobile units, offset by `oi` and `oj` from their
    /// anchors:
    ///
    /// $$
    ///    w_{ij} (x_i + o_i - x_j - o_j)^2
    /// $$
    ///
    /// contributing $w_{ij}$ to $A_{i,i}$ and $A_{j,j}$, $-w_{ij}$ to $A_{i,j}$ and $A_{j,i}$,
    /// and the offset difference to both sides of $b$.
    pub fn cell_mobile_mobile(&mut self, i: usize, oi: f32, j: usize, oj: f32, weight: f32) {
        self.triplets.push((i, i, weight));
        self.triplets.push((j, j, weight));
        self.triplets.push((i, j, -weight));
        self.triplets.push((j, i, -weight));
        self.rhs[i] += weight * (oj - oi);
        self.rhs[j] += weight * (oi - oj);
    }

    /// A connection from a fixed position (a pin on a locked unit, or an anchor) to a mobile
    /// unit:
    ///
    /// $$
    ///  w_{ij} (x_i + o_i - p)^2
    /// $$
    ///
    /// Because p is constant, this contributes $w_{ij}$ to $A_{i,i}$ and $w_{ij} (p - o_i)$ to
    /// $b_i$.
    pub fn cell_fixed_mobile(&mut self, mobile_index: usize, offset: f32, weight: f32, fixed_pos: f32) {
        self.triplets.push((mobile_index, mobile_index, weight));
        self.rhs[mobile_index] += weight * (fixed_pos - offset);
    }

    /// Solve the problem with conjugate gradient, starting from `guess`
    pub fn solve(self, guess: DVector<f32>, config: &AnalyticConfig) -> Result<DVector<f32>> {
        let matrix = SparseMatrix::from_triplets(self.size, self.triplets);
        let (solution, iterations) = conjugate_gradient(
            &matrix,
            &self.rhs,
            guess,
            config.solver_iterations,
            config.solver_tolerance,
        )?;
        log::debug!("Solved {} unknowns in {} iterations", self.size, iterations);
        Ok(solution)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Axis {
    X,
    Y,
}

impl Axis {
    pub fn of(self, v: Vector2<f32>) -> f32 {
        match self {
            Axis::X => v.x,
            Axis::Y => v.y,
        }
    }
}

/// Extra spring added on top of the netlist
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PseudoNet {
    /// Pull a unit toward a fixed location
    Anchor {
        unit: PuId,
        target: Vector2<f32>,
        weight: f32,
    },
    /// Pull the anchors of two units toward each other
    Pair { a: PuId, b: PuId, weight: f32 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum NetStrategy {
    /// All the units are fixed, nothing to do generally
    AllFixed,
    /// Connect all pins to all other pins in the net with plain quadratic springs
    CliqueModel,
    /// Connect the two extreme pins to each other and every inner pin to both extremes
    Bound2Bound,
}

/// Scale on the bound-to-bound weight, growing with net degree
pub fn b2b_degree_factor(pins: usize) -> f32 {
    match pins {
        0..=9 => 1.0,
        10..=19 => 1.2,
        20..=49 => 1.6,
        50..=99 => 1.8,
        100..=199 => 2.1,
        _ => 2.5,
    }
}

/// Adds springs for one axis, dispatching on which endpoints are mobile
struct AxisAssembly<'s, 'a> {
    state: &'s PlacementState<'a>,
    mobile_index: &'s [Option<usize>],
    axis: Axis,
    config: &'s AnalyticConfig,
    problem: AnalyticWirelengthProblem,
}

impl<'s, 'a> AxisAssembly<'s, 'a> {
    fn pin_pos(&self, pin: &UnitPin) -> f32 {
        self.axis.of(self.state.pin_position(pin))
    }

    /// Spring between two pins. Linearized springs use `weight / max(min_distance, |a - b|)`
    /// so the quadratic cost tracks HPWL at the current placement.
    fn connect(&mut self, a: &UnitPin, b: &UnitPin, weight: f32, linearize: bool) {
        if a.unit == b.unit {
            return;
        }
        let pa = self.pin_pos(a);
        let pb = self.pin_pos(b);
        let weight = if linearize {
            weight / (pa - pb).abs().max(self.config.min_distance)
        } else {
            weight
        }
        .max(self.config.min_weight);
        let oa = self.axis.of(a.offset);
        let ob = self.axis.of(b.offset);

        match (
            self.mobile_index[a.unit.index()],
            self.mobile_index[b.unit.index()],
        ) {
            (None, None) => {
                // Both units fixed, nothing to do
            }
            (None, Some(j)) => self.problem.cell_fixed_mobile(j, ob, weight, pa),
            (Some(i), None) => self.problem.cell_fixed_mobile(i, oa, weight, pb),
            (Some(i), Some(j)) => self.problem.cell_mobile_mobile(i, oa, j, ob, weight),
        }
    }

    fn add_net(&mut self, net: &PlacementNet, strategy: NetStrategy, weight: f32) {
        let pins = net.pins.len();
        match strategy {
            NetStrategy::AllFixed => {}
            NetStrategy::CliqueModel => {
                let weight = weight / (pins - 1) as f32;
                for (idx, a) in net.pins.iter().enumerate() {
                    for b in net.pins.iter().skip(idx + 1) {
                        self.connect(a, b, weight, false);
                    }
                }
            }
            NetStrategy::Bound2Bound => {
                let weight = 2.0 * weight / (pins - 1) as f32 * b2b_degree_factor(pins);
                let bounds = net.bounds();
                let (lo, mut hi) = match self.axis {
                    Axis::X => (bounds.left, bounds.right),
                    Axis::Y => (bounds.bottom, bounds.top),
                };
                if lo == hi {
                    // All pins coincide on this axis
                    hi = (lo + 1) % pins;
                }
                self.connect(&net.pins[lo], &net.pins[hi], weight, true);
                for (idx, pin) in net.pins.iter().enumerate() {
                    if idx == lo || idx == hi {
                        continue;
                    }
                    self.connect(pin, &net.pins[lo], weight, true);
                    self.connect(pin, &net.pins[hi], weight, true);
                }
            }
        }
    }

    fn add_pseudo_net(&mut self, pseudo: &PseudoNet) {
        match *pseudo {
            PseudoNet::Anchor {
                unit,
                target,
                weight,
            } => {
                let i = match self.mobile_index[unit.index()] {
                    Some(i) => i,
                    None => return,
                };
                let pos = self.axis.of(self.state.position(unit));
                let target = self.axis.of(target);
                let weight = (weight / (pos - target).abs().max(self.config.min_distance))
                    .max(self.config.min_weight);
                self.problem.cell_fixed_mobile(i, 0.0, weight, target);
            }
            PseudoNet::Pair { a, b, weight } => {
                let pin = |unit| UnitPin {
                    unit,
                    cell: self.state.unit(unit).members[0].cell,
                    offset: Vector2::zeros(),
                };
                let (a, b) = (pin(a), pin(b));
                self.connect(&a, &b, weight, true);
            }
        }
    }
}

/// Used by placers to determine how to decompose multi-pin nets.
pub trait DecompositionStrategy: Sync {
    /// Analyze a single wirelength net
    fn analyze(&self, net: &PlacementNet) -> NetStrategy;

    /// Assemble the per-axis systems from the current placement, solve both axes in parallel
    /// and move every mobile unit to its solution. With a `displacement_bound` no unit moves
    /// further than the bound along either axis.
    fn execute(
        &self,
        state: &mut PlacementState<'_>,
        pseudo_nets: &[PseudoNet],
        config: &AnalyticConfig,
        displacement_bound: Option<f32>,
    ) -> Result<()> {
        let _span = tracing::info_span!("analytical_strategy").entered();

        state.update_b2b();

        let mobile: Vec<PuId> = state.mobile_units().collect();
        if mobile.is_empty() {
            return Ok(());
        }
        let mut mobile_index = vec![None; state.units().len()];
        for (i, id) in mobile.iter().enumerate() {
            mobile_index[id.index()] = Some(i);
        }

        let assemble = |axis: Axis| {
            let mut assembly = AxisAssembly {
                state: &*state,
                mobile_index: &mobile_index,
                axis,
                config,
                problem: AnalyticWirelengthProblem::new(mobile.len()),
            };
            let axis_scale = match axis {
                Axis::X => 1.0,
                Axis::Y => state.y2x_ratio(),
            };
            for net in state.nets().iter().filter(|n| n.is_wirelength_net()) {
                let strategy = if net.moveable_pins == 0 {
                    NetStrategy::AllFixed
                } else {
                    self.analyze(net)
                };
                assembly.add_net(net, strategy, state.net_weight(net) * axis_scale);
            }
            for pseudo in pseudo_nets {
                assembly.add_pseudo_net(pseudo);
            }
            // Weak anchor at the current position keeps the system positive definite
            for (i, id) in mobile.iter().enumerate() {
                let pos = axis.of(state.position(*id));
                assembly
                    .problem
                    .cell_fixed_mobile(i, 0.0, config.min_weight, pos);
            }
            let guess = DVector::from_iterator(
                mobile.len(),
                mobile.iter().map(|id| axis.of(state.position(*id))),
            );
            (assembly.problem, guess)
        };

        let (x_problem, x_guess) =
            tracing::info_span!("assemble_x").in_scope(|| assemble(Axis::X));
        let (y_problem, y_guess) =
            tracing::info_span!("assemble_y").in_scope(|| assemble(Axis::Y));

        let (x, y) = rayon::join(
            || {
                tracing::info_span!("solve_x")
                    .in_scope(|| x_problem.solve(x_guess, config).context("Solve x axis"))
            },
            || {
                tracing::info_span!("solve_y")
                    .in_scope(|| y_problem.solve(y_guess, config).context("Solve y axis"))
            },
        );
        let (x, y) = (x?, y?);

        tracing::info_span!("writeback").in_scope(|| {
            let limit = |old: f32, new: f32| match displacement_bound {
                Some(bound) => new.max(old - bound).min(old + bound),
                None => new,
            };
            let moves: Vec<_> = mobile
                .iter()
                .enumerate()
                .map(|(i, id)| {
                    let old = state.position(*id);
                    (*id, limit(old.x, x[i]), limit(old.y, y[i]))
                })
                .collect();
            state.move_units(moves);
        });

        Ok(())
    }
}
