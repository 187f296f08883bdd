//! Timing graph levelization and the net weights and pseudo nets derived from it
use std::collections::{HashSet, VecDeque};
use std::sync::OnceLock;

use fpnr_common::{
    design::{Design, PinRole},
    device::Device,
    CellId,
};
use nalgebra::Vector2;
use serde::Serialize;

use crate::config::TimingConfig;
use crate::core::PlacementState;
use crate::placement_unit::PuId;
use crate::placer::analytical::PseudoNet;


/// Nets with this many pins or more never get timing pseudo nets
const PSEUDO_NET_MAX_PINS: usize = 500;
/// Nets with this many pins or more are never enhanced
const ENHANCE_MAX_PINS: usize = 1000;

/// Cell-level timing graph. Arcs run from the driver of every non-clock net to each of its
/// sinks. Registers start and end paths.
pub struct TimingGraph {
    fanout: Vec<Vec<usize>>,
    fanin: Vec<Vec<usize>>,
    is_register: Vec<bool>,
    /// Longest combinational depth reaching each node
    forward: Vec<u32>,
    /// Longest combinational depth leaving each node
    backward: Vec<u32>,
    long_threshold: u32,
    medium_threshold: u32,
}

impl TimingGraph {
    pub fn build(design: &Design, config: &TimingConfig) -> Self {
        let _span = tracing::info_span!("build_timing_graph").entered();

        let n = design.cells().len();
        let mut fanout = vec![Vec::new(); n];
        let mut fanin = vec![Vec::new(); n];
        for (idx, net) in design.nets().iter().enumerate() {
            if net.is_clock {
                continue;
            }
            let net_id = idx.into();
            let driver = match design.driver_cell(net_id) {
                Some(d) => d.index(),
                None => continue,
            };
            for (sink, role) in design.sink_cells(net_id) {
                if role == PinRole::Clock || sink.index() == driver {
                    continue;
                }
                fanout[driver].push(sink.index());
                fanin[sink.index()].push(driver);
            }
        }
        for arcs in fanout.iter_mut().chain(fanin.iter_mut()) {
            arcs.sort_unstable();
            arcs.dedup();
        }
        let is_register: Vec<bool> = design
            .cells()
            .iter()
            .map(|c| c.kind.is_register())
            .collect();

        let forward = levelize(&fanin, &fanout, &is_register);
        let backward = levelize(&fanout, &fanin, &is_register);

        let mut sorted = forward.clone();
        sorted.sort_unstable();
        let threshold = |ratio: f32| {
            if sorted.is_empty() {
                return 0;
            }
            let count = (ratio * sorted.len() as f32).ceil() as usize;
            sorted[count.clamp(1, sorted.len()) - 1]
        };
        let long_threshold = threshold(config.long_ratio);
        let medium_threshold = threshold(config.medium_ratio);

        log::info!(
            "Timing graph: {} nodes, long path threshold {}, medium path threshold {}",
            n,
            long_threshold,
            medium_threshold
        );

        Self {
            fanout,
            fanin,
            is_register,
            forward,
            backward,
            long_threshold,
            medium_threshold,
        }
    }

    pub fn len(&self) -> usize {
        self.is_register.len()
    }

    pub fn is_empty(&self) -> bool {
        self.is_register.is_empty()
    }

    pub fn forward_level(&self, cell: CellId) -> u32 {
        self.forward[cell.index()]
    }

    pub fn backward_level(&self, cell: CellId) -> u32 {
        self.backward[cell.index()]
    }

    /// Longest path through the node, counted in nodes
    pub fn path_length(&self, cell: CellId) -> u32 {
        let i = cell.index();
        if self.is_register[i] {
            self.forward[i].max(self.backward[i]) + 1
        } else {
            self.forward[i] + self.backward[i] + 1
        }
    }

    pub fn long_threshold(&self) -> u32 {
        self.long_threshold
    }

    pub fn medium_threshold(&self) -> u32 {
        self.medium_threshold
    }

    /// Depth remaining after a path reaches `i`. Paths end at registers.
    fn end_level(&self, i: usize) -> u32 {
        if self.is_register[i] {
            0
        } else {
            self.backward[i]
        }
    }

    /// Trace the deepest path leaving `start`
    fn trace(&self, start: usize) -> Vec<usize> {
        let mut path = vec![start];
        let mut seen = HashSet::from([start]);
        let mut cur = start;
        while let Some(next) = self.fanout[cur]
            .iter()
            .copied()
            .max_by_key(|w| (self.end_level(*w), std::cmp::Reverse(*w)))
        {
            if !seen.insert(next) {
                break;
            }
            path.push(next);
            if self.is_register[next] {
                break;
            }
            cur = next;
        }
        path
    }
}

/// Longest-path levels over `preds`, restarting at registers. Levels are capped at the node
/// count so combinational cycles terminate.
fn levelize(preds: &[Vec<usize>], succs: &[Vec<usize>], is_register: &[bool]) -> Vec<u32> {
    let n = preds.len();
    let cap = n as u32;
    let mut level = vec![0u32; n];
    let mut queued = vec![true; n];
    let mut queue: VecDeque<usize> = (0..n).collect();

    while let Some(v) = queue.pop_front() {
        queued[v] = false;
        let best = preds[v]
            .iter()
            .map(|p| if is_register[*p] { 1 } else { level[*p] + 1 })
            .max()
            .unwrap_or(0)
            .min(cap);
        if best <= level[v] {
            continue;
        }
        level[v] = best;
        if is_register[v] {
            continue;
        }
        for s in succs[v].iter() {
            if !queued[*s] {
                queued[*s] = true;
                queue.push_back(*s);
            }
        }
    }
    level
}

/// Column and row rank of every clock region, used to count region boundary crossings
fn region_coords(device: &Device) -> Vec<(i32, i32)> {
    let regions = device.clock_regions();
    let mut xs: Vec<u32> = regions.iter().map(|r| r.x0).collect();
    let mut ys: Vec<u32> = regions.iter().map(|r| r.y0).collect();
    xs.sort_unstable();
    xs.dedup();
    ys.sort_unstable();
    ys.dedup();
    let rank = |v: &[u32], x: u32| v.partition_point(|o| *o < x) as i32;
    regions
        .iter()
        .map(|r| (rank(&xs, r.x0), rank(&ys, r.y0)))
        .collect()
}

fn cell_position(state: &PlacementState<'_>, cell: CellId) -> Vector2<f32> {
    let unit = state.unit(state.unit_of(cell));
    let row = unit.row_of(cell).unwrap_or(0) as f32;
    unit.position() + Vector2::new(0.0, row)
}

/// Result of a static timing pass
#[derive(Clone, Debug, Default, Serialize)]
pub struct TimingReport {
    pub worst_delay: f32,
    /// Cell names along the slowest path, from its start
    pub critical_path: Vec<String>,
    pub max_path_length: u32,
    pub long_threshold: u32,
    pub medium_threshold: u32,
}

/// Drives net weights and pseudo nets from the timing graph, which is built on first use and
/// kept for the lifetime of the analyzer.
pub struct TimingAnalyzer {
    config: TimingConfig,
    graph: OnceLock<TimingGraph>,
}

impl TimingAnalyzer {
    pub fn new(config: TimingConfig) -> Self {
        Self {
            config,
            graph: OnceLock::new(),
        }
    }

    pub fn graph(&self, design: &Design) -> &TimingGraph {
        self.graph
            .get_or_init(|| TimingGraph::build(design, &self.config))
    }

    /// Raise the enhancement ratio of nets whose driver sits on a path of at least
    /// `level_threshold` nodes. Returns the number of nets touched.
    pub fn enhance_net_weights(&self, state: &mut PlacementState<'_>, level_threshold: u32) -> usize {
        let _span = tracing::info_span!("enhance_net_weights", level_threshold).entered();
        if level_threshold < 4 {
            log::debug!("Level threshold {} too small, skipping", level_threshold);
            return 0;
        }
        let graph = self.graph(state.design);
        let thr = level_threshold as f32;

        let updates: Vec<_> = state
            .nets()
            .iter()
            .filter(|n| n.is_wirelength_net() && n.pins.len() < ENHANCE_MAX_PINS)
            .filter_map(|net| {
                let driver = net.pins[net.driver?].cell;
                let len = graph.path_length(driver);
                if len < level_threshold {
                    return None;
                }
                let overflow = (len as f32 / thr).powf(1.75);
                let pins = net.pins.len();
                let enhance = if pins < 600 {
                    1.5 * (overflow + 0.0025 * pins as f32)
                } else {
                    1.5 * (overflow + 1.5)
                };
                Some((net.net, enhance))
            })
            .collect();

        for (net, enhance) in updates.iter() {
            let ratio = state.net_enhance(*net).max(*enhance);
            state.set_net_enhance(*net, ratio);
        }
        log::info!("Enhanced {} nets on paths of {}+ levels", updates.len(), level_threshold);
        updates.len()
    }

    pub fn reset_net_weights(&self, state: &mut PlacementState<'_>) {
        state.reset_net_enhance();
    }

    /// Pull the units of every long path toward the clock region holding most of them. With
    /// `pull = 1` units land inside the region, with `pull = 0` nothing moves. Returns the
    /// number of units moved.
    pub fn cluster_long_paths(&self, state: &mut PlacementState<'_>, pull: f32) -> usize {
        let _span = tracing::info_span!("cluster_long_paths", pull).entered();
        let device = state.device;
        if device.clock_regions().is_empty() || pull <= 0.0 {
            return 0;
        }
        let graph = self.graph(state.design);
        let long = graph.long_threshold.max(1);

        let mut pulled: HashSet<PuId> = HashSet::new();
        let mut moved = 0;
        let mut paths = 0;
        for start in 0..graph.len() {
            let is_start = graph.is_register[start] || graph.fanin[start].is_empty();
            if !is_start || graph.backward[start] + 1 < long {
                continue;
            }
            let path = graph.trace(start);

            let mut units: Vec<PuId> = path
                .iter()
                .map(|c| state.unit_of(CellId::from(*c)))
                .collect();
            units.sort_unstable();
            units.dedup();

            let mut votes = vec![0usize; device.clock_regions().len()];
            for unit in units.iter() {
                let pos = state.position(*unit);
                if let Some(r) = device.clock_region_at(pos.x, pos.y) {
                    votes[r] += 1;
                }
            }
            let region = match votes
                .iter()
                .enumerate()
                .filter(|(_, v)| **v > 0)
                .max_by_key(|(r, v)| (**v, std::cmp::Reverse(*r)))
            {
                Some((r, _)) => &device.clock_regions()[r],
                None => continue,
            };
            paths += 1;

            for unit in units {
                if state.unit(unit).pos_locked || !pulled.insert(unit) {
                    continue;
                }
                let pos = state.position(unit);
                let (tx, ty) = region.clamp(pos.x, pos.y, 0.5);
                let target = pos + (Vector2::new(tx, ty) - pos) * pull.min(1.0);
                if target != pos {
                    state.set_position(unit, target.x, target.y);
                    moved += 1;
                }
            }
        }
        log::info!("Clustered {} long paths, moving {} units", paths, moved);
        moved
    }

    /// Pseudo nets pulling the two ends of long timing arcs together when they sit further
    /// apart than the path depth allows
    pub fn timing_pseudo_nets(&self, state: &PlacementState<'_>, progress: f32) -> Vec<PseudoNet> {
        let _span = tracing::info_span!("timing_pseudo_nets").entered();
        let level_threshold = self.config.pseudo_net_level;
        if level_threshold < 4 {
            return vec![];
        }
        let graph = self.graph(state.design);
        let power = 0.5 + 0.2 * progress;
        let expected = self.config.expected_distance;
        let coords = region_coords(state.device);
        let region_of = |p: Vector2<f32>| {
            state
                .device
                .clock_region_at(p.x, p.y)
                .map(|r| coords[r])
        };

        let mut pseudo_nets = vec![];
        for net in state.nets().iter() {
            let pins = net.pins.len();
            if !net.is_wirelength_net() || pins >= PSEUDO_NET_MAX_PINS {
                continue;
            }
            let driver_idx = match net.driver {
                Some(d) => d,
                None => continue,
            };
            let driver = &net.pins[driver_idx];
            let d = driver.cell.index();
            let d_len = graph.path_length(driver.cell) as f32;
            if !graph.is_register[d] && d_len < level_threshold as f32 {
                continue;
            }
            let weight = 2.0 * (0.1 + 0.1 * progress) * state.net_weight(net)
                / ((pins - 1) as f32).sqrt();
            let d_pos = state.pin_position(driver);
            let d_region = region_of(d_pos);

            for (idx, sink) in net.pins.iter().enumerate() {
                if idx == driver_idx || sink.unit == driver.unit {
                    continue;
                }
                let s = sink.cell.index();
                let s_back = graph.end_level(s);
                let threshold = if graph.is_register[d] {
                    if s_back + 1 < level_threshold {
                        continue;
                    }
                    expected / (s_back + 1) as f32
                } else {
                    if s_back + 3 < graph.backward[d] {
                        continue;
                    }
                    let s_len = graph.path_length(sink.cell) as f32;
                    if graph.is_register[s] && graph.forward[d] as f32 >= 0.9 * d_len {
                        expected / (graph.forward[d] + 1) as f32
                    } else if s_len >= 0.9 * d_len {
                        expected / s_len
                    } else {
                        continue;
                    }
                };

                let s_pos = state.pin_position(sink);
                let mut distance = (d_pos - s_pos).abs().sum();
                if let (Some(a), Some(b)) = (d_region, region_of(s_pos)) {
                    let crossings = (a.0 - b.0).abs() + (a.1 - b.1).abs();
                    distance += crossings as f32 * self.config.region_crossing_distance;
                }
                if distance > threshold {
                    pseudo_nets.push(PseudoNet::Pair {
                        a: driver.unit,
                        b: sink.unit,
                        weight: weight * (distance / threshold).powf(power),
                    });
                }
            }
        }
        log::debug!("Generated {} timing pseudo nets", pseudo_nets.len());
        pseudo_nets
    }

    /// Static timing over the current placement. Arc delay grows with the Manhattan distance
    /// between driver and sink; every combinational cell adds the logic delay.
    pub fn analyze(&self, state: &PlacementState<'_>) -> TimingReport {
        let _span = tracing::info_span!("timing_analysis").entered();
        let graph = self.graph(state.design);
        let n = graph.len();
        if n == 0 {
            return TimingReport::default();
        }
        let positions: Vec<Vector2<f32>> = (0..n)
            .map(|c| cell_position(state, CellId::from(c)))
            .collect();

        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by_key(|v| graph.forward[*v]);

        let mut arrival = vec![0.0f32; n];
        let mut pred: Vec<Option<usize>> = vec![None; n];
        for v in order {
            let mut best = 0.0f32;
            for u in graph.fanin[v].iter() {
                let start = if graph.is_register[*u] { 0.0 } else { arrival[*u] };
                let d = (positions[*u] - positions[v]).abs();
                let a = start + d.x * self.config.x_delay + d.y * self.config.y_delay;
                if pred[v].is_none() || a > best {
                    best = a;
                    pred[v] = Some(*u);
                }
            }
            arrival[v] = if graph.is_register[v] {
                best
            } else {
                best + self.config.logic_delay
            };
        }

        let (worst, worst_delay) = arrival
            .iter()
            .copied()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |acc, (i, a)| if a > acc.1 { (i, a) } else { acc });

        let mut path = vec![worst];
        let mut cur = worst;
        while let Some(u) = pred[cur] {
            if path.len() > n || path.contains(&u) {
                break;
            }
            path.push(u);
            if graph.is_register[u] {
                break;
            }
            cur = u;
        }
        path.reverse();

        let design = state.design;
        let report = TimingReport {
            worst_delay,
            critical_path: path
                .into_iter()
                .map(|c| design.cell(CellId::from(c)).name.clone())
                .collect(),
            max_path_length: (0..n)
                .map(|c| graph.path_length(CellId::from(c)))
                .max()
                .unwrap_or(0),
            long_threshold: graph.long_threshold,
            medium_threshold: graph.medium_threshold,
        };
        log::info!(
            "Worst delay {:.3} over {} cells",
            report.worst_delay,
            report.critical_path.len()
        );
        report
    }
}
