use std::collections::{BTreeMap, HashSet};

use fpnr_common::{device::RegionHalf, NetId};
use serde::Serialize;

use super::PlacementState;

/// Part of a clock region whose slot budget was exceeded
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "scope")]
pub enum ClockScope {
    Region,
    HalfColumn { column: u32, half: RegionHalf },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ClockViolation {
    pub region: usize,
    pub scope: ClockScope,
    /// Distinct clock nets observed
    pub clocks: usize,
    pub budget: u32,
}

/// Result of a clock utilization check
#[derive(Clone, Debug, Default, Serialize)]
pub struct ClockReport {
    pub violations: Vec<ClockViolation>,
    /// Largest number of distinct clocks seen in any half-height column
    pub max_half_column_clocks: usize,
}

impl ClockReport {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}

impl<'a> PlacementState<'a> {
    /// Count distinct clock nets per clock region and per half-height region column, using
    /// the current position of every cell.
    pub(crate) fn collect_clock_usage(&self) -> ClockReport {
        let device = self.device;
        let design = self.design;

        let mut per_region: BTreeMap<usize, HashSet<NetId>> = BTreeMap::new();
        let mut per_half_column: BTreeMap<(usize, u32, RegionHalf), HashSet<NetId>> =
            BTreeMap::new();

        for unit in self.units.iter() {
            for member in unit.members.iter() {
                let x = unit.x;
                let y = unit.y + member.row as f32;
                let region_idx = match device.clock_region_at(x, y) {
                    Some(r) => r,
                    None => continue,
                };
                let region = &device.clock_regions()[region_idx];
                let column = x.floor().max(0.0) as u32;
                let half = region.half_of(y);

                for clock in design.clock_nets(member.cell) {
                    per_region.entry(region_idx).or_default().insert(clock);
                    per_half_column
                        .entry((region_idx, column, half))
                        .or_default()
                        .insert(clock);
                }
            }
        }

        let mut report = ClockReport::default();
        for (region_idx, clocks) in per_region {
            let budget = device.clock_regions()[region_idx].region_slots;
            if clocks.len() > budget as usize {
                report.violations.push(ClockViolation {
                    region: region_idx,
                    scope: ClockScope::Region,
                    clocks: clocks.len(),
                    budget,
                });
            }
        }
        for ((region_idx, column, half), clocks) in per_half_column {
            report.max_half_column_clocks = report.max_half_column_clocks.max(clocks.len());
            let budget = device.clock_regions()[region_idx].half_column_slots;
            if clocks.len() > budget as usize {
                report.violations.push(ClockViolation {
                    region: region_idx,
                    scope: ClockScope::HalfColumn { column, half },
                    clocks: clocks.len(),
                    budget,
                });
            }
        }
        report
    }
}
