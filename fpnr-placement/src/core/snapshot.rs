use anyhow::{Context, Result};
use fpnr_common::SiteId;
use serde::{Deserialize, Serialize};

use super::PlacementState;
use crate::error::PlacementError;
use crate::placement_unit::{PlacementUnit, UnitMember};

/// Persisted state of one placement unit. The `packed` flag is not stored and is cleared
/// on restore.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UnitSnapshot {
    pub members: Vec<UnitMember>,
    pub x: f32,
    pub y: f32,
    pub pos_locked: bool,
    pub site: Option<SiteId>,
}

/// Checkpoint of the unit-level placement
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlacementSnapshot {
    pub units: Vec<UnitSnapshot>,
    /// Timing enhancement ratio of every design net
    pub net_enhance: Vec<f32>,
}

impl PlacementSnapshot {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("Serialize placement snapshot")
    }

    pub fn from_json(s: &str) -> Result<Self> {
        serde_json::from_str(s).context("Parse placement snapshot")
    }
}

impl<'a> PlacementState<'a> {
    pub fn snapshot(&self) -> PlacementSnapshot {
        PlacementSnapshot {
            units: self
                .units
                .iter()
                .map(|u| UnitSnapshot {
                    members: u.members.clone(),
                    x: u.x,
                    y: u.y,
                    pos_locked: u.pos_locked,
                    site: u.site,
                })
                .collect(),
            net_enhance: self.net_enhance.clone(),
        }
    }

    /// Replace the current units with the ones recorded in `snapshot`. The snapshot must cover
    /// exactly the cells of the design; otherwise the state is left untouched.
    pub fn restore(&mut self, snapshot: &PlacementSnapshot) -> Result<()> {
        let cell_count = self.design.cells().len();
        let covered: usize = snapshot.units.iter().map(|u| u.members.len()).sum();
        if covered != cell_count || snapshot.net_enhance.len() != self.design.nets().len() {
            return Err(PlacementError::SnapshotMismatch {
                expected: cell_count,
                found: covered,
            })
            .context("Restore placement snapshot");
        }

        let units = snapshot
            .units
            .iter()
            .map(|s| {
                let mut unit = PlacementUnit::new(self.design, s.members.clone());
                unit.x = s.x;
                unit.y = s.y;
                unit.pos_locked = s.pos_locked;
                unit.site = s.site;
                unit
            })
            .collect();

        self.replace_units(units)
            .context("Rebuild units from snapshot")?;
        self.net_enhance.copy_from_slice(&snapshot.net_enhance);
        self.invalidate();
        Ok(())
    }
}
