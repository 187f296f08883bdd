use fpnr_common::{
    design::{CellKind, Design},
    device::{Device, Site, SiteKind},
    CellId, Resources, SiteId,
};
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};

/// Index of a placement unit inside [`crate::core::PlacementState`]
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PuId(pub u32);

impl PuId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl From<usize> for PuId {
    fn from(idx: usize) -> Self {
        Self(idx as u32)
    }
}

/// Resource-type tag of a placement unit, deciding which sites may host it
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    Logic,
    Carry,
    Dsp,
    Bram,
    ClockBuffer,
    Io,
}

impl UnitKind {
    pub fn site_kind(self) -> SiteKind {
        match self {
            UnitKind::Logic | UnitKind::Carry => SiteKind::Slice,
            UnitKind::Dsp => SiteKind::Dsp,
            UnitKind::Bram => SiteKind::Bram,
            UnitKind::ClockBuffer => SiteKind::ClockBuffer,
            UnitKind::Io => SiteKind::Io,
        }
    }

    /// Derive the tag from the most constrained member
    fn from_cells<'a>(kinds: impl Iterator<Item = &'a CellKind>) -> Self {
        let mut kind = UnitKind::Logic;
        for cell in kinds {
            let candidate = match cell {
                CellKind::Carry => UnitKind::Carry,
                CellKind::Dsp => UnitKind::Dsp,
                CellKind::Bram => UnitKind::Bram,
                CellKind::ClockBuffer => UnitKind::ClockBuffer,
                CellKind::Io => UnitKind::Io,
                _ => continue,
            };
            if kind == UnitKind::Logic {
                kind = candidate;
            }
        }
        kind
    }
}

/// A cell inside a placement unit, placed `row` sites above the unit anchor
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitMember {
    pub cell: CellId,
    pub row: u32,
}

/// Placement unit representation for global placement: one or more cells moved as a rigid
/// body.
#[derive(Clone, Debug)]
pub struct PlacementUnit {
    /// Anchor position. Member `row` offsets are measured upward from here.
    pub x: f32,
    pub y: f32,
    pub kind: UnitKind,
    pub members: Vec<UnitMember>,
    /// Resource demand of each occupied row, indexed by row offset
    pub rows: Vec<Resources>,
    /// Whether the unit is locked in place (user constraint, or a legalized macro)
    pub pos_locked: bool,
    /// Transient flag set by the site packer. Not persisted by snapshots.
    pub packed: bool,
    pub site: Option<SiteId>,
}

impl PlacementUnit {
    /// Build a unit from its members. Positions start at the origin.
    pub fn new(design: &Design, members: Vec<UnitMember>) -> Self {
        let height = members.iter().map(|m| m.row + 1).max().unwrap_or(1) as usize;
        let mut rows = vec![Resources::default(); height];
        for member in members.iter() {
            rows[member.row as usize][design.cell(member.cell).kind.resource()] += 1;
        }
        Self {
            x: 0.0,
            y: 0.0,
            kind: UnitKind::from_cells(members.iter().map(|m| &design.cell(m.cell).kind)),
            members,
            rows,
            pos_locked: false,
            packed: false,
            site: None,
        }
    }

    pub fn singleton(design: &Design, cell: CellId) -> Self {
        Self::new(design, vec![UnitMember { cell, row: 0 }])
    }

    /// Number of vertically consecutive sites the unit spans
    pub fn height(&self) -> usize {
        self.rows.len()
    }

    /// Macros are legalized onto site columns during global placement
    pub fn is_macro(&self) -> bool {
        self.height() > 1 || matches!(self.kind, UnitKind::Carry | UnitKind::Dsp | UnitKind::Bram)
    }

    pub fn is_singleton(&self) -> bool {
        self.members.len() == 1
    }

    /// Total demand over all rows
    pub fn demand(&self) -> Resources {
        self.rows
            .iter()
            .fold(Resources::default(), |acc, r| acc + *r)
    }

    pub fn position(&self) -> Vector2<f32> {
        Vector2::new(self.x, self.y)
    }

    /// Site of the unit's kind containing its anchor position
    pub fn site_under<'d>(&self, device: &'d Device) -> Option<&'d Site> {
        if !(self.x >= 0.0 && self.y >= 0.0) {
            return None;
        }
        device.site_at(
            self.x.floor() as u32,
            self.y.floor() as u32,
            self.kind.site_kind(),
        )
    }

    /// Row offset of `cell` inside the unit
    pub fn row_of(&self, cell: CellId) -> Option<u32> {
        self.members.iter().find(|m| m.cell == cell).map(|m| m.row)
    }

    pub fn cells(&self) -> impl Iterator<Item = CellId> + '_ {
        self.members.iter().map(|m| m.cell)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use fpnr_common::{design::DesignBuilder, ResourceKind};

    #[test]
    fn carry_macro_rows() {
        let mut b = DesignBuilder::new();
        let c0 = b.add_cell("c0", CellKind::Carry).unwrap();
        let c1 = b.add_cell("c1", CellKind::Carry).unwrap();
        let l0 = b.add_cell("l0", CellKind::Lut { inputs: 4 }).unwrap();
        let design = b.build().unwrap();

        let unit = PlacementUnit::new(
            &design,
            vec![
                UnitMember { cell: c0, row: 0 },
                UnitMember { cell: l0, row: 0 },
                UnitMember { cell: c1, row: 1 },
            ],
        );

        assert_eq!(unit.kind, UnitKind::Carry);
        assert_eq!(unit.height(), 2);
        assert!(unit.is_macro());
        assert_eq!(unit.rows[0].get(ResourceKind::Lut), 1);
        assert_eq!(unit.rows[1].get(ResourceKind::Carry), 1);
        assert_eq!(unit.demand().get(ResourceKind::Carry), 2);
        assert_eq!(unit.row_of(c1), Some(1));
    }
}
