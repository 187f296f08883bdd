use fpnr_common::SiteId;
use serde::Serialize;

use crate::core::PlacementState;
use crate::placement_unit::PuId;

pub mod tetris;

pub use tetris::TetrisLegalizer;

/// Legal anchor found for a macro
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct LegalTarget {
    pub unit: PuId,
    /// Site holding row 0 of the macro
    pub site: SiteId,
    /// Center of the anchor site
    pub x: f32,
    pub y: f32,
    /// Manhattan distance from the current position to the target
    pub displacement: f32,
}

/// Abstract interface over legalizers. Finds legal sites for the macros of a placement without
/// moving anything.
pub trait Legalizer {
    /// Legalize the mobile macros of `state`
    fn legalize(&self, state: &PlacementState<'_>) -> Vec<LegalTarget>;
}

/// Mean displacement of a set of targets, zero when empty
pub fn average_displacement(targets: &[LegalTarget]) -> f32 {
    if targets.is_empty() {
        return 0.0;
    }
    targets.iter().map(|t| t.displacement).sum::<f32>() / targets.len() as f32
}
