use crate::core::PlacementNet;

use super::{DecompositionStrategy, NetStrategy};

/// A strategy that models every multipin net with the bound-to-bound model
pub struct Bound2Bound {}

impl Bound2Bound {
    pub fn new() -> Self {
        Self {}
    }
}

impl DecompositionStrategy for Bound2Bound {
    fn analyze(&self, net: &PlacementNet) -> NetStrategy {
        match net.moveable_pins {
            0 => NetStrategy::AllFixed,
            _ => NetStrategy::Bound2Bound,
        }
    }
}
