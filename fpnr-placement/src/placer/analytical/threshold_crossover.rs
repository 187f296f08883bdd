use crate::core::PlacementNet;

use super::{DecompositionStrategy, NetStrategy};

/// Picks the `small` decomposition for nets below `threshold` pins and `large` for the rest
pub struct ThresholdCrossover<Small, Large> {
    threshold: usize,
    small: Small,
    large: Large,
}

impl<Small, Large> ThresholdCrossover<Small, Large> {
    pub fn new(threshold: usize, small: Small, large: Large) -> Self {
        Self {
            threshold,
            small,
            large,
        }
    }
}

impl<Small, Large> DecompositionStrategy for ThresholdCrossover<Small, Large>
where
    Small: DecompositionStrategy,
    Large: DecompositionStrategy,
{
    fn analyze(&self, net: &PlacementNet) -> NetStrategy {
        if net.pins.len() < self.threshold {
            return self.small.analyze(net);
        }
        self.large.analyze(net)
    }
}
