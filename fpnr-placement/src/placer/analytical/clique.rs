use crate::core::PlacementNet;

use super::{DecompositionStrategy, NetStrategy};

/// A strategy that considers every multipin net a clique
pub struct Clique {}

impl Clique {
    /// Allocate a new clique strategy
    pub fn new() -> Self {
        Self {}
    }
}

impl DecompositionStrategy for Clique {
    fn analyze(&self, net: &PlacementNet) -> NetStrategy {
        match net.moveable_pins {
            0 => NetStrategy::AllFixed,
            _ => NetStrategy::CliqueModel,
        }
    }
}

#[cfg(test)]
mod test {
    use fpnr_common::design::{CellKind, DesignBuilder, PinRole};

    use super::Clique;
    use crate::config::AnalyticConfig;
    use crate::placer::analytical::DecompositionStrategy;
    use crate::test::{lut, singleton_state, slice_capacity, slice_device};

    #[test]
    fn simple_2fixed_1mobile() {
        let _ = tracing_subscriber::fmt::try_init();

        let device = slice_device(4, 4, slice_capacity());
        let mut b = DesignBuilder::new();
        let fixed_0 = b.add_cell("fixed_0", CellKind::Io).unwrap();
        let fixed_1 = b.add_cell("fixed_1", CellKind::Io).unwrap();
        let mobile_0 = b.add_cell("mobile_0", lut(2)).unwrap();
        b.fix(fixed_0, 0.0, 0.0);
        b.fix(fixed_1, 2.0, 2.0);
        b.connect(fixed_0, PinRole::Output, "a");
        b.connect(mobile_0, PinRole::Input, "a");
        b.connect(mobile_0, PinRole::Output, "b");
        b.connect(fixed_1, PinRole::Input, "b");
        let design = b.build().unwrap();

        let mut state = singleton_state(&device, &design);
        let mobile = state.unit_of(mobile_0);
        state.set_position(mobile, 0.5, 1.5);

        Clique::new()
            .execute(&mut state, &[], &AnalyticConfig::default(), None)
            .expect("Strategy success");

        approx_eq!(state.position(mobile).x, 1.0, 1e-3);
        approx_eq!(state.position(mobile).y, 1.0, 1e-3);
    }

    #[test]
    fn simple_2fixed_2mobile() {
        let _ = tracing_subscriber::fmt::try_init();

        let device = slice_device(4, 4, slice_capacity());
        let mut b = DesignBuilder::new();
        let fixed_0 = b.add_cell("fixed_0", CellKind::Io).unwrap();
        let fixed_1 = b.add_cell("fixed_1", CellKind::Io).unwrap();
        let mobile_0 = b.add_cell("mobile_0", lut(2)).unwrap();
        let mobile_1 = b.add_cell("mobile_1", lut(2)).unwrap();
        b.fix(fixed_0, 0.0, 0.0);
        b.fix(fixed_1, 3.0, 3.0);
        for (driver, sink, net) in [
            (fixed_0, mobile_0, "a"),
            (mobile_0, mobile_1, "b"),
            (mobile_1, fixed_1, "c"),
        ] {
            b.connect(driver, PinRole::Output, net);
            b.connect(sink, PinRole::Input, net);
        }
        let design = b.build().unwrap();

        let mut state = singleton_state(&device, &design);
        let (m0, m1) = (state.unit_of(mobile_0), state.unit_of(mobile_1));
        state.set_position(m0, 1.5, 1.5);
        state.set_position(m1, 1.5, 1.5);

        Clique::new()
            .execute(&mut state, &[], &AnalyticConfig::default(), None)
            .expect("Strategy success");

        approx_eq!(state.position(m0).x, 1.0, 1e-3);
        approx_eq!(state.position(m0).y, 1.0, 1e-3);
        approx_eq!(state.position(m1).x, 2.0, 1e-3);
        approx_eq!(state.position(m1).y, 2.0, 1e-3);
    }
}
