//! Logical design model: cells, pins and nets

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{device::SiteKind, CellId, ModelError, NetId, PinId, ResourceKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum CellKind {
    Lut { inputs: u8 },
    Ff,
    Carry,
    Mux,
    LutRam,
    Dsp,
    Bram,
    ClockBuffer,
    Io,
}

impl CellKind {
    /// Sequential elements start and end timing paths
    pub fn is_register(&self) -> bool {
        matches!(
            self,
            CellKind::Ff | CellKind::LutRam | CellKind::Dsp | CellKind::Bram | CellKind::Io
        )
    }

    pub fn is_lut(&self) -> bool {
        matches!(self, CellKind::Lut { .. })
    }

    /// The resource sub-type consumed by one instance of this cell
    pub fn resource(&self) -> ResourceKind {
        match self {
            CellKind::Lut { .. } | CellKind::Mux | CellKind::LutRam => ResourceKind::Lut,
            CellKind::Ff => ResourceKind::Ff,
            CellKind::Carry => ResourceKind::Carry,
            CellKind::Dsp => ResourceKind::Dsp,
            CellKind::Bram => ResourceKind::Bram,
            CellKind::ClockBuffer => ResourceKind::ClockBuffer,
            CellKind::Io => ResourceKind::Io,
        }
    }

    pub fn site_kind(&self) -> SiteKind {
        match self {
            CellKind::Lut { .. }
            | CellKind::Ff
            | CellKind::Carry
            | CellKind::Mux
            | CellKind::LutRam => SiteKind::Slice,
            CellKind::Dsp => SiteKind::Dsp,
            CellKind::Bram => SiteKind::Bram,
            CellKind::ClockBuffer => SiteKind::ClockBuffer,
            CellKind::Io => SiteKind::Io,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PinRole {
    Input,
    Output,
    Clock,
    Reset,
    Enable,
    CarryIn,
    CarryOut,
    CascadeIn,
    CascadeOut,
}

impl PinRole {
    pub fn is_driver(&self) -> bool {
        matches!(self, PinRole::Output | PinRole::CarryOut | PinRole::CascadeOut)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Pin {
    pub cell: CellId,
    pub role: PinRole,
    pub net: Option<NetId>,
    /// Offset of the pin relative to the cell origin
    pub offset: (f32, f32),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Net {
    pub name: String,
    pub driver: Option<PinId>,
    pub sinks: Vec<PinId>,
    pub is_clock: bool,
    /// Base net weight used by the wirelength objective
    pub weight: f32,
}

impl Net {
    /// Driver followed by sinks
    pub fn pins(&self) -> impl Iterator<Item = PinId> + '_ {
        self.driver.iter().copied().chain(self.sinks.iter().copied())
    }

    pub fn pin_count(&self) -> usize {
        self.sinks.len() + self.driver.is_some() as usize
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Cell {
    pub name: String,
    pub kind: CellKind,
    pub pins: Vec<PinId>,
    /// User-declared fixed location
    pub fixed: Option<(f32, f32)>,
}

/// Flip-flops may only share a site slot group when their clock, reset and enable nets match.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ControlSet {
    pub clock: Option<NetId>,
    pub reset: Option<NetId>,
    pub enable: Option<NetId>,
}

#[derive(Deserialize)]
struct PinDescription {
    role: PinRole,
    net: String,
    #[serde(default)]
    offset: (f32, f32),
}

#[derive(Deserialize)]
struct CellDescription {
    name: String,
    kind: CellKind,
    #[serde(default)]
    fixed: Option<(f32, f32)>,
    pins: Vec<PinDescription>,
}

#[derive(Deserialize)]
struct DesignDescription {
    cells: Vec<CellDescription>,
    /// Names of nets to be treated as clocks, in addition to any net reaching a clock pin
    #[serde(default)]
    clocks: Vec<String>,
    /// Per-net weight overrides
    #[serde(default)]
    net_weights: HashMap<String, f32>,
}

impl TryFrom<DesignDescription> for Design {
    type Error = ModelError;

    fn try_from(d: DesignDescription) -> Result<Self, ModelError> {
        let mut builder = DesignBuilder::new();
        for cell in d.cells {
            let id = builder.add_cell(&cell.name, cell.kind)?;
            if let Some((x, y)) = cell.fixed {
                builder.fix(id, x, y);
            }
            for pin in cell.pins {
                builder.connect_with_offset(id, pin.role, &pin.net, pin.offset);
            }
        }
        for clock in d.clocks {
            builder.mark_clock(&clock);
        }
        for (net, weight) in d.net_weights {
            builder.set_weight(&net, weight);
        }
        builder.build()
    }
}

/// The logical netlist
#[derive(Clone, Debug, Deserialize)]
#[serde(try_from = "DesignDescription")]
pub struct Design {
    cells: Vec<Cell>,
    pins: Vec<Pin>,
    nets: Vec<Net>,
}

impl Design {
    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn nets(&self) -> &[Net] {
        &self.nets
    }

    pub fn cell(&self, id: CellId) -> &Cell {
        &self.cells[id.index()]
    }

    pub fn pin(&self, id: PinId) -> &Pin {
        &self.pins[id.index()]
    }

    pub fn net(&self, id: NetId) -> &Net {
        &self.nets[id.index()]
    }

    pub fn cell_ids(&self) -> impl Iterator<Item = CellId> {
        (0..self.cells.len()).map(CellId::from)
    }

    /// Net attached to the first pin of `cell` with the given role
    pub fn pin_net(&self, cell: CellId, role: PinRole) -> Option<NetId> {
        self.cell(cell)
            .pins
            .iter()
            .map(|p| self.pin(*p))
            .find(|p| p.role == role)
            .and_then(|p| p.net)
    }

    /// Nets driven by any output-like pin of `cell`
    pub fn driven_nets(&self, cell: CellId) -> impl Iterator<Item = NetId> + '_ {
        self.cell(cell)
            .pins
            .iter()
            .map(|p| self.pin(*p))
            .filter(|p| p.role.is_driver())
            .filter_map(|p| p.net)
    }

    /// Nets on the data inputs of `cell`
    pub fn input_nets(&self, cell: CellId) -> impl Iterator<Item = NetId> + '_ {
        self.cell(cell)
            .pins
            .iter()
            .map(|p| self.pin(*p))
            .filter(|p| p.role == PinRole::Input)
            .filter_map(|p| p.net)
    }

    /// Clock nets reaching `cell`
    pub fn clock_nets(&self, cell: CellId) -> impl Iterator<Item = NetId> + '_ {
        self.cell(cell)
            .pins
            .iter()
            .map(|p| self.pin(*p))
            .filter(|p| !p.role.is_driver())
            .filter_map(|p| p.net)
            .filter(|n| self.net(*n).is_clock)
    }

    /// Cells receiving `net` through a sink pin
    pub fn sink_cells(&self, net: NetId) -> impl Iterator<Item = (CellId, PinRole)> + '_ {
        self.net(net).sinks.iter().map(|p| {
            let pin = self.pin(*p);
            (pin.cell, pin.role)
        })
    }

    pub fn driver_cell(&self, net: NetId) -> Option<CellId> {
        self.net(net).driver.map(|p| self.pin(p).cell)
    }

    /// Control set of a flip-flop, `None` for other cells
    pub fn control_set(&self, cell: CellId) -> Option<ControlSet> {
        if self.cell(cell).kind != CellKind::Ff {
            return None;
        }
        Some(ControlSet {
            clock: self.pin_net(cell, PinRole::Clock),
            reset: self.pin_net(cell, PinRole::Reset),
            enable: self.pin_net(cell, PinRole::Enable),
        })
    }
}

/// Incrementally constructs a [`Design`], resolving nets by name.
#[derive(Default)]
pub struct DesignBuilder {
    cells: Vec<Cell>,
    pins: Vec<Pin>,
    nets: Vec<Net>,
    cell_names: HashMap<String, CellId>,
    net_names: HashMap<String, NetId>,
    multiple_drivers: Vec<String>,
}

impl DesignBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_cell(&mut self, name: &str, kind: CellKind) -> Result<CellId, ModelError> {
        let id = CellId::from(self.cells.len());
        if self.cell_names.insert(name.to_owned(), id).is_some() {
            return Err(ModelError::DuplicateName(name.to_owned()));
        }
        self.cells.push(Cell {
            name: name.to_owned(),
            kind,
            pins: vec![],
            fixed: None,
        });
        Ok(id)
    }

    pub fn fix(&mut self, cell: CellId, x: f32, y: f32) {
        self.cells[cell.index()].fixed = Some((x, y));
    }

    pub fn connect(&mut self, cell: CellId, role: PinRole, net: &str) -> PinId {
        self.connect_with_offset(cell, role, net, (0.0, 0.0))
    }

    pub fn connect_with_offset(
        &mut self,
        cell: CellId,
        role: PinRole,
        net: &str,
        offset: (f32, f32),
    ) -> PinId {
        let net_id = self.net_id(net);
        let pin_id = PinId::from(self.pins.len());
        self.pins.push(Pin {
            cell,
            role,
            net: Some(net_id),
            offset,
        });
        self.cells[cell.index()].pins.push(pin_id);

        let net = &mut self.nets[net_id.index()];
        if role.is_driver() {
            if net.driver.is_some() {
                self.multiple_drivers.push(net.name.clone());
            }
            net.driver = Some(pin_id);
        } else {
            net.sinks.push(pin_id);
            if role == PinRole::Clock {
                net.is_clock = true;
            }
        }
        pin_id
    }

    pub fn mark_clock(&mut self, net: &str) {
        let id = self.net_id(net);
        self.nets[id.index()].is_clock = true;
    }

    pub fn set_weight(&mut self, net: &str, weight: f32) {
        let id = self.net_id(net);
        self.nets[id.index()].weight = weight;
    }

    fn net_id(&mut self, name: &str) -> NetId {
        if let Some(id) = self.net_names.get(name) {
            return *id;
        }
        let id = NetId::from(self.nets.len());
        self.nets.push(Net {
            name: name.to_owned(),
            driver: None,
            sinks: vec![],
            is_clock: false,
            weight: 1.0,
        });
        self.net_names.insert(name.to_owned(), id);
        id
    }

    pub fn build(self) -> Result<Design, ModelError> {
        if let Some(net) = self.multiple_drivers.into_iter().next() {
            return Err(ModelError::MultipleDrivers { net });
        }
        Ok(Design {
            cells: self.cells,
            pins: self.pins,
            nets: self.nets,
        })
    }
}
