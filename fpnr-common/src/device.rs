//! Physical device model: sites and clock regions

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{
    ModelError, ResourceKind, Resources, SiteId, CLOCK_SLOTS_PER_HALF_COLUMN,
    CLOCK_SLOTS_PER_REGION,
};

/// Kind of physical slot
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SiteKind {
    Slice,
    Dsp,
    Bram,
    ClockBuffer,
    Io,
}

/// A physical slot on the device. Sites are immutable device facts.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Site {
    #[serde(skip)]
    pub id: SiteId,
    pub kind: SiteKind,
    /// Column of the site
    pub x: u32,
    /// Row of the site
    pub y: u32,
    /// Declared capacity, per resource sub-type
    pub capacity: Resources,
    /// Maximum number of distinct flip-flop control sets among co-located elements
    #[serde(default)]
    pub max_control_sets: Option<u32>,
    /// Maximum number of distinct nets feeding co-located LUTs
    #[serde(default)]
    pub max_lut_inputs: Option<u32>,
}

impl Default for SiteId {
    fn default() -> Self {
        SiteId(0)
    }
}

impl Site {
    pub fn new(kind: SiteKind, x: u32, y: u32, capacity: Resources) -> Self {
        Self {
            id: SiteId(0),
            kind,
            x,
            y,
            capacity,
            max_control_sets: None,
            max_lut_inputs: None,
        }
    }

    /// Center of the site in placement coordinates
    pub fn center(&self) -> (f32, f32) {
        (self.x as f32 + 0.5, self.y as f32 + 0.5)
    }
}

/// Which half of a clock region a row falls in
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionHalf {
    Lower,
    Upper,
}

/// A rectangular zone of the device with a bounded number of clock-net slots. Spans columns
/// `x0..x1` and rows `y0..y1`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClockRegion {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
    #[serde(default = "default_half_column_slots")]
    pub half_column_slots: u32,
    #[serde(default = "default_region_slots")]
    pub region_slots: u32,
}

fn default_half_column_slots() -> u32 {
    CLOCK_SLOTS_PER_HALF_COLUMN
}

fn default_region_slots() -> u32 {
    CLOCK_SLOTS_PER_REGION
}

impl ClockRegion {
    pub fn new(x0: u32, y0: u32, x1: u32, y1: u32) -> Self {
        Self {
            x0,
            y0,
            x1,
            y1,
            half_column_slots: CLOCK_SLOTS_PER_HALF_COLUMN,
            region_slots: CLOCK_SLOTS_PER_REGION,
        }
    }

    pub fn contains(&self, x: f32, y: f32) -> bool {
        x >= self.x0 as f32 && x < self.x1 as f32 && y >= self.y0 as f32 && y < self.y1 as f32
    }

    pub fn half_of(&self, y: f32) -> RegionHalf {
        let mid = (self.y0 + self.y1) as f32 / 2.0;
        if y < mid {
            RegionHalf::Lower
        } else {
            RegionHalf::Upper
        }
    }

    pub fn center(&self) -> (f32, f32) {
        (
            (self.x0 + self.x1) as f32 / 2.0,
            (self.y0 + self.y1) as f32 / 2.0,
        )
    }

    /// Clamp a point into the region, leaving `margin` on each edge
    pub fn clamp(&self, x: f32, y: f32, margin: f32) -> (f32, f32) {
        let clamp = |v: f32, lo: u32, hi: u32| {
            let lo = lo as f32 + margin;
            let hi = (hi as f32 - margin).max(lo);
            v.max(lo).min(hi)
        };
        (clamp(x, self.x0, self.x1), clamp(y, self.y0, self.y1))
    }
}

#[derive(Deserialize)]
struct DeviceDescription {
    width: u32,
    height: u32,
    sites: Vec<Site>,
    #[serde(default)]
    clock_regions: Vec<ClockRegion>,
}

/// The device: extents, sites, and clock regions. Indices over site locations are built once at
/// construction.
#[derive(Clone, Debug, Deserialize)]
#[serde(try_from = "DeviceDescription")]
pub struct Device {
    pub width: u32,
    pub height: u32,
    sites: Vec<Site>,
    clock_regions: Vec<ClockRegion>,
    site_grid: HashMap<(u32, u32, SiteKind), SiteId>,
}

impl TryFrom<DeviceDescription> for Device {
    type Error = ModelError;

    fn try_from(d: DeviceDescription) -> Result<Self, ModelError> {
        Device::new(d.width, d.height, d.sites, d.clock_regions)
    }
}

impl Device {
    /// Build a device, assigning site ids in the given order.
    pub fn new(
        width: u32,
        height: u32,
        mut sites: Vec<Site>,
        clock_regions: Vec<ClockRegion>,
    ) -> Result<Self, ModelError> {
        let mut site_grid = HashMap::with_capacity(sites.len());
        for (idx, site) in sites.iter_mut().enumerate() {
            if site.x >= width || site.y >= height {
                return Err(ModelError::SiteOutOfBounds {
                    x: site.x,
                    y: site.y,
                });
            }
            site.id = SiteId::from(idx);
            if site_grid
                .insert((site.x, site.y, site.kind), site.id)
                .is_some()
            {
                return Err(ModelError::DuplicateName(format!(
                    "{:?} site at ({}, {})",
                    site.kind, site.x, site.y
                )));
            }
        }

        Ok(Self {
            width,
            height,
            sites,
            clock_regions,
            site_grid,
        })
    }

    /// A `width` x `height` grid where every location holds one site of `kind` with the given
    /// capacity, covered by a single clock region.
    pub fn uniform(width: u32, height: u32, kind: SiteKind, capacity: Resources) -> Self {
        let sites = (0..width)
            .flat_map(|x| (0..height).map(move |y| Site::new(kind, x, y, capacity)))
            .collect();
        // Locations are unique and in bounds by construction
        Self::new(
            width,
            height,
            sites,
            vec![ClockRegion::new(0, 0, width, height)],
        )
        .unwrap_or_else(|_| unreachable!())
    }

    pub fn sites(&self) -> &[Site] {
        &self.sites
    }

    pub fn site(&self, id: SiteId) -> &Site {
        &self.sites[id.index()]
    }

    pub fn site_at(&self, x: u32, y: u32, kind: SiteKind) -> Option<&Site> {
        self.site_grid
            .get(&(x, y, kind))
            .map(|id| &self.sites[id.index()])
    }

    pub fn sites_of_kind(&self, kind: SiteKind) -> impl Iterator<Item = &Site> + '_ {
        self.sites.iter().filter(move |s| s.kind == kind)
    }

    pub fn clock_regions(&self) -> &[ClockRegion] {
        &self.clock_regions
    }

    /// Index of the clock region containing the point, if any
    pub fn clock_region_at(&self, x: f32, y: f32) -> Option<usize> {
        self.clock_regions.iter().position(|r| r.contains(x, y))
    }

    pub fn center(&self) -> (f32, f32) {
        (self.width as f32 / 2.0, self.height as f32 / 2.0)
    }

    /// Total capacity of all sites, per resource sub-type
    pub fn total_capacity(&self) -> Resources {
        self.sites
            .iter()
            .fold(Resources::default(), |acc, s| acc + s.capacity)
    }

    /// Whether any site on the device offers `kind`
    pub fn offers(&self, kind: ResourceKind) -> bool {
        self.sites.iter().any(|s| s.capacity.get(kind) > 0)
    }
}
