use std::collections::BTreeMap;
use std::ops::{Add, AddAssign, Index, IndexMut, Sub};

use serde::{Deserialize, Serialize};

/// Resource sub-types a site can offer and a cell can consume.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Lut,
    Ff,
    Carry,
    Dsp,
    Bram,
    ClockBuffer,
    Io,
}

impl ResourceKind {
    pub const COUNT: usize = 7;

    pub const ALL: [ResourceKind; Self::COUNT] = [
        ResourceKind::Lut,
        ResourceKind::Ff,
        ResourceKind::Carry,
        ResourceKind::Dsp,
        ResourceKind::Bram,
        ResourceKind::ClockBuffer,
        ResourceKind::Io,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Per-resource counter. Serialized as a map from resource name to count, omitting zeros.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(
    from = "BTreeMap<ResourceKind, u32>",
    into = "BTreeMap<ResourceKind, u32>"
)]
pub struct Resources([u32; ResourceKind::COUNT]);

impl Resources {
    pub fn new() -> Self {
        Self::default()
    }

    /// `count` units of a single resource kind
    pub fn single(kind: ResourceKind, count: u32) -> Self {
        let mut r = Self::default();
        r[kind] = count;
        r
    }

    pub fn with(mut self, kind: ResourceKind, count: u32) -> Self {
        self[kind] = count;
        self
    }

    pub fn get(&self, kind: ResourceKind) -> u32 {
        self.0[kind.index()]
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|c| *c == 0)
    }

    pub fn total(&self) -> u32 {
        self.0.iter().sum()
    }

    /// True when every component of `self` is less than or equal to the same component of
    /// `capacity`.
    pub fn fits_within(&self, capacity: &Resources) -> bool {
        self.0.iter().zip(capacity.0.iter()).all(|(d, c)| d <= c)
    }

    pub fn saturating_sub(&self, other: &Resources) -> Resources {
        let mut out = *self;
        for (o, r) in out.0.iter_mut().zip(other.0.iter()) {
            *o = o.saturating_sub(*r);
        }
        out
    }

    /// Non-zero components
    pub fn iter(&self) -> impl Iterator<Item = (ResourceKind, u32)> + '_ {
        ResourceKind::ALL
            .iter()
            .map(move |k| (*k, self.get(*k)))
            .filter(|(_, c)| *c > 0)
    }

    pub fn as_f32(&self) -> [f32; ResourceKind::COUNT] {
        self.0.map(|c| c as f32)
    }
}

impl Index<ResourceKind> for Resources {
    type Output = u32;

    fn index(&self, kind: ResourceKind) -> &u32 {
        &self.0[kind.index()]
    }
}

impl IndexMut<ResourceKind> for Resources {
    fn index_mut(&mut self, kind: ResourceKind) -> &mut u32 {
        &mut self.0[kind.index()]
    }
}

impl Add for Resources {
    type Output = Resources;

    fn add(mut self, rhs: Resources) -> Resources {
        self += rhs;
        self
    }
}

impl AddAssign for Resources {
    fn add_assign(&mut self, rhs: Resources) {
        for (o, r) in self.0.iter_mut().zip(rhs.0.iter()) {
            *o += *r;
        }
    }
}

impl Sub for Resources {
    type Output = Resources;

    fn sub(self, rhs: Resources) -> Resources {
        self.saturating_sub(&rhs)
    }
}

impl From<BTreeMap<ResourceKind, u32>> for Resources {
    fn from(map: BTreeMap<ResourceKind, u32>) -> Self {
        let mut r = Resources::default();
        for (k, v) in map {
            r[k] = v;
        }
        r
    }
}

impl From<Resources> for BTreeMap<ResourceKind, u32> {
    fn from(r: Resources) -> Self {
        r.iter().collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fits_and_subtracts() {
        let cap = Resources::single(ResourceKind::Lut, 8).with(ResourceKind::Ff, 16);
        let demand = Resources::single(ResourceKind::Lut, 4).with(ResourceKind::Ff, 16);

        assert!(demand.fits_within(&cap));
        assert!(!cap.fits_within(&demand));

        let rest = cap - demand;
        assert_eq!(rest.get(ResourceKind::Lut), 4);
        assert_eq!(rest.get(ResourceKind::Ff), 0);
        assert!(Resources::single(ResourceKind::Carry, 1).iter().eq([(ResourceKind::Carry, 1)]));
    }

    #[test]
    fn json_map_form() {
        let r: Resources = serde_json::from_str(r#"{"lut": 8, "carry": 1}"#).expect("parse");
        assert_eq!(r.get(ResourceKind::Lut), 8);
        assert_eq!(r.get(ResourceKind::Carry), 1);
        assert_eq!(r.get(ResourceKind::Dsp), 0);

        let back = serde_json::to_string(&r).expect("serialize");
        assert_eq!(back, r#"{"lut":8,"carry":1}"#);
    }
}
