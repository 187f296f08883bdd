use serde::{Deserialize, Serialize};

macro_rules! index_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[repr(transparent)]
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u32);

        impl $name {
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl From<usize> for $name {
            fn from(idx: usize) -> Self {
                Self(idx as u32)
            }
        }
    };
}

index_type!(
    /// Index of a cell in [`crate::design::Design`]
    CellId
);
index_type!(
    /// Index of a pin in [`crate::design::Design`]
    PinId
);
index_type!(
    /// Index of a net in [`crate::design::Design`]
    NetId
);
index_type!(
    /// Index of a site in [`crate::device::Device`]
    SiteId
);
