//! Typed indices into the container's offset tables
//!
//! Index `0` of every table is reserved for "absent" and never dereferenced.

use serde::{Deserialize, Serialize};

macro_rules! table_index {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
        #[repr(transparent)]
        pub struct $name(pub u32);

        impl $name {
            /// The reserved "absent" index
            pub const ABSENT: Self = Self(0);

            /// Create a new index
            #[inline]
            pub const fn new(index: u32) -> Self {
                Self(index)
            }

            /// Get index value
            #[inline]
            pub const fn index(self) -> u32 {
                self.0
            }

            /// Check if this is the reserved absent index
            #[inline]
            pub const fn is_absent(self) -> bool {
                self.0 == 0
            }
        }

        impl From<u32> for $name {
            fn from(index: u32) -> Self {
                Self(index)
            }
        }
    };
}

table_index!(
    /// Index into the code object table
    CodeIndex
);
table_index!(
    /// Index into the constant construction record table
    ConstIndex
);
table_index!(
    /// Index into the string table
    StringIndex
);
table_index!(
    /// Index into the blob table
    BlobIndex
);
