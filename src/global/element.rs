//! Element types storable in a distributed array.

use std::fmt::Debug;

use serde::{Deserialize, Serialize};

/// Runtime tag for the element type of an array.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementType {
    Int,
    Long,
    Float,
    Double,
    /// Plain-old-data record of the given byte size (e.g. memory descriptors).
    Opaque(usize),
}

impl ElementType {
    /// Size of one element in bytes.
    pub const fn size(self) -> usize {
        match self {
            ElementType::Int | ElementType::Float => 4,
            ElementType::Long | ElementType::Double => 8,
            ElementType::Opaque(n) => n,
        }
    }
}

/// A value that can live in remotely accessible memory and be viewed in
/// place. Alignment must not exceed 8 bytes.
pub trait Element: bytemuck::Pod + Debug + Send + Sync + 'static {
    const TYPE: ElementType;
}

impl Element for i32 {
    const TYPE: ElementType = ElementType::Int;
}

impl Element for i64 {
    const TYPE: ElementType = ElementType::Long;
}

impl Element for f32 {
    const TYPE: ElementType = ElementType::Float;
}

impl Element for f64 {
    const TYPE: ElementType = ElementType::Double;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_match_rust_types() {
        assert_eq!(<i32 as Element>::TYPE.size(), std::mem::size_of::<i32>());
        assert_eq!(<i64 as Element>::TYPE.size(), std::mem::size_of::<i64>());
        assert_eq!(<f32 as Element>::TYPE.size(), std::mem::size_of::<f32>());
        assert_eq!(<f64 as Element>::TYPE.size(), std::mem::size_of::<f64>());
        assert_eq!(ElementType::Opaque(24).size(), 24);
    }
}
