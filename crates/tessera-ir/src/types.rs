//! Value types and loop metadata.

/// The kind of a scalar value.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum ScalarKind {
    /// Signed integer.
    Int,
    /// Unsigned integer. One-bit unsigned doubles as boolean.
    UInt,
    /// IEEE float.
    Float,
    /// Opaque pointer-sized handle.
    Handle,
}

/// The type of an IR value: a scalar kind, a bit width, and a lane count.
///
/// `lanes == 1` is a scalar; anything wider is a short vector produced by
/// `Ramp` indexing or vectorized loads.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct DataType {
    pub kind: ScalarKind,
    pub bits: u8,
    pub lanes: u16,
}

impl DataType {
    pub const fn new(kind: ScalarKind, bits: u8, lanes: u16) -> Self {
        Self { kind, bits, lanes }
    }

    pub const fn int32() -> Self {
        Self::new(ScalarKind::Int, 32, 1)
    }

    pub const fn int64() -> Self {
        Self::new(ScalarKind::Int, 64, 1)
    }

    /// One-bit unsigned, the boolean type.
    pub const fn uint1() -> Self {
        Self::new(ScalarKind::UInt, 1, 1)
    }

    pub const fn uint64() -> Self {
        Self::new(ScalarKind::UInt, 64, 1)
    }

    pub const fn float32() -> Self {
        Self::new(ScalarKind::Float, 32, 1)
    }

    /// Opaque handle type (buffer variables, pointers).
    pub const fn handle() -> Self {
        Self::new(ScalarKind::Handle, 64, 1)
    }

    pub const fn is_scalar(self) -> bool {
        self.lanes == 1
    }

    pub const fn is_int(self) -> bool {
        matches!(self.kind, ScalarKind::Int | ScalarKind::UInt)
    }

    /// The same element type with a different lane count.
    pub const fn with_lanes(self, lanes: u16) -> Self {
        Self::new(self.kind, self.bits, lanes)
    }
}

/// Iteration style of a `For` statement.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum ForKind {
    Serial,
    Parallel,
    Vectorized,
    Unrolled,
}

/// Device placement of a loop.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum DeviceApi {
    None,
    Host,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_predicates() {
        assert!(DataType::int32().is_scalar());
        assert!(DataType::int32().is_int());
        assert!(DataType::uint64().is_int());
        assert!(!DataType::float32().is_int());
        assert!(!DataType::int32().with_lanes(4).is_scalar());
    }

    #[test]
    fn with_lanes_keeps_element_type() {
        let v = DataType::float32().with_lanes(8);
        assert_eq!(v.kind, ScalarKind::Float);
        assert_eq!(v.bits, 32);
        assert_eq!(v.lanes, 8);
    }
}
