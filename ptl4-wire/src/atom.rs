//! Atomic operators and datatypes carried in request headers.

use crate::WireError;

/// Atomic operator, a 5-bit header field.
///
/// [`Min`](AtomOp::Min) through [`Bxor`](AtomOp::Bxor) are the arithmetic
/// and bitwise operators applied element-wise by atomic and fetch-atomic
/// operations. [`Swap`](AtomOp::Swap) is a plain exchange of up to the
/// maximum atomic size. The remaining variants are conditional and masked
/// swaps over a single datum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum AtomOp {
    /// Minimum.
    Min = 0,
    /// Maximum.
    Max,
    /// Sum.
    Sum,
    /// Product.
    Prod,
    /// Logical or.
    Lor,
    /// Logical and.
    Land,
    /// Bitwise or.
    Bor,
    /// Bitwise and.
    Band,
    /// Logical xor.
    Lxor,
    /// Bitwise xor.
    Bxor,
    /// Unconditional swap.
    Swap,
    /// Compare (equal) and swap.
    Cswap,
    /// Compare (not equal) and swap.
    CswapNe,
    /// Compare (less or equal) and swap.
    CswapLe,
    /// Compare (less) and swap.
    CswapLt,
    /// Compare (greater or equal) and swap.
    CswapGe,
    /// Compare (greater) and swap.
    CswapGt,
    /// Masked swap.
    Mswap,
}

impl AtomOp {
    /// Whether this operator is applied element-wise over a payload
    /// (`Min..=Bxor`).
    pub fn is_arithmetic(self) -> bool {
        self <= AtomOp::Bxor
    }

    /// Whether this operator is one of the single-datum swap variants
    /// (`Cswap..=Mswap`).
    pub fn is_swap_variant(self) -> bool {
        self >= AtomOp::Cswap
    }
}

impl TryFrom<u8> for AtomOp {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        Ok(match value {
            0 => Self::Min,
            1 => Self::Max,
            2 => Self::Sum,
            3 => Self::Prod,
            4 => Self::Lor,
            5 => Self::Land,
            6 => Self::Bor,
            7 => Self::Band,
            8 => Self::Lxor,
            9 => Self::Bxor,
            10 => Self::Swap,
            11 => Self::Cswap,
            12 => Self::CswapNe,
            13 => Self::CswapLe,
            14 => Self::CswapLt,
            15 => Self::CswapGe,
            16 => Self::CswapGt,
            17 => Self::Mswap,
            v => {
                return Err(WireError::BadField {
                    field: "atom_op",
                    value: v as u32,
                });
            }
        })
    }
}

/// Atomic datatype, a 4-bit header field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AtomType {
    /// Signed 8-bit integer.
    Int8 = 0,
    /// Unsigned 8-bit integer.
    Uint8,
    /// Signed 16-bit integer.
    Int16,
    /// Unsigned 16-bit integer.
    Uint16,
    /// Signed 32-bit integer.
    Int32,
    /// Unsigned 32-bit integer.
    Uint32,
    /// Signed 64-bit integer.
    Int64,
    /// Unsigned 64-bit integer.
    Uint64,
    /// IEEE-754 single precision.
    Float,
    /// Pair of single-precision floats forming a complex number.
    FloatComplex,
    /// IEEE-754 double precision.
    Double,
    /// Pair of double-precision floats forming a complex number.
    DoubleComplex,
}

impl AtomType {
    /// Size of one datum of this type in bytes.
    pub fn size(self) -> usize {
        match self {
            Self::Int8 | Self::Uint8 => 1,
            Self::Int16 | Self::Uint16 => 2,
            Self::Int32 | Self::Uint32 | Self::Float => 4,
            Self::Int64 | Self::Uint64 | Self::Double | Self::FloatComplex => 8,
            Self::DoubleComplex => 16,
        }
    }

    /// Whether this type is one of the two complex variants.
    pub fn is_complex(self) -> bool {
        matches!(self, Self::FloatComplex | Self::DoubleComplex)
    }

    /// Whether this type is an integer type.
    pub fn is_integral(self) -> bool {
        !matches!(
            self,
            Self::Float | Self::FloatComplex | Self::Double | Self::DoubleComplex
        )
    }
}

impl TryFrom<u8> for AtomType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        Ok(match value {
            0 => Self::Int8,
            1 => Self::Uint8,
            2 => Self::Int16,
            3 => Self::Uint16,
            4 => Self::Int32,
            5 => Self::Uint32,
            6 => Self::Int64,
            7 => Self::Uint64,
            8 => Self::Float,
            9 => Self::FloatComplex,
            10 => Self::Double,
            11 => Self::DoubleComplex,
            v => {
                return Err(WireError::BadField {
                    field: "atom_type",
                    value: v as u32,
                });
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_classes() {
        assert!(AtomOp::Min.is_arithmetic());
        assert!(AtomOp::Bxor.is_arithmetic());
        assert!(!AtomOp::Swap.is_arithmetic());
        assert!(!AtomOp::Swap.is_swap_variant());
        assert!(AtomOp::Cswap.is_swap_variant());
        assert!(AtomOp::Mswap.is_swap_variant());
    }

    #[test]
    fn type_sizes() {
        assert_eq!(AtomType::Uint8.size(), 1);
        assert_eq!(AtomType::Uint32.size(), 4);
        assert_eq!(AtomType::FloatComplex.size(), 8);
        assert_eq!(AtomType::DoubleComplex.size(), 16);
    }

    #[test]
    fn roundtrip_raw() {
        for raw in 0..18u8 {
            assert_eq!(AtomOp::try_from(raw).unwrap() as u8, raw);
        }
        assert!(AtomOp::try_from(18).is_err());
        for raw in 0..12u8 {
            assert_eq!(AtomType::try_from(raw).unwrap() as u8, raw);
        }
        assert!(AtomType::try_from(12).is_err());
    }
}
