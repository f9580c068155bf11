//! The atomic engine.
//!
//! Arithmetic and bitwise operators are applied element-wise over the
//! payload; swap variants operate on a single datum. Values are interpreted
//! little-endian, matching the wire. Operator/datatype combinations the
//! interface does not define (relational compares on complex numbers,
//! bitwise ops on floats) are rejected and fail the request.

use ptl4_wire::{AtomOp, AtomType};

use crate::PtlError;

macro_rules! each_datum {
    ($t:ty, $dst:expr, $src:expr, $f:expr) => {{
        const S: usize = std::mem::size_of::<$t>();
        let n = $dst.len().min($src.len()) / S;
        for i in 0..n {
            let at = i * S;
            let cur = <$t>::from_le_bytes($dst[at..at + S].try_into().unwrap());
            let arg = <$t>::from_le_bytes($src[at..at + S].try_into().unwrap());
            let f: fn($t, $t) -> $t = $f;
            let r: $t = f(cur, arg);
            $dst[at..at + S].copy_from_slice(&r.to_le_bytes());
        }
    }};
}

macro_rules! each_complex {
    ($t:ty, $dst:expr, $src:expr, $f:expr) => {{
        const H: usize = std::mem::size_of::<$t>();
        let n = $dst.len().min($src.len()) / (2 * H);
        for i in 0..n {
            let at = i * 2 * H;
            let cr = <$t>::from_le_bytes($dst[at..at + H].try_into().unwrap());
            let ci = <$t>::from_le_bytes($dst[at + H..at + 2 * H].try_into().unwrap());
            let ar = <$t>::from_le_bytes($src[at..at + H].try_into().unwrap());
            let ai = <$t>::from_le_bytes($src[at + H..at + 2 * H].try_into().unwrap());
            let (rr, ri) = $f((cr, ci), (ar, ai));
            $dst[at..at + H].copy_from_slice(&rr.to_le_bytes());
            $dst[at + H..at + 2 * H].copy_from_slice(&ri.to_le_bytes());
        }
    }};
}

macro_rules! for_ints {
    ($ty:expr, $dst:expr, $src:expr, $f:expr) => {
        match $ty {
            AtomType::Int8 => each_datum!(i8, $dst, $src, $f),
            AtomType::Uint8 => each_datum!(u8, $dst, $src, $f),
            AtomType::Int16 => each_datum!(i16, $dst, $src, $f),
            AtomType::Uint16 => each_datum!(u16, $dst, $src, $f),
            AtomType::Int32 => each_datum!(i32, $dst, $src, $f),
            AtomType::Uint32 => each_datum!(u32, $dst, $src, $f),
            AtomType::Int64 => each_datum!(i64, $dst, $src, $f),
            AtomType::Uint64 => each_datum!(u64, $dst, $src, $f),
            _ => return Err(PtlError::InvalidArg("operator undefined for datatype")),
        }
    };
}

macro_rules! for_numeric {
    ($ty:expr, $dst:expr, $src:expr, $f:expr) => {
        match $ty {
            AtomType::Int8 => each_datum!(i8, $dst, $src, $f),
            AtomType::Uint8 => each_datum!(u8, $dst, $src, $f),
            AtomType::Int16 => each_datum!(i16, $dst, $src, $f),
            AtomType::Uint16 => each_datum!(u16, $dst, $src, $f),
            AtomType::Int32 => each_datum!(i32, $dst, $src, $f),
            AtomType::Uint32 => each_datum!(u32, $dst, $src, $f),
            AtomType::Int64 => each_datum!(i64, $dst, $src, $f),
            AtomType::Uint64 => each_datum!(u64, $dst, $src, $f),
            AtomType::Float => each_datum!(f32, $dst, $src, $f),
            AtomType::Double => each_datum!(f64, $dst, $src, $f),
            _ => return Err(PtlError::InvalidArg("operator undefined for datatype")),
        }
    };
}

/// Apply an arithmetic or bitwise operator element-wise: `dst` holds the
/// matched element's bytes, `src` the incoming payload. Trailing bytes
/// smaller than one datum are left untouched.
pub(crate) fn apply_atomic(
    op: AtomOp,
    ty: AtomType,
    dst: &mut [u8],
    src: &[u8],
) -> Result<(), PtlError> {
    match op {
        AtomOp::Min => for_numeric!(ty, dst, src, |cur, arg| if arg < cur { arg } else { cur }),
        AtomOp::Max => for_numeric!(ty, dst, src, |cur, arg| if arg > cur { arg } else { cur }),
        AtomOp::Sum => match ty {
            AtomType::Float => each_datum!(f32, dst, src, |cur, arg| cur + arg),
            AtomType::Double => each_datum!(f64, dst, src, |cur, arg| cur + arg),
            AtomType::FloatComplex => {
                each_complex!(f32, dst, src, |c: (f32, f32), a: (f32, f32)| (
                    c.0 + a.0,
                    c.1 + a.1
                ))
            }
            AtomType::DoubleComplex => {
                each_complex!(f64, dst, src, |c: (f64, f64), a: (f64, f64)| (
                    c.0 + a.0,
                    c.1 + a.1
                ))
            }
            _ => for_ints!(ty, dst, src, |cur, arg| cur.wrapping_add(arg)),
        },
        AtomOp::Prod => match ty {
            AtomType::Float => each_datum!(f32, dst, src, |cur, arg| cur * arg),
            AtomType::Double => each_datum!(f64, dst, src, |cur, arg| cur * arg),
            AtomType::FloatComplex => {
                each_complex!(f32, dst, src, |c: (f32, f32), a: (f32, f32)| (
                    c.0 * a.0 - c.1 * a.1,
                    c.0 * a.1 + c.1 * a.0
                ))
            }
            AtomType::DoubleComplex => {
                each_complex!(f64, dst, src, |c: (f64, f64), a: (f64, f64)| (
                    c.0 * a.0 - c.1 * a.1,
                    c.0 * a.1 + c.1 * a.0
                ))
            }
            _ => for_ints!(ty, dst, src, |cur, arg| cur.wrapping_mul(arg)),
        },
        AtomOp::Lor => for_ints!(ty, dst, src, |cur, arg| if cur != 0 || arg != 0 {
            1
        } else {
            0
        }),
        AtomOp::Land => for_ints!(ty, dst, src, |cur, arg| if cur != 0 && arg != 0 {
            1
        } else {
            0
        }),
        AtomOp::Lxor => for_ints!(ty, dst, src, |cur, arg| if (cur != 0) != (arg != 0) {
            1
        } else {
            0
        }),
        AtomOp::Bor => for_ints!(ty, dst, src, |cur, arg| cur | arg),
        AtomOp::Band => for_ints!(ty, dst, src, |cur, arg| cur & arg),
        AtomOp::Bxor => for_ints!(ty, dst, src, |cur, arg| cur ^ arg),
        _ => return Err(PtlError::InvalidArg("not an element-wise operator")),
    }
    Ok(())
}

macro_rules! cswap {
    ($t:ty, $dst:expr, $src:expr, $opr:expr, $cmp:expr) => {{
        const S: usize = std::mem::size_of::<$t>();
        let cur = <$t>::from_le_bytes($dst[..S].try_into().unwrap());
        let new = <$t>::from_le_bytes($src[..S].try_into().unwrap());
        let opr = <$t>::from_le_bytes($opr[..S].try_into().unwrap());
        let r: $t = if $cmp(opr, cur) { new } else { cur };
        $dst[..S].copy_from_slice(&r.to_le_bytes());
    }};
}

macro_rules! cswap_complex {
    ($t:ty, $dst:expr, $src:expr, $opr:expr, $eq:expr, $want_eq:expr) => {{
        const H: usize = std::mem::size_of::<$t>();
        let cur = (
            <$t>::from_le_bytes($dst[..H].try_into().unwrap()),
            <$t>::from_le_bytes($dst[H..2 * H].try_into().unwrap()),
        );
        let new = (
            <$t>::from_le_bytes($src[..H].try_into().unwrap()),
            <$t>::from_le_bytes($src[H..2 * H].try_into().unwrap()),
        );
        let opr = (
            <$t>::from_le_bytes($opr[..H].try_into().unwrap()),
            <$t>::from_le_bytes($opr[H..2 * H].try_into().unwrap()),
        );
        let hit = $eq(opr, cur) == $want_eq;
        let r = if hit { new } else { cur };
        $dst[..H].copy_from_slice(&r.0.to_le_bytes());
        $dst[H..2 * H].copy_from_slice(&r.1.to_le_bytes());
    }};
}

macro_rules! mswap {
    ($t:ty, $dst:expr, $src:expr, $opr:expr) => {{
        const S: usize = std::mem::size_of::<$t>();
        let cur = <$t>::from_le_bytes($dst[..S].try_into().unwrap());
        let new = <$t>::from_le_bytes($src[..S].try_into().unwrap());
        let mask = <$t>::from_le_bytes($opr[..S].try_into().unwrap());
        let r: $t = (mask & new) | (!mask & cur);
        $dst[..S].copy_from_slice(&r.to_le_bytes());
    }};
}

macro_rules! rel_swaps {
    ($ty:expr, $dst:expr, $src:expr, $opr:expr, $cmp:expr) => {
        match $ty {
            AtomType::Int8 => cswap!(i8, $dst, $src, $opr, $cmp),
            AtomType::Uint8 => cswap!(u8, $dst, $src, $opr, $cmp),
            AtomType::Int16 => cswap!(i16, $dst, $src, $opr, $cmp),
            AtomType::Uint16 => cswap!(u16, $dst, $src, $opr, $cmp),
            AtomType::Int32 => cswap!(i32, $dst, $src, $opr, $cmp),
            AtomType::Uint32 => cswap!(u32, $dst, $src, $opr, $cmp),
            AtomType::Int64 => cswap!(i64, $dst, $src, $opr, $cmp),
            AtomType::Uint64 => cswap!(u64, $dst, $src, $opr, $cmp),
            AtomType::Float => cswap!(f32, $dst, $src, $opr, $cmp),
            AtomType::Double => cswap!(f64, $dst, $src, $opr, $cmp),
            // relational compares are undefined for complex numbers
            _ => return Err(PtlError::InvalidArg("operator undefined for datatype")),
        }
    };
}

fn complex_eq<T: PartialEq>(a: (T, T), b: (T, T)) -> bool {
    a.0 == b.0 && a.1 == b.1
}

/// Apply one of the single-datum swap variants. `dst` holds the element's
/// current datum and receives the result, `src` is the incoming datum and
/// `operand` the compare value or mask from the request header.
pub(crate) fn apply_swap(
    op: AtomOp,
    ty: AtomType,
    dst: &mut [u8],
    src: &[u8],
    operand: u64,
) -> Result<(), PtlError> {
    let size = ty.size();
    if dst.len() < size || src.len() < size {
        return Err(PtlError::InvalidArg("short swap datum"));
    }
    let mut opr = [0u8; 16];
    opr[..8].copy_from_slice(&operand.to_le_bytes());

    match op {
        AtomOp::Cswap => match ty {
            AtomType::FloatComplex => cswap_complex!(f32, dst, src, opr, complex_eq, true),
            AtomType::DoubleComplex => cswap_complex!(f64, dst, src, opr, complex_eq, true),
            _ => rel_swaps!(ty, dst, src, opr, |o, c| o == c),
        },
        AtomOp::CswapNe => match ty {
            AtomType::FloatComplex => cswap_complex!(f32, dst, src, opr, complex_eq, false),
            AtomType::DoubleComplex => cswap_complex!(f64, dst, src, opr, complex_eq, false),
            _ => rel_swaps!(ty, dst, src, opr, |o, c| o != c),
        },
        AtomOp::CswapLe => rel_swaps!(ty, dst, src, opr, |o, c| o <= c),
        AtomOp::CswapLt => rel_swaps!(ty, dst, src, opr, |o, c| o < c),
        AtomOp::CswapGe => rel_swaps!(ty, dst, src, opr, |o, c| o >= c),
        AtomOp::CswapGt => rel_swaps!(ty, dst, src, opr, |o, c| o > c),
        AtomOp::Mswap => match ty {
            AtomType::Int8 | AtomType::Uint8 => mswap!(u8, dst, src, opr),
            AtomType::Int16 | AtomType::Uint16 => mswap!(u16, dst, src, opr),
            AtomType::Int32 | AtomType::Uint32 | AtomType::Float => mswap!(u32, dst, src, opr),
            AtomType::Int64 | AtomType::Uint64 | AtomType::Double => mswap!(u64, dst, src, opr),
            _ => return Err(PtlError::InvalidArg("operator undefined for datatype")),
        },
        _ => return Err(PtlError::InvalidArg("not a swap operator")),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn le_bytes_u32(vals: &[u32]) -> Vec<u8> {
        vals.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn sum_u32_elementwise() {
        let mut dst = le_bytes_u32(&[10, 10, 10, 10]);
        let src = le_bytes_u32(&[1, 2, 3, 4]);
        apply_atomic(AtomOp::Sum, AtomType::Uint32, &mut dst, &src).unwrap();
        assert_eq!(dst, le_bytes_u32(&[11, 12, 13, 14]));
    }

    #[test]
    fn sum_wraps() {
        let mut dst = le_bytes_u32(&[u32::MAX]);
        let src = le_bytes_u32(&[2]);
        apply_atomic(AtomOp::Sum, AtomType::Uint32, &mut dst, &src).unwrap();
        assert_eq!(dst, le_bytes_u32(&[1]));
    }

    #[test]
    fn min_respects_sign() {
        let mut dst = (-5i32).to_le_bytes().to_vec();
        let src = 3i32.to_le_bytes().to_vec();
        apply_atomic(AtomOp::Min, AtomType::Int32, &mut dst, &src).unwrap();
        assert_eq!(dst, (-5i32).to_le_bytes());

        let mut dst = (-5i32 as u32).to_le_bytes().to_vec();
        apply_atomic(AtomOp::Min, AtomType::Uint32, &mut dst, &src).unwrap();
        // as unsigned, 3 is the smaller value
        assert_eq!(dst, 3u32.to_le_bytes());
    }

    #[test]
    fn logical_ops_normalize() {
        let mut dst = 7u8.to_le_bytes().to_vec();
        apply_atomic(AtomOp::Lor, AtomType::Uint8, &mut dst, &[0]).unwrap();
        assert_eq!(dst, [1]);

        let mut dst = 7u8.to_le_bytes().to_vec();
        apply_atomic(AtomOp::Land, AtomType::Uint8, &mut dst, &[0]).unwrap();
        assert_eq!(dst, [0]);

        let mut dst = 7u8.to_le_bytes().to_vec();
        apply_atomic(AtomOp::Lxor, AtomType::Uint8, &mut dst, &[9]).unwrap();
        assert_eq!(dst, [0]);
    }

    #[test]
    fn bitwise_rejected_for_floats() {
        let mut dst = 1.0f32.to_le_bytes().to_vec();
        let src = 2.0f32.to_le_bytes().to_vec();
        assert!(apply_atomic(AtomOp::Bxor, AtomType::Float, &mut dst, &src).is_err());
    }

    #[test]
    fn minmax_rejected_for_complex() {
        let mut dst = vec![0; 8];
        let src = vec![0; 8];
        assert!(apply_atomic(AtomOp::Min, AtomType::FloatComplex, &mut dst, &src).is_err());
    }

    #[test]
    fn complex_product() {
        // (1 + 2i) * (3 + 4i) = -5 + 10i
        let mut dst = Vec::new();
        dst.extend_from_slice(&1.0f32.to_le_bytes());
        dst.extend_from_slice(&2.0f32.to_le_bytes());
        let mut src = Vec::new();
        src.extend_from_slice(&3.0f32.to_le_bytes());
        src.extend_from_slice(&4.0f32.to_le_bytes());
        apply_atomic(AtomOp::Prod, AtomType::FloatComplex, &mut dst, &src).unwrap();
        assert_eq!(&dst[..4], &(-5.0f32).to_le_bytes());
        assert_eq!(&dst[4..], &10.0f32.to_le_bytes());
    }

    #[test]
    fn cswap_hits_and_misses() {
        let mut dst = 5u64.to_le_bytes().to_vec();
        let src = 99u64.to_le_bytes().to_vec();
        apply_swap(AtomOp::Cswap, AtomType::Uint64, &mut dst, &src, 5).unwrap();
        assert_eq!(dst, 99u64.to_le_bytes());

        let mut dst = 6u64.to_le_bytes().to_vec();
        apply_swap(AtomOp::Cswap, AtomType::Uint64, &mut dst, &src, 5).unwrap();
        assert_eq!(dst, 6u64.to_le_bytes());
    }

    #[test]
    fn cswap_lt_signed() {
        // operand -1 < current 4 holds as signed
        let mut dst = 4i64.to_le_bytes().to_vec();
        let src = 7i64.to_le_bytes().to_vec();
        apply_swap(
            AtomOp::CswapLt,
            AtomType::Int64,
            &mut dst,
            &src,
            (-1i64) as u64,
        )
        .unwrap();
        assert_eq!(dst, 7i64.to_le_bytes());

        // as unsigned the operand is huge, so the compare misses
        let mut dst = 4u64.to_le_bytes().to_vec();
        apply_swap(
            AtomOp::CswapLt,
            AtomType::Uint64,
            &mut dst,
            &src,
            (-1i64) as u64,
        )
        .unwrap();
        assert_eq!(dst, 4u64.to_le_bytes());
    }

    #[test]
    fn mswap_mixes_by_mask() {
        let pre = 0xff00_ff00_ff00_ff00u64;
        let new = 0x1234_5678_9abc_def0u64;
        let mask = 0x0000_ffff_0000_ffffu64;
        let mut dst = pre.to_le_bytes().to_vec();
        apply_swap(
            AtomOp::Mswap,
            AtomType::Uint64,
            &mut dst,
            &new.to_le_bytes(),
            mask,
        )
        .unwrap();
        let got = u64::from_le_bytes(dst.try_into().unwrap());
        assert_eq!(got, (mask & new) | (!mask & pre));
    }

    #[test]
    fn relational_swap_rejected_for_complex() {
        let mut dst = vec![0; 8];
        let src = vec![0; 8];
        assert!(apply_swap(AtomOp::CswapLt, AtomType::FloatComplex, &mut dst, &src, 0).is_err());
    }
}
