//! Coordinate datatypes.

use std::fmt::{Debug, Display, Formatter};

/// Physical type of a dimension's coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Datatype {
    Int8,
    Uint8,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Float32,
    Float64,
    /// Variable-length ASCII strings.
    StringAscii,
}

impl Datatype {
    /// Size in bytes of one coordinate value (one character for strings).
    pub fn size(&self) -> usize {
        match self {
            Datatype::Int8 | Datatype::Uint8 | Datatype::StringAscii => 1,
            Datatype::Int16 | Datatype::Uint16 => 2,
            Datatype::Int32 | Datatype::Uint32 | Datatype::Float32 => 4,
            Datatype::Int64 | Datatype::Uint64 | Datatype::Float64 => 8,
        }
    }

    pub fn is_string(&self) -> bool {
        matches!(self, Datatype::StringAscii)
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            Datatype::Int8
                | Datatype::Uint8
                | Datatype::Int16
                | Datatype::Uint16
                | Datatype::Int32
                | Datatype::Uint32
                | Datatype::Int64
                | Datatype::Uint64
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Datatype::Int8 => "INT8",
            Datatype::Uint8 => "UINT8",
            Datatype::Int16 => "INT16",
            Datatype::Uint16 => "UINT16",
            Datatype::Int32 => "INT32",
            Datatype::Uint32 => "UINT32",
            Datatype::Int64 => "INT64",
            Datatype::Uint64 => "UINT64",
            Datatype::Float32 => "FLOAT32",
            Datatype::Float64 => "FLOAT64",
            Datatype::StringAscii => "STRING_ASCII",
        }
    }
}

impl Display for Datatype {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fixed-size coordinate type stored little-endian inside a range.
pub trait Coord: Copy + PartialOrd + Debug + Send + Sync + 'static {
    const SIZE: usize;
    const IS_INTEGER: bool;
    const DATATYPE: Datatype;

    /// Decodes a value from exactly `SIZE` little-endian bytes.
    fn from_le_slice(bytes: &[u8]) -> Option<Self>;

    /// Encodes into the first `SIZE` bytes of `out`.
    fn write_le(self, out: &mut [u8]);

    /// `hi - lo` as a double, computed without overflow for integers and in
    /// the native precision for floats.
    fn span(lo: Self, hi: Self) -> f64;

    /// Smallest positive value of the type, used in place of zero-width float
    /// spans.
    fn min_positive_span() -> f64;
}

macro_rules! impl_integer_coord {
    ($($ty:ty => $datatype:expr),* $(,)?) => {
        $(
            impl Coord for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();
                const IS_INTEGER: bool = true;
                const DATATYPE: Datatype = $datatype;

                #[inline]
                fn from_le_slice(bytes: &[u8]) -> Option<Self> {
                    Some(<$ty>::from_le_bytes(bytes.try_into().ok()?))
                }

                #[inline]
                fn write_le(self, out: &mut [u8]) {
                    out[..Self::SIZE].copy_from_slice(&self.to_le_bytes());
                }

                #[inline]
                fn span(lo: Self, hi: Self) -> f64 {
                    (hi as i128 - lo as i128) as f64
                }

                #[inline]
                fn min_positive_span() -> f64 {
                    1.0
                }
            }
        )*
    };
}

macro_rules! impl_float_coord {
    ($($ty:ty => $datatype:expr),* $(,)?) => {
        $(
            impl Coord for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();
                const IS_INTEGER: bool = false;
                const DATATYPE: Datatype = $datatype;

                #[inline]
                fn from_le_slice(bytes: &[u8]) -> Option<Self> {
                    Some(<$ty>::from_le_bytes(bytes.try_into().ok()?))
                }

                #[inline]
                fn write_le(self, out: &mut [u8]) {
                    out[..Self::SIZE].copy_from_slice(&self.to_le_bytes());
                }

                #[inline]
                fn span(lo: Self, hi: Self) -> f64 {
                    (hi - lo) as f64
                }

                #[inline]
                fn min_positive_span() -> f64 {
                    <$ty>::from_bits(1) as f64
                }
            }
        )*
    };
}

impl_integer_coord!(
    i8 => Datatype::Int8,
    u8 => Datatype::Uint8,
    i16 => Datatype::Int16,
    u16 => Datatype::Uint16,
    i32 => Datatype::Int32,
    u32 => Datatype::Uint32,
    i64 => Datatype::Int64,
    u64 => Datatype::Uint64,
);

impl_float_coord!(f32 => Datatype::Float32, f64 => Datatype::Float64);

/// Runs `$fixed` with `$T` bound to the Rust type behind a fixed-size
/// datatype, or `$var` for string datatypes.
macro_rules! dispatch_coord {
    ($datatype:expr, $T:ident => $fixed:expr, string => $var:expr) => {
        match $datatype {
            $crate::datatype::Datatype::Int8 => {
                type $T = i8;
                $fixed
            }
            $crate::datatype::Datatype::Uint8 => {
                type $T = u8;
                $fixed
            }
            $crate::datatype::Datatype::Int16 => {
                type $T = i16;
                $fixed
            }
            $crate::datatype::Datatype::Uint16 => {
                type $T = u16;
                $fixed
            }
            $crate::datatype::Datatype::Int32 => {
                type $T = i32;
                $fixed
            }
            $crate::datatype::Datatype::Uint32 => {
                type $T = u32;
                $fixed
            }
            $crate::datatype::Datatype::Int64 => {
                type $T = i64;
                $fixed
            }
            $crate::datatype::Datatype::Uint64 => {
                type $T = u64;
                $fixed
            }
            $crate::datatype::Datatype::Float32 => {
                type $T = f32;
                $fixed
            }
            $crate::datatype::Datatype::Float64 => {
                type $T = f64;
                $fixed
            }
            $crate::datatype::Datatype::StringAscii => $var,
        }
    };
}

pub(crate) use dispatch_coord;
