use std::collections::BTreeMap;
use std::fmt;

pub type Dims = Vec<usize>;

/// Free-form key/value parameters, as handed to engines, transports and transforms.
pub type Params = BTreeMap<String, String>;

/// Shape marker used by [`Io::define_local_value`][crate::Io::define_local_value].
pub const LOCAL_VALUE_DIM: usize = usize::MAX - 2;

pub mod constants {
    pub const TYPE_INT8: u8 = 0x01;
    pub const TYPE_INT16: u8 = 0x02;
    pub const TYPE_INT32: u8 = 0x03;
    pub const TYPE_INT64: u8 = 0x04;
    pub const TYPE_UINT8: u8 = 0x11;
    pub const TYPE_UINT16: u8 = 0x12;
    pub const TYPE_UINT32: u8 = 0x13;
    pub const TYPE_UINT64: u8 = 0x14;
    pub const TYPE_FLOAT32: u8 = 0x21;
    pub const TYPE_FLOAT64: u8 = 0x22;
    pub const TYPE_CHAR: u8 = 0x30;
    pub const TYPE_COMPOUND: u8 = 0x40;
}

use self::constants::*;

#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub enum ElementType {
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    Char,
    /// A user struct, carried as opaque bytes of the given size.
    Compound(u32),
}

impl ElementType {
    pub const fn size(self) -> usize {
        use ElementType::*;

        match self {
            Int8 | UInt8 | Char => 1,
            Int16 | UInt16 => 2,
            Int32 | UInt32 | Float32 => 4,
            Int64 | UInt64 | Float64 => 8,
            Compound(size) => size as usize,
        }
    }

    pub const fn id(self) -> u8 {
        use ElementType::*;

        match self {
            Int8 => TYPE_INT8,
            Int16 => TYPE_INT16,
            Int32 => TYPE_INT32,
            Int64 => TYPE_INT64,
            UInt8 => TYPE_UINT8,
            UInt16 => TYPE_UINT16,
            UInt32 => TYPE_UINT32,
            UInt64 => TYPE_UINT64,
            Float32 => TYPE_FLOAT32,
            Float64 => TYPE_FLOAT64,
            Char => TYPE_CHAR,
            Compound(_) => TYPE_COMPOUND,
        }
    }

    /// Compound types carry their size next to the id, so it is passed in separately.
    pub fn from_id(id: u8, compound_size: u32) -> Option<ElementType> {
        use ElementType::*;

        Some(match id {
            TYPE_INT8 => Int8,
            TYPE_INT16 => Int16,
            TYPE_INT32 => Int32,
            TYPE_INT64 => Int64,
            TYPE_UINT8 => UInt8,
            TYPE_UINT16 => UInt16,
            TYPE_UINT32 => UInt32,
            TYPE_UINT64 => UInt64,
            TYPE_FLOAT32 => Float32,
            TYPE_FLOAT64 => Float64,
            TYPE_CHAR => Char,
            TYPE_COMPOUND => Compound(compound_size),
            _ => return None,
        })
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use ElementType::*;

        let s = match self {
            Int8 => "int8_t",
            Int16 => "int16_t",
            Int32 => "int32_t",
            Int64 => "int64_t",
            UInt8 => "uint8_t",
            UInt16 => "uint16_t",
            UInt32 => "uint32_t",
            UInt64 => "uint64_t",
            Float32 => "float",
            Float64 => "double",
            Char => "char",
            Compound(size) => return write!(f, "compound({})", size),
        };

        write!(f, "{}", s)
    }
}

impl fmt::Debug for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// A scalar that can be stored in a variable. Values are always laid out little-endian.
pub trait Element: Copy + Default + Send + Sync + 'static {
    const TYPE: ElementType;

    fn extend_bytes(values: &[Self], out: &mut Vec<u8>);

    fn from_bytes(bytes: &[u8]) -> Vec<Self>;
}

macro_rules! impl_element {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl Element for $ty {
                const TYPE: ElementType = ElementType::$variant;

                fn extend_bytes(values: &[Self], out: &mut Vec<u8>) {
                    out.reserve(values.len() * std::mem::size_of::<$ty>());
                    for v in values {
                        out.extend_from_slice(&v.to_le_bytes());
                    }
                }

                fn from_bytes(bytes: &[u8]) -> Vec<Self> {
                    bytes
                        .chunks_exact(std::mem::size_of::<$ty>())
                        .map(|c| {
                            let mut buf = [0u8; std::mem::size_of::<$ty>()];
                            buf.copy_from_slice(c);
                            <$ty>::from_le_bytes(buf)
                        })
                        .collect()
                }
            }
        )*
    };
}

impl_element! {
    i8 => Int8,
    i16 => Int16,
    i32 => Int32,
    i64 => Int64,
    u8 => UInt8,
    u16 => UInt16,
    u32 => UInt32,
    u64 => UInt64,
    f32 => Float32,
    f64 => Float64,
}

pub(crate) fn to_bytes<T: Element>(values: &[T]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * T::TYPE.size());
    T::extend_bytes(values, &mut out);
    out
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Mode {
    Write,
    Read,
    Append,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Write => write!(f, "write"),
            Mode::Read => write!(f, "read"),
            Mode::Append => write!(f, "append"),
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub enum StepMode {
    #[default]
    NextAvailable,
    LatestAvailable,
}

/// Outcome of a step request. None of these are failures.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum StepStatus {
    Ok,
    NotReady,
    EndOfStream,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ShapeKind {
    GlobalArray,
    LocalArray,
    GlobalValue,
    LocalValue,
}

impl ShapeKind {
    pub const fn id(self) -> u8 {
        match self {
            ShapeKind::GlobalArray => 0,
            ShapeKind::LocalArray => 1,
            ShapeKind::GlobalValue => 2,
            ShapeKind::LocalValue => 3,
        }
    }

    pub fn from_id(id: u8) -> Option<ShapeKind> {
        Some(match id {
            0 => ShapeKind::GlobalArray,
            1 => ShapeKind::LocalArray,
            2 => ShapeKind::GlobalValue,
            3 => ShapeKind::LocalValue,
            _ => return None,
        })
    }

    pub const fn is_value(self) -> bool {
        matches!(self, ShapeKind::GlobalValue | ShapeKind::LocalValue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn element_bytes_are_little_endian() {
        let bytes = to_bytes(&[1u32, 0x0102_0304]);
        assert_eq!(bytes, vec![1, 0, 0, 0, 4, 3, 2, 1]);
        assert_eq!(u32::from_bytes(&bytes), vec![1, 0x0102_0304]);
    }

    #[test]
    fn element_type_ids() {
        for ty in [
            ElementType::Int8,
            ElementType::UInt64,
            ElementType::Float32,
            ElementType::Char,
            ElementType::Compound(24),
        ] {
            let size = match ty {
                ElementType::Compound(s) => s,
                _ => 0,
            };
            assert_eq!(ElementType::from_id(ty.id(), size), Some(ty));
        }
        assert_eq!(ElementType::from_id(0xee, 0), None);
        assert_eq!(ElementType::Compound(24).size(), 24);
        assert_eq!(f64::TYPE.size(), 8);
    }
}
