/// The set of primitive element types a column container can hold.
/// Signedness is tracked as a separate bit on `ContainerHeader`, not folded
/// into this enum, so reformatting can flip int8 <-> uint8 without touching
/// the rest of the header.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum PrimitiveType {
    Bool = 0,
    Char = 1,
    Int8 = 2,
    Int16 = 3,
    Int32 = 4,
    Int64 = 5,
    Float32 = 6,
    Float64 = 7,
    Struct = 8,
}

impl PrimitiveType {
    pub fn byte_width(self) -> usize {
        match self {
            PrimitiveType::Bool | PrimitiveType::Char | PrimitiveType::Int8 => 1,
            PrimitiveType::Int16 => 2,
            PrimitiveType::Int32 | PrimitiveType::Float32 => 4,
            PrimitiveType::Int64 | PrimitiveType::Float64 => 8,
            PrimitiveType::Struct => 0,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => PrimitiveType::Bool,
            1 => PrimitiveType::Char,
            2 => PrimitiveType::Int8,
            3 => PrimitiveType::Int16,
            4 => PrimitiveType::Int32,
            5 => PrimitiveType::Int64,
            6 => PrimitiveType::Float32,
            7 => PrimitiveType::Float64,
            8 => PrimitiveType::Struct,
            _ => return None,
        })
    }

    pub fn is_integer(self) -> bool {
        matches!(
            self,
            PrimitiveType::Int8 | PrimitiveType::Int16 | PrimitiveType::Int32 | PrimitiveType::Int64
        )
    }

    /// The integer primitive type of the given byte width, used after
    /// reformatting has picked a target width.
    pub fn int_of_width(width: usize) -> Self {
        match width {
            1 => PrimitiveType::Int8,
            2 => PrimitiveType::Int16,
            4 => PrimitiveType::Int32,
            8 => PrimitiveType::Int64,
            _ => panic!("not a valid reformatted integer width: {width}"),
        }
    }
}

/// Reserved sentinel values carried through integer reformatting (spec
/// section on the Sentinel glossary entry).
pub const MISSING: i32 = i32::MIN;
pub const END_OF_VECTOR: i32 = i32::MIN + 1;

/// The target-width top-two sentinel values a signed reformat remaps
/// `MISSING`/`END_OF_VECTOR` onto, keyed by destination byte width.
pub fn signed_sentinels_for_width(width: usize) -> (i64, i64) {
    match width {
        1 => (i8::MIN as i64, (i8::MIN as i64) + 1),
        2 => (i16::MIN as i64, (i16::MIN as i64) + 1),
        4 => (i32::MIN as i64, (i32::MIN as i64) + 1),
        8 => (i64::MIN, i64::MIN + 1),
        _ => panic!("not a valid reformatted integer width: {width}"),
    }
}

pub fn smallest_unsigned_width(max: u64) -> usize {
    if max <= 0xff {
        1
    } else if max <= 0xffff {
        2
    } else if max <= 0xffff_ffff {
        4
    } else {
        8
    }
}

/// Rounds a byte width up to the nearest representable width in
/// `{1,2,4,8}`: width 3 becomes 4, anything over 4 becomes 8.
pub fn round_up_width(width: usize) -> usize {
    match width {
        0 | 1 => 1,
        2 => 2,
        3 | 4 => 4,
        _ => 8,
    }
}
