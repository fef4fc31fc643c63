use std::fmt::Display;

use byteorder::{ByteOrder, LittleEndian};

/// Fixed-width integer item types used for in-dataset storage.
#[derive(PartialEq, Eq, PartialOrd, Ord, Debug, Clone, Copy, Hash)]
pub enum IntType {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
}

impl Display for IntType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&format!("{:?}", self))
    }
}

impl IntType {
    pub fn to_byte(&self) -> u8 {
        match self {
            IntType::U8 => 6,
            IntType::U16 => 7,
            IntType::U32 => 8,
            IntType::U64 => 9,
            IntType::I8 => 1,
            IntType::I16 => 2,
            IntType::I32 => 3,
            IntType::I64 => 4,
        }
    }

    pub fn from_byte(byte: u8) -> Option<IntType> {
        match byte {
            1 => Some(IntType::I8),
            2 => Some(IntType::I16),
            3 => Some(IntType::I32),
            4 => Some(IntType::I64),
            6 => Some(IntType::U8),
            7 => Some(IntType::U16),
            8 => Some(IntType::U32),
            9 => Some(IntType::U64),
            _ => None,
        }
    }

    /// Width in bytes.
    pub fn size(&self) -> usize {
        match self {
            IntType::U8 | IntType::I8 => 1,
            IntType::U16 | IntType::I16 => 2,
            IntType::U32 | IntType::I32 => 4,
            IntType::U64 | IntType::I64 => 8,
        }
    }

    pub fn is_signed(&self) -> bool {
        matches!(
            self,
            IntType::I8 | IntType::I16 | IntType::I32 | IntType::I64
        )
    }

    /// Largest value representable as an unsigned quantity.
    pub fn max_value(&self) -> u64 {
        match self {
            IntType::U8 => u8::MAX as u64,
            IntType::U16 => u16::MAX as u64,
            IntType::U32 => u32::MAX as u64,
            IntType::U64 => u64::MAX,
            IntType::I8 => i8::MAX as u64,
            IntType::I16 => i16::MAX as u64,
            IntType::I32 => i32::MAX as u64,
            IntType::I64 => i64::MAX as u64,
        }
    }

    /// Whether `value` is stored without wrapping.
    pub fn holds(&self, value: i64) -> bool {
        match self {
            IntType::U8 => u8::try_from(value).is_ok(),
            IntType::U16 => u16::try_from(value).is_ok(),
            IntType::U32 => u32::try_from(value).is_ok(),
            IntType::U64 => value >= 0,
            IntType::I8 => i8::try_from(value).is_ok(),
            IntType::I16 => i16::try_from(value).is_ok(),
            IntType::I32 => i32::try_from(value).is_ok(),
            IntType::I64 => true,
        }
    }

    /// The wider of two types. Mixing signedness widens to the signed type
    /// able to hold both ranges.
    pub fn widest(self, other: IntType) -> IntType {
        if self.is_signed() == other.is_signed() {
            return if self.size() >= other.size() { self } else { other };
        }

        let (signed, unsigned) = if self.is_signed() {
            (self, other)
        } else {
            (other, self)
        };

        fit_signed_range(-(signed.max_value() as i64) - 1, unsigned.max_value().min(i64::MAX as u64) as i64)
    }

    /// Encodes `values` at this width and appends the bytes to `out`.
    /// Values of signed types are the two's complement bits of an `i64`.
    pub fn encode_into(&self, values: &[u64], out: &mut Vec<u8>) {
        let size = self.size();
        let start = out.len();
        out.resize(start + values.len() * size, 0);
        let buf = &mut out[start..];

        for (i, value) in values.iter().enumerate() {
            let slot = &mut buf[i * size..(i + 1) * size];
            match self {
                IntType::U8 | IntType::I8 => slot[0] = *value as u8,
                IntType::U16 | IntType::I16 => LittleEndian::write_u16(slot, *value as u16),
                IntType::U32 | IntType::I32 => LittleEndian::write_u32(slot, *value as u32),
                IntType::U64 | IntType::I64 => LittleEndian::write_u64(slot, *value),
            }
        }
    }

    /// Decodes `bytes` (a whole number of items) and appends to `out`.
    /// Signed items are sign-extended.
    pub fn decode_into(&self, bytes: &[u8], out: &mut Vec<u64>) {
        let size = self.size();
        out.reserve(bytes.len() / size);

        for slot in bytes.chunks_exact(size) {
            let value = match self {
                IntType::U8 => slot[0] as u64,
                IntType::U16 => LittleEndian::read_u16(slot) as u64,
                IntType::U32 => LittleEndian::read_u32(slot) as u64,
                IntType::U64 => LittleEndian::read_u64(slot),
                IntType::I8 => slot[0] as i8 as i64 as u64,
                IntType::I16 => LittleEndian::read_i16(slot) as i64 as u64,
                IntType::I32 => LittleEndian::read_i32(slot) as i64 as u64,
                IntType::I64 => LittleEndian::read_i64(slot) as u64,
            };
            out.push(value);
        }
    }
}

/// Smallest integer type that can hold `max`.
pub fn fit_integer_type(max: u64, is_signed: bool) -> IntType {
    if is_signed {
        if max <= i8::MAX as u64 {
            IntType::I8
        } else if max <= i16::MAX as u64 {
            IntType::I16
        } else if max <= i32::MAX as u64 {
            IntType::I32
        } else {
            IntType::I64
        }
    } else if max <= u8::MAX as u64 {
        IntType::U8
    } else if max <= u16::MAX as u64 {
        IntType::U16
    } else if max <= u32::MAX as u64 {
        IntType::U32
    } else {
        IntType::U64
    }
}

/// Smallest integer type that can hold every value of `[min, max]`.
pub fn fit_signed_range(min: i64, max: i64) -> IntType {
    if min >= 0 {
        return fit_integer_type(max as u64, false);
    }

    let fits = |lo: i64, hi: i64| min >= lo && max <= hi;

    if fits(i8::MIN as i64, i8::MAX as i64) {
        IntType::I8
    } else if fits(i16::MIN as i64, i16::MAX as i64) {
        IntType::I16
    } else if fits(i32::MIN as i64, i32::MAX as i64) {
        IntType::I32
    } else {
        IntType::I64
    }
}
