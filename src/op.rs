//! Typed operation descriptors.
//!
//! A [`CombineOp`] says how a contiguous run of scalars is combined. Packed,
//! it is a 16 bit code word plus a 16 bit count:
//!
//! | bits of `code` | content |
//! |---|---|
//! | 0..6 | [`Operator`] |
//! | 6..9 | [`ElementType`] |
//! | 9..16 | group field |
//!
//! The group field holds the number of grouped descriptors of a
//! [`Operator::RepeatGroup`]. Inside a collection session buffer the same bits
//! hold the destination index of the record instead.
//!
//! For a repeat group the count field is the number of repetitions, not a
//! number of scalars. This is part of the wire format.

use crate::error::{Error, Result};

/// Number of bytes of a packed descriptor.
pub const HEADER_LEN: usize = 4;

const OPERATOR_BITS: u16 = 6;
const TYPE_BITS: u16 = 3;
const OPERATOR_MASK: u16 = (1 << OPERATOR_BITS) - 1;
const TYPE_SHIFT: u16 = OPERATOR_BITS;
const TYPE_MASK: u16 = (1 << TYPE_BITS) - 1;
const GROUP_SHIFT: u16 = OPERATOR_BITS + TYPE_BITS;

/// Largest value of the group field.
pub const GROUP_MAX: u16 = (1 << (16 - GROUP_SHIFT)) - 1;

/// Combining operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Operator {
    /// Elementwise sum, wrapping on integer overflow.
    Add = 0,
    /// Elementwise maximum.
    Max = 1,
    /// Elementwise minimum.
    Min = 2,
    /// Leave the destination untouched.
    NoOp = 3,
    /// Bitwise or. Integer types only.
    LogicalOr = 4,
    /// Replay the following descriptors.
    RepeatGroup = 5,
}

impl TryFrom<u16> for Operator {
    type Error = Error;

    fn try_from(value: u16) -> Result<Self> {
        match value {
            0 => Ok(Operator::Add),
            1 => Ok(Operator::Max),
            2 => Ok(Operator::Min),
            3 => Ok(Operator::NoOp),
            4 => Ok(Operator::LogicalOr),
            5 => Ok(Operator::RepeatGroup),
            _ => Err(Error::UnknownDescriptor(value)),
        }
    }
}

/// Scalar element types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ElementType {
    /// `i8`
    I8 = 0,
    /// `i16`
    I16 = 1,
    /// `i32`
    I32 = 2,
    /// `i64`
    I64 = 3,
    /// `u32`
    U32 = 4,
    /// `u64`
    U64 = 5,
    /// `f32`
    F32 = 6,
    /// `f64`
    F64 = 7,
}

impl ElementType {
    /// Width of one element in bytes.
    pub const fn width(self) -> usize {
        match self {
            ElementType::I8 => 1,
            ElementType::I16 => 2,
            ElementType::I32 | ElementType::U32 | ElementType::F32 => 4,
            ElementType::I64 | ElementType::U64 | ElementType::F64 => 8,
        }
    }

    /// True for `f32` and `f64`.
    pub const fn is_float(self) -> bool {
        matches!(self, ElementType::F32 | ElementType::F64)
    }

    fn from_bits(bits: u16) -> Self {
        match bits & TYPE_MASK {
            0 => ElementType::I8,
            1 => ElementType::I16,
            2 => ElementType::I32,
            3 => ElementType::I64,
            4 => ElementType::U32,
            5 => ElementType::U64,
            6 => ElementType::F32,
            _ => ElementType::F64,
        }
    }
}

/// A typed operation descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CombineOp {
    /// How elements are combined.
    pub operator: Operator,
    /// Type of the elements.
    pub element_type: ElementType,
    /// Group field, see the module documentation.
    pub group: u16,
    /// Number of elements, or repetitions for a repeat group.
    pub count: u16,
}

impl CombineOp {
    /// Descriptor for `count` elements of type `element_type`.
    pub const fn new(operator: Operator, element_type: ElementType, count: u16) -> Self {
        Self {
            operator,
            element_type,
            group: 0,
            count,
        }
    }

    /// Sum `count` elements.
    pub const fn add(element_type: ElementType, count: u16) -> Self {
        Self::new(Operator::Add, element_type, count)
    }

    /// Maximum over `count` elements.
    pub const fn max(element_type: ElementType, count: u16) -> Self {
        Self::new(Operator::Max, element_type, count)
    }

    /// Minimum over `count` elements.
    pub const fn min(element_type: ElementType, count: u16) -> Self {
        Self::new(Operator::Min, element_type, count)
    }

    /// Skip `count` elements.
    pub const fn noop(element_type: ElementType, count: u16) -> Self {
        Self::new(Operator::NoOp, element_type, count)
    }

    /// Bitwise or over `count` elements.
    pub const fn or(element_type: ElementType, count: u16) -> Self {
        Self::new(Operator::LogicalOr, element_type, count)
    }

    /// Replay the following `width` descriptors `times` times.
    ///
    /// # Panics
    ///
    /// Panics if `width` exceeds [`GROUP_MAX`]. In a const context this is a
    /// compile time error.
    pub const fn repeat(width: u16, times: u16) -> Self {
        assert!(width <= GROUP_MAX, "repeat group too wide");
        Self {
            operator: Operator::RepeatGroup,
            element_type: ElementType::I8,
            group: width,
            count: times,
        }
    }

    /// Descriptors covering `len` elements, split at the 16 bit count limit.
    pub fn split(operator: Operator, element_type: ElementType, len: usize) -> Vec<Self> {
        let full = len / u16::MAX as usize;
        let rest = (len % u16::MAX as usize) as u16;
        let mut ops = vec![Self::new(operator, element_type, u16::MAX); full];
        if rest > 0 {
            ops.push(Self::new(operator, element_type, rest));
        }
        ops
    }

    /// Number of data bytes described by a scalar descriptor.
    pub fn byte_len(&self) -> usize {
        self.count as usize * self.element_type.width()
    }

    /// Same descriptor with a different group field.
    pub fn with_group(self, group: u16) -> Self {
        Self { group, ..self }
    }

    /// Pack the code word: operator, element type and group field.
    pub fn encode(&self) -> u16 {
        debug_assert!(self.group <= GROUP_MAX);
        (self.operator as u16 & OPERATOR_MASK)
            | ((self.element_type as u16 & TYPE_MASK) << TYPE_SHIFT)
            | (self.group << GROUP_SHIFT)
    }

    /// Unpack a code word and count.
    pub fn decode(code: u16, count: u16) -> Result<Self> {
        let operator = Operator::try_from(code & OPERATOR_MASK)
            .map_err(|_| Error::UnknownDescriptor(code))?;
        Ok(Self {
            operator,
            element_type: ElementType::from_bits(code >> TYPE_SHIFT),
            group: code >> GROUP_SHIFT,
            count,
        })
    }

    /// The four header bytes in native byte order.
    pub fn to_header(&self) -> [u8; HEADER_LEN] {
        let code = self.encode().to_ne_bytes();
        let count = self.count.to_ne_bytes();
        [code[0], code[1], count[0], count[1]]
    }

    /// Read a descriptor from the first four bytes of `bytes`.
    pub fn from_header(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::BufferOverrun {
                context: "descriptor header",
                needed: HEADER_LEN,
                available: bytes.len(),
            });
        }
        let code = u16::from_ne_bytes([bytes[0], bytes[1]]);
        let count = u16::from_ne_bytes([bytes[2], bytes[3]]);
        Self::decode(code, count)
    }
}

/// Iterate over the scalar descriptors of `ops` with repeat groups expanded.
pub fn expand(ops: &[CombineOp]) -> Expand<'_> {
    Expand {
        ops,
        pos: 0,
        group: None,
        failed: false,
    }
}

/// Total number of data bytes described by `ops`.
pub fn data_len(ops: &[CombineOp]) -> Result<usize> {
    expand(ops).try_fold(0, |len, op| op.map(|op| len + op.byte_len()))
}

struct Group {
    start: usize,
    width: usize,
    remaining: u16,
    cursor: usize,
}

/// Iterator returned by [`expand`].
pub struct Expand<'o> {
    ops: &'o [CombineOp],
    pos: usize,
    group: Option<Group>,
    failed: bool,
}

impl<'o> Expand<'o> {
    fn open_group(&mut self, index: usize, op: &CombineOp) -> Result<()> {
        let start = index + 1;
        let width = op.group as usize;
        let available = self.ops.len() - start;
        if width > available {
            return Err(Error::RepeatGroupOverrun {
                index,
                width,
                available,
            });
        }
        if let Some(nested) = self.ops[start..start + width]
            .iter()
            .position(|op| op.operator == Operator::RepeatGroup)
        {
            return Err(Error::NestedRepeatGroup {
                index: start + nested,
            });
        }

        if width == 0 || op.count == 0 {
            self.pos = start + width;
        } else {
            self.group = Some(Group {
                start,
                width,
                remaining: op.count,
                cursor: 0,
            });
        }
        Ok(())
    }
}

impl<'o> Iterator for Expand<'o> {
    type Item = Result<CombineOp>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some(group) = self.group.as_mut() {
                let op = self.ops[group.start + group.cursor];
                group.cursor += 1;
                if group.cursor == group.width {
                    group.cursor = 0;
                    group.remaining -= 1;
                    if group.remaining == 0 {
                        self.pos = group.start + group.width;
                        self.group = None;
                    }
                }
                return Some(Ok(op));
            }

            let index = self.pos;
            let op = *self.ops.get(index)?;
            if op.operator == Operator::RepeatGroup {
                if let Err(err) = self.open_group(index, &op) {
                    self.failed = true;
                    return Some(Err(err));
                }
                continue;
            }
            self.pos += 1;
            return Some(Ok(op));
        }
    }
}
