//! Scalar element types that can be combined.

use num::traits::{PrimInt, WrappingAdd};

use crate::op::ElementType;

mod private {
    pub trait Sealed {}
}

/// A scalar type with a fixed-width native representation.
///
/// Implemented for exactly the eight types of [`ElementType`].
pub trait Element: private::Sealed + Copy + PartialOrd + Send + Sync + 'static {
    /// Matching element type tag.
    const TYPE: ElementType;

    /// Read a value from `bytes`, which must be exactly the element width long.
    fn load(bytes: &[u8]) -> Self;

    /// Write the value into `bytes`, which must be exactly the element width long.
    fn store(self, bytes: &mut [u8]);

    /// Sum, wrapping around on integer overflow.
    fn accumulate(self, other: Self) -> Self;

    /// Bitwise or, `None` for floating point types.
    fn bit_or(self, other: Self) -> Option<Self>;
}

fn wrapping_sum<T: PrimInt + WrappingAdd>(a: T, b: T) -> T {
    a.wrapping_add(&b)
}

macro_rules! integer_element {
    ($t:ty, $variant:ident) => {
        impl private::Sealed for $t {}

        impl Element for $t {
            const TYPE: ElementType = ElementType::$variant;

            fn load(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$t>()];
                raw.copy_from_slice(bytes);
                <$t>::from_ne_bytes(raw)
            }

            fn store(self, bytes: &mut [u8]) {
                bytes.copy_from_slice(&self.to_ne_bytes());
            }

            fn accumulate(self, other: Self) -> Self {
                wrapping_sum(self, other)
            }

            fn bit_or(self, other: Self) -> Option<Self> {
                Some(self | other)
            }
        }
    };
}

macro_rules! float_element {
    ($t:ty, $variant:ident) => {
        impl private::Sealed for $t {}

        impl Element for $t {
            const TYPE: ElementType = ElementType::$variant;

            fn load(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$t>()];
                raw.copy_from_slice(bytes);
                <$t>::from_ne_bytes(raw)
            }

            fn store(self, bytes: &mut [u8]) {
                bytes.copy_from_slice(&self.to_ne_bytes());
            }

            fn accumulate(self, other: Self) -> Self {
                self + other
            }

            fn bit_or(self, _other: Self) -> Option<Self> {
                None
            }
        }
    };
}

integer_element!(i8, I8);
integer_element!(i16, I16);
integer_element!(i32, I32);
integer_element!(i64, I64);
integer_element!(u32, U32);
integer_element!(u64, U64);
float_element!(f32, F32);
float_element!(f64, F64);

/// View a slice of elements as its native bytes.
pub fn as_bytes<E: Element>(data: &[E]) -> &[u8] {
    // Element is only implemented for primitive numbers, which have no
    // padding and no invalid bit patterns.
    unsafe { std::slice::from_raw_parts(data.as_ptr() as *const u8, std::mem::size_of_val(data)) }
}

/// View a mutable slice of elements as its native bytes.
pub fn as_bytes_mut<E: Element>(data: &mut [E]) -> &mut [u8] {
    unsafe {
        std::slice::from_raw_parts_mut(data.as_mut_ptr() as *mut u8, std::mem::size_of_val(data))
    }
}
