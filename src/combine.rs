//! Elementwise combination of two equally laid out buffers.

use crate::{
    element::Element,
    error::{Error, Result},
    op::{expand, CombineOp, ElementType, Operator},
};

/// Combine one run of elements of type `element_type` from `src` into `dest`.
///
/// Both slices hold the native bytes of the same number of elements.
pub fn apply(
    operator: Operator,
    element_type: ElementType,
    dest: &mut [u8],
    src: &[u8],
) -> Result<()> {
    debug_assert_eq!(dest.len(), src.len());
    debug_assert_eq!(dest.len() % element_type.width(), 0);

    match element_type {
        ElementType::I8 => apply_typed::<i8>(operator, dest, src),
        ElementType::I16 => apply_typed::<i16>(operator, dest, src),
        ElementType::I32 => apply_typed::<i32>(operator, dest, src),
        ElementType::I64 => apply_typed::<i64>(operator, dest, src),
        ElementType::U32 => apply_typed::<u32>(operator, dest, src),
        ElementType::U64 => apply_typed::<u64>(operator, dest, src),
        ElementType::F32 => apply_typed::<f32>(operator, dest, src),
        ElementType::F64 => apply_typed::<f64>(operator, dest, src),
    }
}

fn apply_typed<E: Element>(operator: Operator, dest: &mut [u8], src: &[u8]) -> Result<()> {
    match operator {
        Operator::NoOp => {}
        Operator::Add => zip_with::<E>(dest, src, E::accumulate),
        Operator::Max => zip_with::<E>(dest, src, |d, s| if s > d { s } else { d }),
        Operator::Min => zip_with::<E>(dest, src, |d, s| if s < d { s } else { d }),
        Operator::LogicalOr => {
            if E::TYPE.is_float() {
                return Err(Error::UnsupportedOperation {
                    operator,
                    element_type: E::TYPE,
                });
            }
            zip_with::<E>(dest, src, |d, s| d.bit_or(s).unwrap_or(d))
        }
        Operator::RepeatGroup => {
            return Err(Error::UnsupportedOperation {
                operator,
                element_type: E::TYPE,
            })
        }
    }
    Ok(())
}

fn zip_with<E: Element>(dest: &mut [u8], src: &[u8], f: impl Fn(E, E) -> E) {
    let width = E::TYPE.width();
    for (d, s) in dest.chunks_exact_mut(width).zip(src.chunks_exact(width)) {
        f(E::load(d), E::load(s)).store(d);
    }
}

/// Combine `src` into `dest` as described by `ops`.
///
/// Repeat groups are expanded. Returns the number of bytes consumed from each
/// buffer.
pub fn combine(dest: &mut [u8], src: &[u8], ops: &[CombineOp]) -> Result<usize> {
    let mut cursor = 0;
    for op in expand(ops) {
        let op = op?;
        let end = cursor + op.byte_len();
        if end > dest.len() || end > src.len() {
            return Err(Error::BufferOverrun {
                context: "combine",
                needed: end,
                available: dest.len().min(src.len()),
            });
        }
        apply(
            op.operator,
            op.element_type,
            &mut dest[cursor..end],
            &src[cursor..end],
        )?;
        cursor = end;
    }
    Ok(cursor)
}
