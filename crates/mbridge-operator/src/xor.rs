use crate::contract::{fold_full_merge, AssociativeMergeOperator, MergeInput, MergeOperator};
use crate::error::{MergeError, MergeResult};

/// Byte-wise XOR of two equal-length values.
///
/// A missing existing value yields a copy of `value`. Lengths must match
/// exactly; nothing is padded or truncated.
pub fn xor_merge(existing: Option<&[u8]>, value: &[u8]) -> MergeResult<Vec<u8>> {
    let Some(existing) = existing else {
        return Ok(value.to_vec());
    };
    if existing.len() != value.len() {
        return Err(MergeError::NotCombinable);
    }
    Ok(existing.iter().zip(value).map(|(a, b)| a ^ b).collect())
}

/// The native XOR combinator. Never calls into managed code.
#[derive(Clone, Copy, Debug, Default)]
pub struct XorOperator;

impl AssociativeMergeOperator for XorOperator {
    fn name(&self) -> &str {
        "XorMergeOperator"
    }

    fn merge(&self, _key: &[u8], existing: Option<&[u8]>, value: &[u8]) -> MergeResult<Vec<u8>> {
        xor_merge(existing, value)
    }
}

impl MergeOperator for XorOperator {
    fn name(&self) -> &str {
        AssociativeMergeOperator::name(self)
    }

    fn full_merge(&self, input: &MergeInput<'_>) -> MergeResult<Vec<u8>> {
        fold_full_merge(self, input)
    }

    fn partial_merge(&self, _key: &[u8], left: &[u8], right: &[u8]) -> MergeResult<Vec<u8>> {
        xor_merge(Some(left), right)
    }
}
