use crate::error::{MergeError, MergeResult};

/// Arguments of a full merge, borrowed from the engine for one call.
#[derive(Clone, Copy, Debug)]
pub struct MergeInput<'a> {
    pub key: &'a [u8],
    /// The value currently stored under `key`, if any.
    pub existing_value: Option<&'a [u8]>,
    /// Pending merge operands, oldest first.
    pub operands: &'a [&'a [u8]],
}

impl<'a> MergeInput<'a> {
    pub fn new(key: &'a [u8], existing_value: Option<&'a [u8]>, operands: &'a [&'a [u8]]) -> Self {
        Self {
            key,
            existing_value,
            operands,
        }
    }
}

/// The engine's general merge contract.
///
/// Implementations are called from arbitrary engine worker threads,
/// concurrently, with engine-owned byte ranges that must not be retained
/// past the call. Every result is an owned copy.
pub trait MergeOperator: Send + Sync {
    /// Stable operator name.
    fn name(&self) -> &str;

    /// Fold every operand into the existing value.
    fn full_merge(&self, input: &MergeInput<'_>) -> MergeResult<Vec<u8>>;

    /// Combine two adjacent operands. Declined by default.
    fn partial_merge(&self, _key: &[u8], _left: &[u8], _right: &[u8]) -> MergeResult<Vec<u8>> {
        Err(MergeError::NotCombinable)
    }

    /// Combine a run of operands. Folds [`partial_merge`](Self::partial_merge)
    /// pairwise by default.
    fn partial_merge_multi(&self, key: &[u8], operands: &[&[u8]]) -> MergeResult<Vec<u8>> {
        let (first, rest) = operands.split_first().ok_or(MergeError::NotCombinable)?;
        let mut acc = first.to_vec();
        for operand in rest {
            acc = self.partial_merge(key, &acc, operand)?;
        }
        Ok(acc)
    }

    /// Whether the engine should merge this operand set now rather than
    /// keep accumulating.
    fn should_merge(&self, _operands: &[&[u8]]) -> bool {
        false
    }

    /// Whether a full merge may be requested with a single operand.
    fn allow_single_operand(&self) -> bool {
        false
    }
}

/// A merge that combines exactly two values.
pub trait AssociativeMergeOperator: Send + Sync {
    fn name(&self) -> &str;

    /// Combine `value` into `existing`.
    fn merge(&self, key: &[u8], existing: Option<&[u8]>, value: &[u8]) -> MergeResult<Vec<u8>>;
}

/// Full merge expressed as a left fold of pairwise merges.
///
/// With no operands the existing value is returned as is; with neither an
/// existing value nor operands there is nothing to produce.
pub fn fold_full_merge(op: &dyn AssociativeMergeOperator, input: &MergeInput<'_>) -> MergeResult<Vec<u8>> {
    let mut acc = input.existing_value.map(<[u8]>::to_vec);
    for operand in input.operands {
        acc = Some(op.merge(input.key, acc.as_deref(), operand)?);
    }
    acc.ok_or(MergeError::NotCombinable)
}

/// Partial merge of an associative operator: the left operand plays the
/// existing value.
pub fn associative_partial_merge(
    op: &dyn AssociativeMergeOperator,
    key: &[u8],
    left: &[u8],
    right: &[u8],
) -> MergeResult<Vec<u8>> {
    op.merge(key, Some(left), right)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Appends with a comma separator; refuses operands equal to `stop`.
    struct Append {
        calls: AtomicUsize,
    }

    impl AssociativeMergeOperator for Append {
        fn name(&self) -> &str {
            "Append"
        }

        fn merge(&self, _key: &[u8], existing: Option<&[u8]>, value: &[u8]) -> MergeResult<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            if value == b"stop" {
                return Err(MergeError::NotCombinable);
            }
            let mut out = existing.map(<[u8]>::to_vec).unwrap_or_default();
            if !out.is_empty() {
                out.push(b',');
            }
            out.extend_from_slice(value);
            Ok(out)
        }
    }

    fn append() -> Append {
        Append {
            calls: AtomicUsize::new(0),
        }
    }

    struct Declines;

    impl MergeOperator for Declines {
        fn name(&self) -> &str {
            "Declines"
        }

        fn full_merge(&self, _input: &MergeInput<'_>) -> MergeResult<Vec<u8>> {
            Err(MergeError::NotCombinable)
        }
    }

    struct Sums;

    impl MergeOperator for Sums {
        fn name(&self) -> &str {
            "Sums"
        }

        fn full_merge(&self, _input: &MergeInput<'_>) -> MergeResult<Vec<u8>> {
            unreachable!()
        }

        fn partial_merge(&self, _key: &[u8], left: &[u8], right: &[u8]) -> MergeResult<Vec<u8>> {
            Ok(vec![left[0] + right[0]])
        }
    }

    // -----------------------------------------------------------------------
    // Folding
    // -----------------------------------------------------------------------

    #[test]
    fn full_merge_folds_left() {
        let op = append();
        let operands: [&[u8]; 2] = [b"b", b"c"];
        let out = fold_full_merge(&op, &MergeInput::new(b"k", Some(&b"a"[..]), &operands)).unwrap();
        assert_eq!(out, b"a,b,c");
        assert_eq!(op.calls.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn full_merge_without_existing() {
        let op = append();
        let operands: [&[u8]; 2] = [b"x", b"y"];
        let out = fold_full_merge(&op, &MergeInput::new(b"k", None, &operands)).unwrap();
        assert_eq!(out, b"x,y");
    }

    #[test]
    fn full_merge_edges() {
        let op = append();
        assert_eq!(
            fold_full_merge(&op, &MergeInput::new(b"k", Some(&b"a"[..]), &[])).unwrap(),
            b"a"
        );
        assert_eq!(
            fold_full_merge(&op, &MergeInput::new(b"k", None, &[])),
            Err(MergeError::NotCombinable)
        );

        let operands: [&[u8]; 3] = [b"b", b"stop", b"c"];
        assert_eq!(
            fold_full_merge(&op, &MergeInput::new(b"k", Some(&b"a"[..]), &operands)),
            Err(MergeError::NotCombinable)
        );
        assert_eq!(op.calls.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn partial_merge_uses_left_as_existing() {
        let op = append();
        assert_eq!(associative_partial_merge(&op, b"k", b"l", b"r").unwrap(), b"l,r");
    }

    // -----------------------------------------------------------------------
    // Trait defaults
    // -----------------------------------------------------------------------

    #[test]
    fn defaults_decline() {
        let op = Declines;
        let operands: [&[u8]; 2] = [b"a", b"b"];
        assert_eq!(op.partial_merge(b"k", b"a", b"b"), Err(MergeError::NotCombinable));
        assert_eq!(op.partial_merge_multi(b"k", &operands), Err(MergeError::NotCombinable));
        assert_eq!(op.partial_merge_multi(b"k", &[]), Err(MergeError::NotCombinable));
        assert!(!op.should_merge(&operands));
        assert!(!op.allow_single_operand());
    }

    #[test]
    fn partial_merge_multi_folds_pairwise() {
        let op = Sums;
        let operands: [&[u8]; 3] = [&[1], &[2], &[3]];
        assert_eq!(op.partial_merge_multi(b"k", &operands).unwrap(), vec![6]);
        assert_eq!(op.partial_merge_multi(b"k", &operands[..1]).unwrap(), vec![1]);
    }
}
