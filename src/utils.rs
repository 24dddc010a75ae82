//! Alignment arithmetic shared by the allocator, the memory manager and the harness.

/// Rounds `val` up to the next multiple of `align`.
///
/// `align` must be a power of two. Returns `None` on overflow.
#[must_use]
pub const fn align_up(val: usize, align: usize) -> Option<usize> {
    match val.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

/// Padding needed to move `val` up to the next multiple of `align`.
#[must_use]
pub const fn align_padding(val: usize, align: usize) -> usize {
    (align - (val & (align - 1))) & (align - 1)
}

#[must_use]
pub const fn is_valid_alignment(align: usize) -> bool {
    align.is_power_of_two()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_multiple() {
        assert_eq!(align_up(0, 64), Some(0));
        assert_eq!(align_up(1, 64), Some(64));
        assert_eq!(align_up(64, 64), Some(64));
        assert_eq!(align_up(65, 1), Some(65));
        assert_eq!(align_up(usize::MAX, 64), None);
    }

    #[test]
    fn padding_matches_align_up() {
        for val in [0usize, 1, 63, 64, 100, 4095, 4096] {
            for align in [1usize, 8, 64, 4096] {
                let aligned = align_up(val, align).unwrap();
                assert_eq!(val + align_padding(val, align), aligned);
            }
        }
    }

    #[test]
    fn alignment_must_be_power_of_two() {
        assert!(is_valid_alignment(1));
        assert!(is_valid_alignment(64));
        assert!(!is_valid_alignment(0));
        assert!(!is_valid_alignment(48));
    }
}
