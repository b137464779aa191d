//! Numeric conversions between sequence numbers (u32), sizes (usize) and bitset positions.
//!  `as` casts are easy to get wrong silently, so conversions go through these traits, which
//!  document at the call site whether a cast is lossless or relies on a checked precondition.

/// Lossless widening casts
pub trait SafeCast<T> {
    fn safe_cast(self) -> T;
}

#[cfg(not(target_pointer_width = "16"))]
impl SafeCast<usize> for u32 {
    fn safe_cast(self) -> usize {
        self as usize
    }
}

impl SafeCast<u64> for u32 {
    fn safe_cast(self) -> u64 {
        self as u64
    }
}


/// For narrowing casts where business logic ensures that the value is in the narrower type's range.
/// NB: The implementations will panic otherwise
pub trait PrecheckedCast<T> {
    fn prechecked_cast(self) -> T;
}
impl PrecheckedCast<u32> for usize {
    fn prechecked_cast(self) -> u32 {
        self.try_into().expect("this is a bug: application logic should have ensured the value range")
    }
}
impl PrecheckedCast<u32> for u64 {
    fn prechecked_cast(self) -> u32 {
        self.try_into().expect("this is a bug: application logic should have ensured the value range")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::zero(0)]
    #[case::one(1)]
    #[case::max(u32::MAX)]
    fn test_widening(#[case] value: u32) {
        let as_usize: usize = value.safe_cast();
        let as_u64: u64 = value.safe_cast();
        assert_eq!(as_usize, value as usize);
        assert_eq!(as_u64, value as u64);
    }

    #[rstest]
    #[case::zero(0)]
    #[case::max(u32::MAX as usize)]
    fn test_prechecked_in_range(#[case] value: usize) {
        let narrowed: u32 = value.prechecked_cast();
        assert_eq!(narrowed as usize, value);
    }

    #[test]
    #[should_panic]
    fn test_prechecked_out_of_range() {
        let _: u32 = (u32::MAX as u64 + 1).prechecked_cast();
    }
}
