//! Round-robin selection.

/// Pick the next index for a rotating counter value.
pub fn pick(len: usize, tick: usize) -> Option<usize> {
    if len == 0 {
        return None;
    }
    Some(tick % len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_robin() {
        assert_eq!(pick(2, 0), Some(0));
        assert_eq!(pick(2, 1), Some(1));
        assert_eq!(pick(2, 2), Some(0));
        assert_eq!(pick(0, 7), None);
    }
}
