//! Batch sizing under a record count and character budget.

/// Bounds on a single scoring call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    pub max_records: usize,
    pub max_chars: usize,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            max_records: 32,
            max_chars: 32 * 512,
        }
    }
}

/// Number of leading `texts` that fit in one batch.
///
/// Always at least one when `texts` is non-empty, so an oversized single
/// record still gets a chance at the scorer.
pub fn next_batch_len(texts: &[String], max_records: usize, max_chars: usize) -> usize {
    let mut chars = 0usize;
    let mut len = 0usize;
    for text in texts.iter().take(max_records.max(1)) {
        let n = text.chars().count();
        if len > 0 && chars + n > max_chars {
            break;
        }
        chars += n;
        len += 1;
    }
    len
}

/// Halve a batch size after resource exhaustion, never below one.
pub fn shrink(size: usize) -> usize {
    (size / 2).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(lens: &[usize]) -> Vec<String> {
        lens.iter().map(|n| "x".repeat(*n)).collect()
    }

    #[test]
    fn bounded_by_record_count() {
        assert_eq!(next_batch_len(&texts(&[1, 1, 1, 1]), 3, 100), 3);
    }

    #[test]
    fn bounded_by_char_budget() {
        assert_eq!(next_batch_len(&texts(&[40, 40, 40]), 10, 100), 2);
    }

    #[test]
    fn oversized_record_goes_alone() {
        assert_eq!(next_batch_len(&texts(&[500, 1]), 10, 100), 1);
        assert_eq!(next_batch_len(&[], 10, 100), 0);
    }

    #[test]
    fn shrink_floors_at_one() {
        assert_eq!(shrink(32), 16);
        assert_eq!(shrink(1), 1);
    }
}
