//! Sharechain difficulty retargeting.

use std::time::Duration;

use num_bigint::BigUint;
use num_traits::Zero;

use peerpool_types::constants::{max_share_target, DIFFICULTY_ADJUSTMENT_WINDOW};
use peerpool_types::hash::{compact_to_target, target_to_compact};
use peerpool_types::Share;

/// Adjusts the share target from a window of recent shares.
pub struct DifficultyCalculator {
    target_time: Duration,
}

impl DifficultyCalculator {
    pub fn new(target_time: Duration) -> Self {
        Self { target_time }
    }

    /// Compute the next share target from a window of shares, newest first.
    ///
    /// `next = newest.target * actual_time / expected_time`, clamped to a 4x
    /// step in either direction and to the global maximum target.
    ///
    /// The window is first trimmed to shares whose target is within 4x of
    /// the newest share's. A cold-started chain holds shares at wildly
    /// different targets, and near-instant max-target shares would dominate
    /// the timing average long after the real difficulty has been found,
    /// producing overshoot or glacial convergence. The trim restricts the
    /// timing signal to a single-difficulty regime, matching the 4x
    /// per-step clamp.
    pub fn next_target(&self, shares: &[Share]) -> BigUint {
        if shares.len() < 2 {
            return max_share_target();
        }

        let mut window = &shares[..shares.len().min(DIFFICULTY_ADJUSTMENT_WINDOW)];

        let current_target = &window[0].share_target;
        if current_target.is_zero() {
            return max_share_target();
        }

        let upper = current_target * 4u32;
        let lower = current_target / 4u32;
        for i in 1..window.len() {
            let st = &window[i].share_target;
            if st.is_zero() || *st > upper || *st < lower {
                window = &window[..i];
                break;
            }
        }

        if window.len() < 2 {
            // Too few comparable-difficulty shares for a timing-based step;
            // hand back the current target, normalized.
            return compact_to_target(target_to_compact(current_target));
        }

        let newest = &window[0];
        let oldest = &window[window.len() - 1];

        let actual =
            (newest.header.timestamp as i64 - oldest.header.timestamp as i64).max(1) as u64;
        let expected = (self.target_time.as_secs() * (window.len() as u64 - 1)).max(1);

        let mut next = (current_target * actual) / expected;

        let max_adjust = current_target * 4u32;
        let min_adjust = current_target / 4u32;
        if next > max_adjust {
            next = max_adjust;
        }
        if next < min_adjust {
            next = min_adjust;
        }

        let global_max = max_share_target();
        if next > global_max {
            next = global_max;
        }

        // Normalize through the compact round-trip so every node lands on
        // the identical value whether the share was mined locally or arrived
        // over the wire as compact bits.
        compact_to_target(target_to_compact(&next))
    }
}
