//! Deterministic PPLNS payout distribution.

use std::collections::BTreeMap;

use num_bigint::BigUint;
use num_traits::{ToPrimitive, Zero};
use peerpool_types::PayoutEntry;

use crate::window::Window;

/// Computes PPLNS payouts from a window of shares.
pub struct Calculator {
    finder_fee_percent: f64,
    dust_threshold_sats: u64,
}

impl Calculator {
    pub fn new(finder_fee_percent: f64, dust_threshold_sats: u64) -> Self {
        Self {
            finder_fee_percent,
            dust_threshold_sats,
        }
    }

    /// Distribute `total_reward` satoshis over the window's miners.
    ///
    /// `finder_address` is the miner whose share became a block; it receives
    /// the finder fee, every rounding remainder, and consolidated dust. The
    /// emitted amounts always sum to `total_reward` unless every payout is
    /// below the dust threshold (in which case all are kept as-is).
    pub fn calculate_payouts(
        &self,
        window: &Window,
        total_reward: i64,
        finder_address: &str,
    ) -> Vec<PayoutEntry> {
        if window.share_count() == 0 || total_reward <= 0 {
            return Vec::new();
        }
        let total_reward = total_reward as u64;

        let finder_fee = (total_reward as f64 * self.finder_fee_percent / 100.0) as u64;
        let distributable = total_reward - finder_fee;

        let total_weight = window.total_weight();
        if total_weight.is_zero() {
            return Vec::new();
        }

        // BTreeMap keeps address iteration lexicographic, which makes the
        // division remainders land identically on every node.
        let miner_weights: BTreeMap<String, BigUint> =
            window.miner_weights().into_iter().collect();

        let mut payouts: BTreeMap<String, u64> = BTreeMap::new();
        let mut distributed: u64 = 0;

        for (addr, weight) in &miner_weights {
            let amount = ((BigUint::from(distributable) * weight) / &total_weight)
                .to_u64()
                .unwrap_or(distributable);
            if amount > 0 {
                payouts.insert(addr.clone(), amount);
                distributed += amount;
            }
        }

        if !finder_address.is_empty() && finder_fee > 0 {
            *payouts.entry(finder_address.to_string()).or_insert(0) += finder_fee;
            distributed += finder_fee;
        }

        // Rounding remainder goes to the finder, or the first address.
        let remainder = total_reward - distributed;
        if remainder > 0 {
            if !finder_address.is_empty() {
                *payouts.entry(finder_address.to_string()).or_insert(0) += remainder;
            } else if let Some(addr) = miner_weights.keys().next() {
                *payouts.entry(addr.clone()).or_insert(0) += remainder;
            }
        }

        self.consolidate_dust(&mut payouts, finder_address);

        let mut result: Vec<PayoutEntry> = payouts
            .into_iter()
            .map(|(address, amount)| PayoutEntry { address, amount })
            .collect();

        // Amount descending, then address ascending.
        result.sort_by(|a, b| b.amount.cmp(&a.amount).then(a.address.cmp(&b.address)));
        result
    }

    /// Fold sub-dust payouts into the finder (or the first surviving miner).
    /// If every payout is dust, keep them all rather than burn the reward.
    fn consolidate_dust(&self, payouts: &mut BTreeMap<String, u64>, finder_address: &str) {
        let dust_addresses: Vec<String> = payouts
            .iter()
            .filter(|(addr, amount)| {
                **amount < self.dust_threshold_sats && addr.as_str() != finder_address
            })
            .map(|(addr, _)| addr.clone())
            .collect();

        if dust_addresses.len() >= payouts.len() {
            return;
        }

        let mut dust_total: u64 = 0;
        for addr in &dust_addresses {
            if let Some(amount) = payouts.remove(addr) {
                dust_total += amount;
            }
        }

        if dust_total > 0 {
            if !finder_address.is_empty() {
                *payouts.entry(finder_address.to_string()).or_insert(0) += dust_total;
            } else if let Some(addr) = payouts.keys().next().cloned() {
                *payouts.entry(addr).or_insert(0) += dust_total;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_bigint::BigUint;
    use num_traits::One;
    use peerpool_types::{Share, ShareHeader};

    fn easy_target() -> BigUint {
        (BigUint::one() << 256u32) - 1u8
    }

    fn make_share(addr: &str, target: BigUint) -> Share {
        Share::new(
            ShareHeader::default(),
            1,
            [0u8; 32],
            target,
            addr.to_string(),
            Vec::new(),
        )
    }

    #[test]
    fn test_equal_shares_split_evenly() {
        let max = easy_target();
        let target = &max / 2u32;

        let shares = vec![
            make_share("miner1", target.clone()),
            make_share("miner2", target.clone()),
            make_share("miner1", target.clone()),
            make_share("miner2", target),
        ];
        let window = Window::new(shares, max);
        let calc = Calculator::new(0.0, 546);

        let payouts = calc.calculate_payouts(&window, 1_000_000, "miner1");

        let total: u64 = payouts.iter().map(|p| p.amount).sum();
        assert_eq!(total, 1_000_000);

        for p in &payouts {
            assert!(
                (490_000..=510_000).contains(&p.amount),
                "{} got {}",
                p.address,
                p.amount
            );
        }

        // Equal weights must land within one satoshi of each other.
        let diff = payouts[0].amount.abs_diff(payouts[1].amount);
        assert!(diff <= 1, "spread {diff}");
    }

    #[test]
    fn test_finder_fee_favors_finder() {
        let max = easy_target();
        let shares = vec![
            make_share("miner1", max.clone()),
            make_share("miner2", max.clone()),
        ];
        let window = Window::new(shares, max);
        let calc = Calculator::new(0.5, 546);

        let total_reward = 5_000_000_000i64;
        let payouts = calc.calculate_payouts(&window, total_reward, "miner1");

        let total: u64 = payouts.iter().map(|p| p.amount).sum();
        assert_eq!(total, total_reward as u64);

        let get = |addr: &str| {
            payouts
                .iter()
                .find(|p| p.address == addr)
                .map(|p| p.amount)
                .unwrap_or(0)
        };
        assert!(get("miner1") > get("miner2"));
    }

    #[test]
    fn test_dust_consolidation() {
        let max = easy_target();

        // 999 shares for one miner, 1 for another; with 1000 sats total the
        // tiny miner's single satoshi is dust.
        let mut shares = Vec::with_capacity(1000);
        for _ in 0..999 {
            shares.push(make_share("bigminer", max.clone()));
        }
        shares.push(make_share("tinyminer", max.clone()));

        let window = Window::new(shares, max);
        let calc = Calculator::new(0.0, 546);

        let payouts = calc.calculate_payouts(&window, 1000, "bigminer");

        assert!(
            payouts.iter().all(|p| p.address != "tinyminer"),
            "tiny miner should be consolidated as dust"
        );
        let total: u64 = payouts.iter().map(|p| p.amount).sum();
        assert_eq!(total, 1000);
    }

    #[test]
    fn test_all_dust_kept() {
        let max = easy_target();
        let shares = vec![
            make_share("miner1", max.clone()),
            make_share("miner2", max.clone()),
        ];
        let window = Window::new(shares, max);
        let calc = Calculator::new(0.0, 546);

        // 100 sats split two ways: both payouts are dust, neither is the
        // finder. Both must survive.
        let payouts = calc.calculate_payouts(&window, 100, "");
        assert_eq!(payouts.len(), 2);
        let total: u64 = payouts.iter().map(|p| p.amount).sum();
        assert_eq!(total, 100);
    }

    #[test]
    fn test_empty_window() {
        let window = Window::new(Vec::new(), easy_target());
        let calc = Calculator::new(0.5, 546);
        assert!(calc.calculate_payouts(&window, 1_000_000, "m").is_empty());
    }

    #[test]
    fn test_non_positive_reward() {
        let max = easy_target();
        let window = Window::new(vec![make_share("m", max.clone())], max);
        let calc = Calculator::new(0.5, 546);
        assert!(calc.calculate_payouts(&window, 0, "m").is_empty());
        assert!(calc.calculate_payouts(&window, -5, "m").is_empty());
    }

    #[test]
    fn test_single_miner_takes_all() {
        let max = easy_target();
        let shares = vec![
            make_share("solo", max.clone()),
            make_share("solo", max.clone()),
            make_share("solo", max.clone()),
        ];
        let window = Window::new(shares, max);
        let calc = Calculator::new(0.5, 546);

        let payouts = calc.calculate_payouts(&window, 5_000_000_000, "solo");
        assert_eq!(payouts.len(), 1);
        assert_eq!(payouts[0].amount, 5_000_000_000);
    }

    #[test]
    fn test_sorted_by_amount_then_address() {
        let max = easy_target();
        let quarter = &max / 4u32;
        let shares = vec![
            make_share("zz_light", max.clone()),
            make_share("aa_heavy", quarter.clone()),
            make_share("mm_heavy", quarter),
        ];
        let window = Window::new(shares, max);
        let calc = Calculator::new(0.0, 0);

        let payouts = calc.calculate_payouts(&window, 900_000, "");
        assert_eq!(payouts.len(), 3);
        assert!(payouts[0].amount >= payouts[1].amount);
        // Equal-weight miners tie on amount and fall back to address order.
        assert!(payouts[0].address < payouts[1].address);
    }
}
