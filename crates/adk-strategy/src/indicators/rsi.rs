/// Relative Strength Index over `period` price changes.
///
/// Uses the simple average of the trailing `period` gains and losses:
///
/// ```text
/// RS  = avg_gain / avg_loss
/// RSI = 100 - 100 / (1 + RS)
/// ```
///
/// Returns one entry per input close; the first `period` entries are `None`
/// (the window needs `period` deltas). When the window has no losses the
/// RSI is 100.
pub fn calculate_rsi(closes: &[f64], period: usize) -> Vec<Option<f64>> {
    if period == 0 || closes.len() < period + 1 {
        return vec![None; closes.len()];
    }

    // deltas[k] = closes[k + 1] - closes[k]
    let deltas: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();

    let mut result = Vec::with_capacity(closes.len());
    for i in 0..closes.len() {
        if i < period {
            result.push(None);
            continue;
        }

        let window = &deltas[i - period..i];
        let mut sum_gain = 0.0f64;
        let mut sum_loss = 0.0f64;
        for &d in window {
            if d > 0.0 {
                sum_gain += d;
            } else {
                sum_loss += -d;
            }
        }

        let avg_gain = sum_gain / period as f64;
        let avg_loss = sum_loss / period as f64;

        let rsi = if avg_loss == 0.0 {
            100.0
        } else {
            let rs = avg_gain / avg_loss;
            100.0 - 100.0 / (1.0 + rs)
        };
        result.push(Some(rsi));
    }

    result
}

/// Most recent RSI value, if computable.
pub fn last_rsi(closes: &[f64], period: usize) -> Option<f64> {
    calculate_rsi(closes, period).last().copied().flatten()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rsi_insufficient_data_is_all_none() {
        let closes: Vec<f64> = (1..=14).map(|x| x as f64).collect();
        assert!(calculate_rsi(&closes, 14).iter().all(Option::is_none));
    }

    #[test]
    fn rsi_period_zero_is_all_none() {
        assert_eq!(calculate_rsi(&[1.0, 2.0, 3.0], 0), vec![None, None, None]);
    }

    #[test]
    fn rsi_all_gains_is_100() {
        let closes: Vec<f64> = (1..=30).map(|x| x as f64).collect();
        let series = calculate_rsi(&closes, 14);
        for v in series.iter().flatten() {
            assert!((v - 100.0).abs() < 1e-10, "expected 100, got {v}");
        }
    }

    #[test]
    fn rsi_all_losses_is_0() {
        let closes: Vec<f64> = (1..=30).rev().map(|x| x as f64).collect();
        let series = calculate_rsi(&closes, 14);
        for v in series.iter().flatten() {
            assert!(v.abs() < 1e-10, "expected 0, got {v}");
        }
    }

    #[test]
    fn rsi_stays_in_range() {
        let closes = [
            44.34, 44.09, 44.15, 43.61, 44.33, 44.83, 45.10, 45.42, 45.84, 46.08, 45.89, 46.03,
            44.18, 44.22, 44.57, 43.42, 42.66, 43.13,
        ];
        for v in calculate_rsi(&closes, 14).iter().flatten() {
            assert!((0.0..=100.0).contains(v), "RSI {v} out of range");
        }
    }

    #[test]
    fn rsi_alignment_matches_close_index() {
        // 15 closes, period 14: only the final index carries a value.
        let closes: Vec<f64> = (1..=15).map(|x| x as f64).collect();
        let series = calculate_rsi(&closes, 14);
        assert_eq!(series.len(), 15);
        assert!(series[..14].iter().all(Option::is_none));
        assert!(series[14].is_some());
    }

    #[test]
    fn last_rsi_convenience() {
        let closes: Vec<f64> = (1..=20).map(|x| x as f64).collect();
        assert!((last_rsi(&closes, 14).unwrap() - 100.0).abs() < 1e-10);
    }
}
