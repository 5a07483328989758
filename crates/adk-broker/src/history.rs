use std::future::Future;

use adk_schemas::{Candle, Interval};
use chrono::{Duration, NaiveDate};

use crate::error::BrokerError;

/// Split `[from, to]` (inclusive) into consecutive spans of at most
/// `max_days` days each.
pub fn chunk_date_ranges(from: NaiveDate, to: NaiveDate, max_days: i64) -> Vec<(NaiveDate, NaiveDate)> {
    let mut ranges = Vec::new();
    if from > to || max_days < 1 {
        return ranges;
    }

    let mut start = from;
    while start <= to {
        let end = (start + Duration::days(max_days - 1)).min(to);
        ranges.push((start, end));
        start = end + Duration::days(1);
    }
    ranges
}

/// Concatenate chunk responses, sort ascending by timestamp, and drop
/// duplicate timestamps (chunk boundaries often overlap by one bar).
pub fn merge_candle_chunks(chunks: Vec<Vec<Candle>>) -> Vec<Candle> {
    let mut all: Vec<Candle> = chunks.into_iter().flatten().collect();
    all.sort_by_key(|c| c.ts);
    all.dedup_by_key(|c| c.ts);
    all
}

/// Drive a per-chunk fetcher over the full range, honoring the interval's
/// per-request day limit, and merge the results.
pub async fn fetch_history_chunked<F, Fut>(
    interval: Interval,
    from: NaiveDate,
    to: NaiveDate,
    fetch_chunk: F,
) -> Result<Vec<Candle>, BrokerError>
where
    F: Fn(NaiveDate, NaiveDate) -> Fut,
    Fut: Future<Output = Result<Vec<Candle>, BrokerError>>,
{
    let mut chunks = Vec::new();
    for (start, end) in chunk_date_ranges(from, to, interval.max_days_per_request()) {
        chunks.push(fetch_chunk(start, end).await?);
    }
    Ok(merge_candle_chunks(chunks))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    fn candle(ts_secs: i64) -> Candle {
        Candle {
            ts: Utc.timestamp_opt(ts_secs, 0).unwrap(),
            open_micros: 100,
            high_micros: 110,
            low_micros: 90,
            close_micros: 105,
            volume: 1,
        }
    }

    #[test]
    fn single_range_when_span_fits() {
        let ranges = chunk_date_ranges(day(1), day(10), 100);
        assert_eq!(ranges, vec![(day(1), day(10))]);
    }

    #[test]
    fn splits_at_exact_limit() {
        let ranges = chunk_date_ranges(day(1), day(10), 5);
        assert_eq!(ranges, vec![(day(1), day(5)), (day(6), day(10))]);
    }

    #[test]
    fn empty_when_reversed() {
        assert!(chunk_date_ranges(day(10), day(1), 5).is_empty());
    }

    #[test]
    fn long_intraday_range_chunks_by_100_days() {
        // 250-day span with a 100-day limit -> 3 chunks.
        let from = NaiveDate::from_ymd_opt(2023, 1, 1).unwrap();
        let to = from + Duration::days(249);
        let ranges = chunk_date_ranges(from, to, Interval::Min15.max_days_per_request());
        assert_eq!(ranges.len(), 3);
        // Spans are contiguous and non-overlapping.
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].1 + Duration::days(1), pair[1].0);
        }
        assert_eq!(ranges[0].0, from);
        assert_eq!(ranges[2].1, to);
    }

    #[test]
    fn merge_sorts_and_dedupes_boundary_overlap() {
        let merged = merge_candle_chunks(vec![
            vec![candle(300), candle(100), candle(200)],
            vec![candle(300), candle(400)],
        ]);
        let stamps: Vec<i64> = merged.iter().map(|c| c.ts.timestamp()).collect();
        assert_eq!(stamps, vec![100, 200, 300, 400]);
    }

    #[tokio::test]
    async fn chunked_fetch_returns_strictly_increasing_union() {
        let from = NaiveDate::from_ymd_opt(2023, 1, 1).unwrap();
        let to = from + Duration::days(249);

        // Each chunk returns one candle per day, plus a duplicated candle at
        // its start date to simulate boundary overlap.
        let candles = fetch_history_chunked(Interval::Min15, from, to, |start, end| async move {
            let mut out = Vec::new();
            let mut d = start;
            while d <= end {
                let ts = d.and_hms_opt(9, 15, 0).unwrap().and_utc().timestamp();
                out.push(candle(ts));
                d += Duration::days(1);
            }
            // duplicate first bar
            let ts = start.and_hms_opt(9, 15, 0).unwrap().and_utc().timestamp();
            out.push(candle(ts));
            Ok(out)
        })
        .await
        .unwrap();

        assert_eq!(candles.len(), 250);
        for pair in candles.windows(2) {
            assert!(pair[0].ts < pair[1].ts, "timestamps must be strictly increasing");
        }
    }
}
