//! Range bounds — block heights or ISO dates, resolved against the chain.
//!
//! Dates resolve by binary search over block timestamps: a start date maps
//! to the first block at or after its UTC midnight, an end date to the last
//! block before the following midnight. Timestamps are assumed
//! non-decreasing across heights, as they effectively are for the
//! bitcoin-family chains this targets.

use std::str::FromStr;

use chrono::{NaiveDate, NaiveTime};

use crate::chain::ChainReader;
use crate::error::ScanError;

/// A caller-supplied bound of a scan range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeBound {
    Height(u64),
    Date(NaiveDate),
}

impl FromStr for RangeBound {
    type Err = ScanError;

    /// All-digits parses as a height, `YYYY-MM-DD` as a date.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) {
            let height = s
                .parse::<u64>()
                .map_err(|e| ScanError::InvalidInput(format!("bad height {s:?}: {e}")))?;
            return Ok(Self::Height(height));
        }
        NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map(Self::Date)
            .map_err(|_| {
                ScanError::InvalidInput(format!(
                    "bound {s:?} is neither a height nor a YYYY-MM-DD date"
                ))
            })
    }
}

fn midnight_utc(date: NaiveDate) -> i64 {
    date.and_time(NaiveTime::MIN).and_utc().timestamp()
}

/// Resolve a `(start, end)` bound pair to concrete heights.
///
/// Reversed ranges and dates that lie entirely before the genesis block's
/// day are invalid input; an end date after the tip clamps to the tip.
pub async fn resolve_range<C: ChainReader + ?Sized>(
    chain: &C,
    start: &RangeBound,
    end: &RangeBound,
) -> Result<(u64, u64), ScanError> {
    let start_height = match start {
        RangeBound::Height(h) => *h,
        RangeBound::Date(date) => {
            let next_midnight = date
                .succ_opt()
                .map(midnight_utc)
                .ok_or_else(|| ScanError::InvalidInput(format!("start date {date} out of range")))?;
            if next_midnight <= block_time(chain, 0).await? {
                return Err(ScanError::InvalidInput(format!(
                    "start date {date} precedes the genesis block"
                )));
            }
            first_height_at_or_after(chain, midnight_utc(*date))
                .await?
                .ok_or_else(|| {
                    ScanError::InvalidInput(format!("start date {date} is after the chain tip"))
                })?
        }
    };
    let end_height = match end {
        RangeBound::Height(h) => *h,
        RangeBound::Date(date) => {
            let next_midnight = date
                .succ_opt()
                .map(midnight_utc)
                .ok_or_else(|| ScanError::InvalidInput(format!("end date {date} out of range")))?;
            match first_height_at_or_after(chain, next_midnight).await? {
                // The block right before the first one of the next day…
                Some(0) => {
                    return Err(ScanError::InvalidInput(format!(
                        "end date {date} precedes the genesis block"
                    )))
                }
                Some(h) => h - 1,
                // …or the tip, when the whole chain predates that midnight.
                None => chain.height().await?,
            }
        }
    };
    if start_height > end_height {
        return Err(ScanError::InvalidInput(format!(
            "range reversed: {start_height} > {end_height}"
        )));
    }
    Ok((start_height, end_height))
}

/// Smallest height whose block timestamp is at or after `ts`, or `None`
/// when even the tip is older.
async fn first_height_at_or_after<C: ChainReader + ?Sized>(
    chain: &C,
    ts: i64,
) -> Result<Option<u64>, ScanError> {
    let tip = chain.height().await?;
    if block_time(chain, tip).await? < ts {
        return Ok(None);
    }
    let (mut lo, mut hi) = (0u64, tip);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if block_time(chain, mid).await? < ts {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    Ok(Some(lo))
}

async fn block_time<C: ChainReader + ?Sized>(chain: &C, height: u64) -> Result<i64, ScanError> {
    let hash = chain.block_hash(height).await?;
    Ok(chain.block(&hash).await?.time)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MemoryChain;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    /// One block per six hours starting at 2024-01-01 00:00 UTC.
    fn quarter_day_chain(blocks: u64) -> MemoryChain {
        let chain = MemoryChain::new();
        let genesis = midnight_utc(date("2024-01-01"));
        for i in 0..blocks {
            chain.add_block_at(genesis + i as i64 * 21_600, vec![]);
        }
        chain
    }

    #[test]
    fn parses_heights_and_dates() {
        assert_eq!("123".parse::<RangeBound>().unwrap(), RangeBound::Height(123));
        assert_eq!(
            "2024-06-01".parse::<RangeBound>().unwrap(),
            RangeBound::Date(date("2024-06-01"))
        );
        assert!("6pm".parse::<RangeBound>().is_err());
        assert!("2024-13-01".parse::<RangeBound>().is_err());
        assert!("".parse::<RangeBound>().is_err());
    }

    #[tokio::test]
    async fn date_bounds_cover_whole_days() {
        // 12 blocks: Jan 1 (0–3), Jan 2 (4–7), Jan 3 (8–11)
        let chain = quarter_day_chain(12);
        let (start, end) = resolve_range(
            &chain,
            &RangeBound::Date(date("2024-01-02")),
            &RangeBound::Date(date("2024-01-02")),
        )
        .await
        .unwrap();
        assert_eq!((start, end), (4, 7));
    }

    #[tokio::test]
    async fn mixed_height_and_date_bounds() {
        let chain = quarter_day_chain(12);
        let (start, end) = resolve_range(
            &chain,
            &RangeBound::Height(2),
            &RangeBound::Date(date("2024-01-03")),
        )
        .await
        .unwrap();
        // Jan 3 runs to the tip
        assert_eq!((start, end), (2, 11));
    }

    #[tokio::test]
    async fn end_date_before_genesis_is_invalid() {
        let chain = quarter_day_chain(4);
        let err = resolve_range(
            &chain,
            &RangeBound::Height(0),
            &RangeBound::Date(date("2023-12-25")),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ScanError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn start_date_after_tip_is_invalid() {
        let chain = quarter_day_chain(4);
        let err = resolve_range(
            &chain,
            &RangeBound::Date(date("2024-02-01")),
            &RangeBound::Height(3),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ScanError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn reversed_range_is_invalid() {
        let chain = quarter_day_chain(4);
        let err = resolve_range(&chain, &RangeBound::Height(3), &RangeBound::Height(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn genesis_day_start_date_is_valid() {
        let chain = quarter_day_chain(4);
        let (start, end) = resolve_range(
            &chain,
            &RangeBound::Date(date("2024-01-01")),
            &RangeBound::Height(3),
        )
        .await
        .unwrap();
        assert_eq!((start, end), (0, 3));
    }

    #[tokio::test]
    async fn start_date_before_genesis_is_invalid() {
        let chain = quarter_day_chain(4);
        let err = resolve_range(
            &chain,
            &RangeBound::Date(date("2023-12-25")),
            &RangeBound::Height(3),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ScanError::InvalidInput(_)));
    }
}
