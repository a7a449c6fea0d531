//! Timestamp -> block height by binary search over on-chain block times.

use std::future::Future;

/// Smallest block in `[0, latest]` whose timestamp is `>= target`, or `latest + 1` when
/// no block qualifies. Block times must be non-decreasing in height.
pub async fn first_block_at_or_after<F, Fut, E>(latest: u64, target: i64, mut block_time: F) -> Result<u64, E>
where
    F: FnMut(u64) -> Fut,
    Fut: Future<Output = Result<i64, E>>,
{
    let mut lo = 0u64;
    let mut hi = latest.saturating_add(1);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if block_time(mid).await? >= target {
            hi = mid;
        } else {
            lo = mid + 1;
        }
    }
    Ok(lo)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    async fn locate(series: &[i64], target: i64) -> (u64, usize) {
        let calls = Cell::new(0usize);
        let latest = series.len() as u64 - 1;
        let found = first_block_at_or_after(latest, target, |n| {
            calls.set(calls.get() + 1);
            let t = series[n as usize];
            async move { Ok::<_, ()>(t) }
        })
        .await
        .unwrap();
        (found, calls.get())
    }

    #[tokio::test]
    async fn finds_first_block_at_or_after_target() {
        let series = [100, 100, 110, 120, 120, 120, 130];
        assert_eq!(locate(&series, 0).await.0, 0);
        assert_eq!(locate(&series, 100).await.0, 0);
        assert_eq!(locate(&series, 101).await.0, 2);
        assert_eq!(locate(&series, 120).await.0, 3);
        assert_eq!(locate(&series, 130).await.0, 6);
        assert_eq!(locate(&series, 131).await.0, 7);
    }

    #[tokio::test]
    async fn logarithmic_lookups() {
        let series: Vec<i64> = (0..100_000).map(|n| 1_600_000_000 + n * 2).collect();
        let (found, calls) = locate(&series, 1_600_000_000 + 2 * 54_321).await;
        assert_eq!(found, 54_321);
        assert!(calls <= 18, "{calls}");
        let (found, _) = locate(&series, 1_600_000_000 + 2 * 54_321 - 1).await;
        assert_eq!(found, 54_321);
    }

    #[tokio::test]
    async fn errors_propagate() {
        let r = first_block_at_or_after(10, 5, |_| async { Err::<i64, &str>("rpc down") }).await;
        assert_eq!(r, Err("rpc down"));
    }
}
