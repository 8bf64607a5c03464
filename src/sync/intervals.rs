//! Closed block-range bookkeeping for the sync cache.
//!
//! `IntervalSet` is the pure form: sorted, disjoint, with adjoining ranges
//! collapsed ([a,b] and [b+1,c] merge). The persistence helpers keep
//! `sync_intervals` rows append-cheap (`ON CONFLICT DO NOTHING`) and rely on
//! `compact` to fold rows back into normal form.

use sqlx::AnyPool;

/// Inclusive block ranges, normalized.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntervalSet {
    ranges: Vec<(u64, u64)>,
}

impl IntervalSet {
    pub fn new() -> Self {
        IntervalSet::default()
    }

    pub fn from_ranges(ranges: impl IntoIterator<Item = (u64, u64)>) -> Self {
        let mut set = IntervalSet::new();
        for (from, to) in ranges {
            set.insert(from, to);
        }
        set
    }

    pub fn ranges(&self) -> &[(u64, u64)] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Insert `[from, to]`, merging overlapping and adjoining ranges.
    pub fn insert(&mut self, from: u64, to: u64) {
        assert!(from <= to, "inverted interval [{from}, {to}]");
        let mut merged = Vec::with_capacity(self.ranges.len() + 1);
        let mut new = (from, to);
        let mut placed = false;
        for &(a, b) in &self.ranges {
            if b.saturating_add(1) < new.0 {
                merged.push((a, b));
            } else if new.1.saturating_add(1) < a {
                if !placed {
                    merged.push(new);
                    placed = true;
                }
                merged.push((a, b));
            } else {
                new = (new.0.min(a), new.1.max(b));
            }
        }
        if !placed {
            merged.push(new);
        }
        self.ranges = merged;
    }

    /// `[from, to] \ self`, as normalized ranges. The missing-range planner.
    pub fn subtract_from(&self, from: u64, to: u64) -> Vec<(u64, u64)> {
        let mut missing = Vec::new();
        let mut cursor = from;
        for &(a, b) in &self.ranges {
            if b < cursor {
                continue;
            }
            if a > to {
                break;
            }
            if a > cursor {
                missing.push((cursor, a - 1));
            }
            cursor = cursor.max(b.saturating_add(1));
            if cursor > to {
                return missing;
            }
        }
        if cursor <= to {
            missing.push((cursor, to));
        }
        missing
    }

    pub fn covers(&self, from: u64, to: u64) -> bool {
        self.subtract_from(from, to).is_empty()
    }
}

/// Read the (possibly unnormalized) rows for a subscription and fold them.
pub async fn get_intervals(
    pool: &AnyPool,
    chain_id: u64,
    fingerprint: &str,
) -> Result<IntervalSet, sqlx::Error> {
    let rows: Vec<(i64, i64)> = sqlx::query_as(
        "SELECT from_block, to_block FROM sync_intervals
         WHERE chain_id = $1 AND fingerprint = $2",
    )
    .bind(chain_id as i64)
    .bind(fingerprint)
    .fetch_all(pool)
    .await?;
    Ok(IntervalSet::from_ranges(
        rows.into_iter().map(|(a, b)| (a as u64, b as u64)),
    ))
}

/// Record a completed range. Cheap and conflict-free; concurrent writers of
/// the same chunk converge on one row.
pub async fn insert_interval<'e, E>(
    executor: E,
    chain_id: u64,
    fingerprint: &str,
    from_block: u64,
    to_block: u64,
) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'e, Database = sqlx::Any>,
{
    sqlx::query(
        "INSERT INTO sync_intervals (chain_id, fingerprint, from_block, to_block)
         VALUES ($1, $2, $3, $4)
         ON CONFLICT (chain_id, fingerprint, from_block) DO NOTHING",
    )
    .bind(chain_id as i64)
    .bind(fingerprint)
    .bind(from_block as i64)
    .bind(to_block as i64)
    .execute(executor)
    .await?;
    Ok(())
}

/// Rewrite a subscription's rows in normal form. Runs periodically, not on
/// the write path.
pub async fn compact(
    pool: &AnyPool,
    chain_id: u64,
    fingerprint: &str,
) -> Result<(), sqlx::Error> {
    let set = get_intervals(pool, chain_id, fingerprint).await?;
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM sync_intervals WHERE chain_id = $1 AND fingerprint = $2")
        .bind(chain_id as i64)
        .bind(fingerprint)
        .execute(&mut *tx)
        .await?;
    for &(from, to) in set.ranges() {
        insert_interval(&mut *tx, chain_id, fingerprint, from, to).await?;
    }
    tx.commit().await?;
    Ok(())
}
