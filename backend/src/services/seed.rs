//! Synthetic order rows for exercising the partitions.
//!
//! Rows are spread evenly over the days of `[start, end)`, at a random second
//! within each day. Generation is deterministic for a given seed.

use chrono::{Duration, NaiveDate};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::db::repository::{PartitionRepository, RepositoryError, RepositoryResult};
use crate::db::sql::{Ident, PartitionNaming};
use crate::models::OrderRow;
use crate::planner::start_of_day;

pub const ORDER_STATUSES: [&str; 4] = ["new", "in_progress", "done", "failed"];

const SECONDS_PER_DAY: i64 = 86_400;

/// What to generate.
#[derive(Debug, Clone)]
pub struct SeedPlan {
    pub start: NaiveDate,
    pub end: NaiveDate,
    /// Approximate total; every day receives `max(1, rows / days)` rows.
    pub rows: usize,
    pub batch_size: usize,
    pub seed: u64,
}

impl SeedPlan {
    pub fn new(start: NaiveDate, end: NaiveDate, rows: usize) -> Self {
        Self {
            start,
            end,
            rows,
            batch_size: 5000,
            seed: 42,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    fn days(&self) -> RepositoryResult<Vec<NaiveDate>> {
        if self.end <= self.start {
            return Err(RepositoryError::invalid_range(format!(
                "seed end {} must be after start {}",
                self.end, self.start
            )));
        }
        Ok(self.start.iter_days().take_while(|d| *d < self.end).collect())
    }

    pub fn rows_per_day(&self) -> RepositoryResult<usize> {
        let days = self.days()?.len();
        Ok((self.rows / days.max(1)).max(1))
    }
}

/// One synthetic order on `day`.
pub fn synth_row(rng: &mut StdRng, day: NaiveDate) -> OrderRow {
    let order_time = start_of_day(day) + Duration::seconds(rng.gen_range(0..SECONDS_PER_DAY));
    let cents: i64 = rng.gen_range(500..=50_000);
    OrderRow {
        order_id: uuid::Builder::from_random_bytes(rng.gen()).into_uuid(),
        customer_id: rng.gen_range(1..=100_000),
        store_id: rng.gen_range(1..=500),
        status: ORDER_STATUSES[rng.gen_range(0..ORDER_STATUSES.len())].to_string(),
        amount: cents as f64 / 100.0,
        order_time,
        updated_at: order_time,
    }
}

/// Every row the plan describes, day by day.
pub fn generate_orders(plan: &SeedPlan) -> RepositoryResult<Vec<OrderRow>> {
    let per_day = plan.rows_per_day()?;
    let mut rng = StdRng::seed_from_u64(plan.seed);
    let mut rows = Vec::new();
    for day in plan.days()? {
        rows.extend((0..per_day).map(|_| synth_row(&mut rng, day)));
    }
    Ok(rows)
}

/// Outcome of [`seed_orders`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SeedReport {
    pub days: usize,
    pub inserted: usize,
    pub batches: usize,
}

/// Insert the plan's rows through the parent in batches of `batch_size`.
///
/// A batch never spans two days. Each batch commits on its own, so a failure
/// keeps the batches already inserted.
pub async fn seed_orders<R: PartitionRepository + ?Sized>(
    repo: &R,
    schema: &Ident,
    plan: &SeedPlan,
) -> RepositoryResult<SeedReport> {
    let parent = PartitionNaming::new(schema.clone()).parent();
    let per_day = plan.rows_per_day()?;
    let batch_size = plan.batch_size.max(1);
    let mut rng = StdRng::seed_from_u64(plan.seed);
    let mut report = SeedReport::default();

    let days = plan.days()?;
    log::info!(
        "seeding ~{} rows across {} day(s) into {}",
        per_day * days.len(),
        days.len(),
        parent.key()
    );
    for day in days {
        let rows: Vec<OrderRow> = (0..per_day).map(|_| synth_row(&mut rng, day)).collect();
        for batch in rows.chunks(batch_size) {
            report.inserted += repo
                .insert_orders(&parent, batch)
                .await
                .map_err(|e| e.with_entity_id(day))?;
            report.batches += 1;
        }
        report.days += 1;
        log::debug!("seeded {} ({} rows so far)", day, report.inserted);
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn rows_are_spread_over_days() {
        let plan = SeedPlan::new(date(2025, 1, 1), date(2025, 1, 4), 30);
        let rows = generate_orders(&plan).unwrap();
        assert_eq!(rows.len(), 30);
        for (i, day) in [date(2025, 1, 1), date(2025, 1, 2), date(2025, 1, 3)]
            .iter()
            .enumerate()
        {
            let chunk = &rows[i * 10..(i + 1) * 10];
            assert!(chunk.iter().all(|r| r.order_time.date() == *day));
        }
    }

    #[test]
    fn at_least_one_row_per_day() {
        let plan = SeedPlan::new(date(2025, 1, 1), date(2025, 1, 8), 3);
        assert_eq!(plan.rows_per_day().unwrap(), 1);
        assert_eq!(generate_orders(&plan).unwrap().len(), 7);
    }

    #[test]
    fn generation_is_deterministic() {
        let plan = SeedPlan::new(date(2025, 1, 1), date(2025, 1, 2), 5).with_seed(7);
        assert_eq!(generate_orders(&plan).unwrap(), generate_orders(&plan).unwrap());
    }

    #[test]
    fn values_stay_in_range() {
        let plan = SeedPlan::new(date(2025, 1, 1), date(2025, 1, 2), 200);
        for row in generate_orders(&plan).unwrap() {
            assert!((1..=100_000).contains(&row.customer_id));
            assert!((1..=500).contains(&row.store_id));
            assert!(row.amount >= 5.0 && row.amount <= 500.0);
            assert!(ORDER_STATUSES.contains(&row.status.as_str()));
            assert_eq!(row.updated_at, row.order_time);
        }
    }

    #[test]
    fn empty_range_is_rejected() {
        let plan = SeedPlan::new(date(2025, 1, 2), date(2025, 1, 2), 5);
        assert!(matches!(
            generate_orders(&plan),
            Err(RepositoryError::InvalidRange { .. })
        ));
    }
}
