//! Daily revenue statistics for the soundbox dashboard.

use chrono::{DateTime, Local, TimeZone};
use serde::Serialize;

use crate::amount::Amount;
use crate::store::Transaction;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MerchantStats {
    pub total_revenue: Amount,
    pub transaction_count: usize,
    pub average_transaction: Amount,
}

/// Stats over the transactions created on the same calendar day as `now`,
/// in `now`'s timezone.
pub fn compute<Tz: TimeZone>(transactions: &[Transaction], now: &DateTime<Tz>) -> MerchantStats {
    let today = now.date_naive();
    let tz = now.timezone();

    let (total_revenue, transaction_count) = transactions
        .iter()
        .filter(|t| t.created_at.with_timezone(&tz).date_naive() == today)
        .fold((Amount::ZERO, 0usize), |(sum, n), t| (sum + t.amount, n + 1));

    MerchantStats {
        total_revenue,
        transaction_count,
        average_transaction: total_revenue.average(transaction_count),
    }
}

pub fn compute_today(transactions: &[Transaction]) -> MerchantStats {
    compute(transactions, &Local::now())
}
