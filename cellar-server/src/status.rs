//! Status types for the status endpoint.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::scheduler::MissedJob;
use cellar_core::{Transaction, TransactionState};

/// Summary statistics for the status page.
#[derive(Debug, Default, Serialize, PartialEq, Eq)]
pub struct StatusSummary {
    pub total_sales: usize,
    pub open: usize,
    pub approved: usize,
    pub completed: usize,
    pub cancelled: usize,
}

/// A sale entry for display on the status page.
#[derive(Debug, Serialize)]
pub struct SaleStatusEntry {
    pub id: i64,
    pub wine: String,
    pub price: String,
    pub state: TransactionState,
    pub seller: u64,
    pub buyer: u64,
    pub creation_date: DateTime<Utc>,
}

/// Full status data for rendering.
#[derive(Debug, Serialize)]
pub struct StatusData {
    pub version: String,
    pub summary: StatusSummary,
    pub sales: Vec<SaleStatusEntry>,
    pub scheduled_jobs: Vec<String>,
    pub missed_jobs: Vec<MissedJob>,
}

impl StatusData {
    pub fn from_parts(
        transactions: Vec<Transaction>,
        scheduled_jobs: Vec<String>,
        missed_jobs: Vec<MissedJob>,
        version: String,
    ) -> Self {
        let mut summary = StatusSummary {
            total_sales: transactions.len(),
            ..Default::default()
        };

        let mut sales = Vec::with_capacity(transactions.len());
        for tx in transactions {
            let state = tx.state();
            match state {
                TransactionState::Open => summary.open += 1,
                TransactionState::Approved => summary.approved += 1,
                TransactionState::Completed => summary.completed += 1,
                TransactionState::Cancelled => summary.cancelled += 1,
            }

            sales.push(SaleStatusEntry {
                id: tx.id.0,
                price: tx.price.to_string(),
                wine: tx.wine,
                state,
                seller: tx.seller.0,
                buyer: tx.buyer.0,
                creation_date: tx.creation_date,
            });
        }

        Self {
            version,
            summary,
            sales,
            scheduled_jobs,
            missed_jobs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellar_core::{MemberId, NewTransaction, TransactionId};

    fn make_tx(id: i64) -> Transaction {
        Transaction::from_new(
            TransactionId(id),
            NewTransaction {
                seller: MemberId(1),
                buyer: MemberId(2),
                wine: format!("Wine {}", id),
                price: "9.99".parse().unwrap(),
                creation_date: Utc::now(),
            },
        )
    }

    #[test]
    fn test_status_data_empty() {
        let data = StatusData::from_parts(vec![], vec![], vec![], "0.1.0".to_string());
        assert_eq!(data.summary, StatusSummary::default());
        assert!(data.sales.is_empty());
    }

    #[test]
    fn test_status_data_counts_states() {
        let open = make_tx(1);
        let mut approved = make_tx(2);
        approved.sale_approved = true;
        let mut cancelled = make_tx(3);
        cancelled.cancelled = true;
        let mut completed = make_tx(4);
        completed.sale_approved = true;
        completed.buyer_paid = true;
        completed.seller_paid = true;
        completed.buyer_delivered = true;
        completed.seller_delivered = true;

        let data = StatusData::from_parts(
            vec![open, approved, cancelled, completed],
            vec!["reminder:1".to_string()],
            vec![],
            "0.1.0".to_string(),
        );

        assert_eq!(
            data.summary,
            StatusSummary {
                total_sales: 4,
                open: 1,
                approved: 1,
                completed: 1,
                cancelled: 1,
            }
        );
        assert_eq!(data.sales[0].price, "£9.99");
        assert_eq!(data.scheduled_jobs, vec!["reminder:1".to_string()]);
    }

    #[test]
    fn test_status_data_serializes_missed_jobs() {
        let missed = MissedJob {
            key: "reminder:9".to_string(),
            scheduled_for: Utc::now(),
            detected_at: Utc::now(),
        };
        let data = StatusData::from_parts(vec![], vec![], vec![missed], "0.1.0".to_string());
        let json = serde_json::to_value(&data).unwrap();
        assert_eq!(json["missed_jobs"][0]["key"], "reminder:9");
    }
}
