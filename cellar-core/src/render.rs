//! Plain-text rendering of a transaction's status message.
//!
//! Layout, one block per line group:
//!
//! ```text
//! **<icon> <title>** (#<id>)
//! <seller> is selling **<wine>** to <buyer> for **<price>**
//!
//! <approval line>
//! <payment line>
//! <delivery line>
//!
//! <call to action / hints, non-terminal sales only>
//! ```

use crate::model::{MemberId, Transaction, TransactionState};
use crate::reaction::{APPROVE_EMOJI, DELIVERED_EMOJI, PAID_EMOJI, REMINDER_EMOJI};

const CONFIRMED: &str = "✅";
const PARTIAL: &str = "🟡";
const PENDING: &str = "⬜";
const VOID: &str = "🚫";

pub const CANCEL_HINT: &str = "Either party can react with ❌ to cancel before the sale is approved.";
pub const REMINDER_HINT: &str = "React with ⏰ to be reminded about this sale.";

/// Render the full status message for a transaction.
pub fn render_status(tx: &Transaction) -> String {
    let mut lines = vec![
        title_line(tx),
        format!(
            "{} is selling **{}** to {} for **{}**",
            tx.seller.mention(),
            tx.wine,
            tx.buyer.mention(),
            tx.price
        ),
        String::new(),
        approval_line(tx),
        payment_line(tx),
        delivery_line(tx),
    ];

    let footer = footer_lines(tx);
    if !footer.is_empty() {
        lines.push(String::new());
        lines.extend(footer);
    }

    lines.join("\n")
}

/// Render the notification sent when a reminder fires.
pub fn render_reminder(tx: &Transaction, member: MemberId) -> String {
    format!(
        "{} {}, here is your reminder about sale #{}: **{}** for **{}** (currently {}).",
        REMINDER_EMOJI,
        member.mention(),
        tx.id,
        tx.wine,
        tx.price,
        tx.state()
    )
}

fn title_line(tx: &Transaction) -> String {
    let title = match tx.state() {
        TransactionState::Cancelled => "🚫 Sale Cancelled",
        TransactionState::Completed => "🎉 Sale Completed",
        _ if tx.is_untouched() => "🍷 New Sale",
        _ => "🔄 Sale Updated",
    };
    format!("**{}** (#{})", title, tx.id)
}

fn approval_line(tx: &Transaction) -> String {
    if tx.cancelled {
        format!("{} Approval cancelled", VOID)
    } else if tx.sale_approved {
        format!("{} Approved by {}", CONFIRMED, tx.buyer.mention())
    } else {
        format!("{} Awaiting approval from {}", PENDING, tx.buyer.mention())
    }
}

fn payment_line(tx: &Transaction) -> String {
    if tx.cancelled {
        return format!("{} Payment cancelled", VOID);
    }
    match (tx.buyer_paid, tx.seller_paid) {
        (true, true) => format!("{} Payment confirmed by both parties", CONFIRMED),
        (true, false) => format!(
            "{} Payment sent by {}; waiting for {} to confirm with {}",
            PARTIAL,
            tx.buyer.mention(),
            tx.seller.mention(),
            PAID_EMOJI
        ),
        (false, true) => format!(
            "{} Payment received by {}; waiting for {} to confirm with {}",
            PARTIAL,
            tx.seller.mention(),
            tx.buyer.mention(),
            PAID_EMOJI
        ),
        (false, false) => format!("{} Payment not yet confirmed", PENDING),
    }
}

fn delivery_line(tx: &Transaction) -> String {
    if tx.cancelled {
        return format!("{} Delivery cancelled", VOID);
    }
    match (tx.buyer_delivered, tx.seller_delivered) {
        (true, true) => format!("{} Delivery confirmed by both parties", CONFIRMED),
        (true, false) => format!(
            "{} Delivery received by {}; waiting for {} to confirm with {}",
            PARTIAL,
            tx.buyer.mention(),
            tx.seller.mention(),
            DELIVERED_EMOJI
        ),
        (false, true) => format!(
            "{} Delivery sent by {}; waiting for {} to confirm with {}",
            PARTIAL,
            tx.seller.mention(),
            tx.buyer.mention(),
            DELIVERED_EMOJI
        ),
        (false, false) => format!("{} Delivery not yet confirmed", PENDING),
    }
}

fn footer_lines(tx: &Transaction) -> Vec<String> {
    if tx.state().is_terminal() {
        return vec![];
    }

    let mut lines = Vec::new();
    if !tx.sale_approved {
        lines.push(format!(
            "{}, react with {} to approve this sale.",
            tx.buyer.mention(),
            APPROVE_EMOJI
        ));
        lines.push(CANCEL_HINT.to_string());
    } else {
        let waiting: Vec<String> = [
            (tx.buyer, tx.buyer_paid, tx.buyer_delivered),
            (tx.seller, tx.seller_paid, tx.seller_delivered),
        ]
        .into_iter()
        .filter_map(|(member, paid, delivered)| {
            let mut needed = Vec::new();
            if !paid {
                needed.push(PAID_EMOJI);
            }
            if !delivered {
                needed.push(DELIVERED_EMOJI);
            }
            (!needed.is_empty()).then(|| format!("{} ({})", member.mention(), needed.join(" ")))
        })
        .collect();
        lines.push(format!("Waiting on {}.", waiting.join(" and ")));
    }
    lines.push(REMINDER_HINT.to_string());
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NewTransaction, Price, TransactionId};
    use chrono::{TimeZone, Utc};

    fn chianti() -> Transaction {
        Transaction::from_new(
            TransactionId(7),
            NewTransaction {
                seller: MemberId(1),
                buyer: MemberId(2),
                wine: "Chianti".to_string(),
                price: "12.50".parse::<Price>().unwrap(),
                creation_date: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            },
        )
    }

    #[test]
    fn test_render_new_sale() {
        let expected = "\
**🍷 New Sale** (#7)
<@1> is selling **Chianti** to <@2> for **£12.50**

⬜ Awaiting approval from <@2>
⬜ Payment not yet confirmed
⬜ Delivery not yet confirmed

<@2>, react with ✅ to approve this sale.
Either party can react with ❌ to cancel before the sale is approved.
React with ⏰ to be reminded about this sale.";
        assert_eq!(render_status(&chianti()), expected);
    }

    #[test]
    fn test_render_partially_paid() {
        let mut tx = chianti();
        tx.sale_approved = true;
        tx.buyer_paid = true;

        let expected = "\
**🔄 Sale Updated** (#7)
<@1> is selling **Chianti** to <@2> for **£12.50**

✅ Approved by <@2>
🟡 Payment sent by <@2>; waiting for <@1> to confirm with 💰
⬜ Delivery not yet confirmed

Waiting on <@2> (📦) and <@1> (💰 📦).
React with ⏰ to be reminded about this sale.";
        assert_eq!(render_status(&tx), expected);
    }

    #[test]
    fn test_render_seller_side_partials() {
        let mut tx = chianti();
        tx.sale_approved = true;
        tx.seller_paid = true;
        tx.seller_delivered = true;
        let text = render_status(&tx);
        assert!(text.contains("🟡 Payment received by <@1>; waiting for <@2> to confirm with 💰"));
        assert!(text.contains("🟡 Delivery sent by <@1>; waiting for <@2> to confirm with 📦"));
        assert!(text.contains("Waiting on <@2> (💰 📦)."));
    }

    #[test]
    fn test_render_completed() {
        let mut tx = chianti();
        tx.sale_approved = true;
        tx.buyer_paid = true;
        tx.seller_paid = true;
        tx.buyer_delivered = true;
        tx.seller_delivered = true;

        let expected = "\
**🎉 Sale Completed** (#7)
<@1> is selling **Chianti** to <@2> for **£12.50**

✅ Approved by <@2>
✅ Payment confirmed by both parties
✅ Delivery confirmed by both parties";
        let text = render_status(&tx);
        assert_eq!(text, expected);
        assert!(!text.contains(CANCEL_HINT));
        assert!(!text.contains(REMINDER_HINT));
    }

    #[test]
    fn test_render_cancelled() {
        let mut tx = chianti();
        tx.cancelled = true;

        let expected = "\
**🚫 Sale Cancelled** (#7)
<@1> is selling **Chianti** to <@2> for **£12.50**

🚫 Approval cancelled
🚫 Payment cancelled
🚫 Delivery cancelled";
        assert_eq!(render_status(&tx), expected);
    }

    #[test]
    fn test_render_reminder() {
        let tx = chianti();
        assert_eq!(
            render_reminder(&tx, MemberId(2)),
            "⏰ <@2>, here is your reminder about sale #7: **Chianti** for **£12.50** (currently open)."
        );
    }
}
