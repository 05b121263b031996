//! Courier (NCM) status vocabulary → internal order status.
//!
//! Pure and total: unknown or empty phrases fall back to `processing`.
//! Matching ignores case and surrounding whitespace. Cancellation and
//! return phrases are recognized by keyword before the exact table.

use crate::models::OrderStatus;

/// Courier phrase (lowercase) → internal status. Many-to-one.
const COURIER_STATUS_TABLE: &[(&str, OrderStatus)] = &[
    ("pickup order created", OrderStatus::Processing),
    ("drop off order created", OrderStatus::Processing),
    ("sent for pickup", OrderStatus::Processing),
    ("pickup complete", OrderStatus::Processing),
    ("drop off order collected", OrderStatus::Processing),
    ("order created", OrderStatus::Processing),
    ("dispatched", OrderStatus::Shipped),
    ("in transit", OrderStatus::Shipped),
    ("arrived", OrderStatus::Shipped),
    ("sent for delivery", OrderStatus::Shipped),
    ("out for delivery", OrderStatus::Shipped),
    ("delivered", OrderStatus::Delivered),
    ("confirmed", OrderStatus::Delivered),
    ("returned", OrderStatus::Returned),
    ("return delivered", OrderStatus::Returned),
    ("returned to vendor", OrderStatus::Returned),
    ("cancelled", OrderStatus::Cancelled),
];

/// Substring → status, checked in order before the exact table.
const COURIER_STATUS_KEYWORDS: &[(&str, OrderStatus)] = &[
    ("cancel", OrderStatus::Cancelled),
    ("return", OrderStatus::Returned),
];

pub const FALLBACK_STATUS: OrderStatus = OrderStatus::Processing;

fn lookup(raw: &str) -> Option<OrderStatus> {
    let key = raw.trim().to_lowercase();
    COURIER_STATUS_KEYWORDS
        .iter()
        .find(|(word, _)| key.contains(word))
        .or_else(|| COURIER_STATUS_TABLE.iter().find(|(phrase, _)| *phrase == key))
        .map(|(_, status)| *status)
}

/// Map a raw courier status string to the internal order status.
pub fn map_courier_status(raw: &str) -> OrderStatus {
    lookup(raw).unwrap_or(FALLBACK_STATUS)
}

/// `true` when the phrase matches a keyword or the table (used only for
/// logging unknown vocabulary).
pub fn is_known_courier_status(raw: &str) -> bool {
    lookup(raw).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_observed_phrases() {
        assert_eq!(
            map_courier_status("Pickup Order Created"),
            OrderStatus::Processing
        );
        assert_eq!(map_courier_status("Pickup Complete"), OrderStatus::Processing);
        assert_eq!(map_courier_status("Dispatched"), OrderStatus::Shipped);
        assert_eq!(map_courier_status("In Transit"), OrderStatus::Shipped);
        assert_eq!(map_courier_status("Arrived"), OrderStatus::Shipped);
        assert_eq!(map_courier_status("Out for Delivery"), OrderStatus::Shipped);
        assert_eq!(map_courier_status("Delivered"), OrderStatus::Delivered);
        assert_eq!(map_courier_status("Returned"), OrderStatus::Returned);
    }

    #[test]
    fn return_and_cancel_phrases_match_by_keyword() {
        for raw in [
            "Return In Transit",
            "Returned To Vendor Branch",
            "Return Order Created",
            "Returned to Vendor",
            "return delivered",
        ] {
            assert_eq!(map_courier_status(raw), OrderStatus::Returned, "{raw}");
            assert!(is_known_courier_status(raw));
        }
        assert_eq!(map_courier_status("Cancelled by Vendor"), OrderStatus::Cancelled);
        assert_eq!(map_courier_status("Order Cancel Requested"), OrderStatus::Cancelled);
    }

    #[test]
    fn unknown_and_empty_fall_back_to_processing() {
        assert_eq!(map_courier_status(""), OrderStatus::Processing);
        assert_eq!(map_courier_status("   "), OrderStatus::Processing);
        assert_eq!(
            map_courier_status("Hold at Hub (weather)"),
            OrderStatus::Processing
        );
        assert!(!is_known_courier_status("Hold at Hub (weather)"));
    }

    #[test]
    fn case_and_whitespace_insensitive() {
        assert_eq!(map_courier_status("  delivered "), OrderStatus::Delivered);
        assert_eq!(map_courier_status("IN TRANSIT"), OrderStatus::Shipped);
    }

    #[test]
    fn mapping_is_stable_across_calls() {
        for raw in ["Delivered", "Sent for Delivery", "whatever", ""] {
            assert_eq!(map_courier_status(raw), map_courier_status(raw));
        }
    }

    #[test]
    fn many_phrases_share_one_status() {
        let shipped = COURIER_STATUS_TABLE
            .iter()
            .filter(|(_, s)| *s == OrderStatus::Shipped)
            .count();
        assert!(shipped >= 4);
    }
}
