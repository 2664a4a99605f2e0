//! Transaction extraction from notification emails.
//!
//! Extractors are pure functions tried in order; the first one that claims an
//! email produces the result. Extraction never fails: anything it cannot read
//! is left absent and lowers the confidence score.

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use crate::connectors::Email;

pub mod generic;
pub mod remitano;

pub type Extractor = fn(&Email) -> Option<ExtractionResult>;

/// Sender-specific extractors first, the generic fallback last.
pub const EXTRACTORS: &[Extractor] = &[remitano::extract, generic::extract];

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExtractionResult {
    pub amount: Option<f64>,
    pub currency: Option<String>,
    pub merchant: Option<String>,
    pub transaction_type: Option<String>,
    pub account_number: Option<String>,
    /// Advisory only: 0.4 for an amount, 0.3 each for merchant and type.
    pub confidence: f64,
}

impl ExtractionResult {
    pub(crate) fn scored(mut self) -> Self {
        self.confidence = confidence(
            self.amount.is_some(),
            self.merchant.is_some(),
            self.transaction_type.is_some(),
        );
        self
    }
}

pub fn extract(email: &Email) -> ExtractionResult {
    EXTRACTORS
        .iter()
        .find_map(|extractor| extractor(email))
        .unwrap_or_default()
}

pub fn confidence(has_amount: bool, has_merchant: bool, has_type: bool) -> f64 {
    let mut score = 0.0;
    if has_amount {
        score += 0.4;
    }
    if has_merchant {
        score += 0.3;
    }
    if has_type {
        score += 0.3;
    }
    score
}

/// Numeric text with thousands separators, e.g. `5,226,659` or `1,200.50`.
pub(crate) fn parse_amount(raw: &str) -> Option<f64> {
    raw.replace(',', "").parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Lowercased domain of the address in a `From` header, angle brackets or not.
pub(crate) fn sender_domain(sender: &str) -> Option<String> {
    let address = match (sender.rfind('<'), sender.rfind('>')) {
        (Some(start), Some(end)) if start < end => &sender[start + 1..end],
        _ => sender,
    };
    address
        .rsplit_once('@')
        .map(|(_, domain)| domain.trim().trim_end_matches('>').to_lowercase())
        .filter(|domain| !domain.is_empty())
}

pub(crate) fn compiled(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| match Regex::new(pattern) {
        Ok(re) => Some(re),
        Err(err) => {
            tracing::error!(pattern, error = %err, "extraction pattern failed to compile");
            None
        }
    })
    .as_ref()
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::{confidence, extract, parse_amount, sender_domain};
    use crate::connectors::Email;

    pub(crate) fn email(sender: &str, subject: &str, body: &str) -> Email {
        Email {
            external_id: "msg-1".to_string(),
            subject: subject.to_string(),
            sender: sender.to_string(),
            received_at: Utc::now(),
            body: body.to_string(),
        }
    }

    #[test]
    fn remitano_swap_subject() {
        let result = extract(&email(
            "Remitano <notifications@remitano.com>",
            "You have swapped from 200.00 USDT to 5,226,659 VND",
            "",
        ));
        assert_eq!(result.amount, Some(5_226_659.0));
        assert_eq!(result.currency.as_deref(), Some("VND"));
        assert_eq!(result.merchant.as_deref(), Some("Remitano"));
        assert_eq!(result.transaction_type.as_deref(), Some("credit"));
        assert!((result.confidence - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn other_senders_fall_through_to_generic() {
        let result = extract(&email(
            "VCBDigibank@info.vietcombank.com.vn",
            "Thông báo giao dịch",
            "Số tiền: 150,000 VND",
        ));
        assert_eq!(result.amount, Some(150_000.0));
        assert_eq!(result.merchant.as_deref(), Some("Vietcombank"));
    }

    #[test]
    fn extraction_is_total_on_empty_input() {
        let result = extract(&email("", "", ""));
        assert_eq!(result.amount, None);
        assert_eq!(result.merchant, None);
        assert_eq!(result.transaction_type, None);
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn confidence_is_additive() {
        assert_eq!(confidence(false, false, false), 0.0);
        assert!((confidence(true, false, false) - 0.4).abs() < 1e-9);
        assert!((confidence(false, true, true) - 0.6).abs() < 1e-9);
    }

    #[test]
    fn amount_and_domain_helpers() {
        assert_eq!(parse_amount("5,226,659"), Some(5_226_659.0));
        assert_eq!(parse_amount(","), None);
        assert_eq!(
            sender_domain("VCB Digibank <VCBDigibank@Info.Vietcombank.com.vn>").as_deref(),
            Some("info.vietcombank.com.vn")
        );
        assert_eq!(sender_domain("no address here"), None);
    }
}
