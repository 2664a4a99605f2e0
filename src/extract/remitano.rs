use std::sync::OnceLock;

use regex::Regex;

use crate::connectors::Email;
use crate::extract::{compiled, parse_amount, ExtractionResult};

pub const MERCHANT: &str = "Remitano";
const CURRENCY: &str = "VND";

fn swap_patterns() -> [Option<&'static Regex>; 3] {
    static ENGLISH: OnceLock<Option<Regex>> = OnceLock::new();
    static VIETNAMESE: OnceLock<Option<Regex>> = OnceLock::new();
    static FALLBACK: OnceLock<Option<Regex>> = OnceLock::new();
    [
        compiled(&ENGLISH, r"(?i)to\s+([\d,]+)\s*(VND|VNDR|VNF)"),
        compiled(&VIETNAMESE, r"(?i)sang\s+([\d,]+)\s*(VND|VNDR|VNF)"),
        compiled(&FALLBACK, r"(?i)([\d,]+)\s*(VND|VNDR|VNF)"),
    ]
}

pub fn is_remitano(email: &Email) -> bool {
    email.sender.to_lowercase().contains("remitano.com")
        || email.subject.to_lowercase().contains("remitano")
}

/// Swap confirmations carry the credited amount in the subject line, e.g.
/// `You have swapped from 200.00 USDT to 5,226,659 VND` or
/// `Bạn đã hoán đổi từ 851.65 USDT sang 22,178,072 VNDR`.
pub fn extract(email: &Email) -> Option<ExtractionResult> {
    if !is_remitano(email) {
        return None;
    }

    let amount = swap_patterns().into_iter().flatten().find_map(|re| {
        re.captures(&email.subject)
            .and_then(|caps| caps.get(1))
            .and_then(|m| parse_amount(m.as_str()))
    });

    Some(
        ExtractionResult {
            amount,
            currency: Some(CURRENCY.to_string()),
            merchant: Some(MERCHANT.to_string()),
            transaction_type: Some("credit".to_string()),
            account_number: None,
            confidence: 0.0,
        }
        .scored(),
    )
}
