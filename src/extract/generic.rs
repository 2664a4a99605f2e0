use std::sync::OnceLock;

use regex::Regex;

use crate::connectors::Email;
use crate::extract::{compiled, parse_amount, sender_domain, ExtractionResult};

/// Checked in order; earlier names win when several appear.
pub const KNOWN_BANKS: &[&str] = &[
    "Vietcombank",
    "VCB",
    "VietinBank",
    "Vietinbank",
    "BIDV",
    "Agribank",
    "Techcombank",
    "TPBank",
    "MB Bank",
    "VPBank",
    "ACB",
    "Sacombank",
    "HDBank",
    "SHB",
    "Eximbank",
    "MSB",
    "Remitano",
];

pub const DEBIT_KEYWORDS: &[&str] = &[
    "withdrawal",
    "withdraw",
    "debit",
    "purchase",
    "payment",
    "transfer out",
];

pub const CREDIT_KEYWORDS: &[&str] = &[
    "deposit",
    "credit",
    "transfer in",
    "refund",
    "income",
    "you have swapped from",
    "bạn đã hoán đổi từ",
];

const MIN_BARE_AMOUNT: f64 = 1_000.0;
const MAX_BARE_AMOUNT: f64 = 100_000_000.0;

fn vnd_amount() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    compiled(
        &RE,
        r"(?i)(?:^|[^\d,.])(\d{1,3}(?:,\d{3})+(?:\.\d{2})?|\d+(?:\.\d{2})?)\s*(?:VND|VNDR|đ)",
    )
}

fn usd_prefixed() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    compiled(&RE, r"(?i)(?:USD|\$)\s*(\d{1,3}(?:,\d{3})+(?:\.\d{2})?|\d+(?:\.\d{2})?)")
}

fn usd_suffixed() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    compiled(
        &RE,
        r"(?i)(?:^|[^\d,.])(\d{1,3}(?:,\d{3})+(?:\.\d{2})?|\d+(?:\.\d{2})?)\s*(?:USD|\$)",
    )
}

fn bare_amount() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    compiled(&RE, r"(?:^|[^\d,.])(\d{1,3}(?:,\d{3})*(?:\.\d{2})?)")
}

fn account_label() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    compiled(&RE, r"(?i)(?:account|tài khoản|số tài khoản)[\s:]*(\d{10,16})")
}

fn first_capture(re: Option<&Regex>, text: &str) -> Option<String> {
    re?.captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Fallback for every email no sender-specific extractor claimed.
pub fn extract(email: &Email) -> Option<ExtractionResult> {
    let (amount, currency) = extract_amount(&format!("{} {}", email.body, email.subject));

    Some(
        ExtractionResult {
            amount,
            currency: currency.map(str::to_string),
            merchant: resolve_merchant(&email.sender, &email.subject, &email.body),
            transaction_type: classify_type(&email.subject, &email.body).map(str::to_string),
            account_number: first_capture(account_label(), &email.body),
            confidence: 0.0,
        }
        .scored(),
    )
}

/// First match wins: VND-suffixed, then USD (`$12.50` before `12.50 USD`), then a bare number in a
/// plausible range. Only the first bare number is considered. A number never starts inside
/// another digit run, and a currency-marked one may omit thousands separators.
pub fn extract_amount(text: &str) -> (Option<f64>, Option<&'static str>) {
    if let Some(amount) = first_capture(vnd_amount(), text).and_then(|raw| parse_amount(&raw)) {
        return (Some(amount), Some("VND"));
    }
    if let Some(amount) = [usd_prefixed(), usd_suffixed()]
        .into_iter()
        .find_map(|re| first_capture(re, text).and_then(|raw| parse_amount(&raw)))
    {
        return (Some(amount), Some("USD"));
    }

    let bare = first_capture(bare_amount(), text)
        .and_then(|raw| parse_amount(&raw))
        .filter(|amount| (MIN_BARE_AMOUNT..=MAX_BARE_AMOUNT).contains(amount));
    (bare, None)
}

/// Sender domain match, then a bank named in the text, then a bank named in the sender domain.
pub fn resolve_merchant(sender: &str, subject: &str, body: &str) -> Option<String> {
    let domain = sender_domain(sender);
    if domain.as_deref().is_some_and(|d| d.contains("remitano.com")) {
        return Some("Remitano".to_string());
    }

    let text = format!("{subject} {body}").to_lowercase();
    if let Some(bank) = KNOWN_BANKS
        .iter()
        .find(|bank| text.contains(&bank.to_lowercase()))
    {
        return Some(bank.to_string());
    }

    let domain = domain?;
    KNOWN_BANKS.iter().find_map(|bank| {
        let needle = bank.to_lowercase();
        domain
            .split('.')
            .find(|label| label.contains(&needle))
            .map(title_case)
    })
}

fn title_case(label: &str) -> String {
    let mut chars = label.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Debit keywords are checked before credit keywords.
pub fn classify_type(subject: &str, body: &str) -> Option<&'static str> {
    let text = format!("{subject} {body}").to_lowercase();
    if DEBIT_KEYWORDS.iter().any(|k| text.contains(k)) {
        return Some("debit");
    }
    if CREDIT_KEYWORDS.iter().any(|k| text.contains(k)) {
        return Some("credit");
    }
    None
}
