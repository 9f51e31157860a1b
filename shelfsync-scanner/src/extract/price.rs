use crate::result::{Currency, Price};
use regex::Regex;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::LazyLock;

static NUMERIC_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d[\d,]*(?:\.\d+)?").expect("numeric run pattern"));

/// Parse the first price found in free text.
///
/// The currency comes from a symbol or ISO code directly next to the number
/// and defaults to GBP. Negative amounts yield `None`.
pub fn parse_price(text: &str) -> Option<Price> {
    let run = NUMERIC_RUN.find(text)?;
    let before = &text[..run.start()];
    let after = &text[run.end()..];

    let sign_slot = before
        .trim_end()
        .trim_end_matches(|c| Currency::from_symbol(c).is_some())
        .trim_end();
    if sign_slot.ends_with('-') {
        return None;
    }

    let amount = parse_amount(run.as_str())?;
    if amount.is_sign_negative() {
        return None;
    }

    let currency = currency_before(before)
        .or_else(|| currency_after(after))
        .unwrap_or(Currency::Gbp);

    Some(Price { amount, currency })
}

fn parse_amount(raw: &str) -> Option<Decimal> {
    let raw = raw.trim_end_matches(',');
    // "12,99" with no dot is a decimal comma, "1,299" is grouping
    let normalized = if !raw.contains('.') {
        match raw.rsplit_once(',') {
            Some((head, tail)) if tail.len() == 2 && !head.contains(',') => {
                format!("{head}.{tail}")
            }
            _ => raw.replace(',', ""),
        }
    } else {
        raw.replace(',', "")
    };
    Decimal::from_str(&normalized).ok()
}

fn currency_before(before: &str) -> Option<Currency> {
    let trimmed = before.trim_end();
    let last = trimmed.chars().next_back()?;
    if let Some(currency) = Currency::from_symbol(last) {
        return Some(currency);
    }
    let tail: String = trimmed
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    if tail.len() == 3 {
        return Currency::from_code(&tail);
    }
    None
}

fn currency_after(after: &str) -> Option<Currency> {
    let trimmed = after.trim_start();
    let first = trimmed.chars().next()?;
    if let Some(currency) = Currency::from_symbol(first) {
        return Some(currency);
    }
    let head: String = trimmed
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect();
    if head.len() == 3 {
        return Currency::from_code(&head);
    }
    None
}
