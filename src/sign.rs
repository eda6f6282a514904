//! Amount polarity rules per statement kind.
//!
//! Canonical polarity: expenses negative, income positive. Everything here is
//! a pure function of its inputs.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::StatementKind;
use crate::settings::SignPolicy;

const REFUND_WORDS: &[&str] = &[
    "REFUND",
    "RETURN",
    "REVERSAL",
    "CHARGEBACK",
    "CASHBACK",
    "CASH BACK",
    "CREDIT ADJ",
    "REBATE",
];

const PAYMENT_WORDS: &[&str] = &[
    "PAYMENT",
    "THANK YOU",
    "AUTOPAY",
    "AUTO PAY",
    "PYMT",
    "PMT",
];

/// Share of positive values among the numeric cells of a dataset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AmountSignStats {
    pub positive_count: usize,
    pub negative_count: usize,
}

impl AmountSignStats {
    pub fn total(&self) -> usize {
        self.positive_count + self.negative_count
    }

    pub fn positive_ratio(&self) -> Option<f64> {
        match self.total() {
            0 => None,
            n => Some(self.positive_count as f64 / n as f64),
        }
    }

    pub fn positive_pct(&self) -> f64 {
        self.positive_ratio().map(|r| r * 100.0).unwrap_or(0.0)
    }

    pub fn negative_pct(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            _ => 100.0 - self.positive_pct(),
        }
    }
}

/// Raw amount cells of one row, parsed but not yet sign-corrected.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RawAmounts {
    pub amount: Option<Decimal>,
    pub debit: Option<Decimal>,
    pub credit: Option<Decimal>,
}

impl RawAmounts {
    pub fn is_empty(&self) -> bool {
        self.amount.is_none() && self.debit.is_none() && self.credit.is_none()
    }

    fn has_split(&self) -> bool {
        self.debit.is_some() || self.credit.is_some()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SignContext<'a> {
    pub kind: StatementKind,
    /// Reversal declared by the column mapping, if any.
    pub declared_reversal: Option<bool>,
    pub stats: Option<&'a AmountSignStats>,
    pub policy: SignPolicy,
}

pub fn is_refund(description: &str) -> bool {
    let upper = description.to_uppercase();
    REFUND_WORDS.iter().any(|w| upper.contains(w))
}

pub fn is_payment(description: &str) -> bool {
    // Word-boundary match so "PMT" does not hit inside longer tokens.
    let words: Vec<String> = description
        .to_uppercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect();
    let padded = format!(" {} ", words.join(" "));
    PAYMENT_WORDS
        .iter()
        .any(|w| padded.contains(&format!(" {w} ")))
        && !is_refund(description)
}

/// Statistical fallback: should a single amount column be reversed?
pub fn reversal_from_stats(stats: &AmountSignStats, policy: &SignPolicy) -> Option<bool> {
    let ratio = stats.positive_ratio()?;
    if ratio > policy.reversal_threshold {
        Some(true)
    } else if ratio < policy.standard_threshold {
        Some(false)
    } else {
        // Mixed: standard polarity.
        Some(false)
    }
}

/// Resolve the canonical signed amount for one row. `None` when the row
/// carries no amount at all.
pub fn resolve_amount(raw: &RawAmounts, description: &str, ctx: &SignContext<'_>) -> Option<Decimal> {
    if raw.is_empty() {
        return None;
    }
    match ctx.kind {
        StatementKind::BankAccount => Some(resolve_bank(raw)),
        StatementKind::CreditCard => Some(resolve_credit_card(raw, description, ctx)),
        StatementKind::Unknown => Some(resolve_unknown(raw, ctx)),
    }
}

fn split_amount(raw: &RawAmounts) -> Option<Decimal> {
    match (raw.debit, raw.credit) {
        (Some(d), _) if !d.is_zero() => Some(-d.abs()),
        (_, Some(c)) if !c.is_zero() => Some(c.abs()),
        (Some(d), _) => Some(-d.abs()),
        (None, Some(c)) => Some(c.abs()),
        (None, None) => None,
    }
}

fn resolve_bank(raw: &RawAmounts) -> Decimal {
    if raw.has_split() {
        if let Some(amount) = split_amount(raw) {
            return amount;
        }
    }
    raw.amount.unwrap_or(Decimal::ZERO)
}

fn resolve_credit_card(raw: &RawAmounts, description: &str, ctx: &SignContext<'_>) -> Decimal {
    if raw.has_split() {
        if let Some(d) = raw.debit.filter(|d| !d.is_zero()) {
            return -d.abs();
        }
        if let Some(c) = raw.credit {
            // A card credit is a payment unless it reads like a refund.
            return if is_refund(description) { c.abs() } else { -c.abs() };
        }
        if let Some(d) = raw.debit {
            return -d.abs();
        }
    }
    let amount = raw.amount.unwrap_or(Decimal::ZERO);
    if is_payment(description) {
        return -amount.abs();
    }
    if ctx.declared_reversal.unwrap_or(true) {
        -amount
    } else {
        amount
    }
}

fn resolve_unknown(raw: &RawAmounts, ctx: &SignContext<'_>) -> Decimal {
    if raw.has_split() {
        if let Some(amount) = split_amount(raw) {
            return amount;
        }
    }
    let amount = raw.amount.unwrap_or(Decimal::ZERO);
    let reverse = ctx
        .stats
        .and_then(|s| reversal_from_stats(s, &ctx.policy))
        .or(ctx.declared_reversal)
        .unwrap_or(false);
    if reverse {
        -amount
    } else {
        amount
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn ctx(kind: StatementKind, declared_reversal: Option<bool>) -> SignContext<'static> {
        SignContext {
            kind,
            declared_reversal,
            stats: None,
            policy: SignPolicy::default(),
        }
    }

    fn single(v: &str) -> RawAmounts {
        RawAmounts {
            amount: Some(dec(v)),
            ..Default::default()
        }
    }

    #[test]
    fn test_bank_debit_is_expense() {
        let raw = RawAmounts {
            debit: Some(dec("42.10")),
            ..Default::default()
        };
        let got = resolve_amount(&raw, "GROCERY", &ctx(StatementKind::BankAccount, None));
        assert_eq!(got, Some(dec("-42.10")));
    }

    #[test]
    fn test_bank_credit_is_income() {
        let raw = RawAmounts {
            credit: Some(dec("1500")),
            ..Default::default()
        };
        let got = resolve_amount(&raw, "PAYROLL", &ctx(StatementKind::BankAccount, None));
        assert_eq!(got, Some(dec("1500")));
    }

    #[test]
    fn test_bank_single_amount_used_as_is() {
        let c = ctx(StatementKind::BankAccount, Some(true));
        assert_eq!(resolve_amount(&single("-12.00"), "COFFEE", &c), Some(dec("-12.00")));
        assert_eq!(resolve_amount(&single("250"), "DEPOSIT", &c), Some(dec("250")));
    }

    #[test]
    fn test_card_payment_single_amount_forced_negative() {
        let got = resolve_amount(
            &single("500.00"),
            "PAYMENT THANK YOU",
            &ctx(StatementKind::CreditCard, Some(true)),
        );
        assert_eq!(got, Some(dec("-500.00")));
        let got = resolve_amount(
            &single("500.00"),
            "PAYMENT THANK YOU",
            &ctx(StatementKind::CreditCard, Some(false)),
        );
        assert_eq!(got, Some(dec("-500.00")));
    }

    #[test]
    fn test_card_purchase_reversed_by_default() {
        let got = resolve_amount(&single("23.99"), "AMAZON MKTPLACE", &ctx(StatementKind::CreditCard, None));
        assert_eq!(got, Some(dec("-23.99")));
        let got = resolve_amount(&single("-23.99"), "AMAZON MKTPLACE", &ctx(StatementKind::CreditCard, None));
        assert_eq!(got, Some(dec("23.99")));
    }

    #[test]
    fn test_card_declared_no_reversal() {
        let got = resolve_amount(&single("-23.99"), "AMAZON", &ctx(StatementKind::CreditCard, Some(false)));
        assert_eq!(got, Some(dec("-23.99")));
    }

    #[test]
    fn test_card_credit_column_payment_vs_refund() {
        let raw = RawAmounts {
            credit: Some(dec("300")),
            ..Default::default()
        };
        let c = ctx(StatementKind::CreditCard, None);
        assert_eq!(resolve_amount(&raw, "ONLINE PAYMENT", &c), Some(dec("-300")));
        assert_eq!(resolve_amount(&raw, "REFUND - BEST BUY", &c), Some(dec("300")));
    }

    #[test]
    fn test_card_debit_column_is_expense() {
        let raw = RawAmounts {
            debit: Some(dec("19.95")),
            ..Default::default()
        };
        let got = resolve_amount(&raw, "NETFLIX", &ctx(StatementKind::CreditCard, None));
        assert_eq!(got, Some(dec("-19.95")));
    }

    #[test]
    fn test_unknown_kind_uses_stats() {
        let mostly_positive = AmountSignStats {
            positive_count: 90,
            negative_count: 10,
        };
        let mostly_negative = AmountSignStats {
            positive_count: 10,
            negative_count: 90,
        };
        let mixed = AmountSignStats {
            positive_count: 50,
            negative_count: 50,
        };
        let mut c = ctx(StatementKind::Unknown, None);
        c.stats = Some(&mostly_positive);
        assert_eq!(resolve_amount(&single("10"), "X", &c), Some(dec("-10")));
        c.stats = Some(&mostly_negative);
        assert_eq!(resolve_amount(&single("-10"), "X", &c), Some(dec("-10")));
        c.stats = Some(&mixed);
        assert_eq!(resolve_amount(&single("10"), "X", &c), Some(dec("10")));
    }

    #[test]
    fn test_unknown_kind_without_stats_falls_back_to_declared() {
        let c = ctx(StatementKind::Unknown, Some(true));
        assert_eq!(resolve_amount(&single("10"), "X", &c), Some(dec("-10")));
        let c = ctx(StatementKind::Unknown, None);
        assert_eq!(resolve_amount(&single("10"), "X", &c), Some(dec("10")));
    }

    #[test]
    fn test_empty_row_has_no_amount() {
        let c = ctx(StatementKind::BankAccount, None);
        assert_eq!(resolve_amount(&RawAmounts::default(), "X", &c), None);
    }

    #[test]
    fn test_vocabulary() {
        assert!(is_payment("AUTOPAY 12345"));
        assert!(is_payment("Payment - Thank You"));
        assert!(!is_payment("REFUND PAYMENT REVERSAL"));
        assert!(is_refund("Merchandise Return"));
        assert!(!is_refund("STARBUCKS"));
    }

    #[test]
    fn test_stats_percentages() {
        let stats = AmountSignStats {
            positive_count: 3,
            negative_count: 1,
        };
        assert_eq!(stats.positive_pct(), 75.0);
        assert_eq!(stats.negative_pct(), 25.0);
        assert_eq!(AmountSignStats::default().positive_ratio(), None);
    }
}
