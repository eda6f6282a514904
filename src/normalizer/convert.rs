//! Cell converters: amounts, dates and descriptions.

use std::str::FromStr;
use std::sync::OnceLock;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime};
use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AmountConfig {
    pub remove_symbols: bool,
    pub handle_parentheses: bool,
    pub reverse_sign: bool,
}

impl Default for AmountConfig {
    fn default() -> Self {
        Self {
            remove_symbols: true,
            handle_parentheses: true,
            reverse_sign: false,
        }
    }
}

pub struct AmountConverter;

impl AmountConverter {
    /// Parse a raw amount cell. Never fails: unparseable input is `None`.
    pub fn convert(raw: &str, config: &AmountConfig) -> Option<Decimal> {
        let mut s = raw.trim().to_string();
        if s.is_empty() {
            return None;
        }
        if config.remove_symbols {
            s = s
                .chars()
                .filter(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | '(' | ')'))
                .collect();
        }
        let mut negative = false;
        if config.handle_parentheses {
            if let Some(inner) = s.strip_prefix('(').and_then(|v| v.strip_suffix(')')) {
                negative = true;
                s = inner.trim().to_string();
            }
        }
        if let Some(stripped) = s.strip_suffix('-') {
            negative = true;
            s = stripped.to_string();
        }
        let s = s.strip_prefix('+').unwrap_or(&s);
        if !s.chars().any(|c| c.is_ascii_digit()) {
            return None;
        }
        let mut value = Decimal::from_str(s)
            .or_else(|_| Decimal::from_scientific(s))
            .ok()?;
        if negative {
            value = -value.abs();
        }
        if config.reverse_sign {
            value = -value;
        }
        Some(value)
    }
}

/// Loose numeric test used when profiling spreadsheet columns. Dates with
/// separators such as `/` do not qualify.
pub fn looks_numeric(raw: &str) -> bool {
    let s = raw.trim();
    !s.is_empty()
        && s.chars().any(|c| c.is_ascii_digit())
        && s.chars().all(|c| {
            c.is_ascii_digit()
                || matches!(c, '.' | ',' | '-' | '+' | '(' | ')' | '$' | '€' | '£' | '¥' | ' ')
        })
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DateConfig {
    pub format: Option<String>,
    pub excel_serial: bool,
}

const FALLBACK_DATE_FORMATS: &[&str] = &[
    "%m/%d/%Y",
    "%m/%d/%y",
    "%d/%m/%Y",
    "%Y/%m/%d",
    "%d.%m.%Y",
    "%d.%m.%y",
    "%m-%d-%Y",
    "%d-%m-%Y",
    "%b %d, %Y",
    "%b %d %Y",
    "%d %b %Y",
    "%B %d, %Y",
    "%d %B %Y",
    "%d-%b-%Y",
    "%d-%b-%y",
    "%Y%m%d",
];

const MAX_EXCEL_SERIAL: f64 = 2_958_465.0;

pub struct DateConverter;

impl DateConverter {
    /// Precedence: explicit format, Excel serial, ISO, common formats.
    pub fn convert(raw: &str, config: &DateConfig) -> Option<NaiveDate> {
        let s = raw.trim();
        if s.is_empty() {
            return None;
        }
        if let Some(format) = config.format.as_deref().filter(|f| !f.trim().is_empty()) {
            if let Some(date) = parse_with_format(s, &to_chrono_format(format)) {
                return Some(date);
            }
        }
        if config.excel_serial {
            if let Some(date) = s.parse::<f64>().ok().and_then(excel_serial_to_date) {
                return Some(date);
            }
        }
        if let Some(date) = parse_iso(s) {
            return Some(date);
        }
        FALLBACK_DATE_FORMATS
            .iter()
            .find_map(|fmt| parse_with_format(s, fmt))
    }
}

fn parse_with_format(s: &str, fmt: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, fmt)
        .ok()
        .or_else(|| NaiveDateTime::parse_from_str(s, fmt).ok().map(|dt| dt.date()))
}

fn parse_iso(s: &str) -> Option<NaiveDate> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.date_naive());
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d"] {
        if let Some(date) = parse_with_format(s, fmt) {
            return Some(date);
        }
    }
    None
}

/// Translate `YYYY-MM-DD`-style tokens into chrono specifiers. Strings that
/// already contain `%` pass through.
pub fn to_chrono_format(format: &str) -> String {
    if format.contains('%') {
        return format.to_string();
    }
    let chars: Vec<char> = format.chars().collect();
    let mut out = String::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let mut run = 1;
        while i + run < chars.len() && chars[i + run] == c {
            run += 1;
        }
        let directive = match (c.to_ascii_uppercase(), run) {
            ('Y', 4) => Some("%Y"),
            ('Y', 2) => Some("%y"),
            ('M', 4) => Some("%B"),
            ('M', 3) => Some("%b"),
            ('M', 1) | ('M', 2) => Some("%m"),
            ('D', 1) | ('D', 2) => Some("%d"),
            _ => None,
        };
        match directive {
            Some(d) => out.push_str(d),
            None => chars[i..i + run].iter().for_each(|ch| out.push(*ch)),
        }
        i += run;
    }
    out
}

/// Spreadsheet serial day number to a calendar date. Serial 1 is 1900-01-01;
/// the nonexistent 1900-02-29 (serial 60) rolls forward to 1900-03-01 and
/// later serials are shifted back one day to undo that phantom leap day.
/// Serials past 9999-12-31 are not dates.
pub fn excel_serial_to_date(serial: f64) -> Option<NaiveDate> {
    if !serial.is_finite() || !(1.0..=MAX_EXCEL_SERIAL).contains(&serial) {
        return None;
    }
    let whole = serial.floor() as i64;
    let offset = if whole <= 59 { whole - 1 } else { (whole - 2).max(59) };
    let epoch = NaiveDate::from_ymd_opt(1900, 1, 1)?;
    epoch.checked_add_signed(Duration::try_days(offset)?)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DescriptionConfig {
    pub trim: bool,
    pub strip_codes: bool,
}

impl Default for DescriptionConfig {
    fn default() -> Self {
        Self {
            trim: true,
            strip_codes: false,
        }
    }
}

fn code_patterns() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(?:REF|ID|TRN|CONF|AUTH|SEQ)(?:\s*[#:]\s*|\s+)[A-Z0-9]*\d[A-Z0-9]*\b|#\s*\d+|\b[X*]{2,}\d{2,}\b|\b\d{6,}\b",
        )
        .expect("static regex")
    })
}

pub struct DescriptionConverter;

impl DescriptionConverter {
    pub fn convert(raw: &str, config: &DescriptionConfig) -> String {
        let mut s = raw.to_string();
        if config.strip_codes {
            s = code_patterns().replace_all(&s, " ").to_string();
        }
        if config.trim {
            s = s.split_whitespace().collect::<Vec<_>>().join(" ");
        }
        s
    }
}

const MERCHANT_PREFIXES: &[&str] = &[
    "POS PURCHASE ",
    "POS DEBIT ",
    "POS ",
    "DEBIT CARD PURCHASE ",
    "CHECKCARD ",
    "CARD PURCHASE ",
    "PURCHASE ",
    "SQ *",
    "SQ*",
    "TST* ",
    "TST*",
    "PAYPAL *",
    "PP*",
    "SP * ",
    "SP *",
];

fn merchant_noise() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^AUTHORIZED ON \d{1,2}/\d{1,2}\s+").expect("static regex")
    })
}

/// Best-effort merchant name from a bank description.
pub fn derive_merchant(description: &str) -> String {
    let mut s = description.trim().to_string();
    s = merchant_noise().replace(&s, "").to_string();
    loop {
        let upper = s.to_uppercase();
        let Some(prefix) = MERCHANT_PREFIXES.iter().find(|p| upper.starts_with(*p)) else {
            break;
        };
        s = s.get(prefix.len()..).unwrap_or("").trim_start().to_string();
    }
    let cleaned = DescriptionConverter::convert(
        &s,
        &DescriptionConfig {
            trim: true,
            strip_codes: true,
        },
    );
    // Cut at the first token after the name that carries digits (store
    // numbers, dates, phone numbers); location words usually follow it.
    let mut words: Vec<&str> = cleaned.split(' ').collect();
    if let Some(cut) = words
        .iter()
        .skip(1)
        .position(|w| w.chars().any(|c| c.is_ascii_digit()))
    {
        words.truncate(cut + 1);
    }
    let merchant = words.join(" ").trim().to_string();
    if merchant.is_empty() {
        description.trim().to_string()
    } else {
        merchant
    }
}
