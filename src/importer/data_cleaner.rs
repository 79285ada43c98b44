// ==========================================
// 价目表导入系统 - 数据清洗器
// ==========================================
// 职责: TRIM / NULL 标准化 / 价格与币种记号规范化
// 价格记号: 币种符号/ISO 代码可前置或后置，千分位与小数点按区域习惯识别
// ==========================================

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// 规范化后的价格记号
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceToken {
    pub amount: Decimal,
    pub currency: Option<String>, // ISO 4217，未识别时为 None
}

// 多字符符号需排在单字符符号之前
const CURRENCY_SYMBOLS: &[(&str, &str)] = &[
    ("US$", "USD"),
    ("R$", "BRL"),
    ("C$", "CAD"),
    ("A$", "AUD"),
    ("HK$", "HKD"),
    ("CHF", "CHF"),
    ("Fr.", "CHF"),
    ("kr", "SEK"),
    ("$", "USD"),
    ("€", "EUR"),
    ("£", "GBP"),
    ("¥", "JPY"),
    ("₹", "INR"),
    ("₽", "RUB"),
    ("₩", "KRW"),
];

pub struct DataCleaner;

impl DataCleaner {
    pub fn clean_text(&self, value: &str, uppercase: bool) -> String {
        let trimmed = value.trim();
        if uppercase {
            trimmed.to_uppercase()
        } else {
            trimmed.to_string()
        }
    }

    /// 空白 → None
    pub fn normalize_null(&self, value: Option<&str>) -> Option<String> {
        value.and_then(|v| {
            let trimmed = v.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    /// 币种代码规范化: 3 位 ASCII 字母，统一大写；也接受货币符号
    pub fn normalize_currency(&self, value: &str) -> Option<String> {
        let trimmed = value.trim();
        if trimmed.len() == 3 && trimmed.chars().all(|c| c.is_ascii_alphabetic()) {
            return Some(trimmed.to_ascii_uppercase());
        }
        CURRENCY_SYMBOLS
            .iter()
            .find(|(symbol, _)| *symbol == trimmed)
            .map(|(_, code)| code.to_string())
    }

    /// 正整数（允许 "10.0" 这类 Excel 浮点输出）
    pub fn parse_quantity(&self, value: &str) -> Option<u32> {
        let token = normalize_price_token(value)?;
        if token.currency.is_some()
            || token.amount.fract() != Decimal::ZERO
            || token.amount < Decimal::ONE
        {
            return None;
        }
        token.amount.to_u32()
    }
}

/// 常见 ISO 4217 代码（用于从值中识别币种）
pub fn is_known_currency(code: &str) -> bool {
    const KNOWN: &[&str] = &[
        "USD", "EUR", "GBP", "JPY", "CNY", "CHF", "CAD", "AUD", "NZD", "SEK", "NOK", "DKK",
        "PLN", "CZK", "HUF", "INR", "RUB", "KRW", "BRL", "MXN", "ZAR", "HKD", "SGD", "TRY",
        "AED",
    ];
    KNOWN.contains(&code.to_ascii_uppercase().as_str())
}

/// 价格记号规范化
///
/// # 支持
/// - 币种符号与 ISO 代码（前置或后置）: "$12.50", "12,50 €", "EUR 1.234,56"
/// - 千分位: `,` `.` 空格 NBSP 撇号
/// - 小数逗号: "12,5" / "1.234,56"
/// - 负数: "-5" / "(5.00)"
///
/// 无法识别为数字时返回 None
pub fn normalize_price_token(raw: &str) -> Option<PriceToken> {
    let mut text = raw.trim().replace('\u{a0}', " ");
    if text.is_empty() {
        return None;
    }

    let mut negative = false;
    if text.starts_with('(') && text.ends_with(')') && text.len() > 2 {
        negative = true;
        text = text[1..text.len() - 1].trim().to_string();
    }

    let (currency, rest) = strip_currency(&text);
    let mut body = rest.trim().to_string();

    if let Some(stripped) = body.strip_prefix('-') {
        negative = !negative;
        body = stripped.trim().to_string();
    } else if let Some(stripped) = body.strip_suffix('-') {
        negative = !negative;
        body = stripped.trim().to_string();
    } else if let Some(stripped) = body.strip_prefix('+') {
        body = stripped.trim().to_string();
    }

    let numeric = normalize_separators(&body)?;
    let amount = Decimal::from_str(&numeric).ok()?;

    Some(PriceToken {
        amount: if negative { -amount } else { amount },
        currency,
    })
}

/// 从文本中剥离币种标记（前置或后置），返回 (币种, 剩余文本)
fn strip_currency(text: &str) -> (Option<String>, String) {
    // ISO 代码前置: "USD 12.50" / "usd12.50"
    let prefix: String = text.chars().take(3).collect();
    if prefix.len() == 3 && is_known_currency(&prefix) {
        let rest = &text[3..];
        if rest.trim_start().starts_with(|c: char| c.is_ascii_digit() || c == '-' || c == '.') {
            return (Some(prefix.to_ascii_uppercase()), rest.to_string());
        }
    }

    // ISO 代码后置: "12.50 EUR"
    let chars: Vec<char> = text.chars().collect();
    if chars.len() > 3 {
        let suffix: String = chars[chars.len() - 3..].iter().collect();
        let before = chars[chars.len() - 4];
        if is_known_currency(&suffix) && (before.is_ascii_digit() || before.is_whitespace())
        {
            let rest: String = chars[..chars.len() - 3].iter().collect();
            return (Some(suffix.to_ascii_uppercase()), rest);
        }
    }

    for (symbol, code) in CURRENCY_SYMBOLS {
        if let Some(rest) = text.strip_prefix(symbol) {
            return (Some(code.to_string()), rest.to_string());
        }
        if let Some(rest) = text.strip_suffix(symbol) {
            return (Some(code.to_string()), rest.to_string());
        }
        // 负号在符号之前: "-$5"
        if let Some(rest) = text.strip_prefix('-').and_then(|t| t.trim_start().strip_prefix(symbol))
        {
            return (Some(code.to_string()), format!("-{}", rest.trim_start()));
        }
    }

    (None, text.to_string())
}

/// 千分位与小数点归一，输出形如 "1234.56"
fn normalize_separators(body: &str) -> Option<String> {
    let compact: String = body
        .chars()
        .filter(|c| !matches!(c, ' ' | '\'' | '’'))
        .collect();
    if compact.is_empty()
        || !compact
            .chars()
            .all(|c| c.is_ascii_digit() || c == ',' || c == '.')
        || !compact.chars().any(|c| c.is_ascii_digit())
    {
        return None;
    }

    let commas = compact.matches(',').count();
    let dots = compact.matches('.').count();

    let normalized = match (commas, dots) {
        (0, 0) => compact,
        (0, 1) => compact,
        // 1.234.567
        (0, _) => compact.replace('.', ""),
        (_, 0) => {
            let decimals = compact.rsplit(',').next().map(|s| s.len()).unwrap_or(0);
            if commas == 1 && decimals != 3 {
                // 12,5 / 12,50
                compact.replace(',', ".")
            } else {
                // 1,234 / 1,234,567
                compact.replace(',', "")
            }
        }
        _ => {
            // 两种分隔符同时出现: 最后出现者为小数点
            let last_comma = compact.rfind(',').unwrap_or(0);
            let last_dot = compact.rfind('.').unwrap_or(0);
            if last_comma > last_dot {
                if commas > 1 {
                    return None;
                }
                compact.replace('.', "").replace(',', ".")
            } else {
                if dots > 1 {
                    return None;
                }
                compact.replace(',', "")
            }
        }
    };

    if normalized.starts_with('.') {
        Some(format!("0{}", normalized))
    } else {
        Some(normalized)
    }
}

/// 文本中的币种标记（表头注解用，如 "Price (USD)" / "Preis [€]"）
pub fn detect_currency_marker(text: &str) -> Option<String> {
    let trimmed = text.trim();
    let cleaner = DataCleaner;
    if let Some(code) = cleaner.normalize_currency(trimmed) {
        return Some(code);
    }
    CURRENCY_SYMBOLS
        .iter()
        .find(|(symbol, _)| trimmed.contains(symbol))
        .map(|(_, code)| code.to_string())
}
