//! Type-driven normalization (spec §4.5 "Normalization").

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use turnflow_core::config::{BooleanTokens, SlotType};

/// Normalize a raw extracted value according to `slot_type`. `now` is
/// injected so relative dates ("tomorrow") resolve deterministically in
/// tests. `boolean_tokens` is the slot's configured token list, if any,
/// consulted only for `SlotType::Boolean`.
pub fn normalize(
    slot_type: SlotType,
    raw: &str,
    now: DateTime<Utc>,
    boolean_tokens: Option<&BooleanTokens>,
) -> Option<serde_json::Value> {
    match slot_type {
        SlotType::Text | SlotType::Entity => Some(serde_json::Value::String(raw.trim().to_string())),
        SlotType::Number => normalize_number(raw).map(|n| serde_json::json!(n)),
        SlotType::Date => normalize_date(raw, now).map(|d| serde_json::Value::String(d.format("%Y-%m-%d").to_string())),
        SlotType::Time => normalize_time(raw).map(serde_json::Value::String),
        SlotType::DateTime => normalize_date(raw, now)
            .map(|d| serde_json::Value::String(d.format("%Y-%m-%dT00:00:00Z").to_string())),
        SlotType::Email => {
            let trimmed = raw.trim().to_lowercase();
            if trimmed.contains('@') {
                Some(serde_json::Value::String(trimmed))
            } else {
                None
            }
        }
        SlotType::Phone => {
            let digits: String = raw.chars().filter(|c| c.is_ascii_digit() || *c == '+').collect();
            if digits.is_empty() {
                None
            } else {
                Some(serde_json::Value::String(digits))
            }
        }
        SlotType::Boolean => normalize_boolean(raw, boolean_tokens).map(serde_json::Value::Bool),
    }
}

fn normalize_number(raw: &str) -> Option<f64> {
    let cleaned: String = raw.chars().filter(|c| !c.is_whitespace() && *c != ',').collect();
    cleaned.parse::<f64>().ok()
}

fn normalize_boolean(raw: &str, tokens: Option<&BooleanTokens>) -> Option<bool> {
    let trimmed = raw.trim().to_lowercase();
    if let Some(tokens) = tokens {
        if tokens.true_tokens.iter().any(|t| t.trim().to_lowercase() == trimmed) {
            return Some(true);
        }
        if tokens.false_tokens.iter().any(|t| t.trim().to_lowercase() == trimmed) {
            return Some(false);
        }
        return None;
    }
    match trimmed.as_str() {
        "yes" | "y" | "true" | "是" | "对" | "好的" => Some(true),
        "no" | "n" | "false" | "否" | "不" | "算了" => Some(false),
        _ => None,
    }
}

fn normalize_time(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let parts: Vec<&str> = trimmed.split(':').collect();
    if parts.len() == 2 {
        let h: u32 = parts[0].parse().ok()?;
        let m: u32 = parts[1].parse().ok()?;
        if h < 24 && m < 60 {
            return Some(format!("{h:02}:{m:02}"));
        }
    }
    None
}

/// Resolve a date expression against `now`'s date. Supports literal
/// `YYYY-MM-DD` and the relative forms `今天`/`today`, `明天`/`tomorrow`,
/// `后天`/`day after tomorrow`. Anything else is rejected (the slot
/// extractor should fall through to the LLM for richer relative forms;
/// this is the deterministic, testable fast path per spec §9's
/// precompiled-parsing intent).
fn normalize_date(raw: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    match trimmed {
        "今天" | "today" => Some(now),
        "明天" | "tomorrow" => Some(now + Duration::days(1)),
        "后天" | "day after tomorrow" => Some(now + Duration::days(2)),
        _ => {
            let parts: Vec<&str> = trimmed.split('-').collect();
            if parts.len() == 3 {
                let y: i32 = parts[0].parse().ok()?;
                let m: u32 = parts[1].parse().ok()?;
                let d: u32 = parts[2].parse().ok()?;
                return Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).single();
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 30, 12, 0, 0).unwrap()
    }

    #[test]
    fn normalizes_tomorrow_relative_to_now() {
        let v = normalize(SlotType::Date, "明天", fixed_now(), None).unwrap();
        assert_eq!(v, serde_json::Value::String("2026-07-31".to_string()));
    }

    #[test]
    fn normalizes_literal_iso_date() {
        let v = normalize(SlotType::Date, "2026-08-15", fixed_now(), None).unwrap();
        assert_eq!(v, serde_json::Value::String("2026-08-15".to_string()));
    }

    #[test]
    fn normalizes_grouped_number() {
        let v = normalize(SlotType::Number, "1,000", fixed_now(), None).unwrap();
        assert_eq!(v, serde_json::json!(1000.0));
    }

    #[test]
    fn rejects_unparseable_date() {
        assert!(normalize(SlotType::Date, "whenever", fixed_now(), None).is_none());
    }

    #[test]
    fn normalizes_boolean_tokens() {
        assert_eq!(normalize(SlotType::Boolean, "是", fixed_now(), None), Some(serde_json::Value::Bool(true)));
        assert_eq!(normalize(SlotType::Boolean, "no", fixed_now(), None), Some(serde_json::Value::Bool(false)));
    }

    #[test]
    fn normalizes_configured_boolean_tokens() {
        let tokens = BooleanTokens {
            true_tokens: vec!["ok".to_string()],
            false_tokens: vec!["nope".to_string()],
        };
        assert_eq!(
            normalize(SlotType::Boolean, "OK", fixed_now(), Some(&tokens)),
            Some(serde_json::Value::Bool(true))
        );
        assert_eq!(
            normalize(SlotType::Boolean, "nope", fixed_now(), Some(&tokens)),
            Some(serde_json::Value::Bool(false))
        );
        assert_eq!(normalize(SlotType::Boolean, "是", fixed_now(), Some(&tokens)), None);
    }

    #[test]
    fn normalize_date_rejects_day_out_of_range() {
        assert!(normalize_date("2026-02-30", fixed_now()).is_none());
    }
}
