use chrono::NaiveDate;
use serde_json::Value;

pub enum NullableValue {
    Omitted,
    Null,
    String(String),
}

pub fn classify_nullable(optional_value: Option<&Value>) -> Result<NullableValue, String> {
    match optional_value {
        None => Ok(NullableValue::Omitted),
        Some(Value::Null) => Ok(NullableValue::Null),
        Some(Value::String(s)) => Ok(NullableValue::String(s.to_owned())),
        Some(other) => Err(format!("expected string or null, got {other}")),
    }
}

/// A PATCH field that may be omitted but never cleared or blank.
pub fn required_text(body: &Value, field: &str) -> Result<Option<String>, String> {
    match classify_nullable(body.get(field))? {
        NullableValue::Omitted => Ok(None),
        NullableValue::Null => Err(format!("{field} cannot be null")),
        NullableValue::String(value) => {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                Err(format!("{field} must not be empty"))
            } else {
                Ok(Some(trimmed.to_string()))
            }
        }
    }
}

/// Nullable text: `Some(None)` clears the column, blank strings count as null.
pub fn nullable_text(body: &Value, field: &str) -> Result<Option<Option<String>>, String> {
    match classify_nullable(body.get(field))? {
        NullableValue::Omitted => Ok(None),
        NullableValue::Null => Ok(Some(None)),
        NullableValue::String(value) => {
            let trimmed = value.trim();
            Ok(Some((!trimmed.is_empty()).then(|| trimmed.to_string())))
        }
    }
}

pub fn required_date(body: &Value, field: &str) -> Result<Option<NaiveDate>, String> {
    required_text(body, field)?
        .map(|value| {
            NaiveDate::parse_from_str(&value, "%Y-%m-%d")
                .map_err(|_| format!("{field} must be a date in YYYY-MM-DD format"))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn required_text_rejects_null_and_blank() {
        let body = json!({ "a": null, "b": "  ", "c": " x ", "d": 3 });
        assert!(required_text(&body, "a").is_err());
        assert!(required_text(&body, "b").is_err());
        assert_eq!(required_text(&body, "c").unwrap(), Some("x".to_string()));
        assert!(required_text(&body, "d").is_err());
        assert_eq!(required_text(&body, "missing").unwrap(), None);
    }

    #[test]
    fn nullable_text_clears() {
        let body = json!({ "a": null, "b": "", "c": "note" });
        assert_eq!(nullable_text(&body, "a").unwrap(), Some(None));
        assert_eq!(nullable_text(&body, "b").unwrap(), Some(None));
        assert_eq!(
            nullable_text(&body, "c").unwrap(),
            Some(Some("note".to_string()))
        );
        assert_eq!(nullable_text(&body, "z").unwrap(), None);
    }

    #[test]
    fn dates_parse_iso_days() {
        let body = json!({ "d": "2025-01-15", "bad": "15/01/2025" });
        assert_eq!(
            required_date(&body, "d").unwrap(),
            NaiveDate::from_ymd_opt(2025, 1, 15)
        );
        assert!(required_date(&body, "bad").is_err());
    }
}
