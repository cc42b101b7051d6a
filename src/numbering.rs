//! Sequential document numbers.
//!
//! A numbering format is a string with `{token}` placeholders:
//!
//! | token     | value                                  |
//! |-----------|----------------------------------------|
//! | `{no}`    | sequence, zero padded                  |
//! | `{kode}`  | template code                          |
//! | `{unit}`  | organization unit code                 |
//! | `{bulan}` | month as a Roman numeral (`I`..`XII`)  |
//! | `{tahun}` | four digit year                        |
//!
//! Sequences live in `numbering_counters`, one row per scope and year, and are
//! advanced with a single upsert so that two allocations in the same scope can
//! never observe the same value.

use chrono::{Datelike, NaiveDate, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use thiserror::Error;
use uuid::Uuid;

use crate::schema::numbering_counters;

pub const DEFAULT_PADDING: usize = 3;

/// Scope reserved for incoming-letter agenda numbers.
pub const INCOMING_AGENDA_SCOPE: Uuid = Uuid::nil();

const KNOWN_TOKENS: &[&str] = &["no", "kode", "unit", "bulan", "tahun"];

#[derive(Debug, Error)]
pub enum NumberingError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("numbering format must contain the {{no}} token")]
    MissingSequence,
    #[error("unknown numbering token {{{0}}}")]
    UnknownToken(String),
    #[error("numbering group {0} is reserved")]
    ReservedScope(Uuid),
}

#[derive(Debug, Clone)]
pub struct NumberingContext<'a> {
    pub sequence: i32,
    pub code: &'a str,
    pub unit: &'a str,
    pub date: NaiveDate,
    pub padding: usize,
}

pub fn to_roman(month: u32) -> &'static str {
    match month {
        1 => "I",
        2 => "II",
        3 => "III",
        4 => "IV",
        5 => "V",
        6 => "VI",
        7 => "VII",
        8 => "VIII",
        9 => "IX",
        10 => "X",
        11 => "XI",
        12 => "XII",
        _ => "",
    }
}

pub fn format_number(format: &str, ctx: &NumberingContext<'_>) -> String {
    let mut out = String::with_capacity(format.len() + 16);
    let mut rest = format;

    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let candidate = &rest[start..];
        let Some(end) = candidate.find('}') else {
            out.push_str(candidate);
            return out;
        };

        match render_token(&candidate[1..end], ctx) {
            Some(value) => out.push_str(&value),
            None => out.push_str(&candidate[..=end]),
        }
        rest = &candidate[end + 1..];
    }

    out.push_str(rest);
    out
}

fn render_token(token: &str, ctx: &NumberingContext<'_>) -> Option<String> {
    let value = match token {
        "no" => format!("{:0width$}", ctx.sequence, width = ctx.padding),
        "kode" => ctx.code.to_string(),
        "unit" => ctx.unit.to_string(),
        "bulan" => to_roman(ctx.date.month()).to_string(),
        "tahun" => ctx.date.year().to_string(),
        _ => return None,
    };
    Some(value)
}

/// Checks a format before it is stored on a template.
pub fn validate_format(format: &str) -> Result<(), NumberingError> {
    let mut has_sequence = false;
    let mut rest = format;
    while let Some(start) = rest.find('{') {
        let candidate = &rest[start..];
        let Some(end) = candidate.find('}') else {
            break;
        };
        let token = &candidate[1..end];
        if !KNOWN_TOKENS.contains(&token) {
            return Err(NumberingError::UnknownToken(token.to_string()));
        }
        has_sequence |= token == "no";
        rest = &candidate[end + 1..];
    }

    if has_sequence {
        Ok(())
    } else {
        Err(NumberingError::MissingSequence)
    }
}

/// Templates may not share a counter with incoming-letter agenda numbers.
pub fn validate_group_id(group_id: Uuid) -> Result<(), NumberingError> {
    if group_id == INCOMING_AGENDA_SCOPE {
        Err(NumberingError::ReservedScope(group_id))
    } else {
        Ok(())
    }
}

/// Advances the counter for `scope_id`/`year` and returns the new value.
///
/// Must run inside the transaction that stores the numbered row; the counter
/// row stays locked until that transaction ends.
pub fn next_sequence(
    conn: &mut PgConnection,
    scope_id: Uuid,
    year: i32,
) -> Result<i32, NumberingError> {
    let now = Utc::now().naive_utc();
    let value = diesel::insert_into(numbering_counters::table)
        .values((
            numbering_counters::scope_id.eq(scope_id),
            numbering_counters::year.eq(year),
            numbering_counters::last_number.eq(1),
            numbering_counters::updated_at.eq(now),
        ))
        .on_conflict((numbering_counters::scope_id, numbering_counters::year))
        .do_update()
        .set((
            numbering_counters::last_number.eq(numbering_counters::last_number + 1),
            numbering_counters::updated_at.eq(now),
        ))
        .returning(numbering_counters::last_number)
        .get_result::<i32>(conn)?;
    Ok(value)
}

/// The value `next_sequence` would hand out, without consuming it.
pub fn peek_sequence(
    conn: &mut PgConnection,
    scope_id: Uuid,
    year: i32,
) -> Result<i32, NumberingError> {
    let current: Option<i32> = numbering_counters::table
        .find((scope_id, year))
        .select(numbering_counters::last_number)
        .first(conn)
        .optional()?;
    Ok(current.unwrap_or(0) + 1)
}

pub struct NumberRequest<'a> {
    pub scope_id: Uuid,
    pub format: &'a str,
    pub code: &'a str,
    pub unit: &'a str,
    pub date: NaiveDate,
    pub padding: usize,
}

pub fn allocate_number(
    conn: &mut PgConnection,
    request: &NumberRequest<'_>,
) -> Result<String, NumberingError> {
    let sequence = next_sequence(conn, request.scope_id, request.date.year())?;
    Ok(format_number(request.format, &request.context(sequence)))
}

pub fn preview_number(
    conn: &mut PgConnection,
    request: &NumberRequest<'_>,
) -> Result<String, NumberingError> {
    let sequence = peek_sequence(conn, request.scope_id, request.date.year())?;
    Ok(format_number(request.format, &request.context(sequence)))
}

impl<'a> NumberRequest<'a> {
    fn context(&self, sequence: i32) -> NumberingContext<'a> {
        NumberingContext {
            sequence,
            code: self.code,
            unit: self.unit,
            date: self.date,
            padding: self.padding,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agenda_scope_is_not_a_template_group() {
        assert!(matches!(
            validate_group_id(INCOMING_AGENDA_SCOPE),
            Err(NumberingError::ReservedScope(_))
        ));
        assert!(validate_group_id(Uuid::new_v4()).is_ok());
    }

    fn ctx(sequence: i32, month: u32) -> NumberingContext<'static> {
        NumberingContext {
            sequence,
            code: "SK",
            unit: "ORG",
            date: NaiveDate::from_ymd_opt(2025, month, 14).unwrap(),
            padding: DEFAULT_PADDING,
        }
    }

    #[test]
    fn formats_every_token() {
        let number = format_number("{no}/{kode}/{unit}/{bulan}/{tahun}", &ctx(7, 3));
        assert_eq!(number, "007/SK/ORG/III/2025");
    }

    #[test]
    fn sequence_wider_than_padding_is_kept_whole() {
        assert_eq!(format_number("{no}", &ctx(12345, 1)), "12345");
    }

    #[test]
    fn unknown_and_unterminated_tokens_pass_through() {
        assert_eq!(
            format_number("{no}-{seri}-{tahun", &ctx(1, 12)),
            "001-{seri}-{tahun"
        );
    }

    #[test]
    fn roman_months() {
        let months: Vec<&str> = (1..=12).map(to_roman).collect();
        assert_eq!(
            months,
            ["I", "II", "III", "IV", "V", "VI", "VII", "VIII", "IX", "X", "XI", "XII"]
        );
        assert_eq!(to_roman(0), "");
        assert_eq!(to_roman(13), "");
    }

    #[test]
    fn validation_requires_sequence_token() {
        assert!(validate_format("{no}/{kode}/{tahun}").is_ok());
        assert!(matches!(
            validate_format("{kode}/{tahun}"),
            Err(NumberingError::MissingSequence)
        ));
        assert!(matches!(
            validate_format("{no}/{dept}"),
            Err(NumberingError::UnknownToken(token)) if token == "dept"
        ));
    }

    #[test]
    fn higher_sequence_sorts_after_lower_one() {
        let first = format_number("{no}/{kode}/{tahun}", &ctx(9, 5));
        let second = format_number("{no}/{kode}/{tahun}", &ctx(10, 5));
        assert!(second > first);
    }
}
