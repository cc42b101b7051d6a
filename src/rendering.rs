//! Letter templates: typed layout, validation, and HTML rendering.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::workflow::SignatoryStatus;

const BUILTIN_VARIABLES: &[&str] = &["letter_number", "subject", "recipient", "date"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("invalid template layout: {0}")]
    InvalidLayout(String),
    #[error("template layout must define at least one signature slot")]
    NoSignatureSlots,
    #[error("signature slot keys must not be empty")]
    EmptySlotKey,
    #[error("duplicate signature slot '{0}'")]
    DuplicateSlot(String),
    #[error("heading level must be between 1 and 6")]
    HeadingLevel,
    #[error("missing template variables: {}", .0.join(", "))]
    MissingVariables(Vec<String>),
    #[error("template variable '{0}' must be a string")]
    NonStringVariable(String),
    #[error("variables must be a JSON object")]
    VariablesNotObject,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateLayout {
    #[serde(default)]
    pub page: PageSettings,
    #[serde(default)]
    pub blocks: Vec<ContentBlock>,
    pub signature_slots: Vec<SignatureSlot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageSettings {
    #[serde(default = "default_page_size")]
    pub size: String,
    #[serde(default)]
    pub orientation: Orientation,
    #[serde(default)]
    pub margins: Margins,
}

impl Default for PageSettings {
    fn default() -> Self {
        Self {
            size: default_page_size(),
            orientation: Orientation::default(),
            margins: Margins::default(),
        }
    }
}

fn default_page_size() -> String {
    "A4".to_string()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    #[default]
    Portrait,
    Landscape,
}

/// Millimetres.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Margins {
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
    pub left: f32,
}

impl Default for Margins {
    fn default() -> Self {
        Self {
            top: 20.0,
            right: 20.0,
            bottom: 20.0,
            left: 25.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Align {
    #[default]
    Left,
    Center,
    Right,
    Justify,
}

impl Align {
    fn css(self) -> &'static str {
        match self {
            Align::Left => "left",
            Align::Center => "center",
            Align::Right => "right",
            Align::Justify => "justify",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Heading {
        text: String,
        #[serde(default = "default_heading_level")]
        level: u8,
        #[serde(default)]
        align: Align,
    },
    Paragraph {
        text: String,
        #[serde(default)]
        align: Align,
    },
    Spacer {
        #[serde(default = "default_spacer_height")]
        height: f32,
    },
}

fn default_heading_level() -> u8 {
    1
}

fn default_spacer_height() -> f32 {
    10.0
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureSlot {
    pub key: String,
    pub label: String,
    #[serde(default)]
    pub column: i32,
    #[serde(default = "default_sign_order")]
    pub order: i32,
}

fn default_sign_order() -> i32 {
    1
}

impl TemplateLayout {
    pub fn from_value(value: &Value) -> Result<Self, TemplateError> {
        let layout: TemplateLayout = serde_json::from_value(value.clone())
            .map_err(|err| TemplateError::InvalidLayout(err.to_string()))?;
        layout.validate()?;
        Ok(layout)
    }

    pub fn validate(&self) -> Result<(), TemplateError> {
        if self.signature_slots.is_empty() {
            return Err(TemplateError::NoSignatureSlots);
        }

        let mut seen = HashSet::new();
        for slot in &self.signature_slots {
            let key = slot.key.trim();
            if key.is_empty() {
                return Err(TemplateError::EmptySlotKey);
            }
            if !seen.insert(key) {
                return Err(TemplateError::DuplicateSlot(key.to_string()));
            }
        }

        for block in &self.blocks {
            if let ContentBlock::Heading { level, .. } = block {
                if !(1..=6).contains(level) {
                    return Err(TemplateError::HeadingLevel);
                }
            }
        }

        Ok(())
    }

    /// Variables the blocks reference, excluding built-ins.
    pub fn placeholders(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        for block in &self.blocks {
            let text = match block {
                ContentBlock::Heading { text, .. } | ContentBlock::Paragraph { text, .. } => text,
                ContentBlock::Spacer { .. } => continue,
            };
            for name in placeholder_names(text) {
                if !BUILTIN_VARIABLES.contains(&name) {
                    names.insert(name.to_string());
                }
            }
        }
        names
    }

    pub fn missing_variables(&self, variables: &Map<String, Value>) -> Vec<String> {
        self.placeholders()
            .into_iter()
            .filter(|name| {
                variables
                    .get(name)
                    .and_then(Value::as_str)
                    .map(|value| value.trim().is_empty())
                    .unwrap_or(true)
            })
            .collect()
    }

    pub fn require_variables(&self, variables: &Map<String, Value>) -> Result<(), TemplateError> {
        let missing = self.missing_variables(variables);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(TemplateError::MissingVariables(missing))
        }
    }
}

/// Variables must be a flat object of strings.
pub fn normalize_variables(value: Option<Value>) -> Result<Map<String, Value>, TemplateError> {
    let map = match value {
        None | Some(Value::Null) => return Ok(Map::new()),
        Some(Value::Object(map)) => map,
        Some(_) => return Err(TemplateError::VariablesNotObject),
    };

    for (key, value) in &map {
        if !value.is_string() {
            return Err(TemplateError::NonStringVariable(key.clone()));
        }
    }
    Ok(map)
}

fn placeholder_names(text: &str) -> impl Iterator<Item = &str> {
    let mut rest = text;
    std::iter::from_fn(move || {
        let start = rest.find("{{")?;
        let after = &rest[start + 2..];
        let end = after.find("}}")?;
        rest = &after[end + 2..];
        Some(after[..end].trim())
    })
}

pub struct RenderedSignature {
    pub slot_label: String,
    pub column: i32,
    pub order: i32,
    pub signer_name: String,
    pub status: SignatoryStatus,
    pub acted_at: Option<NaiveDateTime>,
}

pub struct RenderInput<'a> {
    pub letter_number: &'a str,
    pub subject: &'a str,
    pub recipient: &'a str,
    pub date: NaiveDate,
    pub variables: &'a Map<String, Value>,
    pub signatures: &'a [RenderedSignature],
    pub verification_url: Option<&'a str>,
}

impl RenderInput<'_> {
    fn lookup(&self, name: &str) -> Option<String> {
        match name {
            "letter_number" => Some(self.letter_number.to_string()),
            "subject" => Some(self.subject.to_string()),
            "recipient" => Some(self.recipient.to_string()),
            "date" => Some(self.date.format("%d-%m-%Y").to_string()),
            other => self
                .variables
                .get(other)
                .and_then(Value::as_str)
                .map(str::to_string),
        }
    }
}

fn substitute(text: &str, input: &RenderInput<'_>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            break;
        };
        out.push_str(&escape_html(&rest[..start]));
        let name = after[..end].trim();
        match input.lookup(name) {
            Some(value) => out.push_str(&escape_html(&value)),
            None => out.push_str(&escape_html(&rest[start..start + 2 + end + 2])),
        }
        rest = &after[end + 2..];
    }
    out.push_str(&escape_html(rest));
    out
}

pub fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

pub fn render_html(layout: &TemplateLayout, input: &RenderInput<'_>) -> String {
    let page = &layout.page;
    let orientation = match page.orientation {
        Orientation::Portrait => "portrait",
        Orientation::Landscape => "landscape",
    };

    let mut html = String::new();
    html.push_str("<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n");
    html.push_str(&format!(
        "<title>{}</title>\n",
        escape_html(input.letter_number)
    ));
    html.push_str(&format!(
        "<style>@page {{ size: {} {}; margin: {}mm {}mm {}mm {}mm; }} \
         .signatures td {{ vertical-align: top; padding: 0 12mm; }}</style>\n",
        escape_html(&page.size),
        orientation,
        page.margins.top,
        page.margins.right,
        page.margins.bottom,
        page.margins.left
    ));
    html.push_str("</head>\n<body>\n");

    for block in &layout.blocks {
        match block {
            ContentBlock::Heading { text, level, align } => html.push_str(&format!(
                "<h{level} style=\"text-align:{}\">{}</h{level}>\n",
                align.css(),
                substitute(text, input)
            )),
            ContentBlock::Paragraph { text, align } => html.push_str(&format!(
                "<p style=\"text-align:{}\">{}</p>\n",
                align.css(),
                substitute(text, input)
            )),
            ContentBlock::Spacer { height } => {
                html.push_str(&format!("<div style=\"height:{height}mm\"></div>\n"))
            }
        }
    }

    let mut columns: BTreeMap<i32, Vec<&RenderedSignature>> = BTreeMap::new();
    for signature in input.signatures {
        columns.entry(signature.column).or_default().push(signature);
    }

    html.push_str("<table class=\"signatures\"><tr>\n");
    for slots in columns.values_mut() {
        slots.sort_by_key(|slot| slot.order);
        html.push_str("<td>\n");
        for slot in slots.iter() {
            let mark = match (slot.status, slot.acted_at) {
                (SignatoryStatus::Approved, Some(at)) => {
                    format!("Signed {}", at.format("%d-%m-%Y %H:%M"))
                }
                (SignatoryStatus::Approved, None) => "Signed".to_string(),
                (SignatoryStatus::Rejected, _) => "Rejected".to_string(),
                (SignatoryStatus::Pending, _) => "Awaiting signature".to_string(),
            };
            html.push_str(&format!(
                "<div class=\"slot\"><div>{}</div><div class=\"mark\">{}</div><div><strong>{}</strong></div></div>\n",
                escape_html(&slot.slot_label),
                mark,
                escape_html(&slot.signer_name)
            ));
        }
        html.push_str("</td>\n");
    }
    html.push_str("</tr></table>\n");

    if let Some(url) = input.verification_url {
        let url = escape_html(url);
        html.push_str(&format!(
            "<p class=\"verification\">Verify this document at <a href=\"{url}\">{url}</a></p>\n"
        ));
    }

    html.push_str("</body>\n</html>\n");
    html
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn layout_value() -> Value {
        json!({
            "page": { "size": "A4", "orientation": "portrait" },
            "blocks": [
                { "type": "heading", "text": "Surat {{subject}}" },
                { "type": "paragraph", "text": "Kepada {{recipient}}, rapat pada {{meeting_date}} di {{venue}}." },
                { "type": "spacer" }
            ],
            "signature_slots": [
                { "key": "head", "label": "Head of Office", "column": 0, "order": 2 },
                { "key": "secretary", "label": "Secretary", "column": 0, "order": 1 },
                { "key": "witness", "label": "Witness", "column": 1 }
            ]
        })
    }

    #[test]
    fn parses_layout_with_defaults() {
        let layout = TemplateLayout::from_value(&layout_value()).unwrap();
        assert_eq!(layout.page.margins, Margins::default());
        assert_eq!(layout.signature_slots[2].order, 1);
        assert!(matches!(
            layout.blocks[2],
            ContentBlock::Spacer { height } if height == 10.0
        ));
    }

    #[test]
    fn rejects_bad_slots() {
        let mut value = layout_value();
        value["signature_slots"] = json!([]);
        assert_eq!(
            TemplateLayout::from_value(&value),
            Err(TemplateError::NoSignatureSlots)
        );

        value["signature_slots"] = json!([
            { "key": "a", "label": "A" },
            { "key": "a", "label": "B" }
        ]);
        assert_eq!(
            TemplateLayout::from_value(&value),
            Err(TemplateError::DuplicateSlot("a".into()))
        );

        assert!(matches!(
            TemplateLayout::from_value(&json!({ "blocks": 3 })),
            Err(TemplateError::InvalidLayout(_))
        ));
    }

    #[test]
    fn lists_custom_placeholders_only() {
        let layout = TemplateLayout::from_value(&layout_value()).unwrap();
        let names: Vec<String> = layout.placeholders().into_iter().collect();
        assert_eq!(names, vec!["meeting_date".to_string(), "venue".to_string()]);

        let mut vars = Map::new();
        vars.insert("venue".into(), json!("Aula"));
        vars.insert("meeting_date".into(), json!("  "));
        assert_eq!(
            layout.require_variables(&vars),
            Err(TemplateError::MissingVariables(vec!["meeting_date".into()]))
        );
    }

    #[test]
    fn variables_must_be_strings() {
        assert!(normalize_variables(None).unwrap().is_empty());
        assert_eq!(
            normalize_variables(Some(json!({ "n": 3 }))),
            Err(TemplateError::NonStringVariable("n".into()))
        );
        let err = normalize_variables(Some(json!(["opening"]))).unwrap_err();
        assert_eq!(err, TemplateError::VariablesNotObject);
        assert_eq!(err.to_string(), "variables must be a JSON object");
    }

    #[test]
    fn renders_escaped_values_signatures_and_verification_link() {
        let layout = TemplateLayout::from_value(&layout_value()).unwrap();
        let mut vars = Map::new();
        vars.insert("meeting_date".into(), json!("12-03-2025"));
        vars.insert("venue".into(), json!("<Aula> & Hall"));
        let signatures = vec![
            RenderedSignature {
                slot_label: "Head of Office".into(),
                column: 0,
                order: 2,
                signer_name: "Budi".into(),
                status: SignatoryStatus::Pending,
                acted_at: None,
            },
            RenderedSignature {
                slot_label: "Secretary".into(),
                column: 0,
                order: 1,
                signer_name: "Sari".into(),
                status: SignatoryStatus::Approved,
                acted_at: None,
            },
        ];
        let input = RenderInput {
            letter_number: "001/SK/ORG/III/2025",
            subject: "Undangan",
            recipient: "Tim",
            date: NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
            variables: &vars,
            signatures: &signatures,
            verification_url: Some("https://example.org/verify/ab"),
        };

        let html = render_html(&layout, &input);
        assert!(html.contains("<title>001/SK/ORG/III/2025</title>"));
        assert!(html.contains("Surat Undangan"));
        assert!(html.contains("&lt;Aula&gt; &amp; Hall"));
        assert!(html.contains("size: A4 portrait"));
        assert!(html.find("Secretary").unwrap() < html.find("Head of Office").unwrap());
        assert!(html.contains("Awaiting signature"));
        assert!(html.contains("https://example.org/verify/ab"));
    }

    #[test]
    fn unknown_placeholders_stay_visible() {
        let layout = TemplateLayout {
            page: PageSettings::default(),
            blocks: vec![ContentBlock::Paragraph {
                text: "Dear {{ nobody }}".into(),
                align: Align::Left,
            }],
            signature_slots: vec![SignatureSlot {
                key: "a".into(),
                label: "A".into(),
                column: 0,
                order: 1,
            }],
        };
        let vars = Map::new();
        let input = RenderInput {
            letter_number: "1",
            subject: "",
            recipient: "",
            date: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            variables: &vars,
            signatures: &[],
            verification_url: None,
        };
        assert!(render_html(&layout, &input).contains("Dear {{ nobody }}"));
    }
}
