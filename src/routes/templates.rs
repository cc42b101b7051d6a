use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::{Datelike, NaiveDate, NaiveDateTime, Utc};
use diesel::{dsl::count_star, prelude::*};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use super::to_iso;
use crate::auth::AuthenticatedUser;
use crate::error::{AppError, AppResult};
use crate::models::{LetterTemplate, NewLetterTemplate};
use crate::numbering::{self, NumberRequest};
use crate::rendering::TemplateLayout;
use crate::schema::{letter_templates, outgoing_letters};
use crate::state::AppState;
use crate::utils::json::{classify_nullable, required_text, NullableValue};

#[derive(Deserialize)]
pub struct CreateTemplateRequest {
    pub name: String,
    pub code: String,
    pub layout: Value,
    pub numbering_format: String,
    pub numbering_group_id: Option<Uuid>,
    pub is_active: Option<bool>,
}

#[derive(Deserialize)]
pub struct TemplateListQuery {
    #[serde(default)]
    pub active_only: bool,
}

#[derive(Deserialize)]
pub struct NumberingPreviewQuery {
    pub date: Option<NaiveDate>,
    pub unit: Option<String>,
}

#[derive(Serialize)]
pub struct TemplateResponse {
    pub id: Uuid,
    pub name: String,
    pub code: String,
    pub layout: Value,
    pub placeholders: Vec<String>,
    pub numbering_format: String,
    pub numbering_group_id: Option<Uuid>,
    pub is_active: bool,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Serialize)]
pub struct NumberingPreviewResponse {
    pub number: String,
    pub scope_id: Uuid,
    pub year: i32,
}

#[derive(AsChangeset)]
#[diesel(table_name = letter_templates)]
struct UpdateTemplateChangeset {
    name: Option<String>,
    code: Option<String>,
    layout: Option<Value>,
    numbering_format: Option<String>,
    numbering_group_id: Option<Option<Uuid>>,
    is_active: Option<bool>,
    updated_at: NaiveDateTime,
}

pub async fn list_templates(
    State(state): State<AppState>,
    Query(query): Query<TemplateListQuery>,
) -> AppResult<Json<Vec<TemplateResponse>>> {
    let mut conn = state.db()?;
    let mut rows = letter_templates::table
        .order(letter_templates::name.asc())
        .into_boxed();
    if query.active_only {
        rows = rows.filter(letter_templates::is_active.eq(true));
    }
    let templates: Vec<LetterTemplate> = rows.load(&mut conn)?;
    Ok(Json(templates.into_iter().map(to_template_response).collect()))
}

pub async fn get_template(
    State(state): State<AppState>,
    Path(template_id): Path<Uuid>,
) -> AppResult<Json<TemplateResponse>> {
    let mut conn = state.db()?;
    let template: LetterTemplate = letter_templates::table.find(template_id).first(&mut conn)?;
    Ok(Json(to_template_response(template)))
}

pub async fn create_template(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<CreateTemplateRequest>,
) -> AppResult<(StatusCode, Json<TemplateResponse>)> {
    if !user.is_admin() {
        return Err(AppError::forbidden());
    }

    let name = payload.name.trim().to_string();
    if name.is_empty() {
        return Err(AppError::bad_request("name must not be empty"));
    }
    let code = normalize_code(&payload.code)?;
    TemplateLayout::from_value(&payload.layout)?;
    let numbering_format = payload.numbering_format.trim().to_string();
    numbering::validate_format(&numbering_format)?;
    if let Some(group_id) = payload.numbering_group_id {
        numbering::validate_group_id(group_id)?;
    }

    let new_template = NewLetterTemplate {
        id: Uuid::new_v4(),
        name,
        code,
        layout: payload.layout,
        numbering_format,
        numbering_group_id: payload.numbering_group_id,
        is_active: payload.is_active.unwrap_or(true),
    };

    let mut conn = state.db()?;
    match diesel::insert_into(letter_templates::table)
        .values(&new_template)
        .execute(&mut conn)
    {
        Ok(_) => {}
        Err(diesel::result::Error::DatabaseError(
            diesel::result::DatabaseErrorKind::UniqueViolation,
            _,
        )) => {
            return Err(AppError::bad_request("template code already exists"));
        }
        Err(err) => return Err(AppError::from(err)),
    }

    info!(template_id = %new_template.id, code = %new_template.code, "template created");

    let template: LetterTemplate = letter_templates::table
        .find(new_template.id)
        .first(&mut conn)?;
    Ok((StatusCode::CREATED, Json(to_template_response(template))))
}

pub async fn update_template(
    State(state): State<AppState>,
    Path(template_id): Path<Uuid>,
    user: AuthenticatedUser,
    Json(body): Json<Value>,
) -> AppResult<Json<TemplateResponse>> {
    if !user.is_admin() {
        return Err(AppError::forbidden());
    }

    let code = required_text(&body, "code")
        .map_err(AppError::bad_request)?
        .map(|code| normalize_code(&code))
        .transpose()?;

    let numbering_format =
        required_text(&body, "numbering_format").map_err(AppError::bad_request)?;
    if let Some(format) = numbering_format.as_deref() {
        numbering::validate_format(format)?;
    }

    let layout = match body.get("layout") {
        None => None,
        Some(value) => {
            TemplateLayout::from_value(value)?;
            Some(value.clone())
        }
    };

    let numbering_group_id = match classify_nullable(body.get("numbering_group_id"))
        .map_err(AppError::bad_request)?
    {
        NullableValue::Omitted => None,
        NullableValue::Null => Some(None),
        NullableValue::String(value) => {
            let group_id = Uuid::parse_str(value.trim()).map_err(|_| {
                AppError::bad_request("numbering_group_id must be a valid UUID")
            })?;
            numbering::validate_group_id(group_id)?;
            Some(Some(group_id))
        }
    };

    let is_active = match body.get("is_active") {
        None => None,
        Some(Value::Bool(flag)) => Some(*flag),
        Some(_) => return Err(AppError::bad_request("is_active must be a boolean")),
    };

    let changeset = UpdateTemplateChangeset {
        name: required_text(&body, "name").map_err(AppError::bad_request)?,
        code,
        layout,
        numbering_format,
        numbering_group_id,
        is_active,
        updated_at: Utc::now().naive_utc(),
    };

    let mut conn = state.db()?;
    let updated = match diesel::update(letter_templates::table.find(template_id))
        .set(&changeset)
        .get_result::<LetterTemplate>(&mut conn)
    {
        Ok(template) => template,
        Err(diesel::result::Error::DatabaseError(
            diesel::result::DatabaseErrorKind::UniqueViolation,
            _,
        )) => {
            return Err(AppError::bad_request("template code already exists"));
        }
        Err(err) => return Err(AppError::from(err)),
    };

    info!(template_id = %template_id, "template updated");
    Ok(Json(to_template_response(updated)))
}

/// Templates already used by letters can only be deactivated.
pub async fn delete_template(
    State(state): State<AppState>,
    Path(template_id): Path<Uuid>,
    user: AuthenticatedUser,
) -> AppResult<impl IntoResponse> {
    if !user.is_admin() {
        return Err(AppError::forbidden());
    }

    let mut conn = state.db()?;
    let usage: i64 = outgoing_letters::table
        .filter(outgoing_letters::template_id.eq(template_id))
        .select(count_star())
        .first(&mut conn)?;
    if usage > 0 {
        return Err(AppError::bad_request(
            "cannot delete a template that is used by letters; deactivate it instead",
        ));
    }

    let deleted = diesel::delete(letter_templates::table.find(template_id)).execute(&mut conn)?;
    if deleted == 0 {
        return Err(AppError::not_found());
    }

    info!(template_id = %template_id, "template deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// Number the next letter from this template would get; nothing is consumed.
pub async fn preview_numbering(
    State(state): State<AppState>,
    Path(template_id): Path<Uuid>,
    Query(query): Query<NumberingPreviewQuery>,
) -> AppResult<Json<NumberingPreviewResponse>> {
    let mut conn = state.db()?;
    let template: LetterTemplate = letter_templates::table.find(template_id).first(&mut conn)?;

    let date = query.date.unwrap_or_else(|| Utc::now().date_naive());
    let unit = query
        .unit
        .as_deref()
        .map(str::trim)
        .filter(|unit| !unit.is_empty())
        .unwrap_or(state.config.organization_unit_code.as_str());
    let scope_id = template.numbering_scope();

    let number = numbering::preview_number(
        &mut conn,
        &NumberRequest {
            scope_id,
            format: &template.numbering_format,
            code: &template.code,
            unit,
            date,
            padding: state.config.number_padding,
        },
    )?;

    Ok(Json(NumberingPreviewResponse {
        number,
        scope_id,
        year: date.year(),
    }))
}

fn normalize_code(raw: &str) -> AppResult<String> {
    let code = raw.trim().to_uppercase();
    if code.is_empty() {
        return Err(AppError::bad_request("code must not be empty"));
    }
    if !code
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '.' | '_'))
    {
        return Err(AppError::bad_request(
            "code may only contain letters, digits, '-', '.' and '_'",
        ));
    }
    Ok(code)
}

fn to_template_response(template: LetterTemplate) -> TemplateResponse {
    let placeholders = TemplateLayout::from_value(&template.layout)
        .map(|layout| layout.placeholders().into_iter().collect())
        .unwrap_or_default();

    TemplateResponse {
        id: template.id,
        name: template.name,
        code: template.code,
        layout: template.layout,
        placeholders,
        numbering_format: template.numbering_format,
        numbering_group_id: template.numbering_group_id,
        is_active: template.is_active,
        created_at: to_iso(template.created_at),
        updated_at: to_iso(template.updated_at),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_uppercased_and_checked() {
        assert_eq!(normalize_code(" sk-dir ").unwrap(), "SK-DIR");
        assert!(normalize_code("   ").is_err());
        assert!(normalize_code("S K").is_err());
        assert!(normalize_code("SK/1").is_err());
    }
}
