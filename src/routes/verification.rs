use axum::{
    extract::{Path, State},
    http::header::{CACHE_CONTROL, CONTENT_TYPE},
    response::IntoResponse,
    Json,
};
use diesel::prelude::*;
use serde::Serialize;
use tracing::{info, warn};

use super::outgoing_letters::display_name;
use super::{load_user_summaries, to_iso, UserSummary};
use crate::certificate;
use crate::error::{AppError, AppResult};
use crate::models::{Certificate, LetterSignatory, OutgoingLetter};
use crate::schema::{certificates, letter_signatories, outgoing_letters};
use crate::state::AppState;

#[derive(Serialize)]
pub struct VerifiedSignatory {
    pub name: String,
    pub slot_label: String,
    pub status: String,
    pub acted_at: Option<String>,
}

#[derive(Serialize)]
pub struct VerificationResponse {
    pub verification_hash: String,
    /// False when the stored letter no longer matches the certificate.
    pub intact: bool,
    pub letter_number: String,
    pub subject: String,
    pub recipient: String,
    pub status: String,
    pub signed_at: Option<String>,
    pub issued_at: String,
    pub signer: String,
    pub signatories: Vec<VerifiedSignatory>,
    pub verification_url: String,
}

pub async fn verify_certificate(
    State(state): State<AppState>,
    Path(hash): Path<String>,
) -> AppResult<Json<VerificationResponse>> {
    let hash = normalize_hash(&hash)?;
    let mut conn = state.db()?;

    let cert: Certificate = certificates::table
        .filter(certificates::verification_hash.eq(&hash))
        .first(&mut conn)?;
    let letter: OutgoingLetter = outgoing_letters::table
        .find(cert.letter_id)
        .first(&mut conn)?;
    let rows: Vec<LetterSignatory> = letter_signatories::table
        .filter(letter_signatories::letter_id.eq(letter.id))
        .order((
            letter_signatories::slot_column.asc(),
            letter_signatories::sign_order.asc(),
        ))
        .load(&mut conn)?;
    let users = load_user_summaries(
        &mut conn,
        rows.iter().map(|row| row.user_id).chain([cert.signer_id]),
    )?;

    let recomputed = certificate::verification_hash(
        letter.id,
        &letter.letter_number,
        cert.signer_id,
        cert.issued_at,
    );
    let intact = recomputed == cert.verification_hash && letter.letter_number == cert.letter_number;
    if intact {
        info!(letter_id = %letter.id, "certificate verified");
    } else {
        warn!(
            letter_id = %letter.id,
            verification_hash = %cert.verification_hash,
            "certificate no longer matches its letter"
        );
    }

    let signatories = rows
        .into_iter()
        .map(|row| VerifiedSignatory {
            name: display_name(&UserSummary::lookup(&users, row.user_id)),
            slot_label: row.slot_label,
            status: row.status,
            acted_at: row.acted_at.map(to_iso),
        })
        .collect();

    Ok(Json(VerificationResponse {
        verification_url: state.config.verification_url(&cert.verification_hash),
        signer: display_name(&UserSummary::lookup(&users, cert.signer_id)),
        verification_hash: cert.verification_hash,
        intact,
        letter_number: letter.letter_number,
        subject: letter.subject,
        recipient: letter.recipient,
        status: letter.status,
        signed_at: letter.signed_at.map(to_iso),
        issued_at: to_iso(cert.issued_at),
        signatories,
    }))
}

/// PNG QR code of the public verification link.
pub async fn verification_qr(
    State(state): State<AppState>,
    Path(hash): Path<String>,
) -> AppResult<impl IntoResponse> {
    let hash = normalize_hash(&hash)?;
    let exists: bool = {
        let mut conn = state.db()?;
        diesel::select(diesel::dsl::exists(
            certificates::table.filter(certificates::verification_hash.eq(&hash)),
        ))
        .get_result(&mut conn)?
    };
    if !exists {
        return Err(AppError::not_found());
    }

    let png = certificate::qr_png(&state.config.verification_url(&hash))?;
    Ok((
        [
            (CONTENT_TYPE, "image/png"),
            (CACHE_CONTROL, "public, max-age=86400"),
        ],
        png,
    ))
}

/// Hashes are lowercase hex SHA-256; anything else cannot match.
fn normalize_hash(raw: &str) -> AppResult<String> {
    let hash = raw.trim().to_ascii_lowercase();
    if hash.len() == 64 && hash.chars().all(|ch| ch.is_ascii_hexdigit()) {
        Ok(hash)
    } else {
        Err(AppError::not_found())
    }
}

#[cfg(test)]
mod tests {
    use super::normalize_hash;

    #[test]
    fn hashes_are_lowercased() {
        let upper = "AB".repeat(32);
        assert_eq!(normalize_hash(&upper).unwrap(), "ab".repeat(32));
    }

    #[test]
    fn malformed_hashes_are_not_found() {
        assert_eq!(
            normalize_hash("xyz").unwrap_err().status(),
            axum::http::StatusCode::NOT_FOUND
        );
        assert!(normalize_hash(&"g".repeat(64)).is_err());
    }
}
