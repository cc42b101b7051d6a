//! Verification hashes and QR codes for signed letters.

use std::io::Cursor;

use anyhow::{Context, Result};
use chrono::{NaiveDateTime, SecondsFormat, SubsecRound};
use image::{DynamicImage, ImageFormat, Luma};
use qrcode::QrCode;
use sha2::{Digest, Sha256};
use uuid::Uuid;

const QR_MIN_SIZE: u32 = 256;

/// Certificates store whole seconds so the hash can be recomputed from the row.
pub fn issue_time(now: NaiveDateTime) -> NaiveDateTime {
    now.trunc_subsecs(0)
}

pub fn verification_hash(
    letter_id: Uuid,
    letter_number: &str,
    signer_id: Uuid,
    issued_at: NaiveDateTime,
) -> String {
    let issued = issued_at
        .and_utc()
        .to_rfc3339_opts(SecondsFormat::Secs, true);
    let payload = format!("{letter_id}|{letter_number}|{signer_id}|{issued}");
    hex::encode(Sha256::digest(payload.as_bytes()))
}

/// PNG bytes of a QR code pointing at `url`.
pub fn qr_png(url: &str) -> Result<Vec<u8>> {
    let code = QrCode::new(url.as_bytes()).context("failed to encode verification QR code")?;
    let buffer = code
        .render::<Luma<u8>>()
        .min_dimensions(QR_MIN_SIZE, QR_MIN_SIZE)
        .build();

    let mut cursor = Cursor::new(Vec::new());
    DynamicImage::ImageLuma8(buffer)
        .write_to(&mut cursor, ImageFormat::Png)
        .context("failed to write QR code PNG")?;
    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn issued() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, 4)
            .unwrap()
            .and_hms_milli_opt(10, 15, 30, 750)
            .unwrap()
    }

    #[test]
    fn hash_is_stable_hex_sha256() {
        let letter = Uuid::nil();
        let signer = Uuid::from_u128(1);
        let at = issue_time(issued());

        let first = verification_hash(letter, "001/SK/ORG/III/2025", signer, at);
        let second = verification_hash(letter, "001/SK/ORG/III/2025", signer, at);
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));

        let expected = hex::encode(Sha256::digest(
            format!("{letter}|001/SK/ORG/III/2025|{signer}|2025-03-04T10:15:30Z").as_bytes(),
        ));
        assert_eq!(first, expected);
    }

    #[test]
    fn hash_changes_with_any_input() {
        let at = issue_time(issued());
        let base = verification_hash(Uuid::nil(), "001", Uuid::nil(), at);
        assert_ne!(base, verification_hash(Uuid::nil(), "002", Uuid::nil(), at));
        assert_ne!(
            base,
            verification_hash(Uuid::from_u128(7), "001", Uuid::nil(), at)
        );
    }

    #[test]
    fn issue_time_drops_subseconds() {
        assert_eq!(
            issue_time(issued()),
            NaiveDate::from_ymd_opt(2025, 3, 4)
                .unwrap()
                .and_hms_opt(10, 15, 30)
                .unwrap()
        );
    }

    #[test]
    fn qr_is_a_png() {
        let bytes = qr_png("https://letters.example.org/verify/abc").unwrap();
        assert!(bytes.starts_with(&[0x89, b'P', b'N', b'G']));
    }
}
