mod common;

use anyhow::Result;
use axum::http::StatusCode;
use common::{acquire_db_lock, expect_error, expect_json, TestApp};
use serde_json::{json, Value};

async fn register_letter(app: &TestApp, token: &str, subject: &str) -> Result<Value> {
    let response = app
        .post_json(
            "/api/incoming-letters",
            &json!({
                "letter_number": "005/DINAS/I/2025",
                "sender": "Dinas Pendidikan",
                "subject": subject,
                "letter_date": "2025-01-10",
                "received_date": "2025-01-15",
            }),
            Some(token),
        )
        .await?;
    expect_json(response, StatusCode::CREATED).await
}

#[tokio::test]
async fn disposition_completes_letter_after_follow_up() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    let (_, secretary) = app.user_with_token("sekretaris", "secretary").await?;
    let (_, manager) = app.user_with_token("kabag", "manager").await?;
    let (staff_id, staff) = app.user_with_token("staf", "staff").await?;

    let letter = register_letter(&app, &secretary, "Undangan rapat koordinasi").await?;
    assert_eq!(letter["agenda_number"], "001/SM/ORG/I/2025");
    assert_eq!(letter["status"], "received");
    let letter_id = letter["id"].as_str().unwrap().to_string();

    let second = register_letter(&app, &secretary, "Permohonan data").await?;
    assert_eq!(second["agenda_number"], "002/SM/ORG/I/2025");

    // Only managers start a disposition chain.
    let forbidden = app
        .post_json(
            &format!("/api/incoming-letters/{letter_id}/dispositions"),
            &json!({ "to_user_id": staff_id, "instruction": "Hadiri rapat" }),
            Some(&secretary),
        )
        .await?;
    assert_eq!(forbidden.status(), StatusCode::FORBIDDEN);

    let disposition: Value = expect_json(
        app.post_json(
            &format!("/api/incoming-letters/{letter_id}/dispositions"),
            &json!({
                "to_user_id": staff_id,
                "instruction": "Hadiri rapat dan buat laporan",
                "priority": "high",
                "due_date": "2025-01-20",
            }),
            Some(&manager),
        )
        .await?,
        StatusCode::CREATED,
    )
    .await?;
    assert_eq!(disposition["status"], "pending");
    let disposition_id = disposition["id"].as_str().unwrap().to_string();

    let inbox: Vec<Value> = expect_json(
        app.get("/api/dispositions?box=inbox", Some(&staff)).await?,
        StatusCode::OK,
    )
    .await?;
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0]["letter"]["agenda_number"], "001/SM/ORG/I/2025");

    // The sender cannot act on the recipient's behalf.
    let not_recipient = app
        .post_empty(&format!("/api/dispositions/{disposition_id}/read"), &manager)
        .await?;
    assert_eq!(not_recipient.status(), StatusCode::FORBIDDEN);

    let early = app
        .post_empty(&format!("/api/dispositions/{disposition_id}/complete"), &staff)
        .await?;
    let message = expect_error(early, StatusCode::BAD_REQUEST).await?;
    assert!(message.contains("follow-up"));

    let follow_up = app
        .post_json(
            &format!("/api/dispositions/{disposition_id}/follow-ups"),
            &json!({ "note": "Sudah hadir, laporan terlampir" }),
            Some(&staff),
        )
        .await?;
    assert_eq!(follow_up.status(), StatusCode::CREATED);

    let completed: Value = expect_json(
        app.post_empty(&format!("/api/dispositions/{disposition_id}/complete"), &staff)
            .await?,
        StatusCode::OK,
    )
    .await?;
    assert_eq!(completed["status"], "completed");
    assert!(completed["completed_at"].is_string());

    let detail: Value = expect_json(
        app.get(&format!("/api/incoming-letters/{letter_id}"), Some(&secretary))
            .await?,
        StatusCode::OK,
    )
    .await?;
    assert_eq!(detail["status"], "completed");
    assert_eq!(detail["disposition_progress"]["total"], 1);
    assert_eq!(detail["disposition_progress"]["percentage"], 100);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn delegated_dispositions_form_a_tree() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    let (_, secretary) = app.user_with_token("sekretaris", "secretary").await?;
    let (_, manager) = app.user_with_token("kabag", "manager").await?;
    let (lead_id, lead) = app.user_with_token("kasubag", "staff").await?;
    let (staff_id, staff) = app.user_with_token("staf", "staff").await?;

    let letter = register_letter(&app, &secretary, "Laporan keuangan").await?;
    let letter_id = letter["id"].as_str().unwrap().to_string();

    let root: Value = expect_json(
        app.post_json(
            &format!("/api/incoming-letters/{letter_id}/dispositions"),
            &json!({ "to_user_id": lead_id, "instruction": "Tindak lanjuti" }),
            Some(&manager),
        )
        .await?,
        StatusCode::CREATED,
    )
    .await?;
    let root_id = root["id"].as_str().unwrap().to_string();

    // Someone who is not the recipient cannot delegate the root further.
    let stranger = app
        .post_json(
            &format!("/api/incoming-letters/{letter_id}/dispositions"),
            &json!({
                "to_user_id": lead_id,
                "instruction": "Bantu",
                "parent_disposition_id": root_id,
            }),
            Some(&staff),
        )
        .await?;
    assert_eq!(stranger.status(), StatusCode::FORBIDDEN);

    let child: Value = expect_json(
        app.post_json(
            &format!("/api/incoming-letters/{letter_id}/dispositions"),
            &json!({
                "to_user_id": staff_id,
                "instruction": "Siapkan rekap",
                "parent_disposition_id": root_id,
            }),
            Some(&lead),
        )
        .await?,
        StatusCode::CREATED,
    )
    .await?;
    assert_eq!(child["parent_disposition_id"], root_id.as_str());

    let detail: Value = expect_json(
        app.get(&format!("/api/incoming-letters/{letter_id}"), Some(&manager))
            .await?,
        StatusCode::OK,
    )
    .await?;
    let tree = detail["dispositions"].as_array().unwrap();
    assert_eq!(tree.len(), 1);
    assert_eq!(tree[0]["id"], root_id.as_str());
    assert_eq!(tree[0]["children"].as_array().unwrap().len(), 1);
    assert_eq!(detail["disposition_progress"]["total"], 2);
    assert_eq!(detail["status"], "disposed");

    let blocked = app
        .delete(&format!("/api/dispositions/{root_id}"), Some(&manager))
        .await?;
    expect_error(blocked, StatusCode::BAD_REQUEST).await?;
    assert_eq!(app.count_rows("dispositions").await?, 2);

    // A letter with dispositions cannot be deleted either.
    let delete_letter = app
        .delete(&format!("/api/incoming-letters/{letter_id}"), Some(&secretary))
        .await?;
    expect_error(delete_letter, StatusCode::BAD_REQUEST).await?;

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn attachment_upload_and_download() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    let (_, secretary) = app.user_with_token("sekretaris", "secretary").await?;
    let letter = register_letter(&app, &secretary, "Surat edaran").await?;
    let letter_id = letter["id"].as_str().unwrap().to_string();

    let uploaded: Value = expect_json(
        app.upload_file(
            &format!("/api/incoming-letters/{letter_id}/attachment"),
            "edaran.pdf",
            "application/pdf",
            b"%PDF-1.4 scan",
            &secretary,
        )
        .await?,
        StatusCode::OK,
    )
    .await?;
    assert_eq!(uploaded["attachment"]["name"], "edaran.pdf");
    let checksum = uploaded["attachment"]["checksum"].as_str().unwrap();

    let stored = app
        .storage()
        .get(&format!("incoming/{letter_id}/{checksum}"))
        .await
        .expect("attachment stored");
    assert_eq!(stored.bytes, b"%PDF-1.4 scan");

    let download: Value = expect_json(
        app.get(
            &format!("/api/incoming-letters/{letter_id}/attachment"),
            Some(&secretary),
        )
        .await?,
        StatusCode::OK,
    )
    .await?;
    assert!(download["url"]
        .as_str()
        .unwrap()
        .starts_with("https://fake-storage/incoming/"));

    app.cleanup().await?;
    Ok(())
}
