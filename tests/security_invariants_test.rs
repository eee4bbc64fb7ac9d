//! Cross-cutting security invariants: PII never reaches the audit log or
//! intake excerpts, and known secret values are scrubbed everywhere.

use std::sync::Arc;

use adjutant::audit::redactor::PiiRedactor;
use adjutant::audit::{Actor, AuditEntry, AuditLogger, AuditResult};
use adjutant::credentials::{blobs, SecretsDir};
use adjutant::intake::{IntakeItem, IntakeType, IntakeWriter, WriteOutcome};
use adjutant::vault::VaultStore;
use chrono::Utc;

fn vault() -> (tempfile::TempDir, VaultStore) {
    let dir = tempfile::tempdir().expect("tempdir");
    let vault = VaultStore::init(dir.path()).expect("vault");
    (dir, vault)
}

#[test]
fn audit_entries_never_carry_pii_forms() {
    let (_dir, vault) = vault();
    let logger = AuditLogger::new(vault.clone());

    logger
        .log(
            AuditEntry::new("send_email", Actor::Ai, AuditResult::Ok)
                .target("gmail:client@example.com")
                .parameters(serde_json::json!({
                    "to": "client@example.com",
                    "cc": ["other@example.org"],
                    "phone": "+1 415 555 0199",
                    "card": "4111 1111 1111 1111",
                    "token": "ya29.a0AfH6SMBexampletokenvalue0123",
                }))
                .error_detail("upstream said: token ya29.a0AfH6SMBotherexampletoken9876 was rejected"),
        )
        .expect("log");

    let partition = format!("Logs/{}.json", Utc::now().format("%Y-%m-%d"));
    let log = vault.read_to_string(&partition).expect("read");

    for forbidden in [
        "client@example.com",
        "other@example.org",
        "415 555",
        "4111 1111",
        "ya29.a0AfH6SMB",
    ] {
        assert!(!log.contains(forbidden), "leaked: {forbidden}");
    }
    for marker in [
        "<REDACTED_EMAIL>",
        "<REDACTED_PHONE>",
        "<REDACTED_PAN>",
        "<REDACTED_TOKEN>",
    ] {
        assert!(log.contains(marker), "missing marker: {marker}");
    }
}

#[test]
fn known_secret_values_are_scrubbed_exactly() {
    let dir = tempfile::tempdir().expect("tempdir");
    let secrets = SecretsDir::new(dir.path().join("secrets"));
    secrets
        .store_json(
            blobs::ODOO,
            &serde_json::json!({
                "url": "https://erp.example.com",
                "db": "prod",
                "username": "bot",
                "api_key": "odoo-api-key-0123456789",
            }),
        )
        .expect("store");

    let vault_root = dir.path().join("vault");
    let vault = VaultStore::init(&vault_root).expect("vault");
    let logger = AuditLogger::with_redactor(
        vault.clone(),
        PiiRedactor::with_secrets(secrets.known_secrets()),
    );

    logger
        .log(
            AuditEntry::new("register_payment", Actor::Ai, AuditResult::Error)
                .error_detail("rpc failed with key odoo-api-key-0123456789"),
        )
        .expect("log");

    let partition = format!("Logs/{}.json", Utc::now().format("%Y-%m-%d"));
    let log = vault.read_to_string(&partition).expect("read");
    assert!(!log.contains("odoo-api-key-0123456789"));
    assert!(log.contains("<REDACTED_TOKEN>"));
}

#[test]
fn intake_excerpts_are_redacted_but_originals_untouched() {
    let (_dir, vault) = vault();

    // A preserved original with PII stays as-is on disk.
    vault
        .write_atomic("Inbox/raw-email.txt", b"from client@example.com: pay 4111 1111 1111 1111")
        .expect("raw");

    let writer = IntakeWriter::new(vault.clone());
    let outcome = writer
        .write(
            "Needs_Action",
            "gmail__client__pay__x.md",
            &IntakeItem {
                id: "m-1".to_owned(),
                source: "gmail".to_owned(),
                received_at: Utc::now(),
                intake_type: IntakeType::Email,
                sender: "client".to_owned(),
                subject: "payment".to_owned(),
                excerpt: "from client@example.com: pay 4111 1111 1111 1111".to_owned(),
                raw_ref: Some("Inbox/raw-email.txt".to_owned()),
                has_attachments: false,
                urgency: "normal".to_owned(),
            },
        )
        .expect("write");
    let WriteOutcome::Created(path) = outcome else {
        panic!("expected creation");
    };

    let wrapper = vault.read_to_string(&path).expect("wrapper");
    assert!(!wrapper.contains("client@example.com"));
    assert!(!wrapper.contains("4111 1111"));

    let original = vault.read_to_string("Inbox/raw-email.txt").expect("original");
    assert!(original.contains("client@example.com"), "original preserved");
}
