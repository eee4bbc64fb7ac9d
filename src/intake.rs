//! Intake wrappers: the unit of perception output.
//!
//! A watcher that perceives an upstream event writes exactly one markdown
//! wrapper describing it. Wrappers are immutable once written; the wrapper
//! file's creation is the only way a new pending item enters the pipeline.
//! `(source, id)` is globally unique: the writer scans the destination
//! folder's front matter as a crash-window backstop behind the watcher
//! checkpoints.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::audit::redactor::PiiRedactor;
use crate::vault::{folders, VaultError, VaultStore};

/// Maximum excerpt length in characters; longer content is truncated at
/// exactly this cap and marked with an ellipsis.
pub const EXCERPT_CAP: usize = 500;

/// Kind of perceived event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntakeType {
    /// A to-do style item.
    Task,
    /// An email message.
    Email,
    /// A chat message.
    Message,
    /// A social post or comment.
    Post,
    /// An invoice lifecycle event.
    InvoiceEvent,
    /// A dropped document.
    Document,
}

impl IntakeType {
    /// String form used in front matter.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Email => "email",
            Self::Message => "message",
            Self::Post => "post",
            Self::InvoiceEvent => "invoice_event",
            Self::Document => "document",
        }
    }

    /// Parse the front-matter form.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown type names.
    pub fn parse(s: &str) -> Result<Self, IntakeError> {
        match s {
            "task" => Ok(Self::Task),
            "email" => Ok(Self::Email),
            "message" => Ok(Self::Message),
            "post" => Ok(Self::Post),
            "invoice_event" => Ok(Self::InvoiceEvent),
            "document" => Ok(Self::Document),
            other => Err(IntakeError::InvalidType(other.to_owned())),
        }
    }
}

/// One perceived event, ready to be wrapped.
#[derive(Debug, Clone)]
pub struct IntakeItem {
    /// Identity stable across reruns for the same upstream event.
    pub id: String,
    /// Watcher identifier.
    pub source: String,
    /// When the watcher perceived it (UTC).
    pub received_at: DateTime<Utc>,
    /// Event kind.
    pub intake_type: IntakeType,
    /// Originating party.
    pub sender: String,
    /// Subject or title.
    pub subject: String,
    /// Bounded body excerpt (redacted at write time).
    pub excerpt: String,
    /// Path to the preserved original, if one exists.
    pub raw_ref: Option<String>,
    /// Whether the upstream event carried attachments.
    pub has_attachments: bool,
    /// Urgency hint surfaced to the human (`normal` unless the source says
    /// otherwise).
    pub urgency: String,
}

/// Intake failures.
#[derive(Debug, Error)]
pub enum IntakeError {
    /// Vault I/O failed.
    #[error(transparent)]
    Vault(#[from] VaultError),
    /// Unknown intake type in front matter.
    #[error("invalid intake type: {0}")]
    InvalidType(String),
    /// The wrapper file is missing its front matter block.
    #[error("malformed intake wrapper: {0}")]
    Malformed(String),
}

/// Outcome of attempting to write a wrapper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// A new wrapper was created at this vault-relative path.
    Created(String),
    /// An identical `(source, id)` wrapper already exists; nothing written.
    Duplicate,
}

/// Writes intake wrappers with redacted excerpts and identity dedup.
#[derive(Debug)]
pub struct IntakeWriter {
    vault: VaultStore,
    redactor: PiiRedactor,
}

impl IntakeWriter {
    /// Create a writer over a vault with the default redactor.
    pub fn new(vault: VaultStore) -> Self {
        Self {
            vault,
            redactor: PiiRedactor::new(),
        }
    }

    /// Write one wrapper into `dest_folder` under `file_name`.
    ///
    /// Applies the excerpt cap and PII redaction to the excerpt only (the
    /// preserved original, if any, is untouched). Skips the write when a
    /// wrapper with the same `(source, id)` already exists in the folder.
    ///
    /// # Errors
    ///
    /// Returns an error on vault I/O failure.
    pub fn write(
        &self,
        dest_folder: &str,
        file_name: &str,
        item: &IntakeItem,
    ) -> Result<WriteOutcome, IntakeError> {
        if self.identity_exists(dest_folder, &item.source, &item.id)? {
            debug!(
                source = %item.source,
                id = %item.id,
                "duplicate intake discarded"
            );
            return Ok(WriteOutcome::Duplicate);
        }

        let rel = format!("{dest_folder}/{file_name}");
        let document = self.render(item);
        self.vault.write_atomic(&rel, document.as_bytes())?;
        debug!(path = %rel, source = %item.source, "intake wrapper created");
        Ok(WriteOutcome::Created(rel))
    }

    /// Whether a wrapper with this `(source, id)` already exists in the
    /// folder.
    fn identity_exists(
        &self,
        dest_folder: &str,
        source: &str,
        id: &str,
    ) -> Result<bool, IntakeError> {
        for rel in self.vault.list(&format!("{dest_folder}/*.md"))? {
            let Ok(text) = self.vault.read_to_string(&rel) else {
                continue;
            };
            let Ok(front) = parse_front_matter(&text) else {
                continue;
            };
            if front.get("source").map(String::as_str) == Some(source)
                && front.get("id").map(String::as_str) == Some(id)
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn render(&self, item: &IntakeItem) -> String {
        let excerpt = truncate_excerpt(&self.redactor.redact(&item.excerpt));
        let mut doc = format!(
            "---\n\
             source: {source}\n\
             received: {received}\n\
             type: {intake_type}\n\
             id: {id}\n\
             sender: {sender}\n\
             subject: {subject}\n\
             has_attachments: {attachments}\n\
             urgency: {urgency}\n\
             ---\n\n\
             ## Raw / Excerpt\n\n\
             ```\n{excerpt}\n```\n\n\
             ## Audit Trail\n\n\
             - {received} created by watcher:{source}\n",
            source = item.source,
            received = item.received_at.format("%Y-%m-%dT%H:%M:%SZ"),
            intake_type = item.intake_type.as_str(),
            id = item.id,
            sender = item.sender,
            subject = item.subject,
            attachments = item.has_attachments,
            urgency = item.urgency,
            excerpt = excerpt,
        );
        if let Some(ref raw_ref) = item.raw_ref {
            doc.push_str(&format!("- original preserved at {raw_ref}\n"));
        }
        doc
    }
}

/// Truncate to [`EXCERPT_CAP`] characters, appending an ellipsis when
/// content was dropped.
pub fn truncate_excerpt(text: &str) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(EXCERPT_CAP).collect();
    if chars.next().is_some() {
        format!("{head}…")
    } else {
        head
    }
}

/// Parse the `---` front matter block into key/value pairs.
///
/// # Errors
///
/// Returns [`IntakeError::Malformed`] when the block is missing.
pub fn parse_front_matter(document: &str) -> Result<BTreeMap<String, String>, IntakeError> {
    let mut lines = document.lines();
    if lines.next().map(str::trim) != Some("---") {
        return Err(IntakeError::Malformed("missing front matter".to_owned()));
    }
    let mut map = BTreeMap::new();
    for line in lines {
        if line.trim() == "---" {
            return Ok(map);
        }
        if let Some((key, value)) = line.split_once(':') {
            map.insert(key.trim().to_owned(), value.trim().to_owned());
        }
    }
    Err(IntakeError::Malformed(
        "unterminated front matter".to_owned(),
    ))
}

/// File name for a remediation intake: `remediation__<source>__<ts>.md`.
pub fn remediation_file_name(source: &str, at: DateTime<Utc>) -> String {
    format!("remediation__{source}__{}.md", at.format("%Y%m%d-%H%M"))
}

/// Write a remediation intake into `Needs_Action/` describing a blocked or
/// failed operation in operator-actionable terms.
///
/// # Errors
///
/// Returns an error on vault I/O failure.
pub fn write_remediation(
    vault: &VaultStore,
    source: &str,
    subject: &str,
    detail: &str,
    at: DateTime<Utc>,
) -> Result<String, IntakeError> {
    let writer = IntakeWriter::new(vault.clone());
    let item = IntakeItem {
        id: format!("remediation-{source}-{}", at.format("%Y%m%d%H%M%S")),
        source: source.to_owned(),
        received_at: at,
        intake_type: IntakeType::Task,
        sender: "system".to_owned(),
        subject: subject.to_owned(),
        excerpt: detail.to_owned(),
        raw_ref: None,
        has_attachments: false,
        urgency: "high".to_owned(),
    };
    match writer.write(
        folders::NEEDS_ACTION,
        &remediation_file_name(source, at),
        &item,
    )? {
        WriteOutcome::Created(path) => Ok(path),
        WriteOutcome::Duplicate => Ok(format!(
            "{}/{}",
            folders::NEEDS_ACTION,
            remediation_file_name(source, at)
        )),
    }
}
