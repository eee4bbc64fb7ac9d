//! Plan model and lifecycle: the unit of intended side-effecting work.
//!
//! A plan proposes exactly one external action on one channel. Its status
//! walks a fixed state machine, and for anything mutating the only path to
//! execution runs through a human moving the plan file into `Approved/`.

pub mod lifecycle;
pub mod markdown;
pub mod registry;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Outbound channel a plan acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Local vault filesystem.
    Filesystem,
    /// Gmail mailbox.
    Gmail,
    /// WhatsApp Web bridge.
    Whatsapp,
    /// LinkedIn member account.
    Linkedin,
    /// Instagram business account.
    Instagram,
    /// Twitter/X account (no cataloged actions yet).
    Twitter,
    /// Odoo ERP instance.
    Odoo,
}

impl Channel {
    /// String form stored in SQLite and plan ids.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Filesystem => "filesystem",
            Self::Gmail => "gmail",
            Self::Whatsapp => "whatsapp",
            Self::Linkedin => "linkedin",
            Self::Instagram => "instagram",
            Self::Twitter => "twitter",
            Self::Odoo => "odoo",
        }
    }

    /// Parse from the stored string form.
    ///
    /// # Errors
    ///
    /// Returns an error for unrecognised channel names.
    pub fn parse(s: &str) -> Result<Self, PlanFieldError> {
        match s {
            "filesystem" => Ok(Self::Filesystem),
            "gmail" => Ok(Self::Gmail),
            "whatsapp" => Ok(Self::Whatsapp),
            "linkedin" => Ok(Self::Linkedin),
            "instagram" => Ok(Self::Instagram),
            "twitter" => Ok(Self::Twitter),
            "odoo" => Ok(Self::Odoo),
            other => Err(PlanFieldError::new("channel", other)),
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Concrete action a plan performs, flagged mutating or read-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Send an email immediately.
    SendEmail,
    /// Create a Drafts entry only.
    DraftEmail,
    /// Publish a text post.
    PostText,
    /// Publish an image post.
    PostImage,
    /// Send a direct message.
    SendMessage,
    /// Create a customer invoice in draft state.
    CreateInvoice,
    /// Post (confirm) an existing invoice.
    PostInvoice,
    /// Register a payment against an invoice.
    RegisterPayment,
    /// Create a credit note.
    CreateCreditNote,
    /// Create a customer record.
    CreateCustomer,
    /// List invoices matching a query.
    ListInvoices,
    /// Summarise revenue over a period.
    RevenueSummary,
    /// Accounts-receivable aging report.
    ArAging,
    /// List customer records.
    ListCustomers,
}

impl ActionType {
    /// String form stored in SQLite and plan ids.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SendEmail => "send_email",
            Self::DraftEmail => "draft_email",
            Self::PostText => "post_text",
            Self::PostImage => "post_image",
            Self::SendMessage => "send_message",
            Self::CreateInvoice => "create_invoice",
            Self::PostInvoice => "post_invoice",
            Self::RegisterPayment => "register_payment",
            Self::CreateCreditNote => "create_credit_note",
            Self::CreateCustomer => "create_customer",
            Self::ListInvoices => "list_invoices",
            Self::RevenueSummary => "revenue_summary",
            Self::ArAging => "ar_aging",
            Self::ListCustomers => "list_customers",
        }
    }

    /// Parse from the stored string form.
    ///
    /// # Errors
    ///
    /// Returns an error for unrecognised action names.
    pub fn parse(s: &str) -> Result<Self, PlanFieldError> {
        match s {
            "send_email" => Ok(Self::SendEmail),
            "draft_email" => Ok(Self::DraftEmail),
            "post_text" => Ok(Self::PostText),
            "post_image" => Ok(Self::PostImage),
            "send_message" => Ok(Self::SendMessage),
            "create_invoice" => Ok(Self::CreateInvoice),
            "post_invoice" => Ok(Self::PostInvoice),
            "register_payment" => Ok(Self::RegisterPayment),
            "create_credit_note" => Ok(Self::CreateCreditNote),
            "create_customer" => Ok(Self::CreateCustomer),
            "list_invoices" => Ok(Self::ListInvoices),
            "revenue_summary" => Ok(Self::RevenueSummary),
            "ar_aging" => Ok(Self::ArAging),
            "list_customers" => Ok(Self::ListCustomers),
            other => Err(PlanFieldError::new("action_type", other)),
        }
    }

    /// Whether the action mutates external state and therefore requires at
    /// least one human approval before execution.
    pub fn is_mutating(&self) -> bool {
        !matches!(
            self,
            Self::ListInvoices | Self::RevenueSummary | Self::ArAging | Self::ListCustomers
        )
    }

    /// Whether the action is a monetary mutation that must never be retried
    /// by any layer, even on transient failure.
    pub fn is_no_retry(&self) -> bool {
        matches!(self, Self::RegisterPayment | Self::PostInvoice)
    }

    /// Whether the action belongs to the given channel's catalog.
    pub fn belongs_to(&self, channel: Channel) -> bool {
        match self {
            Self::SendEmail | Self::DraftEmail => channel == Channel::Gmail,
            Self::PostText => channel == Channel::Linkedin,
            Self::PostImage => matches!(channel, Channel::Linkedin | Channel::Instagram),
            Self::SendMessage => channel == Channel::Whatsapp,
            Self::CreateInvoice
            | Self::PostInvoice
            | Self::RegisterPayment
            | Self::CreateCreditNote
            | Self::CreateCustomer
            | Self::ListInvoices
            | Self::RevenueSummary
            | Self::ArAging
            | Self::ListCustomers => channel == Channel::Odoo,
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Plan lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    /// Being drafted; payload still mutable.
    Draft,
    /// Awaiting a human approval move; payload frozen.
    PendingApproval,
    /// Human approved; eligible for execution.
    Approved,
    /// Human rejected; terminal.
    Rejected,
    /// Executed successfully; terminal.
    Executed,
    /// Execution failed; terminal.
    Failed,
    /// Terminal state acknowledged by the orchestrator sweep.
    Archived,
}

impl PlanStatus {
    /// String form stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::PendingApproval => "pending_approval",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Executed => "executed",
            Self::Failed => "failed",
            Self::Archived => "archived",
        }
    }

    /// Parse from the stored string form.
    ///
    /// # Errors
    ///
    /// Returns an error for unrecognised status names.
    pub fn parse(s: &str) -> Result<Self, PlanFieldError> {
        match s {
            "draft" => Ok(Self::Draft),
            "pending_approval" => Ok(Self::PendingApproval),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "executed" => Ok(Self::Executed),
            "failed" => Ok(Self::Failed),
            "archived" => Ok(Self::Archived),
            other => Err(PlanFieldError::new("status", other)),
        }
    }

    /// Whether `self → to` is a legal state-machine edge.
    ///
    /// The executor performing a dry-run re-queue is the one legal path
    /// back from `approved` to `pending_approval`.
    pub fn can_transition(&self, to: PlanStatus) -> bool {
        use PlanStatus::{
            Approved, Archived, Draft, Executed, Failed, PendingApproval, Rejected,
        };
        matches!(
            (self, to),
            (Draft, PendingApproval)
                | (PendingApproval, Approved)
                | (PendingApproval, Rejected)
                | (Approved, Executed)
                | (Approved, Failed)
                | (Approved, PendingApproval)
                | (Executed, Archived)
                | (Failed, Archived)
                | (Rejected, Archived)
        )
    }

    /// The vault folder a plan file must live in for this status, when the
    /// status pins one.
    pub fn expected_folder(&self) -> Option<&'static str> {
        use crate::vault::folders;
        match self {
            Self::Draft => Some(folders::PLANS),
            Self::PendingApproval => Some(folders::PENDING_APPROVAL),
            Self::Approved => Some(folders::APPROVED),
            Self::Rejected => Some(folders::REJECTED),
            Self::Executed => Some(folders::PLANS_COMPLETED),
            Self::Failed => Some(folders::PLANS_FAILED),
            Self::Archived => None,
        }
    }

    /// Whether the status is terminal (only archival remains).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Rejected | Self::Executed | Self::Failed)
    }
}

impl std::fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operator-facing risk classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    /// Routine, easily reversible.
    Low,
    /// Externally visible but recoverable.
    Medium,
    /// Financial or hard to undo.
    High,
}

impl RiskLevel {
    /// String form stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    /// Parse from the stored string form.
    ///
    /// # Errors
    ///
    /// Returns an error for unrecognised risk names.
    pub fn parse(s: &str) -> Result<Self, PlanFieldError> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(PlanFieldError::new("risk_level", other)),
        }
    }
}

/// A stored field held a value outside its enum.
#[derive(Debug, Error)]
#[error("invalid {field}: {value}")]
pub struct PlanFieldError {
    /// Field name.
    pub field: &'static str,
    /// Offending value.
    pub value: String,
}

impl PlanFieldError {
    fn new(field: &'static str, value: &str) -> Self {
        Self {
            field,
            value: value.to_owned(),
        }
    }
}

/// The unit of intended side-effecting work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    /// Unique, creation-time-sortable identifier.
    pub id: String,
    /// Opaque owner key; the core does not interpret it.
    pub user_id: String,
    /// Outbound channel.
    pub channel: Channel,
    /// Concrete action.
    pub action_type: ActionType,
    /// Action payload; validated only by the adapter.
    pub payload: serde_json::Value,
    /// Lifecycle status.
    pub status: PlanStatus,
    /// Operator risk classification.
    pub risk_level: RiskLevel,
    /// Creation time (UTC).
    pub created_at: DateTime<Utc>,
    /// Last mutation time (UTC).
    pub updated_at: DateTime<Utc>,
    /// Earliest execution time, when deferred.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Vault-relative location of the plan's markdown file.
    pub file_path: Option<String>,
    /// Structured outcome, populated on execute/fail (dry-run preview
    /// included).
    pub result: Option<serde_json::Value>,
    /// Reference to the human approval event, once one exists.
    pub approval_ref: Option<String>,
    /// Whether the dry-run preview has received its second approval.
    pub dryrun_approved: bool,
}

impl Plan {
    /// Create a fresh draft plan stamped now.
    pub fn new_draft(
        user_id: impl Into<String>,
        channel: Channel,
        action_type: ActionType,
        payload: serde_json::Value,
        risk_level: RiskLevel,
        slug: &str,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: generate_id(now, channel, action_type, slug),
            user_id: user_id.into(),
            channel,
            action_type,
            payload,
            status: PlanStatus::Draft,
            risk_level,
            created_at: now,
            updated_at: now,
            scheduled_at: None,
            file_path: None,
            result: None,
            approval_ref: None,
            dryrun_approved: false,
        }
    }

    /// The canonical markdown file name for this plan.
    pub fn file_name(&self) -> String {
        plan_file_name(&self.id)
    }
}

/// Canonical plan file name: `<id>.md`.
pub fn plan_file_name(id: &str) -> String {
    format!("{id}.md")
}

/// File name for the dry-run second-approval round: `<id>.dryrun.md`.
/// The marker sits before the extension so `*.md` globs keep matching.
pub fn dryrun_file_name(id: &str) -> String {
    format!("{id}.dryrun.md")
}

/// Recover a plan id from a vault file name. Returns the id and whether
/// the file carries the dry-run marker.
pub fn id_from_file_name(name: &str) -> Option<(String, bool)> {
    let stem = name.strip_suffix(".md")?;
    match stem.strip_suffix(".dryrun") {
        Some(id) => Some((id.to_owned(), true)),
        None => Some((stem.to_owned(), false)),
    }
}

/// Generate a plan id: `WEBPLAN_<YYYYMMDDhhmm>_<channel>_<action>_<slug>`.
pub fn generate_id(
    now: DateTime<Utc>,
    channel: Channel,
    action_type: ActionType,
    slug: &str,
) -> String {
    format!(
        "WEBPLAN_{}_{}_{}_{}",
        now.format("%Y%m%d%H%M"),
        channel.as_str(),
        action_type.as_str(),
        slugify(slug),
    )
}

/// Lowercase, replace non-alphanumerics with `-`, collapse runs, cap at 40.
pub fn slugify(input: &str) -> String {
    let mut out = String::new();
    let mut last_dash = true;
    for ch in input.chars() {
        if out.len() >= 40 {
            break;
        }
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    if out.is_empty() {
        out.push_str("plan");
    }
    out
}
