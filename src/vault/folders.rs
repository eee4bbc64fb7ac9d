//! Fixed vault tree layout.
//!
//! Folder names are part of the external interface: humans move plan files
//! between them, and external collaborators read them. Nothing outside this
//! module spells a folder name.

/// New raw drops and filesystem intake wrappers.
pub const INBOX: &str = "Inbox";
/// Items awaiting a human or reasoning step, including remediation intakes.
pub const NEEDS_ACTION: &str = "Needs_Action";
/// Processed intake items.
pub const DONE: &str = "Done";
/// Draft plans.
pub const PLANS: &str = "Plans";
/// Terminal folder for successfully executed plans.
pub const PLANS_COMPLETED: &str = "Plans/completed";
/// Terminal folder for failed plans.
pub const PLANS_FAILED: &str = "Plans/failed";
/// Plans awaiting a human approval move.
pub const PENDING_APPROVAL: &str = "Pending_Approval";
/// Human-approved plans, ready for the executor.
pub const APPROVED: &str = "Approved";
/// Human-rejected plans; files remain here as the rejection record.
pub const REJECTED: &str = "Rejected";
/// Social-channel intake wrappers.
pub const SOCIAL_INBOX: &str = "Social/Inbox";
/// Accounting intakes and audit reports.
pub const BUSINESS_ACCOUNTING: &str = "Business/Accounting";
/// Generated daily briefings.
pub const BUSINESS_BRIEFINGS: &str = "Business/Briefings";
/// Goal documents consumed by the autonomy loop.
pub const BUSINESS_GOALS: &str = "Business/Goals";
/// Append-only audit log partitions.
pub const LOGS: &str = "Logs";
/// Compressed audit partitions past the retention window.
pub const LOGS_ARCHIVE: &str = "Logs/archive";

/// Every folder created by [`super::VaultStore::init`]. Also the parent
/// allow-list: writes may create these on demand, nothing else.
pub const ALL: &[&str] = &[
    INBOX,
    NEEDS_ACTION,
    DONE,
    PLANS,
    PLANS_COMPLETED,
    PLANS_FAILED,
    PENDING_APPROVAL,
    APPROVED,
    REJECTED,
    SOCIAL_INBOX,
    BUSINESS_ACCOUNTING,
    BUSINESS_BRIEFINGS,
    BUSINESS_GOALS,
    LOGS,
    LOGS_ARCHIVE,
];

/// Folders the store refuses to delete from; they are the approval record.
pub const PROTECTED_PREFIXES: &[&str] = &[PENDING_APPROVAL, APPROVED, REJECTED, PLANS];
