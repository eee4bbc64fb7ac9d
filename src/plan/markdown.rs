//! Markdown representation of a plan: the 12-section template humans review
//! before moving the file between approval folders.
//!
//! The registry stays authoritative for the payload; the file is the human
//! review surface and the approval token. Validation only checks that every
//! mandatory section heading is present; a missing section is a
//! precondition failure at execution time.

use chrono::{DateTime, Utc};
use thiserror::Error;

use super::Plan;

/// Mandatory section headings, in template order.
pub const SECTIONS: &[&str] = &[
    "Objective",
    "Success Criteria",
    "Files to Touch",
    "Channel/Adapter",
    "Action Type",
    "Payload",
    "Risk Level",
    "Rollback Strategy",
    "Dry-Run Preview",
    "Execution Log",
    "Change Log",
    "Approval Trail",
];

/// Placeholder used for sections populated later in the lifecycle.
const PENDING_PLACEHOLDER: &str = "_pending_";

/// Free-text fields supplied by the plan author (human or reasoning step).
#[derive(Debug, Clone, Default)]
pub struct PlanNarrative {
    /// What the plan is meant to accomplish.
    pub objective: String,
    /// How success will be judged.
    pub success_criteria: String,
    /// Vault files the plan touches, if any.
    pub files_to_touch: Vec<String>,
    /// How to undo the action if it goes wrong.
    pub rollback_strategy: String,
}

/// Errors from parsing or editing a plan document.
#[derive(Debug, Error)]
pub enum PlanDocError {
    /// One or more mandatory sections are missing.
    #[error("plan document missing mandatory sections: {}", missing.join(", "))]
    MissingSections {
        /// The absent section headings.
        missing: Vec<String>,
    },
    /// A named section was not found when editing.
    #[error("section not found: {0}")]
    SectionNotFound(String),
}

/// Render a plan into the full 12-section markdown document.
pub fn render(plan: &Plan, narrative: &PlanNarrative) -> String {
    let payload_pretty =
        serde_json::to_string_pretty(&plan.payload).unwrap_or_else(|_| "{}".to_owned());
    let files = if narrative.files_to_touch.is_empty() {
        "- none".to_owned()
    } else {
        narrative
            .files_to_touch
            .iter()
            .map(|f| format!("- {f}"))
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        "# Plan: {id}\n\n\
         ## Objective\n\n{objective}\n\n\
         ## Success Criteria\n\n{success}\n\n\
         ## Files to Touch\n\n{files}\n\n\
         ## Channel/Adapter\n\n{channel}\n\n\
         ## Action Type\n\n{action}\n\n\
         ## Payload\n\n```json\n{payload}\n```\n\n\
         ## Risk Level\n\n{risk}\n\n\
         ## Rollback Strategy\n\n{rollback}\n\n\
         ## Dry-Run Preview\n\n{placeholder}\n\n\
         ## Execution Log\n\n{placeholder}\n\n\
         ## Change Log\n\n- {created} created as draft\n\n\
         ## Approval Trail\n\n{placeholder}\n",
        id = plan.id,
        objective = or_placeholder(&narrative.objective),
        success = or_placeholder(&narrative.success_criteria),
        files = files,
        channel = plan.channel,
        action = plan.action_type,
        payload = payload_pretty,
        risk = plan.risk_level.as_str(),
        rollback = or_placeholder(&narrative.rollback_strategy),
        placeholder = PENDING_PLACEHOLDER,
        created = plan.created_at.format("%Y-%m-%dT%H:%M:%SZ"),
    )
}

fn or_placeholder(text: &str) -> &str {
    if text.trim().is_empty() {
        PENDING_PLACEHOLDER
    } else {
        text
    }
}

/// Check that every mandatory section heading is present.
///
/// # Errors
///
/// Returns [`PlanDocError::MissingSections`] listing every absent heading.
pub fn validate_sections(document: &str) -> Result<(), PlanDocError> {
    let missing: Vec<String> = SECTIONS
        .iter()
        .filter(|section| !has_section(document, section))
        .map(|s| (*s).to_owned())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(PlanDocError::MissingSections { missing })
    }
}

fn has_section(document: &str, section: &str) -> bool {
    document
        .lines()
        .any(|line| line.trim_end() == format!("## {section}"))
}

/// Replace the body of a section with new content (used for the dry-run
/// preview).
///
/// # Errors
///
/// Returns [`PlanDocError::SectionNotFound`] if the heading is absent.
pub fn set_section(
    document: &str,
    section: &str,
    content: &str,
) -> Result<String, PlanDocError> {
    let (before, _, after) = split_section(document, section)?;
    Ok(format!("{before}\n{content}\n\n{after}"))
}

/// Append a timestamped bullet to a section (execution log, change log,
/// approval trail).
///
/// # Errors
///
/// Returns [`PlanDocError::SectionNotFound`] if the heading is absent.
pub fn append_entry(
    document: &str,
    section: &str,
    at: DateTime<Utc>,
    entry: &str,
) -> Result<String, PlanDocError> {
    let (before, body, after) = split_section(document, section)?;
    let bullet = format!("- {} {entry}", at.format("%Y-%m-%dT%H:%M:%SZ"));
    let body = body.trim();
    let new_body = if body.is_empty() || body == PENDING_PLACEHOLDER {
        bullet
    } else {
        format!("{body}\n{bullet}")
    };
    Ok(format!("{before}\n{new_body}\n\n{after}"))
}

/// Split a document around one section: (up to and including the heading,
/// section body, rest starting at the next heading or end).
fn split_section<'a>(
    document: &'a str,
    section: &str,
) -> Result<(&'a str, &'a str, &'a str), PlanDocError> {
    let heading = format!("## {section}");
    let mut offset = 0usize;
    let mut heading_end = None;
    for line in document.split_inclusive('\n') {
        let end = offset.saturating_add(line.len());
        if heading_end.is_none() && line.trim_end() == heading {
            heading_end = Some(end);
        } else if let Some(he) = heading_end {
            if line.trim_start().starts_with("## ") {
                return Ok((&document[..he], &document[he..offset], &document[offset..]));
            }
        }
        offset = end;
    }
    match heading_end {
        Some(he) => Ok((&document[..he], &document[he..], "")),
        None => Err(PlanDocError::SectionNotFound(section.to_owned())),
    }
}
