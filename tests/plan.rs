//! Integration tests for `src/plan/`.

#[path = "plan/approval_protocol_test.rs"]
mod approval_protocol_test;
