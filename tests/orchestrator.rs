//! Integration tests for `src/orchestrator/`.

#[path = "orchestrator/daily_cycle_test.rs"]
mod daily_cycle_test;
