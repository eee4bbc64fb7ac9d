//! Integration tests for `src/watchers/`.

#[path = "watchers/at_most_once_test.rs"]
mod at_most_once_test;
#[path = "watchers/degradation_test.rs"]
mod degradation_test;
