//! Integration tests for the Strata control plane.
//!
//! The tests live in `tests/` and exercise cross-crate flows: worker
//! registration through the gateway dispatch, placement, command fan-out,
//! status reporting, node loss, and blue-green cutover.
