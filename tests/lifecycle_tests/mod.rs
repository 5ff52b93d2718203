//! Integration tests for the create/destroy pipeline
//!
//! # Test Organization
//!
//! Tests are organized by the story they tell:
//!
//! - `create_stories`: Stories about bringing a node from nothing to a
//!   recorded, reachable deployment, and about what is left behind when a
//!   stage fails (nothing)
//!
//! - `destroy_stories`: Stories about tearing a cluster down, including what
//!   survives a failed teardown so it can be retried
//!
//! - `state_file`: Stories about records outliving the process that wrote them

mod create_stories;
mod destroy_stories;
mod fakes;
mod state_file;
