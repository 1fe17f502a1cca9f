//! Shared harness for the sidecar's end-to-end tests and benchmarks.

pub mod harness;

pub use harness::{
    default_policy_bundle, find_free_port, init_test_tracing, HarnessPorts, TestHarness, DOMAIN,
    ROLE_HEADER,
};
