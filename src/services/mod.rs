//! Business logic services.
//!
//! This module contains the aggregation engine (fetch, derivation, grouping),
//! the GitLab client it consumes and the HTTP surface that exposes it.
//!
//! Services only depend on the `GitLabApi` trait, so they can be tested
//! against in-memory fakes.

pub mod aggregation;
pub mod fetch;
pub mod gitlab_client;
pub mod grouping;
pub mod http_api;
pub mod http_server;
pub mod pipeline;

pub use aggregation::AggregationService;
pub use gitlab_client::{GitLabApi, GitLabClient, GitLabClientConfig};
