//! # market-chatbot - Flea-market recommendations for 광주광역시
//!
//! A chatbot that recommends local flea markets and pop-ups to shoppers and
//! guides sellers to open booths, built as a [`flowgraph_core`] workflow.
//!
//! ## Request Flow
//!
//! 1. **Guardrails** refuse forbidden keywords, topics and out-of-area requests
//! 2. **Classification** separates small talk from market requests
//! 3. **Planning** picks retrieval tasks (`vector`, `metadata`, `web`, `seller_guide`)
//! 4. **Dispatch** runs the tasks concurrently; a failed task never blocks the join
//! 5. **Grading** sends irrelevant results through a bounded rewrite loop
//! 6. **Draft and validation** check coverage and requested facets, with one
//!    corrective retry
//!
//! ## Module Organization
//!
//! - [`settings`] - layered configuration (defaults, TOML, environment)
//! - [`dataset`] - seed markets, regions, zones and guardrail lists
//! - [`guardrails`] - request filtering
//! - [`planner`] - intent heuristics and retrieval planning
//! - [`retrieval`] - seed-backed retrievers
//! - [`generator`] - OpenAI-compatible and offline generators
//! - [`formatting`] - response text
//! - [`validation`] - draft coverage and facet checks
//! - [`schema`] / [`steps`] / [`workflow`] - the graph itself
//! - [`chatbot`] - the service entry point
//! - [`batch`] - stored-prompt replay for the CLI

pub mod batch;
pub mod chatbot;
pub mod dataset;
pub mod error;
pub mod formatting;
pub mod generator;
pub mod guardrails;
pub mod planner;
pub mod retrieval;
pub mod schema;
pub mod settings;
pub mod steps;
pub mod validation;
pub mod workflow;

pub use chatbot::{ChatOutcome, Chatbot};
pub use dataset::SeedDataset;
pub use error::{ChatbotError, Result};
pub use schema::Role;
pub use settings::Settings;
pub use steps::Step;
pub use validation::{ValidationStatus, ValidationVerdict};
pub use workflow::{Collaborators, WorkflowContext};
