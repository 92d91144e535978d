//! # Evidence Harness
//!
//! A local, evidence-grounded retrieval and answering engine.
//!
//! Evidence Harness indexes a document corpus for both lexical (FTS5) and
//! semantic (vector) search, fuses the two rankings with Reciprocal Rank
//! Fusion, and — in answer mode — synthesizes citation-backed claims,
//! verifies each claim against the retrieved evidence, and returns either
//! a fully-cited answer or an abstention with the queries it searched.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────────┐   ┌───────────────┐
//! │  Ingest  │──▶│    SQLite      │◀──│  Index build   │
//! │  (fs)    │   │ chunks + FTS5 │   │ vectors+manifest│
//! └──────────┘   └──────┬────────┘   └───────────────┘
//!                       │
//!        Router ─▶ Retrieval (lexical ∥ vector → RRF)
//!                       │
//!          search ◀─────┴─────▶ answer
//!                               Synthesize → Verify
//!                               └ ≤1 hop, ≤1 repair ┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! evi init                              # create database
//! evi ingest                            # ingest the configured corpus
//! evi index                             # build + activate a vector index
//! evi search "deployment cadence"
//! evi answer "what is the backup cadence?"
//! evi runs                              # inspect the audit trail
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Typed pipeline failure modes |
//! | [`chunk`] | Offset-preserving text chunking |
//! | [`ingest`] | Filesystem corpus ingestion |
//! | [`embedding`] | Embedding backend abstraction |
//! | [`index`] | Vector index builds and manifests |
//! | [`retrieval`] | Lexical, vector, and fused search |
//! | [`router`] | Policy-driven intent routing |
//! | [`synthesize`] | Extractive claim synthesis |
//! | [`verify`] | Claim verification and repair |
//! | [`hop`] | Bounded evidence expansion |
//! | [`orchestrate`] | The run state machine |
//! | [`trace`] | Append-only run audit trail |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod hop;
pub mod index;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod orchestrate;
pub mod retrieval;
pub mod router;
pub mod stats;
pub mod synthesize;
pub mod trace;
pub mod verify;
