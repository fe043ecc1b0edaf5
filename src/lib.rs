//! # Clippings
//!
//! **A personal read-it-later knowledge pipeline.**
//!
//! Clippings ingests documents and highlights from a reading service,
//! fetches article full text for items whose body is missing, splits the
//! text into position-anchored chunks, generates vector embeddings for each
//! chunk, and serves hybrid (lexical + semantic) retrieval and LLM-powered
//! weekly digests with provenance back to the exact characters of the
//! source document.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌───────────────────┐   ┌────────────┐
//! │ Reading svc  │──▶│     Pipeline      │──▶│   SQLite   │
//! │ + web fetch  │   │ Chunk+Embed+Index │   │ FTS5 + vec │
//! └──────────────┘   └───────────────────┘   └─────┬──────┘
//!                                                  │
//!                              ┌───────────────────┤
//!                              ▼                   ▼
//!                        ┌───────────┐       ┌───────────┐
//!                        │ Retrieval │       │  Digests  │
//!                        │ (library) │       │   (LLM)   │
//!                        └───────────┘       └───────────┘
//! ```
//!
//! ## Data Flow
//!
//! 1. The **reading-service client** ([`reader`]) streams two overlapping
//!    upstream endpoints; the import job deduplicates documents by canonical
//!    URL and merges highlights by text hash.
//! 2. The **fetch job** fills in missing full text via the **content
//!    fetcher** ([`fetcher`]) under the per-domain **rate limiter**
//!    ([`rate_limit`]).
//! 3. The **chunker** ([`chunker`]) splits full text into overlapping,
//!    position-anchored chunks.
//! 4. The **embed job** generates vectors through an **embedding provider**
//!    ([`embedding`]) and mirrors them into per-dimension KNN tables.
//! 5. **Retrieval** ([`search`]) serves lexical FTS, chunk-level vector
//!    search with context windows, and the unified library read path.
//! 6. The **digest generator** ([`digest`]) clusters a date window of chunks
//!    into topics ([`clustering`]) and composes a cited summary through the
//!    **chat provider** ([`llm`]) and the **prompt registry** ([`prompts`]).
//! 7. Every external API call lands in the usage ledger ([`store`]).
//!
//! ## Jobs
//!
//! | Job | Drives | Resume cursor |
//! |-----|--------|---------------|
//! | Import | reading-service endpoints | two opaque page cursors |
//! | Fetch | content fetcher | last processed document id |
//! | Embed | embedding provider | last processed chunk id |
//! | Pipeline | import → chunk → embed → index | phase + child job ids |
//!
//! All jobs stream server-sent events, pause and cancel cooperatively, and
//! persist their cursors so a resumed job continues where it stopped.

pub mod chunker;
pub mod clustering;
pub mod config;
pub mod db;
pub mod digest;
pub mod embedding;
pub mod fetcher;
pub mod jobs;
pub mod llm;
pub mod migrate;
pub mod models;
pub mod normalize;
pub mod prompts;
pub mod rate_limit;
pub mod reader;
pub mod search;
pub mod server;
pub mod store;
