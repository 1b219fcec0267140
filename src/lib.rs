//! Local archive of saved Instagram content.
//!
//! Two long-running pipelines cooperate on one JSON-array archive: an
//! enricher that fetches post metadata and media through the platform's
//! private web API, and an extractor that mines text out of the downloaded
//! media (Whisper transcription, frame/image OCR). Both write through the
//! store's lock-guarded patch path, so they can run as separate processes on
//! the same file.

pub mod config;
pub mod constants;
pub mod extract;
pub mod instagram;
pub mod models;
pub mod retry;
pub mod store;
