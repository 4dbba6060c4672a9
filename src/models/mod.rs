//! Core data models for the ephemeral drop store.
//!
//! `ObjectRecord` is the durable metadata entry for one upload; the preview
//! types describe what the archive previewer reports about a stored zip.

pub mod preview;
pub mod record;
