//! Prompt authoring core for the SD Forge desktop client: tag vocabularies,
//! completion context, inline weight annotations, auxiliary model selections
//! and txt2img payload assembly.

pub mod config;
pub mod models;
pub mod prompt;
pub mod request;
pub mod response;
pub mod tags;
