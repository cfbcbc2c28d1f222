pub mod config;
pub mod document;
pub mod entry;
pub mod record;
pub mod source;
