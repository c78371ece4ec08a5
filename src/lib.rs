pub mod cache;
pub mod config;
pub mod error;
pub mod exec;
pub mod llm;
pub mod pipeline;
pub mod schema;
pub mod track;
pub mod util;
pub mod validate;
pub mod web;
