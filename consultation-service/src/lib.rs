pub mod llm;
pub mod models;
pub mod search;
pub mod service;
pub mod storage;

pub use service::create_app;
