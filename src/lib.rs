pub mod acquire;
pub mod app;
pub mod config;
pub mod dispatch;
pub mod domain;
pub mod error;
pub mod input;
pub mod landing;
pub mod output;
pub mod placement;
pub mod poll;
pub mod rate_limit;
pub mod resolver;
pub mod result_log;
pub mod retry;
pub mod session;
