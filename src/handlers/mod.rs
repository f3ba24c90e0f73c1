pub mod auth;
pub mod billing;
pub mod files;
pub mod message;
pub mod upload;
