//! HTTP adapter for the conversation backend API and session token handling.

pub mod http;
pub mod token;

pub use http::{classify_status, ConversationFetcher, FetcherSettings, DEFAULT_BASE_URL};
pub use token::{token_hash, TokenManager, TokenSource};
