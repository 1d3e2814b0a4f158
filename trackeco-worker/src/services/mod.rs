//! Worker services
//!
//! Each pipeline phase lives in its own service module; `pipeline` wires
//! them together in order.

pub mod credential_pool;
pub mod gemini_client;
pub mod interpreter;
pub mod job_guard;
pub mod ledger;
pub mod media_store;
pub mod notifier;
pub mod points;
pub mod prompt;
pub mod search;
pub mod team_aggregator;

pub use credential_pool::CredentialPool;
pub use gemini_client::GeminiClient;
pub use media_store::MediaStore;
