pub mod auth;
pub mod chat;
pub mod conversation;
pub mod files;
pub mod keyring;
pub mod repository;
pub mod session;
pub mod store;

pub use auth::AuthService;
pub use chat::{ChatError, ChatEvent, ChatService};
pub use conversation::ConversationService;
pub use files::{FileIntake, PreparedAttachments, Validation};
pub use keyring::CredentialStore;
pub use repository::{ConversationRepository, Snapshot};
pub use session::SessionManager;
pub use store::{ConversationStore, StoreError};
