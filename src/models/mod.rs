pub mod attachment;
pub mod conversation;
pub mod message;
pub mod model;

pub use attachment::{FileData, PendingFile};
pub use conversation::Conversation;
pub use message::{Citation, GeneratedImage, Message, MessageDelta, Role, TokenUsage};
pub use model::{LogicalModel, ModelProfile, ToolSet};
