use std::time::Duration;

/// Slot name the conversation list is persisted under.
pub const STORE_SLOT: &str = "conversations";

/// Data directory name under `$XDG_DATA_HOME`.
pub const APP_DIR: &str = "murmur";

/// Hard per-file ceiling; anything larger is rejected outright.
pub const MAX_ATTACHMENT_BYTES: usize = 50 * 1024 * 1024;

/// Files up to this size ride inline in the message payload; larger ones
/// go through upload-and-poll and are referenced by URI.
pub const INLINE_ATTACHMENT_BYTES: usize = 7 * 1024 * 1024;

/// A single document above this size (and of a cacheable type) is bound
/// into a server-side context cache instead of being attached.
pub const CACHEABLE_DOCUMENT_BYTES: usize = 10 * 1024 * 1024;

/// The one document type eligible for context caching.
pub const CACHEABLE_DOCUMENT_MIME: &str = "application/pdf";

/// Interval between processing-status polls for an uploaded file.
pub const FILE_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Lifetime requested for a server-side context cache.
pub const CACHE_TTL_SECS: u64 = 3600;

/// Longest auto-generated conversation title, in characters.
pub const TITLE_MAX_CHARS: usize = 48;
