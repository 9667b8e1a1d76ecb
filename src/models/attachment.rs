use base64::Engine;
use serde::{Deserialize, Serialize};

/// A file the user picked but that has not been validated or uploaded yet.
#[derive(Debug, Clone)]
pub struct PendingFile {
    pub name: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl PendingFile {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            data,
        }
    }

    /// Descriptor form kept on the message record.
    pub fn to_file_data(&self) -> FileData {
        FileData {
            name: self.name.clone(),
            mime_type: self.mime_type.clone(),
            data: base64::engine::general_purpose::STANDARD.encode(&self.data),
        }
    }
}

/// File descriptor stored on a message: name, mime type and the inline
/// payload as base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileData {
    pub name: String,
    pub mime_type: String,
    pub data: String,
}
