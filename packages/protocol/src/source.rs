use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Content encoding of a submitted source file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileEncoding {
    #[default]
    Utf8,
    Base64,
    Hex,
}

/// A file in a submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceFile {
    /// Filename relative to the sandbox root. Assigned deterministically
    /// when absent.
    #[serde(default)]
    pub name: Option<String>,
    pub content: String,
    #[serde(default)]
    pub encoding: FileEncoding,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid base64 content: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("invalid hex content: {0}")]
    Hex(#[from] hex::FromHexError),
}

impl SourceFile {
    /// Decode `content` per `encoding` into the bytes to materialize.
    pub fn decoded_content(&self) -> Result<Vec<u8>, DecodeError> {
        match self.encoding {
            FileEncoding::Utf8 => Ok(self.content.as_bytes().to_vec()),
            FileEncoding::Base64 => {
                Ok(base64::engine::general_purpose::STANDARD.decode(&self.content)?)
            }
            FileEncoding::Hex => Ok(hex::decode(&self.content)?),
        }
    }
}
