use std::sync::Arc;

use resona_audio::DecodeError;
use resona_library::LibraryError;

/// Terminal error of a single load request. Cloneable so the same decode
/// failure can be fanned out to every request that referenced the entry.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LoadError {
    #[error("library \"{0}\" not found")]
    LibraryNotFound(String),
    #[error("instrument \"{0}\" not found")]
    InstrumentNotFound(String),
    #[error("impulse response \"{0}\" not found")]
    IrNotFound(String),
    #[error("failed to open \"{path}\": {source}")]
    OpenAudio {
        path: String,
        source: Arc<LibraryError>,
    },
    #[error("failed to decode \"{path}\": {source}")]
    Decode {
        path: String,
        source: Arc<DecodeError>,
    },
}

impl LoadError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            LoadError::LibraryNotFound(_)
                | LoadError::InstrumentNotFound(_)
                | LoadError::IrNotFound(_)
        )
    }
}
