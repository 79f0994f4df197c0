//! Image Errors

/// Errors raised by the image pipeline
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ImageError {
    #[error("Allocation failed for {width}x{height} frame")]
    AllocationFailure { width: u32, height: u32 },

    #[error("Decoder error: {0}")]
    Decoder(String),

    #[error("Size mismatch: {old_width}x{old_height} became {new_width}x{new_height}")]
    SizeMismatch {
        old_width: u32,
        old_height: u32,
        new_width: u32,
        new_height: u32,
    },

    #[error("Unexpected end of image data")]
    UnexpectedEof,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Image is in an error state")]
    Failed,

    #[error("No decoder for mime type: {0}")]
    NoDecoder(String),

    #[error("Decoded frames not available")]
    NotAvailable,

    #[error("Image is not locked")]
    NotLocked,

    #[error("Image already initialized")]
    AlreadyInitialized,

    #[error("Operation not allowed inside a decoder call")]
    Reentrant,
}

impl ImageError {
    /// Whether this error puts the image into the permanent error state
    pub fn is_sticky(&self) -> bool {
        matches!(
            self,
            ImageError::AllocationFailure { .. }
                | ImageError::Decoder(_)
                | ImageError::SizeMismatch { .. }
                | ImageError::UnexpectedEof
                | ImageError::NoDecoder(_)
                | ImageError::Failed
        )
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        ImageError::InvalidArgument(msg.into())
    }
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, ImageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sticky_classification() {
        assert!(ImageError::UnexpectedEof.is_sticky());
        assert!(ImageError::Decoder("bad".into()).is_sticky());
        assert!(!ImageError::invalid("index").is_sticky());
        assert!(!ImageError::NotLocked.is_sticky());
    }

    #[test]
    fn test_display() {
        let err = ImageError::SizeMismatch {
            old_width: 10,
            old_height: 10,
            new_width: 20,
            new_height: 10,
        };
        assert_eq!(err.to_string(), "Size mismatch: 10x10 became 20x10");
    }
}
