use thiserror::Error;

/// Errors raised while preparing or dispatching a volume frame.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Volume rendering not supported, missing: {}", missing.join(", "))]
    Unsupported { missing: Vec<String> },

    #[error("Out of GPU memory: {0}")]
    OutOfMemory(String),

    #[error("Shader program link failed: {0}")]
    ShaderLink(String),

    #[error("Invalid volume: {0}")]
    InvalidVolume(String),

    #[error("Unsupported blend configuration: {0}")]
    InvalidConfiguration(String),

    #[error("GPU backend error: {0}")]
    Backend(String),
}

impl RenderError {
    /// Memory exhaustion is the only error the block planner recovers from.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, RenderError::OutOfMemory(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_lists_missing_capabilities() {
        let err = RenderError::Unsupported {
            missing: vec!["3D textures".into(), "float render targets".into()],
        };
        assert_eq!(
            err.to_string(),
            "Volume rendering not supported, missing: 3D textures, float render targets"
        );
    }

    #[test]
    fn test_out_of_memory_classification() {
        assert!(RenderError::OutOfMemory("block".into()).is_out_of_memory());
        assert!(!RenderError::ShaderLink("trace".into()).is_out_of_memory());
    }
}
