use thiserror::Error;

use crate::driver::GraphNodeKind;

/// Errors surfaced by graph construction, capture and execution.
#[derive(Debug, Error)]
pub enum GraphError {
    /// A driver call failed. The message is the driver's own diagnostic and is
    /// passed through without reinterpretation.
    #[error("{op} failed: {message}")]
    Driver { op: &'static str, message: String },
    /// The driver call returned, but the outcome is not usable (a capture body
    /// failed, an executable update was rejected).
    #[error("internal: {message}")]
    Internal { message: String },
    #[error("{driver} driver does not support {kind} graph nodes")]
    Unsupported {
        driver: String,
        kind: GraphNodeKind,
    },
    #[error("{what} no longer owns a device handle")]
    EmptyHandle { what: &'static str },
}

impl GraphError {
    pub fn driver(op: &'static str, message: impl Into<String>) -> Self {
        GraphError::Driver {
            op,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        GraphError::Internal {
            message: message.into(),
        }
    }

    pub fn unsupported(driver: impl Into<String>, kind: GraphNodeKind) -> Self {
        GraphError::Unsupported {
            driver: driver.into(),
            kind,
        }
    }

    pub fn is_internal(&self) -> bool {
        matches!(self, GraphError::Internal { .. })
    }

    pub fn is_driver(&self) -> bool {
        matches!(self, GraphError::Driver { .. })
    }
}

/// Convenience alias for results returned by graph routines.
pub type GraphResult<T> = Result<T, GraphError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_error_keeps_driver_message_verbatim() {
        let err = GraphError::driver("cuGraphLaunch", "code 700: an illegal memory access");
        assert!(err.is_driver());
        assert_eq!(
            err.to_string(),
            "cuGraphLaunch failed: code 700: an illegal memory access"
        );
    }

    #[test]
    fn unsupported_names_driver_and_node_kind() {
        let err = GraphError::unsupported("rocm", GraphNodeKind::MemcpyDeviceToDevice);
        assert_eq!(
            err.to_string(),
            "rocm driver does not support memcpy-d2d graph nodes"
        );
        assert!(!err.is_internal());
    }
}
