use std::path::PathBuf;

/// Errors raised while constructing a sandboxed command.
///
/// Everything here happens before the jail runs. Once the wrapper script has
/// been handed back, the only failure channel is its exit status.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("sandbox dependencies unavailable: missing {missing}")]
    DependencyUnavailable { missing: String },

    #[error("jail sandboxing is not supported on {platform}")]
    UnsupportedPlatform { platform: String },

    #[error("failed to start {bridge} bridge: {reason}")]
    BridgeStartFailure { bridge: &'static str, reason: String },

    #[error("bridge sockets not ready after {attempts} attempts ({http} / {socks})")]
    BridgeNotReady {
        attempts: u32,
        http: PathBuf,
        socks: PathBuf,
    },

    #[error("{bridge} bridge process exited before becoming ready")]
    BridgeProcessDied { bridge: &'static str },

    #[error("network restriction requested but bridge socket paths were not provided")]
    MissingBridgeConfig,

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl SandboxError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

pub type Result<T, E = SandboxError> = std::result::Result<T, E>;
