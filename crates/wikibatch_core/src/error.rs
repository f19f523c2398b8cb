use thiserror::Error;

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Failure of a single round-trip or mutating action against the wiki API.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("MediaWiki API request failed with HTTP {0}")]
    Http(u16),

    #[error("failed to decode MediaWiki API response: {0}")]
    Decode(String),

    #[error("rate limited [{code}]: {info}")]
    RateLimited { code: String, info: String },

    #[error("protected [{code}]: {info}")]
    Protected { code: String, info: String },

    #[error("not found [{code}]: {info}")]
    NotFound { code: String, info: String },

    #[error("bad token [{code}]: {info}")]
    BadToken { code: String, info: String },

    #[error("MediaWiki API error [{code}]: {info}")]
    Api { code: String, info: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Decode,
    RateLimited,
    Protected,
    NotFound,
    BadToken,
    Api,
    Io,
}

impl ApiError {
    /// Classify a server-reported error code.
    pub fn from_code(code: &str, info: &str) -> Self {
        let code_owned = code.to_string();
        let info = info.to_string();
        match code {
            "ratelimited" => Self::RateLimited {
                code: code_owned,
                info,
            },
            "protectedpage" | "cascadeprotected" | "protectedtitle" | "protectednamespace"
            | "protectednamespace-interface" | "permissiondenied" | "blocked" | "readonly" => {
                Self::Protected {
                    code: code_owned,
                    info,
                }
            }
            "missingtitle" | "nosuchpageid" | "cantundelete" => Self::NotFound {
                code: code_owned,
                info,
            },
            "badtoken" | "notoken" => Self::BadToken {
                code: code_owned,
                info,
            },
            _ => Self::Api {
                code: code_owned,
                info,
            },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport(_) | Self::Http(_) => ErrorKind::Transport,
            Self::Decode(_) => ErrorKind::Decode,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::Protected { .. } => ErrorKind::Protected,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::BadToken { .. } => ErrorKind::BadToken,
            Self::Api { .. } => ErrorKind::Api,
            Self::Io(_) => ErrorKind::Io,
        }
    }

    /// Server error code, when the failure came from an API error payload.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::RateLimited { code, .. }
            | Self::Protected { code, .. }
            | Self::NotFound { code, .. }
            | Self::BadToken { code, .. }
            | Self::Api { code, .. } => Some(code),
            _ => None,
        }
    }

    /// Whether a mutating action may be attempted again after this failure.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self.kind(),
            ErrorKind::Protected | ErrorKind::NotFound | ErrorKind::Io
        )
    }
}

/// Programmer error in the shape of a query; raised before any request is sent.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueryTemplateError {
    #[error("query parameter `{0}` is a required placeholder and was never set")]
    UnsetParameter(String),

    #[error("group size must be at least 1")]
    ZeroGroupSize,

    #[error("batched query template does not declare the `{0}` parameter")]
    MissingTitleParameter(String),
}
