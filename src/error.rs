use std::fmt;
use std::process::ExitStatus;

pub type DeployResult<T> = Result<T, DeployError>;

/// Exit code used when configuration validation fails.
pub const EXIT_VALIDATION: i32 = 2;

/// All problems found while validating one configuration source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub context: String,
    pub problems: Vec<String>,
}

impl ValidationError {
    #[must_use]
    pub fn new(context: &str, problems: Vec<String>) -> Self {
        Self {
            context: context.to_string(),
            problems,
        }
    }

    /// Multi-line report shown to the user.
    #[must_use]
    pub fn report(&self) -> String {
        let mut out = format!("[env] validation failed: {}", self.context);
        for problem in &self.problems {
            out.push_str("\n- ");
            out.push_str(problem);
        }
        out
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.context, self.problems.join("; "))
    }
}

impl std::error::Error for ValidationError {}

#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("validation failed: {0}")]
    Validation(ValidationError),

    #[error("command failed: {command}")]
    ExternalTool {
        command: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("command not found: {0}")]
    CommandNotFound(String),

    #[error("hook '{hook}' failed: {message}")]
    Hook { hook: String, message: String },

    #[error("failed to load hooks from {path}: {message}")]
    HookLoad { path: String, message: String },

    #[error("invalid manifest input: {0}")]
    ManifestContract(String),

    #[error("SSH connection failed: {0}")]
    SshFailed(String),

    #[error("Portainer error: {0}")]
    Portainer(String),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("{0}")]
    Other(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl DeployError {
    /// Whether a failed external call is worth retrying.
    ///
    /// Only registry hiccups reported by the container platform
    /// qualify; everything else is treated as fatal.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ExternalTool { stderr, .. } => {
                stderr.contains("RegistryErrorResponse") || stderr.contains("Conflict")
            }
            _ => false,
        }
    }

    /// Captured stderr of a failed external command, if any.
    #[must_use]
    pub fn stderr(&self) -> Option<&str> {
        match self {
            Self::ExternalTool { stderr, .. } => Some(stderr),
            _ => None,
        }
    }

    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Validation(_) => EXIT_VALIDATION,
            _ => 1,
        }
    }
}

impl From<ValidationError> for DeployError {
    fn from(err: ValidationError) -> Self {
        Self::Validation(err)
    }
}
