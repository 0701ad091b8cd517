//! Secret resolution for credentials referenced from the config file.
//!
//! A secret may be given in one of three ways, checked in this order:
//!
//! 1. **Direct value** for local testing (`"api_token": "..."`)
//! 2. **File reference** for mounted secrets (`"api_token_file": "/run/secrets/kb"`)
//! 3. **Env var reference** for deployments (`"api_token_env_var": "KB_API_TOKEN"`)

use secrecy::SecretString;

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("No secret source provided (need one of: direct value, file path, or env var name)")]
    NoSourceProvided,

    #[error("Failed to read secret from file '{path}': {source}")]
    FileReadError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Environment variable '{name}' not set")]
    EnvVarNotSet { name: String },

    #[error("Environment variable '{name}' contains invalid UTF-8")]
    EnvVarNotUnicode { name: String },

    #[error("Secret from {origin} is empty")]
    Empty { origin: String },
}

pub type Result<T> = std::result::Result<T, SecretError>;

/// Where a credential comes from once the config has been read.
#[derive(Debug, Clone, PartialEq, Eq)]
enum SecretSource<'a> {
    Inline(&'a str),
    File(String),
    Env(&'a str),
}

impl<'a> SecretSource<'a> {
    /// Picks the first configured source. Empty strings count as unset.
    fn select(
        direct: Option<&'a str>,
        file_path: Option<&'a str>,
        env_var: Option<&'a str>,
    ) -> Option<Self> {
        if let Some(value) = direct.filter(|v| !v.is_empty()) {
            return Some(SecretSource::Inline(value));
        }
        if let Some(path) = file_path.filter(|p| !p.is_empty()) {
            return Some(SecretSource::File(expand_home(path)));
        }
        env_var.filter(|n| !n.is_empty()).map(SecretSource::Env)
    }

    fn origin(&self) -> String {
        match self {
            SecretSource::Inline(_) => "inline value".to_string(),
            SecretSource::File(path) => format!("file '{path}'"),
            SecretSource::Env(name) => format!("environment variable '{name}'"),
        }
    }

    fn read(&self) -> Result<String> {
        match self {
            SecretSource::Inline(value) => Ok((*value).to_string()),
            SecretSource::File(path) => {
                std::fs::read_to_string(path).map_err(|source| SecretError::FileReadError {
                    path: path.clone(),
                    source,
                })
            }
            SecretSource::Env(name) => std::env::var(name).map_err(|e| match e {
                std::env::VarError::NotPresent => SecretError::EnvVarNotSet {
                    name: (*name).to_string(),
                },
                std::env::VarError::NotUnicode(_) => SecretError::EnvVarNotUnicode {
                    name: (*name).to_string(),
                },
            }),
        }
    }
}

/// Resolves a secret from the first non-empty source.
///
/// File and env values are trimmed since both usually end in a newline.
pub fn resolve_secret(
    direct: Option<&str>,
    file_path: Option<&str>,
    env_var: Option<&str>,
) -> Result<SecretString> {
    let source =
        SecretSource::select(direct, file_path, env_var).ok_or(SecretError::NoSourceProvided)?;
    let raw = source.read()?;

    let value = match source {
        SecretSource::Inline(_) => raw.as_str(),
        _ => raw.trim(),
    };
    if value.is_empty() {
        return Err(SecretError::Empty {
            origin: source.origin(),
        });
    }
    Ok(SecretString::from(value.to_string()))
}

/// Like [`resolve_secret`], but a missing source is `Ok(None)`.
pub fn resolve_secret_optional(
    direct: Option<&str>,
    file_path: Option<&str>,
    env_var: Option<&str>,
) -> Result<Option<SecretString>> {
    match resolve_secret(direct, file_path, env_var) {
        Ok(secret) => Ok(Some(secret)),
        Err(SecretError::NoSourceProvided) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Expands a leading `~` to the user's home directory.
fn expand_home(path: &str) -> String {
    if path == "~" || path.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            return path.replacen('~', &home.to_string_lossy(), 1);
        }
    }
    path.to_string()
}
