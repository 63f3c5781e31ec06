//! Listen target resolution.
//!
//! Maps the small target grammar onto a listen address: `host:port`,
//! bracketed IPv6, bare hosts (port chosen by credential security), `dns:`
//! prefixes, numeric ports, and `unix:` sockets.

use std::path::PathBuf;
use thiserror::Error;

/// Default port for targets bound with secure credentials.
const DEFAULT_SECURE_PORT: u16 = 443;
/// Default port for targets bound with insecure credentials.
const DEFAULT_INSECURE_PORT: u16 = 80;

/// A parsed listen target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenTarget {
    Tcp { host: String, port: u16 },
    Unix { path: PathBuf },
}

/// Errors from target parsing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TargetError {
    #[error("could not parse target {0:?}")]
    Invalid(String),
    #[error("unix socket path must be absolute in target {0:?}")]
    RelativeUnixPath(String),
}

/// Parse a listen target string. `secure` selects the default port for
/// targets that omit one.
pub fn parse_target(target: &str, secure: bool) -> Result<ListenTarget, TargetError> {
    if let Some(path) = target.strip_prefix("unix://") {
        // Authority form: the path component must be absolute.
        if !path.starts_with('/') {
            return Err(TargetError::RelativeUnixPath(target.to_string()));
        }
        return Ok(ListenTarget::Unix {
            path: PathBuf::from(path),
        });
    }
    if let Some(path) = target.strip_prefix("unix:") {
        if path.is_empty() {
            return Err(TargetError::Invalid(target.to_string()));
        }
        return Ok(ListenTarget::Unix {
            path: PathBuf::from(path),
        });
    }

    let stripped = target
        .strip_prefix("dns:///")
        .or_else(|| target.strip_prefix("dns:"))
        .unwrap_or(target);
    if stripped.is_empty() {
        return Err(TargetError::Invalid(target.to_string()));
    }

    let default_port = if secure {
        DEFAULT_SECURE_PORT
    } else {
        DEFAULT_INSECURE_PORT
    };

    // Bracketed IPv6, with or without a port.
    if let Some(rest) = stripped.strip_prefix('[') {
        let Some((host, after)) = rest.split_once(']') else {
            return Err(TargetError::Invalid(target.to_string()));
        };
        let port = match after {
            "" => default_port,
            _ => after
                .strip_prefix(':')
                .and_then(|p| p.parse().ok())
                .ok_or_else(|| TargetError::Invalid(target.to_string()))?,
        };
        return Ok(ListenTarget::Tcp {
            host: host.to_string(),
            port,
        });
    }

    // A bare port number means localhost.
    if let Ok(port) = stripped.parse::<u16>() {
        return Ok(ListenTarget::Tcp {
            host: "localhost".to_string(),
            port,
        });
    }

    match stripped.rsplit_once(':') {
        Some((host, port_str)) => {
            if host.is_empty() || host.contains(':') {
                return Err(TargetError::Invalid(target.to_string()));
            }
            let port = port_str
                .parse()
                .map_err(|_| TargetError::Invalid(target.to_string()))?;
            Ok(ListenTarget::Tcp {
                host: host.to_string(),
                port,
            })
        }
        None => Ok(ListenTarget::Tcp {
            host: stripped.to_string(),
            port: default_port,
        }),
    }
}
