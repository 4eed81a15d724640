//! Ingress and egress binding grammar
//!
//! Agents declare where their messages come from and go to with compact
//! binding strings: `file:<glob>`, `pub:<topic>`, `sub:<pattern>`, and
//! `pipe:<name>`. Bindings are parsed and validated at configuration load;
//! a malformed binding is a fatal configuration error, never a runtime
//! surprise.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::envelope::Envelope;

/// Binding grammar violations
#[derive(Debug, Error)]
pub enum BindingError {
    #[error("unknown binding scheme {scheme:?} in {binding:?}")]
    UnknownScheme { scheme: String, binding: String },

    #[error("binding {binding:?} has an empty target")]
    EmptyTarget { binding: String },

    #[error("wildcards are only allowed on sub: bindings: {binding:?}")]
    WildcardNotAllowed { binding: String },

    #[error("invalid glob pattern {pattern:?}: {source}")]
    InvalidGlob {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    #[error("{binding:?} is not a valid {direction} binding")]
    WrongDirection {
        binding: String,
        direction: &'static str,
    },
}

/// A parsed ingress or egress binding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Binding {
    /// `file:<glob>`: watch matching files (ingress) or write payloads to a
    /// templated path (egress).
    File { pattern: String },
    /// `pub:<topic>`: publish to a literal topic.
    Publish { topic: String },
    /// `sub:<pattern>`: subscribe to a topic pattern, wildcards allowed.
    Subscribe { pattern: String },
    /// `pipe:<name>`: send into or receive from a named pipe.
    Pipe { name: String },
}

impl Binding {
    /// Parses a binding string
    pub fn parse(binding: &str) -> Result<Self, BindingError> {
        let (scheme, target) =
            binding
                .split_once(':')
                .ok_or_else(|| BindingError::UnknownScheme {
                    scheme: binding.to_owned(),
                    binding: binding.to_owned(),
                })?;
        if target.is_empty() {
            return Err(BindingError::EmptyTarget {
                binding: binding.to_owned(),
            });
        }
        match scheme {
            "file" => {
                glob::Pattern::new(target).map_err(|source| BindingError::InvalidGlob {
                    pattern: target.to_owned(),
                    source,
                })?;
                Ok(Self::File {
                    pattern: target.to_owned(),
                })
            }
            "pub" => {
                if target.contains('*') {
                    return Err(BindingError::WildcardNotAllowed {
                        binding: binding.to_owned(),
                    });
                }
                Ok(Self::Publish {
                    topic: target.to_owned(),
                })
            }
            "sub" => Ok(Self::Subscribe {
                pattern: target.to_owned(),
            }),
            "pipe" => {
                if target.contains('*') {
                    return Err(BindingError::WildcardNotAllowed {
                        binding: binding.to_owned(),
                    });
                }
                Ok(Self::Pipe {
                    name: target.to_owned(),
                })
            }
            other => Err(BindingError::UnknownScheme {
                scheme: other.to_owned(),
                binding: binding.to_owned(),
            }),
        }
    }

    /// Parses a binding and checks it is usable as an ingress source
    pub fn parse_ingress(binding: &str) -> Result<Self, BindingError> {
        let parsed = Self::parse(binding)?;
        match parsed {
            Self::Publish { .. } => Err(BindingError::WrongDirection {
                binding: binding.to_owned(),
                direction: "ingress",
            }),
            other => Ok(other),
        }
    }

    /// Parses a binding and checks it is usable as an egress sink
    pub fn parse_egress(binding: &str) -> Result<Self, BindingError> {
        let parsed = Self::parse(binding)?;
        match parsed {
            Self::Subscribe { .. } => Err(BindingError::WrongDirection {
                binding: binding.to_owned(),
                direction: "egress",
            }),
            other => Ok(other),
        }
    }
}

impl std::fmt::Display for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::File { pattern } => write!(f, "file:{pattern}"),
            Self::Publish { topic } => write!(f, "pub:{topic}"),
            Self::Subscribe { pattern } => write!(f, "sub:{pattern}"),
            Self::Pipe { name } => write!(f, "pipe:{name}"),
        }
    }
}

/// Renders the output path for a `file:` egress binding
///
/// Placeholders in the pattern are substituted from the envelope:
/// `{id}`, `{source}`, `{message_type}`, `{sequence}`. A glob `*` in the
/// pattern is replaced by the envelope id so repeated writes don't clobber
/// each other. The result is resolved under `root` when relative.
#[must_use]
pub fn render_egress_path(pattern: &str, envelope: &Envelope, root: &Path) -> PathBuf {
    let rendered = pattern
        .replace("{id}", &envelope.id.to_string())
        .replace("{source}", &envelope.source)
        .replace("{message_type}", &envelope.message_type)
        .replace("{sequence}", &envelope.sequence.to_string())
        .replace('*', &envelope.id.to_string());
    let path = PathBuf::from(rendered);
    if path.is_absolute() {
        path
    } else {
        root.join(path)
    }
}
