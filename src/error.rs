use thiserror::Error;

/// Raised while building the affinity table or name matcher. Never raised per request.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid subnet: {value}")]
    InvalidSubnet {
        value: String,
        #[source]
        source: ipnet::AddrParseError,
    },

    #[error("availability zone cannot be empty (subnet {subnet})")]
    EmptyZone { subnet: String },

    #[error("alb region cannot be empty")]
    EmptyRegion,

    #[error("invalid alb name pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// No configured subnet contains the client, or the client address did not parse.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("no availability zone found for client {client}")]
pub struct NotFoundError {
    pub client: String,
}
