//! Client identification sent to the remote and the identity provider.

use std::fmt;
use std::str::FromStr;

/// Which host packaging the bridge was launched from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ClientKind {
    /// Interactive command line use.
    #[default]
    Cli,
    /// Desktop extension bundle.
    Dxt,
    /// MCP bundle.
    Mcpb,
}

impl ClientKind {
    /// Wire value for the `X-Client-Type` header.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cli => "cli",
            Self::Dxt => "dxt",
            Self::Mcpb => "mcpb",
        }
    }

    /// Name registered with the identity provider.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Cli => "PageIndex MCP",
            Self::Dxt => "Claude Desktop Extension",
            Self::Mcpb => "MCPB Bundle",
        }
    }

    /// Bundles redirect the browser back into the host app after login.
    pub fn is_bundle(&self) -> bool {
        matches!(self, Self::Dxt | Self::Mcpb)
    }
}

impl fmt::Display for ClientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClientKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cli" => Ok(Self::Cli),
            "dxt" => Ok(Self::Dxt),
            "mcpb" => Ok(Self::Mcpb),
            other => Err(format!(
                "unknown client kind '{other}' (expected cli, dxt or mcpb)"
            )),
        }
    }
}

/// Client kind plus version, attached to every outbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub kind: ClientKind,
    pub version: String,
}

impl ClientIdentity {
    pub fn new(kind: ClientKind) -> Self {
        Self {
            kind,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl Default for ClientIdentity {
    fn default() -> Self {
        Self::new(ClientKind::default())
    }
}
