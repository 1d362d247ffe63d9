use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

const MAX_USER_AGENT_CHARS: usize = 200;

/// Rate-limit tier; each has its own daily allowance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    #[default]
    Anonymous,
    SignedIn,
    Premium,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Anonymous => "anonymous",
            Tier::SignedIn => "signed_in",
            Tier::Premium => "premium",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "anonymous" => Ok(Self::Anonymous),
            "signed_in" | "signed-in" => Ok(Self::SignedIn),
            "premium" => Ok(Self::Premium),
            other => anyhow::bail!("unknown tier: {other}"),
        }
    }
}

/// Who a vent is counted against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    /// Keyed by [`device_hash`]; always the anonymous tier.
    Anonymous { device_hash: String },
    /// Keyed by user id, supplied by a trusted auth proxy.
    User { id: String, tier: Tier },
}

impl Identity {
    pub fn anonymous(ip: &str, user_agent: &str) -> Self {
        Self::Anonymous {
            device_hash: device_hash(ip, user_agent),
        }
    }

    /// Signed-in identity; `tier` defaults to [`Tier::SignedIn`].
    pub fn user(id: impl Into<String>, tier: Option<Tier>) -> Self {
        Self::User {
            id: id.into(),
            tier: tier.unwrap_or(Tier::SignedIn),
        }
    }

    pub fn tier(&self) -> Tier {
        match self {
            Identity::Anonymous { .. } => Tier::Anonymous,
            Identity::User { tier, .. } => *tier,
        }
    }

    /// Counter key: `rate:<tier>:<identity>`.
    pub fn key(&self) -> String {
        match self {
            Identity::Anonymous { device_hash } => {
                format!("rate:{}:{device_hash}", Tier::Anonymous)
            }
            Identity::User { id, tier } => format!("rate:{tier}:{id}"),
        }
    }
}

/// Anonymous device fingerprint: first 16 hex chars of
/// `sha256("<ip>:<user-agent>")`. The IP is trimmed and lower-cased and the
/// user agent trimmed and cut to 200 chars; blanks become `unknown`.
pub fn device_hash(ip: &str, user_agent: &str) -> String {
    let ip = match ip.trim() {
        "" => "unknown".to_string(),
        ip => ip.to_lowercase(),
    };
    let user_agent: String = match user_agent.trim() {
        "" => "unknown".to_string(),
        ua => ua.chars().take(MAX_USER_AGENT_CHARS).collect(),
    };

    let digest = Sha256::digest(format!("{ip}:{user_agent}").as_bytes());
    let mut hash = hex::encode(digest);
    hash.truncate(16);
    hash
}
