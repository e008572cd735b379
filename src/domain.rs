use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::HarvestError;

pub const LOCAL_USER_PLUGIN: &str = "django_user";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExperimentId(pub u64);

impl fmt::Display for ExperimentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteId(String);

impl RemoteId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RemoteId {
    type Err = HarvestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let is_valid = !trimmed.is_empty()
            && !trimmed
                .chars()
                .any(|ch| ch.is_whitespace() || matches!(ch, '/' | '?' | '#' | '&'));
        if !is_valid {
            return Err(HarvestError::ReposRead(format!(
                "invalid remote identifier: {value:?}"
            )));
        }
        Ok(Self(trimmed.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublicAccess {
    None,
    Embargo,
    Metadata,
    Full,
}

impl PublicAccess {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(PublicAccess::None),
            25 => Some(PublicAccess::Embargo),
            50 => Some(PublicAccess::Metadata),
            100 => Some(PublicAccess::Full),
            _ => None,
        }
    }

    pub fn code(self) -> i64 {
        match self {
            PublicAccess::None => 1,
            PublicAccess::Embargo => 25,
            PublicAccess::Metadata => 50,
            PublicAccess::Full => 100,
        }
    }

    pub fn is_harvestable(self) -> bool {
        matches!(self, PublicAccess::Metadata | PublicAccess::Full)
    }
}

impl fmt::Display for PublicAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublicAccess::None => write!(f, "none"),
            PublicAccess::Embargo => write!(f, "embargo"),
            PublicAccess::Metadata => write!(f, "metadata"),
            PublicAccess::Full => write!(f, "full"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteUserProfile {
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AclEntry {
    pub plugin_id: String,
    #[serde(deserialize_with = "string_or_number")]
    pub entity_id: String,
    pub is_owner: bool,
}

impl AclEntry {
    pub fn is_local_owner(&self) -> bool {
        self.plugin_id == LOCAL_USER_PLUGIN && self.is_owner
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordDescriptor {
    pub identifier: RemoteId,
    pub creator: RemoteId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeedIdentity {
    pub base_url: String,
    pub repository_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExperimentKey(String);

impl ExperimentKey {
    /// Blank keys count as "not yet assigned".
    pub fn new(value: impl Into<String>) -> Option<Self> {
        let value = value.into();
        if value.trim().is_empty() {
            None
        } else {
            Some(Self(value))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExperimentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(i64),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(value) => value,
        Raw::Number(value) => value.to_string(),
    })
}
