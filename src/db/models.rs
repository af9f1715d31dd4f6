use std::collections::BTreeSet;
use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use ring::rand::{SecureRandom, SystemRandom};
use rusqlite::{Result as SqlResult, Row};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

const CLIENT_SECRET_BYTES: usize = 32;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

impl Display for ChangeKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Updated => write!(f, "updated"),
            Self::Deleted => write!(f, "deleted"),
        }
    }
}

impl FromStr for ChangeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "created" => Ok(Self::Created),
            "updated" => Ok(Self::Updated),
            "deleted" => Ok(Self::Deleted),
            other => Err(format!("invalid change kind: {other}")),
        }
    }
}

/// Set of change kinds a subscription covers, rendered the way Graph expects
/// it on the wire (`"created,updated"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChangeType(BTreeSet<ChangeKind>);

impl ChangeType {
    pub fn new(kinds: impl IntoIterator<Item = ChangeKind>) -> Result<Self, String> {
        let set: BTreeSet<ChangeKind> = kinds.into_iter().collect();
        if set.is_empty() {
            return Err("change type must name at least one change kind".to_string());
        }
        Ok(Self(set))
    }

    pub fn created() -> Self {
        Self(BTreeSet::from([ChangeKind::Created]))
    }

    pub fn contains(&self, kind: ChangeKind) -> bool {
        self.0.contains(&kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = ChangeKind> + '_ {
        self.0.iter().copied()
    }
}

impl Display for ChangeType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let joined = self
            .0
            .iter()
            .map(ChangeKind::to_string)
            .collect::<Vec<_>>()
            .join(",");
        f.write_str(&joined)
    }
}

impl FromStr for ChangeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kinds = s
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(ChangeKind::from_str)
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(kinds)
    }
}

impl TryFrom<String> for ChangeType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ChangeType> for String {
    fn from(value: ChangeType) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    Pending,
    Active,
    RenewalDue,
    Renewing,
    Expired,
    Failed,
}

impl SubscriptionState {
    pub const ALL: [SubscriptionState; 6] = [
        Self::Pending,
        Self::Active,
        Self::RenewalDue,
        Self::Renewing,
        Self::Expired,
        Self::Failed,
    ];

    pub const ACCEPTING: [SubscriptionState; 3] = [Self::Active, Self::RenewalDue, Self::Renewing];

    pub fn is_accepting(self) -> bool {
        Self::ACCEPTING.contains(&self)
    }

    /// Expired and Failed need a fresh creation to restore coverage.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Expired | Self::Failed)
    }
}

impl Display for SubscriptionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Active => write!(f, "active"),
            Self::RenewalDue => write!(f, "renewal_due"),
            Self::Renewing => write!(f, "renewing"),
            Self::Expired => write!(f, "expired"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for SubscriptionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "renewal_due" | "renewaldue" => Ok(Self::RenewalDue),
            "renewing" => Ok(Self::Renewing),
            "expired" => Ok(Self::Expired),
            "failed" => Ok(Self::Failed),
            other => Err(format!("invalid subscription state: {other}")),
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct ClientSecret(String);

impl ClientSecret {
    pub fn generate() -> Result<Self, ring::error::Unspecified> {
        let mut bytes = [0u8; CLIENT_SECRET_BYTES];
        SystemRandom::new().fill(&mut bytes)?;
        Ok(Self(URL_SAFE_NO_PAD.encode(bytes)))
    }

    pub fn from_stored(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn matches(&self, provided: &str) -> bool {
        self.0.as_bytes().ct_eq(provided.as_bytes()).into()
    }
}

impl Debug for ClientSecret {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("ClientSecret(<redacted>)")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub id: String,
    pub resource: String,
    pub change_type: ChangeType,
    pub notification_url: String,
    pub client_secret: ClientSecret,
    pub expires_at: DateTime<Utc>,
    pub state: SubscriptionState,
    pub created_at: DateTime<Utc>,
    /// Lifetime requested at creation; each renewal extends by this much.
    pub lifetime: Duration,
    pub renewal_attempts: u32,
    pub next_renewal_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Subscription {
    pub fn covers(&self, resource: &str, change_type: &ChangeType) -> bool {
        self.resource == resource && &self.change_type == change_type
    }

    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        self.expires_at.signed_duration_since(now)
    }

    pub fn view(&self) -> SubscriptionView {
        SubscriptionView {
            id: self.id.clone(),
            resource: self.resource.clone(),
            change_type: self.change_type.to_string(),
            notification_url: self.notification_url.clone(),
            expires_at: self.expires_at,
            state: self.state,
            created_at: self.created_at,
            lifetime_minutes: self.lifetime.num_minutes(),
            renewal_attempts: self.renewal_attempts,
            next_renewal_at: self.next_renewal_at,
            last_error: self.last_error.clone(),
        }
    }

    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        let change_type_raw: String = row.get("change_type")?;
        let state_raw: String = row.get("state")?;
        let lifetime_secs: i64 = row.get("lifetime_secs")?;
        let renewal_attempts: i64 = row.get("renewal_attempts")?;
        let next_renewal_raw: Option<String> = row.get("next_renewal_at")?;

        Ok(Self {
            id: row.get("id")?,
            resource: row.get("resource")?,
            change_type: parse_column("change_type", &change_type_raw)?,
            notification_url: row.get("notification_url")?,
            client_secret: ClientSecret::from_stored(row.get::<_, String>("client_secret")?),
            expires_at: parse_timestamp("expires_at", &row.get::<_, String>("expires_at")?)?,
            state: parse_column("state", &state_raw)?,
            created_at: parse_timestamp("created_at", &row.get::<_, String>("created_at")?)?,
            lifetime: Duration::seconds(lifetime_secs),
            renewal_attempts: u32::try_from(renewal_attempts).unwrap_or(u32::MAX),
            next_renewal_at: next_renewal_raw
                .as_deref()
                .map(|raw| parse_timestamp("next_renewal_at", raw))
                .transpose()?,
            last_error: row.get("last_error")?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionView {
    pub id: String,
    pub resource: String,
    pub change_type: String,
    pub notification_url: String,
    pub expires_at: DateTime<Utc>,
    pub state: SubscriptionState,
    pub created_at: DateTime<Utc>,
    pub lifetime_minutes: i64,
    pub renewal_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_renewal_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

fn conversion_error(column: &str, raw: &str, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        raw.len(),
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("{column}: {message}"),
        )),
    )
}

fn parse_column<T: FromStr<Err = String>>(column: &str, raw: &str) -> SqlResult<T> {
    raw.parse::<T>()
        .map_err(|error| conversion_error(column, raw, error))
}

fn parse_timestamp(column: &str, raw: &str) -> SqlResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|error| conversion_error(column, raw, error.to_string()))
}
