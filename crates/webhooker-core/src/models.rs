//! Domain models and strongly-typed identifiers.
//!
//! Defines subscribers, delivery attempts and delivery jobs along with the
//! validation applied when they are written. Identifiers are UUID newtypes
//! so a subscriber id can never be passed where an attempt id is expected.

use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, Result};

type PgDb = sqlx::Postgres;
type PgRow = sqlx::postgres::PgRow;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    std::result::Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Subscription pattern that matches every event name.
pub const WILDCARD: &str = "*";

/// Display name given to subscribers registered without one.
pub const DEFAULT_SUBSCRIBER_NAME: &str = "anonymous";

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Creates a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl sqlx::Type<PgDb> for $name {
            fn type_info() -> PgTypeInfo {
                <Uuid as sqlx::Type<PgDb>>::type_info()
            }
        }

        impl<'r> sqlx::Decode<'r, PgDb> for $name {
            fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
                let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
                Ok(Self(uuid))
            }
        }

        impl sqlx::Encode<'_, PgDb> for $name {
            fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
                <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
            }
        }
    };
}

uuid_id! {
    /// Identifier of a registered subscriber.
    ///
    /// # Example
    ///
    /// ```
    /// use webhooker_core::models::SubscriberId;
    /// let id = SubscriberId::new();
    /// println!("delivering to subscriber {id}");
    /// ```
    SubscriberId
}

uuid_id! {
    /// Identifier of one subscriber's delivery attempt for one event.
    AttemptId
}

uuid_id! {
    /// Identifier of a queued delivery job.
    JobId
}

/// The set of event-name patterns a subscriber listens to.
///
/// Never empty. The literal `*` matches every event name; every other
/// pattern matches only the identical event name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct Subscriptions(Vec<String>);

impl Subscriptions {
    /// Builds a validated subscription set.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` if the set is empty or contains a
    /// blank pattern.
    pub fn new<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set: Vec<String> = Vec::new();
        for pattern in patterns {
            let pattern = pattern.into();
            if pattern.trim().is_empty() {
                return Err(CoreError::invalid("subscription patterns must not be blank"));
            }
            if !set.contains(&pattern) {
                set.push(pattern);
            }
        }

        if set.is_empty() {
            return Err(CoreError::invalid("subscriptions must contain at least one event"));
        }

        Ok(Self(set))
    }

    /// The wildcard-only set, matching every event.
    pub fn all() -> Self {
        Self(vec![WILDCARD.to_string()])
    }

    /// Returns true when `event` is listed or the set contains the wildcard.
    pub fn matches(&self, event: &str) -> bool {
        self.0.iter().any(|pattern| pattern == WILDCARD || pattern == event)
    }

    /// Returns the patterns in insertion order.
    pub fn patterns(&self) -> &[String] {
        &self.0
    }
}

impl Default for Subscriptions {
    fn default() -> Self {
        Self::all()
    }
}

impl TryFrom<Vec<String>> for Subscriptions {
    type Error = CoreError;

    fn try_from(patterns: Vec<String>) -> Result<Self> {
        Self::new(patterns)
    }
}

impl From<Subscriptions> for Vec<String> {
    fn from(subscriptions: Subscriptions) -> Self {
        subscriptions.0
    }
}

/// A registered external endpoint receiving webhook callbacks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriber {
    /// Unique identifier for this subscriber.
    pub id: SubscriberId,
    /// Human-readable name.
    pub name: String,
    /// Callback URL receiving the HTTP POST.
    pub url: String,
    /// Whether the subscriber currently receives deliveries.
    pub enabled: bool,
    /// Event names this subscriber listens to.
    pub subscriptions: Subscriptions,
    /// When the subscriber was registered.
    pub created_at: DateTime<Utc>,
    /// When the subscriber was last modified.
    pub updated_at: DateTime<Utc>,
}

impl Subscriber {
    /// Returns true when the subscriber listens to `event`.
    ///
    /// Ignores the enabled flag; see [`Subscriber::is_eligible`].
    pub fn is_subscribed(&self, event: &str) -> bool {
        self.subscriptions.matches(event)
    }

    /// Returns true when `event` may be delivered to this subscriber right now.
    pub fn is_eligible(&self, event: &str) -> bool {
        self.enabled && self.is_subscribed(event)
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for Subscriber {
    fn from_row(row: &'r PgRow) -> std::result::Result<Self, sqlx::Error> {
        use sqlx::Row;

        let subscriptions: sqlx::types::Json<Vec<String>> = row.try_get("subscriptions")?;
        let subscriptions = Subscriptions::new(subscriptions.0)
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;

        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            url: row.try_get("url")?,
            enabled: row.try_get("enabled")?,
            subscriptions,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Registration request for a new subscriber.
///
/// Missing fields fall back to the registry defaults: name `anonymous`,
/// enabled, subscribed to `*`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSubscriber {
    /// Display name.
    #[serde(default = "default_subscriber_name")]
    pub name: String,
    /// Callback URL.
    pub url: String,
    /// Initial enabled state.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Subscription patterns. An explicitly empty list is rejected.
    #[serde(default = "default_subscription_patterns")]
    pub subscriptions: Vec<String>,
}

impl NewSubscriber {
    /// Creates a registration for `url` with all defaults applied.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            name: default_subscriber_name(),
            url: url.into(),
            enabled: true,
            subscriptions: default_subscription_patterns(),
        }
    }

    /// Sets the display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Replaces the subscription patterns.
    #[must_use]
    pub fn with_subscriptions<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subscriptions = patterns.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the initial enabled state.
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Validates the request and builds the subscriber record.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` if the name is blank, the URL is
    /// not an absolute HTTP(S) URL, or the subscription set is empty.
    pub fn into_subscriber(self, now: DateTime<Utc>) -> Result<Subscriber> {
        validate_name(&self.name)?;
        validate_callback_url(&self.url)?;
        let subscriptions = Subscriptions::new(self.subscriptions)?;

        Ok(Subscriber {
            id: SubscriberId::new(),
            name: self.name,
            url: self.url,
            enabled: self.enabled,
            subscriptions,
            created_at: now,
            updated_at: now,
        })
    }
}

fn default_subscriber_name() -> String {
    DEFAULT_SUBSCRIBER_NAME.to_string()
}

fn default_enabled() -> bool {
    true
}

fn default_subscription_patterns() -> Vec<String> {
    vec![WILDCARD.to_string()]
}

fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(CoreError::invalid("subscriber name must not be blank"));
    }
    Ok(())
}

/// Validates a subscriber callback URL.
///
/// Accepts absolute `http` and `https` URLs with a host.
///
/// # Errors
///
/// Returns `CoreError::InvalidInput` when the URL is blank, unparseable,
/// uses another scheme, or has no host.
pub fn validate_callback_url(raw: &str) -> Result<()> {
    if raw.trim().is_empty() {
        return Err(CoreError::invalid("subscriber url must not be blank"));
    }

    let parsed = url::Url::parse(raw)
        .map_err(|e| CoreError::invalid(format!("invalid subscriber url: {e}")))?;

    match parsed.scheme() {
        "http" | "https" => {},
        scheme => {
            return Err(CoreError::invalid(format!("unsupported url scheme: {scheme}")));
        },
    }

    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(CoreError::invalid("subscriber url must have a host"));
    }

    Ok(())
}

/// Validates an event name.
///
/// # Errors
///
/// Returns `CoreError::InvalidInput` for a blank name.
pub fn validate_event_name(event: &str) -> Result<()> {
    if event.trim().is_empty() {
        return Err(CoreError::invalid("event name must not be blank"));
    }
    Ok(())
}

/// Opaque event payload.
///
/// Stored and forwarded verbatim. The only check is that it is present:
/// `null` and the empty string are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(serde_json::Value);

impl Payload {
    /// Wraps a JSON value as a payload.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` for `null` or an empty string.
    pub fn new(value: serde_json::Value) -> Result<Self> {
        match &value {
            serde_json::Value::Null => Err(CoreError::invalid("payload must not be empty")),
            serde_json::Value::String(s) if s.is_empty() => {
                Err(CoreError::invalid("payload must not be empty"))
            },
            _ => Ok(Self(value)),
        }
    }

    /// Returns the wrapped value.
    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }

    /// Consumes the payload.
    pub fn into_inner(self) -> serde_json::Value {
        self.0
    }
}

/// Terminal transport failures recorded in place of an HTTP response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportFailure {
    /// TLS handshake or certificate verification failed.
    #[serde(rename = "TLS_ERROR")]
    Tls,
    /// Connection refused, reset, or DNS resolution failed.
    #[serde(rename = "CONNECTION_ERROR")]
    Connection,
    /// No response within the request timeout.
    #[serde(rename = "TIMEOUT_ERROR")]
    Timeout,
}

impl TransportFailure {
    /// Returns the persisted tag for this failure.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tls => "TLS_ERROR",
            Self::Connection => "CONNECTION_ERROR",
            Self::Timeout => "TIMEOUT_ERROR",
        }
    }
}

impl fmt::Display for TransportFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last outcome observed for a delivery attempt.
///
/// Persisted as either `{headers, code, body}` or `{error}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttemptResponse {
    /// A completed HTTP exchange, successful or not.
    Received {
        /// Response headers.
        headers: BTreeMap<String, String>,
        /// HTTP status code.
        code: u16,
        /// Response body as received.
        body: String,
    },
    /// The exchange never completed.
    Failed {
        /// Which transport failure occurred.
        error: TransportFailure,
    },
}

impl AttemptResponse {
    /// Returns the HTTP status for completed exchanges.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Received { code, .. } => Some(*code),
            Self::Failed { .. } => None,
        }
    }

    /// Returns true for a completed exchange with a 2xx status.
    pub fn is_success(&self) -> bool {
        self.status_code().is_some_and(|code| (200..300).contains(&code))
    }

    /// Returns the transport failure tag, if any.
    pub fn failure(&self) -> Option<TransportFailure> {
        match self {
            Self::Failed { error } => Some(*error),
            Self::Received { .. } => None,
        }
    }
}

/// One subscriber's delivery of one event.
///
/// Created once per match at broadcast time and never deleted by the
/// pipeline. `response` is overwritten by every delivery execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    /// Unique identifier for this attempt.
    pub id: AttemptId,
    /// Owning subscriber. Immutable.
    pub subscriber_id: SubscriberId,
    /// Event name.
    pub event: String,
    /// Opaque payload forwarded to the subscriber.
    pub payload: Payload,
    /// Latest outcome, `None` until the first execution completes.
    pub response: Option<AttemptResponse>,
    /// When the attempt was created.
    pub created_at: DateTime<Utc>,
    /// When the outcome was last written.
    pub updated_at: DateTime<Utc>,
}

impl DeliveryAttempt {
    /// Creates an unsent attempt for `subscriber_id`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` for a blank event name.
    pub fn new(
        subscriber_id: SubscriberId,
        event: impl Into<String>,
        payload: Payload,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let event = event.into();
        validate_event_name(&event)?;

        Ok(Self {
            id: AttemptId::new(),
            subscriber_id,
            event,
            payload,
            response: None,
            created_at: now,
            updated_at: now,
        })
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for DeliveryAttempt {
    fn from_row(row: &'r PgRow) -> std::result::Result<Self, sqlx::Error> {
        use sqlx::Row;

        let payload: sqlx::types::Json<serde_json::Value> = row.try_get("payload")?;
        let response: Option<sqlx::types::Json<AttemptResponse>> = row.try_get("response")?;

        Ok(Self {
            id: row.try_get("id")?,
            subscriber_id: row.try_get("subscriber_id")?,
            event: row.try_get("event")?,
            payload: Payload(payload.0),
            response: response.map(|r| r.0),
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// A queued delivery task for one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryJob {
    /// Unique identifier for this job.
    pub id: JobId,
    /// Attempt this job delivers.
    pub attempt_id: AttemptId,
    /// Executions started so far, including the one in progress once claimed.
    pub attempt_number: u32,
    /// Earliest time the job may run.
    pub run_at: DateTime<Utc>,
    /// Lease expiry while a worker holds the job.
    pub locked_until: Option<DateTime<Utc>>,
    /// When the job was enqueued.
    pub created_at: DateTime<Utc>,
}

impl DeliveryJob {
    /// Creates a job runnable at `run_at`.
    pub fn new(attempt_id: AttemptId, run_at: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            attempt_id,
            attempt_number: 0,
            run_at,
            locked_until: None,
            created_at: run_at,
        }
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for DeliveryJob {
    fn from_row(row: &'r PgRow) -> std::result::Result<Self, sqlx::Error> {
        use sqlx::Row;

        Ok(Self {
            id: row.try_get("id")?,
            attempt_id: row.try_get("attempt_id")?,
            attempt_number: {
                let val: i32 = row.try_get("attempt_number")?;
                val.try_into()
                    .map_err(|_| sqlx::Error::Decode("attempt_number cannot be negative".into()))?
            },
            run_at: row.try_get("run_at")?,
            locked_until: row.try_get("locked_until")?,
            created_at: row.try_get("created_at")?,
        })
    }
}
