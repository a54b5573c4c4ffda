//! Typed search requests parsed from query parameters
//!
//! Every malformed value is rejected here, before any storage access.

use super::filter::{EventFilter, MessageFilter};
use crate::error::{ProviderError, Result};
use chrono::{DateTime, Utc};
use rptdata_storage::{EventId, MessageId};

/// Default `resultCountLimit`
pub const DEFAULT_RESULT_LIMIT: usize = 100;

/// Raw query pairs in arrival order; keys may repeat
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams(Vec<(String, String)>);

impl QueryParams {
    #[must_use]
    pub const fn new(pairs: Vec<(String, String)>) -> Self {
        Self(pairs)
    }

    /// First value given for `key`
    #[must_use]
    pub fn first(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }

    /// Every value for `key`, repeated or comma separated
    #[must_use]
    pub fn all(&self, key: &str) -> Vec<String> {
        self.0
            .iter()
            .filter(|(name, _)| name == key)
            .flat_map(|(_, value)| value.split(','))
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Epoch-millisecond timestamp
    ///
    /// # Errors
    ///
    /// `InvalidRequest` when the value is not an integer in range.
    pub fn timestamp(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        let Some(raw) = self.first(key) else {
            return Ok(None);
        };
        raw.trim()
            .parse::<i64>()
            .ok()
            .and_then(DateTime::from_timestamp_millis)
            .map(Some)
            .ok_or_else(|| {
                ProviderError::InvalidRequest(format!(
                    "'{raw}' is not a valid epoch-millisecond value for '{key}'"
                ))
            })
    }

    /// First timestamp present among `keys`
    ///
    /// # Errors
    ///
    /// `InvalidRequest` when a present value is malformed.
    pub fn timestamp_any(&self, keys: &[&str]) -> Result<Option<DateTime<Utc>>> {
        for key in keys {
            if let Some(value) = self.timestamp(key)? {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    /// Result count from the first of `keys` present, or the default
    ///
    /// # Errors
    ///
    /// `InvalidRequest` when the value is not a non-negative integer.
    pub fn limit(&self, keys: &[&str]) -> Result<usize> {
        let Some((key, raw)) = keys
            .iter()
            .find_map(|key| self.first(key).map(|value| (*key, value)))
        else {
            return Ok(DEFAULT_RESULT_LIMIT);
        };
        raw.trim().parse::<usize>().map_err(|_| {
            ProviderError::InvalidRequest(format!("'{raw}' is not a valid count for '{key}'"))
        })
    }

    /// Boolean switch; a bare key counts as `true`
    ///
    /// # Errors
    ///
    /// `InvalidRequest` for anything other than `true`, `false` or empty.
    pub fn flag(&self, key: &str) -> Result<bool> {
        match self.first(key).map(str::trim) {
            None | Some("false") => Ok(false),
            Some("" | "true") => Ok(true),
            Some(other) => Err(ProviderError::InvalidRequest(format!(
                "'{other}' is not a valid boolean for '{key}'"
            ))),
        }
    }
}

impl FromIterator<(String, String)> for QueryParams {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Scan direction on the timeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeRelation {
    /// Forward in time (`next`)
    #[default]
    After,
    /// Backward in time (`previous`)
    Before,
}

impl TimeRelation {
    /// Parse the `searchDirection` keyword
    ///
    /// # Errors
    ///
    /// `InvalidRequest` for anything other than `next` or `previous`.
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "next" => Ok(Self::After),
            "previous" => Ok(Self::Before),
            other => Err(ProviderError::InvalidRequest(format!(
                "'{other}' is not a valid timeline direction. Use 'next' or 'previous'"
            ))),
        }
    }

    fn from_params(params: &QueryParams) -> Result<Self> {
        params
            .first("searchDirection")
            .map_or(Ok(Self::default()), Self::parse)
    }
}

fn check_end_timestamp(
    start: DateTime<Utc>,
    end: Option<DateTime<Utc>>,
    direction: TimeRelation,
) -> Result<()> {
    let Some(end) = end else {
        return Ok(());
    };
    match direction {
        TimeRelation::After if start > end => Err(ProviderError::InvalidRequest(format!(
            "startTimestamp: {} > endTimestamp: {}",
            start.timestamp_millis(),
            end.timestamp_millis()
        ))),
        TimeRelation::Before if start < end => Err(ProviderError::InvalidRequest(format!(
            "startTimestamp: {} < endTimestamp: {}",
            start.timestamp_millis(),
            end.timestamp_millis()
        ))),
        _ => Ok(()),
    }
}

fn check_range(from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Result<()> {
    match (from, to) {
        (Some(from), Some(to)) if from > to => Err(ProviderError::InvalidRequest(format!(
            "timestampFrom: {} > timestampTo: {}",
            from.timestamp_millis(),
            to.timestamp_millis()
        ))),
        _ => Ok(()),
    }
}

fn required_start(params: &QueryParams) -> Result<DateTime<Utc>> {
    params.timestamp("startTimestamp")?.ok_or_else(|| {
        ProviderError::InvalidRequest("Required parameter 'startTimestamp' not specified".into())
    })
}

/// Bounded message search
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageSearchRequest {
    pub time_from: Option<DateTime<Utc>>,
    pub time_to: Option<DateTime<Utc>>,
    /// Empty means every known stream
    pub streams: Vec<String>,
    pub filter: MessageFilter,
    pub limit: usize,
    pub ids_only: bool,
}

impl MessageSearchRequest {
    /// # Errors
    ///
    /// `InvalidRequest` on malformed or inconsistent parameters.
    pub fn from_params(params: &QueryParams) -> Result<Self> {
        let time_from = params.timestamp_any(&["timestampFrom", "startTimestamp"])?;
        let time_to = params.timestamp_any(&["timestampTo", "endTimestamp"])?;
        check_range(time_from, time_to)?;

        Ok(Self {
            time_from,
            time_to,
            streams: params.all("stream"),
            filter: MessageFilter::from_params(params),
            limit: params.limit(&["resultCountLimit", "limit"])?,
            ids_only: params.flag("idsOnly")?,
        })
    }
}

/// Bounded event search over `[time_from, time_to)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSearchRequest {
    pub time_from: DateTime<Utc>,
    pub time_to: DateTime<Utc>,
    pub parent_event: Option<EventId>,
    pub filter: EventFilter,
    pub limit: usize,
    pub ids_only: bool,
}

impl EventSearchRequest {
    /// # Errors
    ///
    /// `InvalidRequest` when a bound is missing or the range is inverted.
    pub fn from_params(params: &QueryParams) -> Result<Self> {
        let missing = |name: &str| {
            ProviderError::InvalidRequest(format!("Required parameter '{name}' not specified"))
        };
        let time_from = params
            .timestamp_any(&["timestampFrom", "startTimestamp"])?
            .ok_or_else(|| missing("timestampFrom"))?;
        let time_to = params
            .timestamp_any(&["timestampTo", "endTimestamp"])?
            .ok_or_else(|| missing("timestampTo"))?;
        check_range(Some(time_from), Some(time_to))?;

        Ok(Self {
            time_from,
            time_to,
            parent_event: params.first("parentEvent").map(EventId::from),
            filter: EventFilter::from_params(params),
            limit: params.limit(&["resultCountLimit", "limit"])?,
            ids_only: params.flag("idsOnly")?,
        })
    }
}

/// Streaming message search
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseMessageSearchRequest {
    pub start_timestamp: DateTime<Utc>,
    pub end_timestamp: Option<DateTime<Utc>>,
    /// Empty means every known stream
    pub streams: Vec<String>,
    pub direction: TimeRelation,
    pub limit: usize,
    pub resume_from_id: Option<MessageId>,
    pub filter: MessageFilter,
}

impl SseMessageSearchRequest {
    /// # Errors
    ///
    /// `InvalidRequest` on malformed parameters or an end bound behind the
    /// scan direction.
    pub fn from_params(params: &QueryParams) -> Result<Self> {
        let start_timestamp = required_start(params)?;
        let end_timestamp = params.timestamp("endTimestamp")?;
        let direction = TimeRelation::from_params(params)?;
        check_end_timestamp(start_timestamp, end_timestamp, direction)?;

        let resume_from_id = params
            .first("resumeFromId")
            .map(str::parse::<MessageId>)
            .transpose()
            .map_err(|err| ProviderError::InvalidRequest(err.to_string()))?;

        Ok(Self {
            start_timestamp,
            end_timestamp,
            streams: params.all("stream"),
            direction,
            limit: params.limit(&["resultCountLimit"])?,
            resume_from_id,
            filter: MessageFilter::from_params(params),
        })
    }
}

/// Streaming event search
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEventSearchRequest {
    pub start_timestamp: DateTime<Utc>,
    pub end_timestamp: Option<DateTime<Utc>>,
    pub parent_event: Option<EventId>,
    pub direction: TimeRelation,
    pub limit: usize,
    pub filter: EventFilter,
}

impl SseEventSearchRequest {
    /// # Errors
    ///
    /// `InvalidRequest` on malformed parameters or an end bound behind the
    /// scan direction.
    pub fn from_params(params: &QueryParams) -> Result<Self> {
        let start_timestamp = required_start(params)?;
        let end_timestamp = params.timestamp("endTimestamp")?;
        let direction = TimeRelation::from_params(params)?;
        check_end_timestamp(start_timestamp, end_timestamp, direction)?;

        Ok(Self {
            start_timestamp,
            end_timestamp,
            parent_event: params.first("parentEvent").map(EventId::from),
            direction,
            limit: params.limit(&["resultCountLimit"])?,
            filter: EventFilter::from_params(params),
        })
    }
}
