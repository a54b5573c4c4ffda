//! Event searches: bounded and streaming over time windows

use super::request::{EventSearchRequest, SseEventSearchRequest, TimeRelation};
use super::sink::SseSink;
use super::{BoundedSearch, with_request_timeout};
use crate::context::ProviderContext;
use crate::error::{ProviderError, Result};
use crate::event::EventTreeNode;
use chrono::{DateTime, TimeDelta, Utc};
use rptdata_storage::{EventId, TimeRange, UnwrappedEvent};
use serde::Serialize;
use std::cmp::Reverse;
use tracing::debug;

/// One bounded-search result
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum EventSearchItem {
    Id(EventId),
    Node(EventTreeNode),
}

/// Bounded event search, most recent first.
///
/// # Errors
///
/// `TimeoutExceeded` past the request deadline; storage errors propagate.
pub async fn search_events(
    ctx: &ProviderContext,
    request: &EventSearchRequest,
) -> Result<BoundedSearch<EventSearchItem>> {
    let items = with_request_timeout(ctx, "event search", collect_events(ctx, request)).await?;
    let long_term_cacheable = items.len() == request.limit || request.time_to < Utc::now();
    Ok(BoundedSearch {
        items,
        long_term_cacheable,
    })
}

async fn collect_events(
    ctx: &ProviderContext,
    request: &EventSearchRequest,
) -> Result<Vec<EventSearchItem>> {
    let range = TimeRange {
        from: request.time_from,
        to: request.time_to,
    };
    let mut events = ctx
        .storage()
        .get_events_in_range(&range, request.parent_event.as_ref())
        .await?;
    events.retain(|unwrapped| request.filter.matches(&unwrapped.event));
    sort_events(&mut events, TimeRelation::Before);
    events.truncate(request.limit);

    Ok(events
        .into_iter()
        .map(|unwrapped| {
            if request.ids_only {
                EventSearchItem::Id(unwrapped.event.id)
            } else {
                EventSearchItem::Node(EventTreeNode::from_stored(
                    &unwrapped.event,
                    unwrapped.is_batched,
                ))
            }
        })
        .collect())
}

fn sort_events(events: &mut [UnwrappedEvent], direction: TimeRelation) {
    match direction {
        TimeRelation::After => {
            events.sort_by(|a, b| {
                (a.event.start_timestamp, &a.event.id).cmp(&(b.event.start_timestamp, &b.event.id))
            });
        }
        TimeRelation::Before => {
            events.sort_by_key(|u| Reverse((u.event.start_timestamp, u.event.id.clone())));
        }
    }
}

fn to_delta(duration: std::time::Duration) -> Result<TimeDelta> {
    TimeDelta::from_std(duration)
        .ok()
        .filter(|delta| *delta > TimeDelta::zero())
        .ok_or_else(|| ProviderError::InvalidRequest("event search step must be positive".into()))
}

/// Successive half-open windows covering the scan in its direction
struct WindowPlan {
    cursor: DateTime<Utc>,
    bound: DateTime<Utc>,
    step: TimeDelta,
    direction: TimeRelation,
}

impl WindowPlan {
    fn new(ctx: &ProviderContext, request: &SseEventSearchRequest) -> Result<Self> {
        let step = to_delta(ctx.settings().sse_event_search_step)?;
        let one_ms = TimeDelta::milliseconds(1);
        let plan = match request.direction {
            // end bounds are inclusive, windows are half-open
            TimeRelation::After => Self {
                cursor: request.start_timestamp,
                bound: request.end_timestamp.map_or_else(Utc::now, |end| end + one_ms),
                step,
                direction: TimeRelation::After,
            },
            TimeRelation::Before => {
                let lookback = TimeDelta::from_std(ctx.settings().event_lookback)
                    .unwrap_or(TimeDelta::MAX);
                let bound = request.end_timestamp.unwrap_or_else(|| {
                    request
                        .start_timestamp
                        .checked_sub_signed(lookback)
                        .unwrap_or(DateTime::<Utc>::MIN_UTC)
                });
                Self {
                    cursor: request.start_timestamp + one_ms,
                    bound,
                    step,
                    direction: TimeRelation::Before,
                }
            }
        };
        Ok(plan)
    }

    fn next_window(&mut self) -> Option<TimeRange> {
        match self.direction {
            TimeRelation::After if self.cursor < self.bound => {
                let to = self
                    .cursor
                    .checked_add_signed(self.step)
                    .map_or(self.bound, |to| to.min(self.bound));
                let window = TimeRange {
                    from: self.cursor,
                    to,
                };
                self.cursor = to;
                Some(window)
            }
            TimeRelation::Before if self.cursor > self.bound => {
                let from = self
                    .cursor
                    .checked_sub_signed(self.step)
                    .map_or(self.bound, |from| from.max(self.bound));
                let window = TimeRange {
                    from,
                    to: self.cursor,
                };
                self.cursor = from;
                Some(window)
            }
            _ => None,
        }
    }
}

/// Streaming event search, one time window at a time.
///
/// # Errors
///
/// `Cancelled` once the client is gone; storage errors propagate.
pub async fn search_events_sse(
    ctx: &ProviderContext,
    request: &SseEventSearchRequest,
    sink: &SseSink,
) -> Result<()> {
    let mut plan = WindowPlan::new(ctx, request)?;
    let mut emitted = 0;
    debug!(
        start = request.start_timestamp.timestamp_millis(),
        parent = ?request.parent_event,
        limit = request.limit,
        "Starting streaming event search"
    );

    while emitted < request.limit {
        let Some(window) = plan.next_window() else {
            break;
        };
        let mut events = ctx
            .storage()
            .get_events_in_range(&window, request.parent_event.as_ref())
            .await?;
        events.retain(|unwrapped| request.filter.matches(&unwrapped.event));
        sort_events(&mut events, request.direction);

        for unwrapped in events.iter().take(request.limit - emitted) {
            let node = EventTreeNode::from_stored(&unwrapped.event, unwrapped.is_batched);
            sink.send_event(&node).await?;
            emitted += 1;
        }

        let scanned_to = match request.direction {
            TimeRelation::After => window.to,
            TimeRelation::Before => window.from,
        };
        sink.note_scanned_timestamp(scanned_to);
    }

    debug!(emitted, "Streaming event search finished");
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::codec::DecodeCorrelator;
    use crate::context::{CacheSizes, SearchSettings};
    use rptdata_storage::hot::HotStore;
    use std::sync::Arc;
    use std::time::Duration;

    fn ctx(step: Duration) -> ProviderContext {
        ProviderContext::new(
            Arc::new(HotStore::new()),
            Arc::new(DecodeCorrelator::disconnected()),
            CacheSizes::default(),
            SearchSettings {
                sse_event_search_step: step,
                ..SearchSettings::default()
            },
        )
    }

    fn at(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(ms).unwrap()
    }

    fn request(start: i64, end: Option<i64>, direction: TimeRelation) -> SseEventSearchRequest {
        SseEventSearchRequest {
            start_timestamp: at(start),
            end_timestamp: end.map(at),
            parent_event: None,
            direction,
            limit: 10,
            filter: Default::default(),
        }
    }

    #[test]
    fn forward_windows_cover_inclusive_end() {
        let ctx = ctx(Duration::from_millis(400));
        let mut plan = WindowPlan::new(&ctx, &request(0, Some(1000), TimeRelation::After)).unwrap();
        let mut windows = Vec::new();
        while let Some(window) = plan.next_window() {
            windows.push((window.from.timestamp_millis(), window.to.timestamp_millis()));
        }
        assert_eq!(windows, [(0, 400), (400, 800), (800, 1001)]);
    }

    #[test]
    fn backward_windows_include_start() {
        let ctx = ctx(Duration::from_millis(600));
        let mut plan =
            WindowPlan::new(&ctx, &request(1000, Some(0), TimeRelation::Before)).unwrap();
        let mut windows = Vec::new();
        while let Some(window) = plan.next_window() {
            windows.push((window.from.timestamp_millis(), window.to.timestamp_millis()));
        }
        assert_eq!(windows, [(401, 1001), (0, 401)]);
    }

    #[test]
    fn zero_step_is_rejected() {
        let ctx = ctx(Duration::ZERO);
        assert!(WindowPlan::new(&ctx, &request(0, None, TimeRelation::After)).is_err());
    }
}
