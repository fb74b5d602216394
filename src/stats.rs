use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

pub const MAX_LIVE_REQUESTS: usize = 100;
const TOP_MODELS: usize = 3;

pub const CHAT_PATH: &str = "/v1/chat/completions";
pub const MODELS_PATH: &str = "/v1/models";
pub const HOME_PATH: &str = "/";

/// One finished request as reported by a handler.
#[derive(Debug, Clone)]
pub struct Outcome<'a> {
    pub path: &'a str,
    pub status: u16,
    pub duration: Duration,
    pub model: &'a str,
    pub is_streaming: bool,
    pub tokens: u64,
}

#[derive(Debug, Clone)]
pub struct RequestStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub last_request_time: Option<DateTime<Utc>>,
    pub average_response_time: Duration,
    pub home_page_views: u64,
    pub api_calls_count: u64,
    pub models_calls_count: u64,
    pub streaming_requests: u64,
    pub non_streaming_requests: u64,
    pub total_tokens_used: u64,
    pub start_time: DateTime<Utc>,
    pub fastest_response: Option<Duration>,
    pub slowest_response: Duration,
    pub model_usage: HashMap<String, u64>,
}

impl RequestStats {
    fn new(start_time: DateTime<Utc>) -> Self {
        Self {
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            last_request_time: None,
            average_response_time: Duration::ZERO,
            home_page_views: 0,
            api_calls_count: 0,
            models_calls_count: 0,
            streaming_requests: 0,
            non_streaming_requests: 0,
            total_tokens_used: 0,
            start_time,
            fastest_response: None,
            slowest_response: Duration::ZERO,
            model_usage: HashMap::new(),
        }
    }

    fn apply(&mut self, outcome: &Outcome<'_>, now: DateTime<Utc>) {
        self.total_requests += 1;
        self.last_request_time = Some(now);
        if (200..300).contains(&outcome.status) {
            self.successful_requests += 1;
        } else {
            self.failed_requests += 1;
        }

        let previous = self.average_response_time.as_nanos() * u128::from(self.total_requests - 1);
        let average = (previous + outcome.duration.as_nanos()) / u128::from(self.total_requests);
        self.average_response_time = Duration::from_nanos(u64::try_from(average).unwrap_or(u64::MAX));

        if self.fastest_response.is_none_or(|fastest| outcome.duration < fastest) {
            self.fastest_response = Some(outcome.duration);
        }
        if outcome.duration > self.slowest_response {
            self.slowest_response = outcome.duration;
        }

        match outcome.path {
            HOME_PATH => self.home_page_views += 1,
            CHAT_PATH => {
                self.api_calls_count += 1;
                if outcome.is_streaming {
                    self.streaming_requests += 1;
                } else {
                    self.non_streaming_requests += 1;
                }
            }
            MODELS_PATH => self.models_calls_count += 1,
            _ => {}
        }

        if !outcome.model.is_empty() {
            *self.model_usage.entry(outcome.model.to_string()).or_default() += 1;
        }
        self.total_tokens_used += outcome.tokens;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LiveRequest {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub duration: u64,
    pub user_agent: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelCount {
    pub model: String,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub last_request_time: Option<DateTime<Utc>>,
    pub average_response_time: u64,
    pub home_page_views: u64,
    pub api_calls_count: u64,
    pub models_calls_count: u64,
    pub streaming_requests: u64,
    pub non_streaming_requests: u64,
    pub total_tokens_used: u64,
    pub start_time: DateTime<Utc>,
    pub fastest_response: i64,
    pub slowest_response: u64,
    pub top_models: Vec<ModelCount>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveRequestPage {
    pub requests: Vec<LiveRequest>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
    pub total_pages: usize,
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Shared request statistics and the bounded live-request log.
///
/// Each structure has its own lock, held only for the in-memory update.
pub struct StatsCollector {
    stats: Mutex<RequestStats>,
    live: Mutex<VecDeque<LiveRequest>>,
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsCollector {
    pub fn new() -> Self {
        Self {
            stats: Mutex::new(RequestStats::new(Utc::now())),
            live: Mutex::new(VecDeque::with_capacity(MAX_LIVE_REQUESTS)),
        }
    }

    pub fn record_outcome(&self, outcome: &Outcome<'_>) {
        let status = outcome.status.to_string();
        metrics::counter!(
            "zai_gateway_requests_total",
            "path" => outcome.path.to_string(),
            "status" => status
        )
        .increment(1);
        metrics::histogram!("zai_gateway_request_duration_seconds", "path" => outcome.path.to_string())
            .record(outcome.duration.as_secs_f64());
        if !outcome.model.is_empty() {
            metrics::counter!("zai_gateway_model_requests_total", "model" => outcome.model.to_string())
                .increment(1);
        }

        match self.stats.lock() {
            Ok(mut stats) => stats.apply(outcome, Utc::now()),
            Err(poisoned) => poisoned.into_inner().apply(outcome, Utc::now()),
        }
    }

    pub fn append_live_request(
        &self,
        method: &str,
        path: &str,
        status: u16,
        duration: Duration,
        user_agent: &str,
        model: &str,
    ) {
        let now = Utc::now();
        let record = LiveRequest {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: now,
            method: method.to_string(),
            path: path.to_string(),
            status,
            duration: millis(duration),
            user_agent: user_agent.to_string(),
            model: model.to_string(),
        };
        let mut live = match self.live.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if live.len() == MAX_LIVE_REQUESTS {
            live.pop_front();
        }
        live.push_back(record);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let stats = match self.stats.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };

        let mut top_models: Vec<ModelCount> = stats
            .model_usage
            .iter()
            .map(|(model, count)| ModelCount {
                model: model.clone(),
                count: *count,
            })
            .collect();
        top_models.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.model.cmp(&b.model)));
        top_models.truncate(TOP_MODELS);

        StatsSnapshot {
            total_requests: stats.total_requests,
            successful_requests: stats.successful_requests,
            failed_requests: stats.failed_requests,
            last_request_time: stats.last_request_time,
            average_response_time: millis(stats.average_response_time),
            home_page_views: stats.home_page_views,
            api_calls_count: stats.api_calls_count,
            models_calls_count: stats.models_calls_count,
            streaming_requests: stats.streaming_requests,
            non_streaming_requests: stats.non_streaming_requests,
            total_tokens_used: stats.total_tokens_used,
            start_time: stats.start_time,
            fastest_response: stats
                .fastest_response
                .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
                .unwrap_or(-1),
            slowest_response: millis(stats.slowest_response),
            top_models,
        }
    }

    /// Live requests newest first, paginated. Out-of-range pages are empty.
    pub fn live_requests(&self, page: usize, page_size: usize) -> LiveRequestPage {
        let page = page.max(1);
        let page_size = page_size.clamp(1, MAX_LIVE_REQUESTS);
        let live = match self.live.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let total = live.len();
        let requests = live
            .iter()
            .rev()
            .skip((page - 1).saturating_mul(page_size))
            .take(page_size)
            .cloned()
            .collect();
        LiveRequestPage {
            requests,
            total,
            page,
            page_size,
            total_pages: total.div_ceil(page_size),
        }
    }
}
