// Copyright 2015 CoreOS, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Reporting sinks of the store and the proxy. Components receive a sink
// explicitly instead of incrementing process wide counters. NoopMetrics drops
// everything; PrometheusMetrics records into its own prometheus recorder,
// which is never installed as the global one, and renders the text format.

use std::fmt::{self, Display, Formatter};
use std::time::Instant;

use ::metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle, PrometheusRecorder};

pub const STORE_READS: &str = "etcd_store_reads";
pub const STORE_READ_TIME: &str = "etcd_store_read_time_s";
pub const STORE_WRITES: &str = "etcd_store_writes";
pub const STORE_WRITE_TIME: &str = "etcd_store_write_time_s";
pub const STORE_EXPIRES: &str = "etcd_store_expires";
pub const STORE_WATCH_REQUESTS: &str = "etcd_store_watch_requests";
pub const STORE_WATCHERS: &str = "etcd_store_watchers";

pub const COMPACTION_RUNS: &str = "etcd_mvcc_db_compaction_runs";
pub const COMPACTION_KEYS: &str = "etcd_mvcc_db_compaction_keys_total";
pub const COMPACTION_DURATION: &str = "etcd_mvcc_db_compaction_duration_s";

pub const PROXY_REQUESTS: &str = "etcd_proxy_requests";
pub const PROXY_HANDLED: &str = "etcd_proxy_handled";
pub const PROXY_DROPPED: &str = "etcd_proxy_dropped";
pub const HTTP_HANDLING_TIME: &str = "etcd_http_handling_time_s";

// GET_RECURSIVE is the read type of a recursive get.
pub const GET_RECURSIVE: &str = "getRecursive";

// 0.001s to 4.096s, doubling
pub const LATENCY_BUCKETS: [f64; 13] = [0.001, 0.002, 0.004, 0.008, 0.016, 0.032, 0.064, 0.128, 0.256, 0.512, 1.024, 2.048, 4.096];
// 0.0005s to 2.048s, doubling
pub const HANDLING_TIME_BUCKETS: [f64; 13] = [0.0005, 0.001, 0.002, 0.004, 0.008, 0.016, 0.032, 0.064, 0.128, 0.256, 0.512, 1.024, 2.048];
// 0.1s to 409.6s, doubling
pub const COMPACTION_BUCKETS: [f64; 13] = [0.1, 0.2, 0.4, 0.8, 1.6, 3.2, 6.4, 12.8, 25.6, 51.2, 102.4, 204.8, 409.6];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
        }
    }
}

impl Display for Outcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyingError {
    ZeroEndpoints,
    FailedSendingRequest,
    FailedGettingResponse,
}

impl ProxyingError {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyingError::ZeroEndpoints => "zero_endpoints",
            ProxyingError::FailedSendingRequest => "failed_sending_request",
            ProxyingError::FailedGettingResponse => "failed_getting_response",
        }
    }
}

impl Display for ProxyingError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub trait StoreMetrics: Send + Sync {
    // read_type is e.g. "get" or GET_RECURSIVE.
    fn report_read_request(&self, read_type: &str, outcome: Outcome, start: Instant);
    // write_type is one of set/delete/update/create/compareAndSwap/compareAndDelete/expire.
    fn report_write_request(&self, write_type: &str, outcome: Outcome, start: Instant);
    fn report_expired_key(&self);
    fn report_watch_request(&self);
    fn report_watcher_added(&self);
    fn report_watcher_removed(&self);
    // report_compaction records one compaction run. outcome is "finished",
    // "cancelled" or "failed"; deleted counts the revisions it removed.
    fn report_compaction(&self, outcome: &str, deleted: u64, start: Instant);
}

pub trait ProxyMetrics: Send + Sync {
    fn report_incoming_request(&self, method: &str);
    fn report_request_handled(&self, method: &str, code: u16, start: Instant);
    fn report_request_dropped(&self, method: &str, err: ProxyingError);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl StoreMetrics for NoopMetrics {
    fn report_read_request(&self, _read_type: &str, _outcome: Outcome, _start: Instant) {}
    fn report_write_request(&self, _write_type: &str, _outcome: Outcome, _start: Instant) {}
    fn report_expired_key(&self) {}
    fn report_watch_request(&self) {}
    fn report_watcher_added(&self) {}
    fn report_watcher_removed(&self) {}
    fn report_compaction(&self, _outcome: &str, _deleted: u64, _start: Instant) {}
}

impl ProxyMetrics for NoopMetrics {
    fn report_incoming_request(&self, _method: &str) {}
    fn report_request_handled(&self, _method: &str, _code: u16, _start: Instant) {}
    fn report_request_dropped(&self, _method: &str, _err: ProxyingError) {}
}

// PrometheusMetrics is a sink for both the store and the proxy. Every report
// goes to the recorder owned by this value, so two sinks never share series.
pub struct PrometheusMetrics {
    recorder: PrometheusRecorder,
}

impl PrometheusMetrics {
    pub fn new() -> Result<Self, BuildError> {
        let recorder = PrometheusBuilder::new()
            .set_buckets_for_metric(Matcher::Full(STORE_READ_TIME.to_string()), &LATENCY_BUCKETS)?
            .set_buckets_for_metric(Matcher::Full(STORE_WRITE_TIME.to_string()), &LATENCY_BUCKETS)?
            .set_buckets_for_metric(Matcher::Full(HTTP_HANDLING_TIME.to_string()), &HANDLING_TIME_BUCKETS)?
            .set_buckets_for_metric(Matcher::Full(COMPACTION_DURATION.to_string()), &COMPACTION_BUCKETS)?
            .build_recorder();
        Ok(PrometheusMetrics { recorder })
    }

    // handle is what an exposition endpoint renders from.
    pub fn handle(&self) -> PrometheusHandle {
        self.recorder.handle()
    }

    pub fn render(&self) -> String {
        self.recorder.handle().render()
    }

    // value returns the current value of the series name carrying at least
    // the given labels, read from the rendered text format.
    pub fn value(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        let rendered = self.render();
        rendered.lines().filter(|line| !line.starts_with('#')).find_map(|line| {
            let (series, value) = line.rsplit_once(' ')?;
            let (series_name, series_labels) = match series.find('{') {
                Some(idx) => (&series[..idx], &series[idx..]),
                None => (series, ""),
            };
            if series_name != name {
                return None;
            }
            let matched = labels.iter().all(|(k, v)| series_labels.contains(&format!("{}=\"{}\"", k, v)));
            if !matched {
                return None;
            }
            value.trim().parse().ok()
        })
    }

    fn record<F: FnOnce()>(&self, f: F) {
        ::metrics::with_local_recorder(&self.recorder, f)
    }
}

impl StoreMetrics for PrometheusMetrics {
    fn report_read_request(&self, read_type: &str, outcome: Outcome, start: Instant) {
        let labels = [("type", read_type.to_string()), ("outcome", outcome.as_str().to_string())];
        self.record(|| {
            counter!(STORE_READS, &labels).increment(1);
            histogram!(STORE_READ_TIME, &labels).record(start.elapsed().as_secs_f64());
        });
    }

    fn report_write_request(&self, write_type: &str, outcome: Outcome, start: Instant) {
        let labels = [("type", write_type.to_string()), ("outcome", outcome.as_str().to_string())];
        self.record(|| {
            counter!(STORE_WRITES, &labels).increment(1);
            histogram!(STORE_WRITE_TIME, &labels).record(start.elapsed().as_secs_f64());
        });
    }

    fn report_expired_key(&self) {
        self.record(|| counter!(STORE_EXPIRES).increment(1));
    }

    fn report_watch_request(&self) {
        self.record(|| counter!(STORE_WATCH_REQUESTS).increment(1));
    }

    fn report_watcher_added(&self) {
        self.record(|| gauge!(STORE_WATCHERS).increment(1.0));
    }

    fn report_watcher_removed(&self) {
        self.record(|| gauge!(STORE_WATCHERS).decrement(1.0));
    }

    fn report_compaction(&self, outcome: &str, deleted: u64, start: Instant) {
        let labels = [("outcome", outcome.to_string())];
        self.record(|| {
            counter!(COMPACTION_RUNS, &labels).increment(1);
            counter!(COMPACTION_KEYS).increment(deleted);
            histogram!(COMPACTION_DURATION, &labels).record(start.elapsed().as_secs_f64());
        });
    }
}

impl ProxyMetrics for PrometheusMetrics {
    fn report_incoming_request(&self, method: &str) {
        let method = method.to_string();
        self.record(|| counter!(PROXY_REQUESTS, "method" => method).increment(1));
    }

    fn report_request_handled(&self, method: &str, code: u16, start: Instant) {
        let method = method.to_string();
        self.record(|| {
            counter!(PROXY_HANDLED, "method" => method.clone(), "code" => code.to_string()).increment(1);
            histogram!(HTTP_HANDLING_TIME, "method" => method).record(start.elapsed().as_secs_f64());
        });
    }

    fn report_request_dropped(&self, method: &str, err: ProxyingError) {
        let method = method.to_string();
        self.record(|| counter!(PROXY_DROPPED, "method" => method, "proxying_error" => err.as_str()).increment(1));
    }
}
