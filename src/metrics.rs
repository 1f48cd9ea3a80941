use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, Histogram, register_counter, register_counter_vec, register_gauge,
    register_histogram,
};


lazy_static! {
    pub static ref REQUEST_TOTAL: Counter =
        register_counter!("kobold_gateway_requests_total", "Total number of tool calls submitted").unwrap();
    pub static ref CACHE_HITS: Counter =
        register_counter!("kobold_gateway_cache_hits_total", "Total cache hits").unwrap();
    pub static ref CACHE_MISSES: Counter =
        register_counter!("kobold_gateway_cache_misses_total", "Total cache misses").unwrap();
    pub static ref DEDUP_FOLLOWERS: Counter = register_counter!(
        "kobold_gateway_dedup_followers_total",
        "Requests that joined an identical in-flight backend call"
    )
    .unwrap();
    pub static ref REJECTED_TOTAL: CounterVec = register_counter_vec!(
        "kobold_gateway_rejected_total",
        "Requests rejected before reaching the backend",
        &["reason"]
    )
    .unwrap();
    pub static ref BACKEND_RETRIES: Counter =
        register_counter!("kobold_gateway_backend_retries_total", "Backend retry attempts").unwrap();
    pub static ref REQUEST_LATENCY: Histogram = register_histogram!(
        "kobold_gateway_request_latency_seconds",
        "Dispatch latency in seconds"
    )
    .unwrap();
    pub static ref CACHE_SIZE: Gauge =
        register_gauge!("kobold_gateway_cache_size", "Current number of items in cache").unwrap();
    pub static ref QUEUE_DEPTH: Gauge =
        register_gauge!("kobold_gateway_queue_depth", "Requests waiting for an execution slot").unwrap();
    pub static ref EXECUTING: Gauge =
        register_gauge!("kobold_gateway_executing", "Requests currently executing against the backend").unwrap();
}
