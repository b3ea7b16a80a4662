use std::collections::HashMap;

/// Default number of concurrent requests.
pub const DEFAULT_MAX_THREADS: usize = 2;
/// Default multiplier over the reference response time; a response slower
/// than `reference * threshold` counts as an affirmative answer.
pub const DEFAULT_THRESHOLD: f64 = 2.0;
/// Default search range for a character value (printable ASCII).
pub const DEFAULT_MIN_CHAR: i64 = 0;
pub const DEFAULT_MAX_CHAR: i64 = 126;
/// Default search range for a row length.
pub const DEFAULT_MIN_ROW_LENGTH: i64 = 0;
pub const DEFAULT_MAX_ROW_LENGTH: i64 = 128;
/// Default max time to wait between request submissions, in ms.
pub const DEFAULT_MAX_INTERVAL_MS: u64 = 0;
/// Replacement for a character the oracle could not resolve.
pub const DEFAULT_UNKNOWN_CHAR: char = '?';
/// Default path of the dump file.
pub const DEFAULT_OUTPUT_PATH: &str = "./timesink.out";

/// Headers used when the operator supplies none: a browser-like UA keeps
/// naive filters quiet, keep-alive keeps latency jitter down.
pub fn default_headers() -> HashMap<String, String> {
    HashMap::from([
        ("Cookie".to_string(), String::new()),
        (
            "User-Agent".to_string(),
            "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_14_2) AppleWebKit/605.1.15 \
             (KHTML, like Gecko) Version/12.0.2 Safari/605.1.15"
                .to_string(),
        ),
        ("Connection".to_string(), "keep-alive".to_string()),
    ])
}
