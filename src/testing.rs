//! Test support: a scriptable latency oracle standing in for a vulnerable
//! endpoint, plus a frame-recording sink.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;

use crate::error::Result;
use crate::output::status::{StatusFrame, StatusSink};
use crate::web::request::Request;
use crate::web::target::Target;

/// A [`Target`] whose latency is computed by a closure over the request.
///
/// The reported latency is also slept, so completion order matches what a
/// real endpoint would produce; run under a paused tokio clock to make the
/// sleeps free.
pub struct MockTarget {
    url: String,
    calls: AtomicUsize,
    responder: Box<dyn Fn(&Request) -> Result<f64> + Send + Sync>,
}

impl MockTarget {
    pub fn new<F>(url: &str, responder: F) -> Self
    where
        F: Fn(&Request) -> Result<f64> + Send + Sync + 'static,
    {
        Self {
            url: url.to_string(),
            calls: AtomicUsize::new(0),
            responder: Box::new(responder),
        }
    }

    /// Number of requests issued so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Target for MockTarget {
    fn url(&self) -> &str {
        &self.url
    }

    async fn response_time(&self, request: &Request) -> Result<f64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let latency_ms = (self.responder)(request)?;
        tokio::time::sleep(Duration::from_micros((latency_ms * 1000.0) as u64)).await;
        Ok(latency_ms)
    }
}

/// Extracts the `{condition}{value}` pair a ternary probe substituted into a
/// payload, e.g. `=71` out of `...)=71, sleep(0.1), sleep(0))`.
pub fn parse_predicate(payload: &str) -> Option<(char, i64)> {
    let re = Regex::new(r"(=|>|<)(-?\d+), sleep\(").unwrap();
    let caps = re.captures(payload)?;
    Some((caps[1].chars().next()?, caps[2].parse().ok()?))
}

pub fn eval_predicate(condition: char, actual: i64, value: i64) -> bool {
    match condition {
        '=' => actual == value,
        '>' => actual > value,
        '<' => actual < value,
        _ => false,
    }
}

fn parse_row_index(payload: &str) -> Option<usize> {
    let re = Regex::new(r"limit (\d+),1\)").unwrap();
    re.captures(payload)?[1].parse().ok()
}

fn parse_char_index(payload: &str) -> Option<usize> {
    let re = Regex::new(r"limit \d+,1\),(\d+),1\)\)").unwrap();
    re.captures(payload)?[1].parse().ok()
}

/// A latency oracle backed by an in-memory table: answers row-length and
/// character probes against `rows` (multi-column rows carry embedded tabs),
/// trips the threshold for bare test payloads, and stays at `base_ms` for
/// everything else.
pub fn table_oracle(
    param: &'static str,
    rows: Vec<String>,
    base_ms: f64,
    slow_ms: f64,
) -> Arc<MockTarget> {
    Arc::new(MockTarget::new(
        "http://mock.test",
        move |request: &Request| {
            let injected = &request.params()[param];
            if !injected.contains("sleep(") {
                return Ok(base_ms);
            }

            if injected.contains("char_length(") {
                let row_index = parse_row_index(injected).expect("row index in payload");
                let (condition, value) = parse_predicate(injected).expect("predicate in payload");
                let fired = rows
                    .get(row_index)
                    .map(|content| {
                        eval_predicate(condition, content.chars().count() as i64, value)
                    })
                    .unwrap_or(false);
                return Ok(if fired { slow_ms } else { base_ms });
            }

            if injected.contains("ord(mid(") {
                let row_index = parse_row_index(injected).expect("row index in payload");
                let char_index = parse_char_index(injected).expect("char index in payload");
                let (condition, value) = parse_predicate(injected).expect("predicate in payload");
                let fired = rows
                    .get(row_index)
                    .and_then(|content| content.chars().nth(char_index - 1))
                    .map(|ch| eval_predicate(condition, ch as i64, value))
                    .unwrap_or(false);
                return Ok(if fired { slow_ms } else { base_ms });
            }

            // A bare test payload: the parameter is exploitable.
            Ok(slow_ms)
        },
    ))
}

/// Sink that records every frame for later assertions.
#[derive(Default)]
pub struct RecordingSink {
    frames: Mutex<Vec<StatusFrame>>,
    resets: AtomicUsize,
    ended: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> Vec<StatusFrame> {
        self.frames.lock().unwrap().clone()
    }

    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }

    pub fn ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }
}

impl StatusSink for RecordingSink {
    fn log(&self, frame: StatusFrame) {
        self.frames.lock().unwrap().push(frame);
    }

    fn reset(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }

    fn end(&self) {
        self.ended.store(true, Ordering::SeqCst);
    }
}
