use std::time::{Duration, Instant};

use anyhow::Result as AnyResult;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use rand_distr::{Distribution, Triangular};
use reqwest::Client;
use tracing::debug;

use crate::error::{AttackError, Result};
use crate::web::request::Request;

/// A website the payloads are sent to.
///
/// The only observation the engine ever makes is wall-clock latency: the
/// target is a timing oracle, nothing more. Implementations must be cheap to
/// share across concurrent probes.
#[async_trait]
pub trait Target: Send + Sync {
    fn url(&self) -> &str;

    /// Issues a single request and returns its latency in milliseconds,
    /// measured from just before send until the full body has been read.
    async fn response_time(&self, request: &Request) -> Result<f64>;

    /// Issues a batch of requests with bounded parallelism and returns the
    /// latencies in input order, regardless of completion order.
    ///
    /// Before each submission the dispatcher sleeps a pseudorandom delay
    /// drawn from a triangular distribution over
    /// `[max_interval / 2, max_interval]` ms (mode at `max_interval`).
    /// Staggering submissions keeps probes from arriving in lock-step, which
    /// would queue at the target and inflate the measured latencies in a
    /// correlated way.
    async fn response_times(
        &self,
        requests: Vec<Request>,
        max_interval_ms: u64,
        max_threads: usize,
    ) -> Result<Vec<f64>> {
        let n_requests = requests.len();

        // Submission delays accumulate: request i is held back by the sum of
        // the first i jitter draws, mirroring a dispatcher that sleeps
        // between submissions.
        let delays_ms: Vec<f64> = {
            let mut rng = rand::thread_rng();
            let mut acc = 0.0f64;
            requests
                .iter()
                .map(|_| {
                    if max_interval_ms > 0 {
                        if let Ok(jitter) = Triangular::new(
                            max_interval_ms as f64 / 2.0,
                            max_interval_ms as f64,
                            max_interval_ms as f64,
                        ) {
                            acc += jitter.sample(&mut rng);
                        }
                    }
                    acc
                })
                .collect()
        };

        let probes = requests
            .into_iter()
            .zip(delays_ms)
            .enumerate()
            .map(|(index, (request, delay_ms))| async move {
                if delay_ms > 0.0 {
                    debug!("delaying submission {} for {:.2} ms", index, delay_ms);
                    tokio::time::sleep(Duration::from_millis(delay_ms as u64)).await;
                }
                let elapsed_ms = self.response_time(&request).await?;
                Ok::<(usize, f64), AttackError>((index, elapsed_ms))
            });

        let mut times = vec![0.0f64; n_requests];
        let mut in_flight = stream::iter(probes).buffer_unordered(max_threads.max(1));
        while let Some(outcome) = in_flight.next().await {
            let (index, elapsed_ms) = outcome?;
            times[index] = elapsed_ms;
        }

        Ok(times)
    }
}

/// Concrete [`Target`] backed by a `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpTarget {
    url: String,
    client: Client,
}

impl HttpTarget {
    /// Builds a target for `url`. Assessment hosts often sit behind
    /// self-signed TLS, so certificate validation is off; redirects are not
    /// followed because they would distort the latency measurement.
    pub fn new(url: impl Into<String>) -> AnyResult<Self> {
        let client = Client::builder()
            .danger_accept_invalid_certs(true)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            url: url.into(),
            client,
        })
    }

    fn unavailable(&self, request: &Request, status: impl Into<String>) -> AttackError {
        AttackError::TargetUnavailable {
            url: self.url.clone(),
            request: request.to_string(),
            status: status.into(),
        }
    }
}

#[async_trait]
impl Target for HttpTarget {
    fn url(&self) -> &str {
        &self.url
    }

    async fn response_time(&self, request: &Request) -> Result<f64> {
        let mut builder = if request.method().eq_ignore_ascii_case("post") {
            self.client.post(&self.url).form(request.params())
        } else {
            self.client.get(&self.url).query(request.params())
        };
        for (name, value) in request.headers() {
            builder = builder.header(name, value);
        }

        let started = Instant::now();
        let outcome = async {
            let response = builder.send().await?;
            let status = response.status();
            // Drain the body: the oracle fires on time-to-last-byte.
            response.bytes().await.map(|_| status)
        }
        .await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        match outcome {
            Ok(status) if status.is_success() => {
                debug!("target response time: {:.2} ms", elapsed_ms);
                Ok(elapsed_ms)
            }
            Ok(status) => Err(self.unavailable(request, status.as_u16().to_string())),
            Err(e) => Err(self.unavailable(request, e.to_string())),
        }
    }
}
