//! Per-superbatch metrics record and the reporters that consume it.
//!
//! A [`SuperbatchMetrics`] is built once after fine-tuning and handed, read
//! only, to every registered [`MetricsReporter`] in order. Reporters are side
//! effects; the trainer logs their failures and carries on.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use parking_lot::Mutex;
use serde::Serialize;

// ── Record ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct SuperbatchMetrics {
    /// 0-based index of the superbatch just completed.
    pub superbatch_index: usize,
    pub superbatch_count: usize,
    pub completions: Vec<String>,
    pub filtered_completions: Vec<String>,
    pub scores_train: Vec<f32>,
    /// Empty when validation did not run this superbatch.
    pub scores_val: Vec<f32>,
    pub filtered_scores: Vec<f32>,
    pub average_loss: f32,
    pub average_kl_div: f32,
    pub scheduler_lr: f64,
    pub completion_lengths: Vec<usize>,
    pub filtered_completion_lengths: Vec<usize>,
}

/// Scalar view of a [`SuperbatchMetrics`], as logged by the sinks.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MetricsSummary {
    pub superbatch_index: usize,
    /// Superbatches finished, this one included.
    pub superbatches_complete: usize,
    pub percent_complete: f64,
    /// Number of prompts trained on so far; the step axis for tracking sinks.
    pub prompt_index: usize,
    pub num_completions: usize,
    pub num_filtered: usize,
    pub score_train_avg: Option<f32>,
    pub score_train_std: Option<f32>,
    pub score_val_avg: Option<f32>,
    pub score_val_std: Option<f32>,
    pub filtered_score_avg: Option<f32>,
    pub average_loss: f32,
    pub average_kl_div: f32,
    pub scheduler_lr: f64,
    pub average_completion_length: Option<f32>,
    pub average_filtered_completion_length: Option<f32>,
}

fn mean(values: &[f32]) -> Option<f32> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f32>() / values.len() as f32)
}

/// Population standard deviation.
fn std_dev(values: &[f32]) -> Option<f32> {
    let m = mean(values)?;
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f32>() / values.len() as f32;
    Some(var.sqrt())
}

fn mean_len(lengths: &[usize]) -> Option<f32> {
    let as_f32: Vec<f32> = lengths.iter().map(|&l| l as f32).collect();
    mean(&as_f32)
}

impl SuperbatchMetrics {
    pub fn summary(&self) -> MetricsSummary {
        let complete = self.superbatch_index + 1;
        MetricsSummary {
            superbatch_index: self.superbatch_index,
            superbatches_complete: complete,
            percent_complete: complete as f64 / self.superbatch_count.max(1) as f64 * 100.0,
            prompt_index: complete * self.filtered_completions.len(),
            num_completions: self.completions.len(),
            num_filtered: self.filtered_completions.len(),
            score_train_avg: mean(&self.scores_train),
            score_train_std: std_dev(&self.scores_train),
            score_val_avg: mean(&self.scores_val),
            score_val_std: std_dev(&self.scores_val),
            filtered_score_avg: mean(&self.filtered_scores),
            average_loss: self.average_loss,
            average_kl_div: self.average_kl_div,
            scheduler_lr: self.scheduler_lr,
            average_completion_length: mean_len(&self.completion_lengths),
            average_filtered_completion_length: mean_len(&self.filtered_completion_lengths),
        }
    }
}

// ── Reporters ───────────────────────────────────────────────────────────────

/// A metrics sink.
pub trait MetricsReporter {
    fn name(&self) -> &str;

    fn report(&self, metrics: &SuperbatchMetrics) -> anyhow::Result<()>;
}

fn fmt_opt(v: Option<f32>) -> String {
    v.map_or_else(|| "n/a".to_string(), |v| format!("{v:.3}"))
}

/// Human-readable summary, three lines per superbatch.
pub struct ConsoleReporter {
    out: Mutex<Box<dyn Write + Send>>,
}

impl ConsoleReporter {
    pub fn stdout() -> Self {
        Self::with_writer(Box::new(std::io::stdout()))
    }

    pub fn with_writer(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }
}

impl MetricsReporter for ConsoleReporter {
    fn name(&self) -> &str {
        "console"
    }

    fn report(&self, metrics: &SuperbatchMetrics) -> anyhow::Result<()> {
        let s = metrics.summary();
        let mut out = self.out.lock();
        writeln!(
            out,
            "\nMetrics at {}\nSuperbatch {}/{} ({:.3}%): {} completions, {} filtered completions, completion length {}, filtered completion length {}",
            chrono::Local::now().format("%H:%M:%S"),
            s.superbatches_complete,
            metrics.superbatch_count,
            s.percent_complete,
            s.num_completions,
            s.num_filtered,
            fmt_opt(s.average_completion_length),
            fmt_opt(s.average_filtered_completion_length),
        )?;
        writeln!(
            out,
            "train score {} ±{}, val score {} ±{}, filtered score {}",
            fmt_opt(s.score_train_avg),
            fmt_opt(s.score_train_std),
            fmt_opt(s.score_val_avg),
            fmt_opt(s.score_val_std),
            fmt_opt(s.filtered_score_avg),
        )?;
        writeln!(
            out,
            "loss {:.3}, KL {:.3}, lr {:.3e}",
            s.average_loss, s.average_kl_div, s.scheduler_lr
        )?;
        out.flush()?;
        Ok(())
    }
}

#[derive(Serialize)]
struct JsonlRecord<'a> {
    timestamp: String,
    #[serde(flatten)]
    summary: MetricsSummary,
    filtered_completions: &'a [String],
}

/// Appends one JSON object per superbatch to a file; the tracking sink.
pub struct JsonlReporter {
    file: Mutex<BufWriter<File>>,
}

impl JsonlReporter {
    pub fn create(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open metrics file {}", path.display()))?;
        Ok(Self {
            file: Mutex::new(BufWriter::new(file)),
        })
    }
}

impl MetricsReporter for JsonlReporter {
    fn name(&self) -> &str {
        "jsonl"
    }

    fn report(&self, metrics: &SuperbatchMetrics) -> anyhow::Result<()> {
        let record = JsonlRecord {
            timestamp: chrono::Utc::now().to_rfc3339(),
            summary: metrics.summary(),
            filtered_completions: &metrics.filtered_completions,
        };
        let mut file = self.file.lock();
        serde_json::to_writer(&mut *file, &record)?;
        file.write_all(b"\n")?;
        file.flush()?;
        Ok(())
    }
}

/// Blocks the loop for a fixed time so a remote telemetry sink can flush.
pub struct DelayReporter {
    pub delay: Duration,
}

impl MetricsReporter for DelayReporter {
    fn name(&self) -> &str {
        "delay"
    }

    fn report(&self, _metrics: &SuperbatchMetrics) -> anyhow::Result<()> {
        std::thread::sleep(self.delay);
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> SuperbatchMetrics {
        SuperbatchMetrics {
            superbatch_index: 1,
            superbatch_count: 4,
            completions: vec!["a".into(), "bb".into(), "ccc".into(), "dddd".into()],
            filtered_completions: vec!["bb".into(), "dddd".into()],
            scores_train: vec![1.0, 3.0, 1.0, 3.0],
            scores_val: vec![],
            filtered_scores: vec![3.0, 3.0],
            average_loss: 0.5,
            average_kl_div: 0.0,
            scheduler_lr: 1e-5,
            completion_lengths: vec![1, 2, 3, 4],
            filtered_completion_lengths: vec![2, 4],
        }
    }

    #[test]
    fn summary_statistics() {
        let s = record().summary();
        assert!((s.percent_complete - 50.0).abs() < 1e-9);
        assert_eq!(s.score_train_avg, Some(2.0));
        assert_eq!(s.score_train_std, Some(1.0));
        assert_eq!(s.score_val_avg, None);
        assert_eq!(s.filtered_score_avg, Some(3.0));
        assert_eq!(s.average_completion_length, Some(2.5));
        assert_eq!(s.average_filtered_completion_length, Some(3.0));
        assert_eq!(s.superbatches_complete, 2);
        assert_eq!(s.prompt_index, 4);
    }

    #[test]
    fn first_superbatch_counts_its_own_prompts() {
        let first = SuperbatchMetrics {
            superbatch_index: 0,
            superbatch_count: 1,
            ..record()
        };
        let s = first.summary();
        assert_eq!(s.prompt_index, 2);
        assert!((s.percent_complete - 100.0).abs() < 1e-9);
    }

    #[derive(Clone, Default)]
    struct SharedBuf(std::sync::Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn console_reporter_prints_summary() {
        let buf = SharedBuf::default();
        let reporter = ConsoleReporter::with_writer(Box::new(buf.clone()));
        reporter.report(&record()).unwrap();
        let text = String::from_utf8(buf.0.lock().clone()).unwrap();
        assert!(text.contains("Superbatch 2/4 (50.000%)"));
        assert!(text.contains("val score n/a"));
    }

    #[test]
    fn jsonl_reporter_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.jsonl");
        let reporter = JsonlReporter::create(&path).unwrap();
        reporter.report(&record()).unwrap();
        reporter.report(&record()).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let v: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(v["superbatch_index"], 1);
        assert_eq!(v["filtered_completions"][1], "dddd");
    }
}
