//! Subprocess compute backend
//!
//! Runs the quantizer and the evaluation scripts as child processes, streams
//! their output into the log, and scrapes the metrics from what they print.

use super::backend::ComputeBackend;
use super::types::{BackendError, BackendResult, MeasureRequest, Measurement, QuantizeRequest};
use crate::config::BackendConfig;
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Backend that shells out to external tools
#[derive(Debug, Clone)]
pub struct ProcessBackend {
    quantize_command: Vec<String>,
    ppl_command: Vec<String>,
    kl_command: Vec<String>,
    timeout: Option<Duration>,
}

impl ProcessBackend {
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            quantize_command: config.quantize_command.clone(),
            ppl_command: config.ppl_command.clone(),
            kl_command: config.kl_command.clone(),
            timeout: config.timeout_secs.filter(|s| *s > 0).map(Duration::from_secs),
        }
    }

    /// Run one command to completion and return its combined output
    async fn run_command(&self, argv: &[String], args: Vec<String>, device: u32) -> BackendResult<String> {
        let (program, fixed) = argv
            .split_first()
            .ok_or_else(|| BackendError::Spawn("empty command".to_string()))?;

        debug!(device, program = %program, args = ?args, "Spawning backend process");

        let mut command = Command::new(program);
        command
            .args(fixed)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Own process group: a terminal Ctrl+C reaches only us, and the
        // in-flight item runs to completion while dispatch stops.
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .map_err(|e| BackendError::Spawn(format!("{}: {}", program, e)))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let run = async {
            let (out, err) = tokio::join!(read_lines(stdout, device), read_lines(stderr, device));
            let status = child.wait().await;
            (format!("{}{}", out, err), status)
        };

        let (output, status) = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(done) => done,
                Err(_) => {
                    warn!(device, program = %program, "Backend process timed out");
                    return Err(BackendError::Timeout(limit.as_millis() as u64));
                }
            },
            None => run.await,
        };

        let status = status.map_err(|e| BackendError::Failed(format!("{}: {}", program, e)))?;
        if status.success() {
            return Ok(output);
        }

        let last_line = output.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
        if output.to_lowercase().contains("out of memory") {
            Err(BackendError::OutOfMemory(last_line.to_string()))
        } else if status.code().is_none() {
            Err(BackendError::Interrupted(format!("{} terminated by signal", program)))
        } else {
            Err(BackendError::Failed(format!("{} exited with {}: {}", program, status, last_line)))
        }
    }
}

async fn read_lines<R: AsyncRead + Unpin>(pipe: Option<R>, device: u32) -> String {
    let mut output = String::new();
    if let Some(pipe) = pipe {
        let mut lines = BufReader::new(pipe).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(device, "{}", line);
            output.push_str(&line);
            output.push('\n');
        }
    }
    output
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// First number after the colon that follows `label` on a line matching
/// `select`. Matching is case-insensitive.
fn scrape_metric(output: &str, label: &str, select: impl Fn(&str) -> bool) -> Option<f64> {
    output
        .lines()
        .map(str::to_lowercase)
        .filter(|line| select(line))
        .filter_map(|line| {
            let after_label = &line[line.find(label)? + label.len()..];
            let (_, value) = after_label.split_once(':')?;
            value
                .split_whitespace()
                .next()?
                .trim_end_matches([',', ';'])
                .parse::<f64>()
                .ok()
        })
        .next()
}

pub(crate) fn parse_perplexity(output: &str) -> Option<f64> {
    scrape_metric(output, "perplexity", |l| l.contains("perplexity"))
}

pub(crate) fn parse_kl_divergence(output: &str) -> Option<f64> {
    scrape_metric(output, "divergence", |l| {
        l.contains("divergence") && (l.contains("kl") || l.contains("k/l"))
    })
}

/// Total size of the `*.safetensors` files directly under `dir`
pub(crate) fn weights_size_gib(dir: &Path) -> BackendResult<f64> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| BackendError::MissingArtifact(format!("{}: {}", dir.display(), e)))?;

    let mut bytes = 0u64;
    let mut found = false;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("safetensors") {
            if let Ok(meta) = entry.metadata() {
                bytes += meta.len();
                found = true;
            }
        }
    }

    if !found {
        return Err(BackendError::MissingArtifact(format!(
            "no *.safetensors in {}",
            dir.display()
        )));
    }
    Ok(bytes as f64 / GIB)
}

#[async_trait]
impl ComputeBackend for ProcessBackend {
    #[instrument(skip(self, request), fields(bpw = %request.bpw, device = request.device))]
    async fn run_quantize(&self, request: &QuantizeRequest) -> BackendResult<()> {
        for dir in [&request.out_dir, &request.work_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| BackendError::Failed(format!("{}: {}", dir.display(), e)))?;
        }

        let mut args = if request.resume {
            info!("Resuming quantization from work directory");
            vec!["-w".to_string(), path_arg(&request.work_dir), "-r".to_string()]
        } else {
            vec![
                "-i".to_string(),
                path_arg(&request.model_dir),
                "-o".to_string(),
                path_arg(&request.out_dir),
                "-w".to_string(),
                path_arg(&request.work_dir),
                "-b".to_string(),
                request.bpw.to_string(),
            ]
        };
        args.extend(["-d".to_string(), request.device.to_string()]);
        args.extend(request.passthrough.iter().cloned());

        self.run_command(&self.quantize_command, args, request.device).await?;
        Ok(())
    }

    #[instrument(skip(self, request), fields(variant = %request.variant, device = request.device))]
    async fn run_measure(&self, request: &MeasureRequest) -> BackendResult<Measurement> {
        let gib = weights_size_gib(&request.variant_dir)?;

        let mut args = vec![
            "-m".to_string(),
            path_arg(&request.variant_dir),
            "-r".to_string(),
            request.ppl_rows.to_string(),
            "-d".to_string(),
            request.device.to_string(),
        ];
        args.extend(request.passthrough.iter().cloned());
        let output = self.run_command(&self.ppl_command, args, request.device).await?;
        let ppl = parse_perplexity(&output)
            .ok_or_else(|| BackendError::Parse("no perplexity in output".to_string()))?;

        let kl_div = if request.variant.is_base() {
            0.0
        } else {
            let mut args = vec![
                "-ma".to_string(),
                path_arg(&request.model_dir),
                "-mb".to_string(),
                path_arg(&request.variant_dir),
                "-r".to_string(),
                request.kl_rows.to_string(),
                "-d".to_string(),
                request.device.to_string(),
            ];
            args.extend(request.passthrough.iter().cloned());
            let output = self.run_command(&self.kl_command, args, request.device).await?;
            parse_kl_divergence(&output)
                .ok_or_else(|| BackendError::Parse("no KL divergence in output".to_string()))?
        };

        info!(gib, kl_div, ppl, "Measured");
        Ok(Measurement { gib, kl_div, ppl })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_perplexity() {
        let out = "loading...\n -- Evaluated 100 rows\n -- Perplexity: 6.8421\n";
        assert_eq!(parse_perplexity(out), Some(6.8421));
        assert_eq!(parse_perplexity("no metrics here"), None);
    }

    #[test]
    fn test_parse_metric_ignores_trailing_fields() {
        assert_eq!(parse_perplexity("Perplexity: 6.84 (elapsed: 3s)"), Some(6.84));
        assert_eq!(parse_perplexity("[eval] step: 4, perplexity: 7.25"), Some(7.25));
        assert_eq!(
            parse_kl_divergence("K/L divergence (A, B): 0.031, time: 12s"),
            Some(0.031)
        );
    }

    #[test]
    fn test_parse_non_finite_metrics() {
        assert!(parse_perplexity("Perplexity: nan").unwrap().is_nan());
        assert_eq!(parse_perplexity("Perplexity: inf"), Some(f64::INFINITY));
    }

    #[test]
    fn test_parse_kl_divergence() {
        let out = "Top-1 agreement: 0.93\nK/L divergence (A, B): 0.0421\nK/L divergence (B, A): 0.0500\n";
        assert_eq!(parse_kl_divergence(out), Some(0.0421));
        assert_eq!(parse_kl_divergence("KL divergence: 1e-3"), Some(0.001));
        assert_eq!(parse_kl_divergence("Perplexity: 7.0"), None);
    }

    #[test]
    fn test_weights_size() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("model-00001.safetensors"), vec![0u8; 1024]).unwrap();
        std::fs::write(dir.path().join("model-00002.safetensors"), vec![0u8; 1024]).unwrap();
        std::fs::write(dir.path().join("config.json"), b"{}").unwrap();

        let gib = weights_size_gib(dir.path()).unwrap();
        assert!((gib - 2048.0 / GIB).abs() < 1e-15);
    }

    #[test]
    fn test_weights_size_requires_safetensors() {
        let dir = TempDir::new().unwrap();
        let err = weights_size_gib(dir.path()).unwrap_err();
        assert!(matches!(err, BackendError::MissingArtifact(_)));
        assert!(!err.is_transient());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_command_is_permanent() {
        let backend = ProcessBackend {
            quantize_command: vec!["false".to_string()],
            ppl_command: vec![],
            kl_command: vec![],
            timeout: None,
        };
        let err = backend
            .run_command(&backend.quantize_command, vec![], 0)
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Failed(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_timeout_is_transient() {
        let backend = ProcessBackend {
            quantize_command: vec!["sleep".to_string(), "5".to_string()],
            ppl_command: vec![],
            kl_command: vec![],
            timeout: Some(Duration::from_millis(100)),
        };
        let err = backend
            .run_command(&backend.quantize_command, vec![], 0)
            .await
            .unwrap_err();
        assert_eq!(err, BackendError::Timeout(100));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let backend = ProcessBackend {
            quantize_command: vec!["/nonexistent/quantizer-binary".to_string()],
            ppl_command: vec![],
            kl_command: vec![],
            timeout: None,
        };
        let err = backend
            .run_command(&backend.quantize_command, vec![], 0)
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Spawn(_)));
    }

    #[cfg(target_os = "linux")]
    fn pgid_from_stat(stat: &str) -> i64 {
        // Fields after the parenthesised command name: state ppid pgrp ...
        let (_, rest) = stat.rsplit_once(')').unwrap();
        rest.split_whitespace().nth(2).unwrap().parse().unwrap()
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_child_runs_in_own_process_group() {
        let backend = ProcessBackend {
            quantize_command: vec![
                "sh".to_string(),
                "-c".to_string(),
                "cat /proc/$$/stat".to_string(),
            ],
            ppl_command: vec![],
            kl_command: vec![],
            timeout: None,
        };
        let output = backend
            .run_command(&backend.quantize_command, vec![], 0)
            .await
            .unwrap();

        let own = pgid_from_stat(&std::fs::read_to_string("/proc/self/stat").unwrap());
        let child = pgid_from_stat(output.trim());
        assert_ne!(child, own);
    }
}
