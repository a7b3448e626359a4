// Live registry of active pipelines plus rolling history, per-stage latency
// metrics and threshold alerts. Alerts are records only; nothing blocks on
// them.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use sysinfo::System;

const MAX_HISTORY: usize = 1000;
const MAX_ALERTS: usize = 100;
const METRIC_WINDOW: usize = 100;
const RECENT_SAMPLES: usize = 10;

const MAX_OPERATION_SECONDS: f64 = 60.0;
const MAX_PIPELINE_SECONDS: f64 = 300.0;
const MAX_CPU_PERCENT: f32 = 90.0;
const MAX_MEMORY_PERCENT: f64 = 85.0;

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    #[serde(rename = "type")]
    pub alert_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    pub value: f64,
    pub threshold: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActivePipeline {
    pub call_id: String,
    pub start_time: DateTime<Utc>,
    pub file_info: serde_json::Value,
    pub steps: HashMap<String, StepRecord>,
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineRecord {
    pub call_id: String,
    pub status: String,
    pub total_duration: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub steps: HashMap<String, StepRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageMetrics {
    pub count: usize,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub success_rate: f64,
    pub recent: Vec<f64>,
}

#[derive(Default)]
struct Metrics {
    durations: HashMap<String, VecDeque<f64>>,
    successes: HashMap<String, u64>,
    errors: HashMap<String, u64>,
}

impl Metrics {
    fn record_duration(&mut self, operation: &str, duration: f64) {
        let window = self.durations.entry(operation.to_string()).or_default();
        if window.len() >= METRIC_WINDOW {
            window.pop_front();
        }
        window.push_back(duration);
    }

    fn stats(&self, operation: &str) -> StageMetrics {
        let window = self.durations.get(operation);
        let times: Vec<f64> = window.map(|w| w.iter().copied().collect()).unwrap_or_default();
        let successes = *self.successes.get(operation).unwrap_or(&0);
        let errors = *self.errors.get(operation).unwrap_or(&0);
        let total = successes + errors;

        if times.is_empty() {
            return StageMetrics {
                count: 0,
                avg: 0.0,
                min: 0.0,
                max: 0.0,
                success_rate: 0.0,
                recent: Vec::new(),
            };
        }

        StageMetrics {
            count: times.len(),
            avg: times.iter().sum::<f64>() / times.len() as f64,
            min: times.iter().copied().fold(f64::INFINITY, f64::min),
            max: times.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            success_rate: if total > 0 {
                successes as f64 / total as f64
            } else {
                0.0
            },
            recent: times.iter().rev().take(RECENT_SAMPLES).rev().copied().collect(),
        }
    }
}

struct MonitorState {
    active: HashMap<String, ActivePipeline>,
    history: VecDeque<PipelineRecord>,
    alerts: VecDeque<Alert>,
    metrics: Metrics,
}

pub struct PipelineMonitor {
    state: Mutex<MonitorState>,
    system: Mutex<System>,
}

impl PipelineMonitor {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MonitorState {
                active: HashMap::new(),
                history: VecDeque::new(),
                alerts: VecDeque::new(),
                metrics: Metrics::default(),
            }),
            system: Mutex::new(System::new()),
        }
    }

    pub fn start_pipeline(&self, call_id: &str, file_info: serde_json::Value) {
        let mut state = self.state.lock().expect("monitor state poisoned");
        state.active.insert(
            call_id.to_string(),
            ActivePipeline {
                call_id: call_id.to_string(),
                start_time: Utc::now(),
                file_info,
                steps: HashMap::new(),
                status: "running".to_string(),
            },
        );
        log::info!("monitoring pipeline {call_id}");
    }

    pub fn update_step(
        &self,
        call_id: &str,
        step: &str,
        status: &str,
        duration: Option<f64>,
        error: Option<&str>,
    ) {
        let system_alerts = self.system_alerts();
        let mut state = self.state.lock().expect("monitor state poisoned");

        if let Some(pipeline) = state.active.get_mut(call_id) {
            pipeline.steps.insert(
                step.to_string(),
                StepRecord {
                    status: status.to_string(),
                    duration,
                    error: error.map(str::to_string),
                    timestamp: Utc::now(),
                },
            );
        }

        if let Some(duration) = duration {
            state.metrics.record_duration(step, duration);
            if duration > MAX_OPERATION_SECONDS {
                push_alert(
                    &mut state.alerts,
                    Alert {
                        alert_type: "slow_operation",
                        call_id: Some(call_id.to_string()),
                        step: Some(step.to_string()),
                        value: duration,
                        threshold: MAX_OPERATION_SECONDS,
                        timestamp: Utc::now(),
                    },
                );
            }
        }

        match status {
            "completed" => {
                *state.metrics.successes.entry(step.to_string()).or_default() += 1;
            }
            "failed" => {
                *state.metrics.errors.entry(step.to_string()).or_default() += 1;
            }
            _ => {}
        }

        for alert in system_alerts {
            push_alert(&mut state.alerts, alert);
        }
    }

    pub fn complete_pipeline(&self, call_id: &str) {
        let mut state = self.state.lock().expect("monitor state poisoned");
        if let Some(pipeline) = state.active.remove(call_id) {
            let end = Utc::now();
            let total = (end - pipeline.start_time).num_milliseconds() as f64 / 1000.0;

            state.metrics.record_duration("total_pipeline", total);
            *state
                .metrics
                .successes
                .entry("total_pipeline".to_string())
                .or_default() += 1;

            if total > MAX_PIPELINE_SECONDS {
                push_alert(
                    &mut state.alerts,
                    Alert {
                        alert_type: "slow_pipeline",
                        call_id: Some(call_id.to_string()),
                        step: None,
                        value: total,
                        threshold: MAX_PIPELINE_SECONDS,
                        timestamp: Utc::now(),
                    },
                );
            }

            push_history(
                &mut state.history,
                PipelineRecord {
                    call_id: pipeline.call_id,
                    status: "completed".to_string(),
                    total_duration: total,
                    error: None,
                    failed_step: None,
                    start_time: pipeline.start_time,
                    end_time: end,
                    steps: pipeline.steps,
                },
            );
            log::info!("pipeline completed: {call_id} ({total:.2}s)");
        }
    }

    pub fn fail_pipeline(&self, call_id: &str, error: &str, failed_step: Option<&str>) {
        let mut state = self.state.lock().expect("monitor state poisoned");
        if let Some(pipeline) = state.active.remove(call_id) {
            let end = Utc::now();
            let total = (end - pipeline.start_time).num_milliseconds() as f64 / 1000.0;

            *state
                .metrics
                .errors
                .entry("total_pipeline".to_string())
                .or_default() += 1;

            push_history(
                &mut state.history,
                PipelineRecord {
                    call_id: pipeline.call_id,
                    status: "failed".to_string(),
                    total_duration: total,
                    error: Some(error.to_string()),
                    failed_step: failed_step.map(str::to_string),
                    start_time: pipeline.start_time,
                    end_time: end,
                    steps: pipeline.steps,
                },
            );
            log::error!(
                "pipeline failed: {call_id} at step {}: {error}",
                failed_step.unwrap_or("unknown")
            );
        }
    }

    pub fn active(&self) -> Vec<ActivePipeline> {
        let state = self.state.lock().expect("monitor state poisoned");
        state.active.values().cloned().collect()
    }

    pub fn history(&self, limit: usize) -> Vec<PipelineRecord> {
        let state = self.state.lock().expect("monitor state poisoned");
        state
            .history
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn recent_alerts(&self, limit: usize) -> Vec<Alert> {
        let state = self.state.lock().expect("monitor state poisoned");
        state.alerts.iter().rev().take(limit).cloned().collect()
    }

    pub fn performance_summary(&self) -> serde_json::Value {
        let state = self.state.lock().expect("monitor state poisoned");
        let operations = [
            "upload",
            "audio_processing",
            "transcription",
            "nlp_analysis",
            "database_storage",
            "total_pipeline",
        ];

        let mut per_operation = serde_json::Map::new();
        for operation in operations {
            per_operation.insert(
                operation.to_string(),
                serde_json::to_value(state.metrics.stats(operation)).unwrap_or_default(),
            );
        }

        json!({
            "operations": per_operation,
            "active_pipelines": state.active.len(),
            "recent_alerts": state.alerts.iter().rev().take(RECENT_SAMPLES).collect::<Vec<_>>(),
            "system_metrics": self.system_metrics(),
            "timestamp": Utc::now().to_rfc3339(),
        })
    }

    fn system_metrics(&self) -> serde_json::Value {
        let mut system = self.system.lock().expect("sysinfo poisoned");
        system.refresh_cpu_usage();
        system.refresh_memory();
        let memory_percent = if system.total_memory() > 0 {
            system.used_memory() as f64 / system.total_memory() as f64 * 100.0
        } else {
            0.0
        };
        json!({
            "cpu_percent": system.global_cpu_usage(),
            "memory_percent": memory_percent,
        })
    }

    fn system_alerts(&self) -> Vec<Alert> {
        let mut system = self.system.lock().expect("sysinfo poisoned");
        system.refresh_cpu_usage();
        system.refresh_memory();

        let mut alerts = Vec::new();
        let cpu = system.global_cpu_usage();
        if cpu > MAX_CPU_PERCENT {
            alerts.push(Alert {
                alert_type: "high_cpu",
                call_id: None,
                step: None,
                value: cpu as f64,
                threshold: MAX_CPU_PERCENT as f64,
                timestamp: Utc::now(),
            });
        }

        if system.total_memory() > 0 {
            let memory_percent =
                system.used_memory() as f64 / system.total_memory() as f64 * 100.0;
            if memory_percent > MAX_MEMORY_PERCENT {
                alerts.push(Alert {
                    alert_type: "high_memory",
                    call_id: None,
                    step: None,
                    value: memory_percent,
                    threshold: MAX_MEMORY_PERCENT,
                    timestamp: Utc::now(),
                });
            }
        }
        alerts
    }
}

impl Default for PipelineMonitor {
    fn default() -> Self {
        Self::new()
    }
}

fn push_alert(alerts: &mut VecDeque<Alert>, alert: Alert) {
    if alerts.len() >= MAX_ALERTS {
        alerts.pop_front();
    }
    log::warn!(
        "alert: {} value={:.1} threshold={:.1}",
        alert.alert_type,
        alert.value,
        alert.threshold
    );
    alerts.push_back(alert);
}

fn push_history(history: &mut VecDeque<PipelineRecord>, record: PipelineRecord) {
    if history.len() >= MAX_HISTORY {
        history.pop_front();
    }
    history.push_back(record);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_moves_pipeline_from_active_to_history() {
        let monitor = PipelineMonitor::new();
        monitor.start_pipeline("c1", json!({ "filename": "a.wav" }));
        assert_eq!(monitor.active().len(), 1);

        monitor.update_step("c1", "upload", "completed", Some(0.5), None);
        monitor.complete_pipeline("c1");

        assert!(monitor.active().is_empty());
        let history = monitor.history(10);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, "completed");
        assert!(history[0].steps.contains_key("upload"));
    }

    #[test]
    fn failed_pipeline_records_failed_step() {
        let monitor = PipelineMonitor::new();
        monitor.start_pipeline("c2", json!({}));
        monitor.update_step("c2", "transcription", "failed", Some(1.2), Some("server down"));
        monitor.fail_pipeline("c2", "server down", Some("transcription"));

        let history = monitor.history(10);
        assert_eq!(history[0].status, "failed");
        assert_eq!(history[0].failed_step.as_deref(), Some("transcription"));
        assert_eq!(history[0].error.as_deref(), Some("server down"));
    }

    #[test]
    fn slow_operation_emits_alert() {
        let monitor = PipelineMonitor::new();
        monitor.start_pipeline("c3", json!({}));
        monitor.update_step("c3", "transcription", "completed", Some(120.0), None);

        let alerts = monitor.recent_alerts(10);
        assert!(alerts.iter().any(|a| a.alert_type == "slow_operation"));
    }

    #[test]
    fn metrics_window_stays_bounded() {
        let monitor = PipelineMonitor::new();
        monitor.start_pipeline("c4", json!({}));
        for _ in 0..250 {
            monitor.update_step("c4", "upload", "completed", Some(1.0), None);
        }
        let summary = monitor.performance_summary();
        assert_eq!(summary["operations"]["upload"]["count"], 100);
        let rate = summary["operations"]["upload"]["success_rate"].as_f64().unwrap();
        assert!((rate - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn history_is_newest_first_and_bounded() {
        let monitor = PipelineMonitor::new();
        for i in 0..5 {
            let id = format!("c{i}");
            monitor.start_pipeline(&id, json!({}));
            monitor.complete_pipeline(&id);
        }
        let history = monitor.history(2);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].call_id, "c4");
    }
}
