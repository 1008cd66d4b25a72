//! Observability events
//!
//! Training code reports what it does as typed [`TrainingEvent`]s pushed into an
//! [`EventSink`]. The CLI uses [`TracingSink`], which renders each event through
//! `tracing`; tests use [`MemorySink`] and inspect the captured events directly.

use std::path::PathBuf;
use std::sync::Mutex;

use serde::Serialize;

/// Something that happened during a run
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TrainingEvent {
    CycleStarted {
        cycle: usize,
        cycles: usize,
        labeled: usize,
        unlabeled: usize,
    },
    /// An image could not be scored and sits out this cycle's selection
    ScoringSkipped {
        index: usize,
        reason: String,
    },
    SelectionMade {
        cycle: usize,
        strategy: String,
        selected: Vec<usize>,
    },
    ResumeLoaded {
        path: PathBuf,
        epoch: usize,
        best_prec1: f64,
    },
    CheckpointMissing {
        path: PathBuf,
    },
    EpochStarted {
        cycle: usize,
        epoch: usize,
        lr: f64,
    },
    TrainProgress {
        epoch: usize,
        batch: usize,
        batches: usize,
        loss: f64,
        score: f64,
        batch_time: f64,
        data_time: f64,
        ranking_accuracy: Option<f64>,
    },
    /// Emitted after every validation batch
    ValidationProgress {
        batch: usize,
        batches: usize,
        loss: f64,
        score: f64,
        mean_iou: f64,
        /// Falls on the print interval
        periodic: bool,
    },
    EpochCompleted {
        cycle: usize,
        epoch: usize,
        train_loss: f64,
        prec1: f64,
        mean_iou: f64,
        is_best: bool,
    },
    CheckpointSaved {
        path: PathBuf,
        is_best: bool,
        archived: Option<PathBuf>,
    },
    CycleCompleted {
        cycle: usize,
        labeled: usize,
        best_prec1: f64,
        best_map: f64,
    },
    EvaluationOnly {
        prec1: f64,
        mean_iou: f64,
    },
    TestImage {
        index: usize,
        total: usize,
        name: String,
        mean_iou: Option<f64>,
    },
}

/// Receiver of training events
pub trait EventSink: Send + Sync {
    fn emit(&self, event: TrainingEvent);
}

/// Forwards events to the global `tracing` subscriber
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: TrainingEvent) {
        match event {
            TrainingEvent::CycleStarted {
                cycle,
                cycles,
                labeled,
                unlabeled,
            } => tracing::info!(
                "Cycle {}/{} | labeled: {} | unlabeled: {}",
                cycle + 1,
                cycles,
                labeled,
                unlabeled
            ),
            TrainingEvent::ScoringSkipped { index, reason } => {
                tracing::warn!("Image {} excluded from selection: {}", index, reason)
            }
            TrainingEvent::SelectionMade {
                cycle,
                strategy,
                selected,
            } => tracing::info!(
                "Cycle {}: {} selected {} images {:?}",
                cycle + 1,
                strategy,
                selected.len(),
                selected
            ),
            TrainingEvent::ResumeLoaded {
                path,
                epoch,
                best_prec1,
            } => tracing::info!(
                "=> loaded checkpoint '{}' (epoch {}, best prec1 {:.3})",
                path.display(),
                epoch,
                best_prec1
            ),
            TrainingEvent::CheckpointMissing { path } => {
                tracing::warn!("=> no checkpoint found at '{}'", path.display())
            }
            TrainingEvent::EpochStarted { cycle, epoch, lr } => {
                tracing::info!("Cycle {} epoch {} | lr {:.6}", cycle + 1, epoch, lr)
            }
            TrainingEvent::TrainProgress {
                epoch,
                batch,
                batches,
                loss,
                score,
                batch_time,
                data_time,
                ranking_accuracy,
            } => match ranking_accuracy {
                Some(acc) => tracing::info!(
                    "Epoch: [{}][{}/{}] Time {:.3} Data {:.3} Loss {:.4} Score {:.3} Ranking {:.3}",
                    epoch,
                    batch,
                    batches,
                    batch_time,
                    data_time,
                    loss,
                    score,
                    acc
                ),
                None => tracing::info!(
                    "Epoch: [{}][{}/{}] Time {:.3} Data {:.3} Loss {:.4} Score {:.3}",
                    epoch,
                    batch,
                    batches,
                    batch_time,
                    data_time,
                    loss,
                    score
                ),
            },
            TrainingEvent::ValidationProgress {
                batch,
                batches,
                loss,
                score,
                mean_iou,
                periodic,
            } => {
                if periodic {
                    tracing::info!(
                        "Test: [{}/{}] Loss {:.4} Score {:.3} mAP {:.3}",
                        batch,
                        batches,
                        loss,
                        score,
                        mean_iou
                    )
                } else {
                    tracing::debug!("Test: [{}/{}] mAP {:.3}", batch, batches, mean_iou)
                }
            }
            TrainingEvent::EpochCompleted {
                cycle,
                epoch,
                train_loss,
                prec1,
                mean_iou,
                is_best,
            } => tracing::info!(
                "Cycle {} epoch {} done | loss {:.4} | prec1 {:.3} | mAP {:.3}{}",
                cycle + 1,
                epoch,
                train_loss,
                prec1,
                mean_iou,
                if is_best { " | new best" } else { "" }
            ),
            TrainingEvent::CheckpointSaved {
                path,
                is_best,
                archived,
            } => tracing::debug!(
                "Saved '{}' (best: {}, archived: {:?})",
                path.display(),
                is_best,
                archived
            ),
            TrainingEvent::CycleCompleted {
                cycle,
                labeled,
                best_prec1,
                best_map,
            } => tracing::info!(
                "Cycle {} complete | labeled {} | best prec1 {:.3} | best mAP {:.3}",
                cycle + 1,
                labeled,
                best_prec1,
                best_map
            ),
            TrainingEvent::EvaluationOnly { prec1, mean_iou } => {
                tracing::info!(" * Score {:.3} mAP {:.3}", prec1, mean_iou)
            }
            TrainingEvent::TestImage {
                index,
                total,
                name,
                mean_iou,
            } => match mean_iou {
                Some(m) => tracing::info!("Eval: [{}/{}] {} ===> mAP {:.3}", index, total, name, m),
                None => tracing::info!("Eval: [{}/{}] {}", index, total, name),
            },
        }
    }
}

/// Collects events in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<TrainingEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything emitted so far
    pub fn events(&self) -> Vec<TrainingEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Number of captured events matching a predicate
    pub fn count(&self, predicate: impl Fn(&TrainingEvent) -> bool) -> usize {
        self.events().iter().filter(|e| predicate(e)).count()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: TrainingEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_captures_in_order() {
        let sink = MemorySink::new();
        sink.emit(TrainingEvent::CheckpointMissing {
            path: PathBuf::from("runs/checkpoint_latest.json"),
        });
        sink.emit(TrainingEvent::EvaluationOnly {
            prec1: 91.5,
            mean_iou: 62.0,
        });

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], TrainingEvent::CheckpointMissing { .. }));
        assert_eq!(
            sink.count(|e| matches!(e, TrainingEvent::EvaluationOnly { .. })),
            1
        );
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let event = TrainingEvent::SelectionMade {
            cycle: 0,
            strategy: "random".to_string(),
            selected: vec![3, 1],
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"selection_made\""));
    }
}
