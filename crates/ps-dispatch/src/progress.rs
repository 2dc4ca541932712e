//! Rate-limited progress reporting

use tokio::sync::broadcast;

use crate::protocol::WorkerEvent;
use crate::task::TaskId;

/// Passes a percentage through only when it moved by at least `step`
/// points, plus the first report and the final 100
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    step: u8,
    last: Option<u8>,
}

impl ProgressThrottle {
    pub fn new(step: u8) -> Self {
        Self {
            step: step.clamp(1, 100),
            last: None,
        }
    }

    pub fn update(&mut self, percent: u8) -> Option<u8> {
        let percent = percent.min(100);
        let emit = match self.last {
            None => true,
            Some(last) if percent == 100 => last != 100,
            Some(last) => percent >= last.saturating_add(self.step),
        };
        if emit {
            self.last = Some(percent);
            Some(percent)
        } else {
            None
        }
    }
}

/// Publishes a task's progress on the coordinator's event channel
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    task_id: TaskId,
    step: u8,
    events: broadcast::Sender<WorkerEvent>,
}

impl ProgressReporter {
    pub(crate) fn new(task_id: TaskId, step: u8, events: broadcast::Sender<WorkerEvent>) -> Self {
        Self {
            task_id,
            step,
            events,
        }
    }

    /// A callback that forwards throttled percentages
    pub fn percent_sink(&self) -> impl FnMut(u8) + Send + 'static {
        let mut throttle = ProgressThrottle::new(self.step);
        let events = self.events.clone();
        let task_id = self.task_id;
        move |percent| {
            if let Some(percent) = throttle.update(percent) {
                // nobody listening is fine
                let _ = events.send(WorkerEvent::Progress { task_id, percent });
            }
        }
    }

    /// Report that `rows` more rows were delivered
    pub fn rows(&self, rows: u64) {
        let _ = self.events.send(WorkerEvent::Rows {
            task_id: self.task_id,
            rows,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttle_steps() {
        let mut throttle = ProgressThrottle::new(5);
        let emitted: Vec<u8> = (0..=100).filter_map(|p| throttle.update(p)).collect();
        assert_eq!(emitted.len(), 21);
        assert_eq!(emitted.first(), Some(&0));
        assert_eq!(emitted.last(), Some(&100));
        assert!(throttle.update(100).is_none());
    }

    #[test]
    fn test_throttle_always_reports_completion() {
        let mut throttle = ProgressThrottle::new(30);
        assert_eq!(throttle.update(10), Some(10));
        assert_eq!(throttle.update(20), None);
        assert_eq!(throttle.update(100), Some(100));
    }

    #[tokio::test]
    async fn test_reporter_publishes() {
        let (tx, mut rx) = broadcast::channel(16);
        let reporter = ProgressReporter::new(4, 50, tx);
        let mut sink = reporter.percent_sink();
        for p in [0, 10, 60, 70, 100] {
            sink(p);
        }
        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let WorkerEvent::Progress { task_id: 4, percent } = event {
                seen.push(percent);
            }
        }
        assert_eq!(seen, vec![0, 60, 100]);
    }
}
