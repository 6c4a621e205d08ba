//! Per-submission stdin queues.
//!
//! `send_stdin` management calls land here via the control loop; the
//! `read_stdin` primitive blocks on the queue from the evaluator thread.
//! Delivery is strictly FIFO per submission. The queue also tracks whether a
//! reader is currently blocked so the control loop can announce
//! `interactive_started` exactly once, on the first write that meets a
//! waiting reader.

use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::kill::KillFlags;

#[derive(Default)]
struct QueueState {
    items: VecDeque<String>,
    waiting: bool,
    announced: bool,
}

#[derive(Default)]
pub struct StdinQueues {
    inner: Mutex<HashMap<u64, QueueState>>,
    cv: Condvar,
}

impl StdinQueues {
    /// Enqueue one chunk of stdin data for a submission.
    ///
    /// Returns `true` when this write should be announced as the start of
    /// interactive input (a reader is blocked and no announcement has been
    /// made yet).
    pub fn push(&self, submission_id: u64, data: String) -> bool {
        let mut guard = self.inner.lock().expect("stdin queue lock poisoned");
        let queue = guard.entry(submission_id).or_default();
        queue.items.push_back(data);
        let announce = queue.waiting && !queue.announced;
        if announce {
            queue.announced = true;
        }
        self.cv.notify_all();
        announce
    }

    /// Dequeue the next chunk for a submission, blocking until one arrives
    /// or the submission is killed.
    ///
    /// # Errors
    ///
    /// Returns an error message when the submission is killed while waiting.
    pub fn pop_blocking(&self, submission_id: u64, kill: &KillFlags) -> Result<String, String> {
        let mut guard = self.inner.lock().expect("stdin queue lock poisoned");
        loop {
            if kill.is_killed(submission_id) {
                if let Some(queue) = guard.get_mut(&submission_id) {
                    queue.waiting = false;
                }
                return Err("submission killed".to_string());
            }
            let queue = guard.entry(submission_id).or_default();
            if let Some(item) = queue.items.pop_front() {
                queue.waiting = false;
                return Ok(item);
            }
            queue.waiting = true;
            let (next, _timeout) = self
                .cv
                .wait_timeout(guard, Duration::from_millis(100))
                .expect("stdin queue lock poisoned");
            guard = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn fifo_within_a_submission() {
        let queues = StdinQueues::default();
        let kill = KillFlags::default();
        queues.push(1, "A".to_string());
        queues.push(1, "B".to_string());
        assert_eq!(queues.pop_blocking(1, &kill).unwrap(), "A");
        assert_eq!(queues.pop_blocking(1, &kill).unwrap(), "B");
    }

    #[test]
    fn queues_are_per_submission() {
        let queues = StdinQueues::default();
        let kill = KillFlags::default();
        queues.push(1, "one".to_string());
        queues.push(2, "two".to_string());
        assert_eq!(queues.pop_blocking(2, &kill).unwrap(), "two");
        assert_eq!(queues.pop_blocking(1, &kill).unwrap(), "one");
    }

    #[test]
    fn blocked_reader_wakes_on_push() {
        let queues = Arc::new(StdinQueues::default());
        let kill = Arc::new(KillFlags::default());

        let reader = {
            let queues = Arc::clone(&queues);
            let kill = Arc::clone(&kill);
            std::thread::spawn(move || queues.pop_blocking(7, &kill))
        };

        // Give the reader time to block before writing.
        std::thread::sleep(Duration::from_millis(50));
        let announce = queues.push(7, "hello".to_string());
        assert!(announce, "first write meeting a waiting reader announces");
        assert_eq!(reader.join().unwrap().unwrap(), "hello");
    }

    #[test]
    fn announcement_happens_once() {
        let queues = Arc::new(StdinQueues::default());
        let kill = Arc::new(KillFlags::default());

        let reader = {
            let queues = Arc::clone(&queues);
            let kill = Arc::clone(&kill);
            std::thread::spawn(move || {
                let a = queues.pop_blocking(7, &kill).unwrap();
                let b = queues.pop_blocking(7, &kill).unwrap();
                (a, b)
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        assert!(queues.push(7, "first".to_string()));
        assert!(!queues.push(7, "second".to_string()));
        assert_eq!(
            reader.join().unwrap(),
            ("first".to_string(), "second".to_string())
        );
    }

    #[test]
    fn push_without_waiting_reader_does_not_announce() {
        let queues = StdinQueues::default();
        assert!(!queues.push(1, "queued ahead of any read".to_string()));
    }

    #[test]
    fn kill_unblocks_reader() {
        let queues = Arc::new(StdinQueues::default());
        let kill = Arc::new(KillFlags::default());

        let reader = {
            let queues = Arc::clone(&queues);
            let kill = Arc::clone(&kill);
            std::thread::spawn(move || queues.pop_blocking(9, &kill))
        };

        std::thread::sleep(Duration::from_millis(50));
        kill.kill(9);
        let err = reader.join().unwrap().unwrap_err();
        assert!(err.contains("killed"));
    }
}
