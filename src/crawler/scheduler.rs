//! Task queue and pacing
//!
//! This module handles:
//! - FIFO ordering of queued resources
//! - Optionally serving non-markup resources before pages, which keeps the
//!   chain of pages waiting on their assets short
//! - The randomized delay between two tasks

use crate::crawler::resource::ResourceTask;
use rand::Rng;
use std::collections::VecDeque;
use std::time::Duration;

/// Scheduler manages the work queue and inter-task delay
#[derive(Debug)]
pub struct Scheduler {
    /// Non-markup resources (only used when prioritizing assets)
    assets: VecDeque<ResourceTask>,

    /// Pages, or everything when assets are not prioritized
    pages: VecDeque<ResourceTask>,

    prioritize_assets: bool,
    base_wait: Duration,
    random_wait: Duration,
}

impl Scheduler {
    /// Creates a new scheduler
    ///
    /// # Arguments
    ///
    /// * `prioritize_assets` - Serve non-markup tasks before markup tasks
    /// * `base_wait` - Fixed delay between two tasks
    /// * `random_wait` - Upper bound of an additional uniformly random delay
    pub fn new(prioritize_assets: bool, base_wait: Duration, random_wait: Duration) -> Self {
        Self {
            assets: VecDeque::new(),
            pages: VecDeque::new(),
            prioritize_assets,
            base_wait,
            random_wait,
        }
    }

    /// Appends a task to the end of its queue
    pub fn push(&mut self, task: ResourceTask, is_markup: bool) {
        if self.prioritize_assets && !is_markup {
            self.assets.push_back(task);
        } else {
            self.pages.push_back(task);
        }
    }

    /// Takes the next task, assets first if prioritized
    pub fn next_task(&mut self) -> Option<ResourceTask> {
        self.assets.pop_front().or_else(|| self.pages.pop_front())
    }

    pub fn len(&self) -> usize {
        self.assets.len() + self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty() && self.pages.is_empty()
    }

    /// Delay to wait before the next task starts
    pub fn next_delay(&self) -> Duration {
        let random_ms = self.random_wait.as_millis() as u64;
        let extra = if random_ms > 0 {
            rand::rng().random_range(0..=random_ms)
        } else {
            0
        };
        self.base_wait + Duration::from_millis(extra)
    }
}
