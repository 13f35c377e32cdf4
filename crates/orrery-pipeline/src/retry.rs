//! Engine-level retry policy for handler invocations.
//!
//! The same algorithm backs the per-node retry loop in the engine and is
//! available to tool-like handlers that wrap external operations.

use std::time::Duration;

use rand::Rng;

use crate::graph::{PipelineGraph, PipelineNode};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl RetryPolicy {
    /// The effective policy for a node: `max_retries` (or the graph default)
    /// plus one attempt, 200 ms initial delay doubling to a 60 s cap.
    pub fn for_node(node: &PipelineNode, graph: &PipelineGraph) -> Self {
        let max_retries = if node.max_retries > 0 {
            node.max_retries
        } else {
            graph.default_max_retry
        };
        Self {
            max_attempts: max_retries + 1,
            initial_delay: Duration::from_millis(200),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }

    /// Delay after the 1-indexed `attempt` fails.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exp = attempt.saturating_sub(1) as i32;
        let mut delay = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        let max = self.max_delay.as_secs_f64();
        if delay > max {
            delay = max;
        }
        if self.jitter {
            delay *= rand::thread_rng().gen_range(0.5..1.5);
        }
        Duration::from_secs_f64(delay)
    }
}
