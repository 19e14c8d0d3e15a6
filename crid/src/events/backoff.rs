/* -------------------------------------------------------------------------- *\
 *                |   █████╗ ██╗   ██╗██████╗  █████╗ ███████╗ |              *
 *                |  ██╔══██╗██║   ██║██╔══██╗██╔══██╗██╔════╝ |              *
 *                |  ███████║██║   ██║██████╔╝███████║█████╗   |              *
 *                |  ██╔══██║██║   ██║██╔══██╗██╔══██║██╔══╝   |              *
 *                |  ██║  ██║╚██████╔╝██║  ██║██║  ██║███████╗ |              *
 *                |  ╚═╝  ╚═╝ ╚═════╝ ╚═╝  ╚═╝╚═╝  ╚═╝╚══════╝ |              *
 *                +--------------------------------------------+              *
 *                                                                            *
 *                         Distributed Systems Runtime                        *
 * -------------------------------------------------------------------------- *
 * Copyright 2022 - 2024, the aurae contributors                              *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! The per-subject retry queue.
//!
//! A subject whose handler failed goes into backoff: further events for
//! it queue in FIFO order behind the retry deadline, and each failed
//! flush doubles the delay up to the cap. Success clears the subject.
//! State is process-local; a restart starts fresh.

use crate::engine::EngineEvent;
use backoff::backoff::Backoff as _;
use backoff::ExponentialBackoff;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

pub(crate) const INITIAL_DELAY: Duration = Duration::from_secs(1);
pub(crate) const MAX_DELAY: Duration = Duration::from_secs(5 * 60);

#[derive(Debug)]
pub(crate) struct Entry {
    pub events: VecDeque<EngineEvent>,
    pub policy: ExponentialBackoff,
    deadline: Instant,
}

#[derive(Debug, Default)]
pub(crate) struct EventBackoff {
    entries: HashMap<String, Entry>,
}

fn policy() -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: INITIAL_DELAY,
        randomization_factor: 0.0,
        multiplier: 2.0,
        max_interval: MAX_DELAY,
        max_elapsed_time: None,
        ..Default::default()
    }
}

impl EventBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Queues an event at the tail of a subject already in backoff.
    pub fn append(&mut self, id: &str, event: EngineEvent) {
        if let Some(entry) = self.entries.get_mut(id) {
            entry.events.push_back(event);
        } else {
            self.promote(id, event);
        }
    }

    /// Moves a subject into backoff after its first handling failure.
    pub fn promote(&mut self, id: &str, event: EngineEvent) {
        let entry = self.entries.entry(id.to_string()).or_insert_with(|| {
            let mut policy = policy();
            let delay = policy.next_backoff().unwrap_or(MAX_DELAY);
            Entry {
                events: VecDeque::new(),
                policy,
                deadline: Instant::now() + delay,
            }
        });
        entry.events.push_back(event);
    }

    /// Re-queues what is left of a drained subject after a flush
    /// failure, with the delay doubled (capped).
    pub fn requeue(
        &mut self,
        id: String,
        events: VecDeque<EngineEvent>,
        mut policy: ExponentialBackoff,
    ) {
        let delay = policy.next_backoff().unwrap_or(MAX_DELAY);
        let _ = self.entries.insert(
            id,
            Entry { events, policy, deadline: Instant::now() + delay },
        );
    }

    /// Removes and returns every subject whose deadline has passed.
    pub fn take_expired(
        &mut self,
        now: Instant,
    ) -> Vec<(String, VecDeque<EngineEvent>, ExponentialBackoff)> {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|id| {
                self.entries
                    .remove(&id)
                    .map(|entry| (id, entry.events, entry.policy))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn event(name: &str) -> EngineEvent {
        EngineEvent::ImageUpdate { name: name.to_string() }
    }

    #[tokio::test(start_paused = true)]
    async fn test_promote_delays_by_initial_interval() {
        let mut backoff = EventBackoff::new();
        backoff.promote("img", event("img"));
        assert!(backoff.contains("img"));

        // not yet expired
        assert!(backoff.take_expired(Instant::now()).is_empty());

        tokio::time::advance(Duration::from_millis(1001)).await;
        let expired = backoff.take_expired(Instant::now());
        assert_eq!(expired.len(), 1);
        assert!(backoff.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_requeue_doubles_the_delay() {
        let mut backoff = EventBackoff::new();
        backoff.promote("img", event("one"));

        tokio::time::advance(Duration::from_millis(1001)).await;
        let (id, events, policy) =
            backoff.take_expired(Instant::now()).remove(0);
        backoff.requeue(id, events, policy);

        // The second deadline is 2s out, not 1s.
        tokio::time::advance(Duration::from_millis(1001)).await;
        assert!(backoff.take_expired(Instant::now()).is_empty());
        tokio::time::advance(Duration::from_millis(1000)).await;
        assert_eq!(backoff.take_expired(Instant::now()).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_append_keeps_fifo_order() {
        let mut backoff = EventBackoff::new();
        backoff.promote("img", event("one"));
        backoff.append("img", event("two"));
        backoff.append("img", event("three"));

        tokio::time::advance(Duration::from_secs(2)).await;
        let (_, events, _) = backoff.take_expired(Instant::now()).remove(0);
        let names: Vec<String> = events
            .iter()
            .map(|e| match e {
                EngineEvent::ImageUpdate { name } => name.clone(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(
            names,
            vec!["one".to_string(), "two".to_string(), "three".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_caps_at_maximum() {
        let mut backoff = EventBackoff::new();
        backoff.promote("img", event("one"));

        // Fail enough times to exceed the cap if uncapped.
        for _ in 0..12 {
            tokio::time::advance(MAX_DELAY + Duration::from_secs(1)).await;
            let (id, events, policy) =
                backoff.take_expired(Instant::now()).remove(0);
            backoff.requeue(id, events, policy);
        }

        // The next deadline is at most MAX_DELAY away.
        tokio::time::advance(MAX_DELAY).await;
        assert_eq!(backoff.take_expired(Instant::now()).len(), 1);
    }
}
