// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The shared descriptor installed for one parallel loop.

#[cfg(feature = "adaptive")]
use crate::adaptive::AdaptiveShare;
use crate::macros::log_debug;
#[cfg(feature = "numa")]
use crate::numa::NumaTopology;
use crate::util::trip_count;
#[cfg(feature = "adaptive")]
use crate::util::Span;
use crate::worker::Worker;
use crossbeam_utils::CachePadded;
use std::num::NonZeroUsize;
use std::sync::atomic::AtomicI64;
#[cfg(feature = "numa")]
use std::sync::Arc;
use std::sync::Mutex;

/// Iteration scheduling policy for one parallel loop, together with its
/// chunk-size hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Closed-form partitioning with no shared writes during iteration.
    Static {
        /// Iterations per round-robin chunk. Zero splits the loop so that
        /// each worker makes a single trip.
        chunk_size: i64,
    },
    /// A single shared cursor advanced by fetch-and-add (or CAS).
    Dynamic {
        /// Iterations claimed per request.
        chunk_size: i64,
    },
    /// A shared cursor with claim sizes that decay as work runs out.
    Guided {
        /// Lower bound on the claim size.
        chunk_size: i64,
    },
    /// Per-worker deques with random-victim work stealing.
    #[cfg(feature = "adaptive")]
    Adaptive {
        /// Iterations claimed from the local deque per request.
        chunk_size: i64,
    },
}

impl Schedule {
    pub(crate) fn chunk_size(self) -> i64 {
        match self {
            Schedule::Static { chunk_size }
            | Schedule::Dynamic { chunk_size }
            | Schedule::Guided { chunk_size } => chunk_size,
            #[cfg(feature = "adaptive")]
            Schedule::Adaptive { chunk_size } => chunk_size,
        }
    }
}

/// Shared state describing one parallel loop: bounds, step, policy, and the
/// policy's shared cursors.
///
/// One `WorkShare` is installed per loop, then borrowed by every member of
/// the team via [`worker()`](Self::worker). Each member repeatedly claims
/// ranges from its [`Worker`] until the claim returns nothing; only then is
/// the loop drained. Every team member must participate: under the adaptive
/// schedule a worker's initial share is only released for stealing once that
/// worker has touched it.
pub struct WorkShare {
    /// Original loop lower bound.
    pub(crate) start: i64,
    /// Loop upper bound, exclusive in the step direction.
    pub(crate) end: i64,
    /// Signed step, nonzero.
    pub(crate) incr: i64,
    /// Policy and chunk hint.
    pub(crate) schedule: Schedule,
    /// Number of threads in the team.
    pub(crate) num_threads: usize,
    /// Shared cursor: the next iteration yet to be handed out.
    pub(crate) next: CachePadded<AtomicI64>,
    /// Serializes claims on the `*_locked` fallback paths.
    pub(crate) lock: Mutex<()>,
    /// Whether the dynamic fetch-and-add fast path is safe from overflow.
    #[cfg(feature = "atomics")]
    pub(crate) mode: bool,
    /// Per-worker deques, present under the adaptive schedule.
    #[cfg(feature = "adaptive")]
    pub(crate) adaptive: Option<AdaptiveShare>,
    /// NUMA placement table supplied by the thread pool, if any.
    #[cfg(feature = "numa")]
    pub(crate) numa: Option<Arc<NumaTopology>>,
}

impl WorkShare {
    /// Creates the descriptor for one parallel loop over
    /// `for (i = start; i != end; i += incr)`, shared by a team of
    /// `num_threads` workers.
    ///
    /// Loops whose bounds are inverted with respect to the step direction
    /// are canonicalized to zero iterations.
    ///
    /// # Panics
    ///
    /// Panics if `incr` is zero, or if the chunk size is negative (static
    /// schedule) or not strictly positive (all other schedules).
    pub fn new(
        start: i64,
        end: i64,
        incr: i64,
        schedule: Schedule,
        num_threads: NonZeroUsize,
    ) -> Self {
        assert!(incr != 0, "the loop increment must be nonzero");
        match schedule {
            Schedule::Static { chunk_size } => assert!(
                chunk_size >= 0,
                "the static schedule requires a nonnegative chunk size, got {chunk_size}"
            ),
            Schedule::Dynamic { chunk_size } | Schedule::Guided { chunk_size } => assert!(
                chunk_size > 0,
                "this schedule requires a positive chunk size, got {chunk_size}"
            ),
            #[cfg(feature = "adaptive")]
            Schedule::Adaptive { chunk_size } => assert!(
                chunk_size > 0,
                "this schedule requires a positive chunk size, got {chunk_size}"
            ),
        }

        let num_threads = num_threads.get();
        let total = trip_count(start, end, incr);
        // Canonicalize zero-trip loops so that `next == end`.
        let end = if total == 0 { start } else { end };

        #[cfg(feature = "atomics")]
        let mode = match schedule {
            Schedule::Dynamic { chunk_size } => {
                dynamic_fast_path_is_safe(end, incr, chunk_size, num_threads)
            }
            _ => false,
        };

        #[cfg(feature = "adaptive")]
        let adaptive = match schedule {
            Schedule::Adaptive { .. } => Some(AdaptiveShare::new(total, num_threads)),
            _ => None,
        };

        log_debug!(
            "installed work share over [{start}, {end}) step {incr} ({total} iterations) for {num_threads} thread(s)"
        );

        Self {
            start,
            end,
            incr,
            schedule,
            num_threads,
            next: CachePadded::new(AtomicI64::new(start)),
            lock: Mutex::new(()),
            #[cfg(feature = "atomics")]
            mode,
            #[cfg(feature = "adaptive")]
            adaptive,
            #[cfg(feature = "numa")]
            numa: None,
        }
    }

    /// Attaches the NUMA placement table supplied by the thread pool, to
    /// bias adaptive victim selection towards same-node peers.
    ///
    /// # Panics
    ///
    /// Panics if the table doesn't describe exactly this team.
    #[cfg(feature = "numa")]
    pub fn with_numa_topology(mut self, topology: Arc<NumaTopology>) -> Self {
        assert_eq!(
            topology.num_threads(),
            self.num_threads,
            "the NUMA table describes {} thread(s) but the team has {}",
            topology.num_threads(),
            self.num_threads
        );
        self.numa = Some(topology);
        self
    }

    /// Creates the scheduling view for the given team member.
    ///
    /// # Panics
    ///
    /// Panics if `team_id` is not smaller than the team size.
    pub fn worker(&self, team_id: usize) -> Worker<'_> {
        assert!(
            team_id < self.num_threads,
            "team id {team_id} out of range for a team of {} thread(s)",
            self.num_threads
        );
        Worker::new(self, team_id)
    }

    /// Original loop lower bound.
    pub fn start(&self) -> i64 {
        self.start
    }

    /// Loop upper bound, exclusive in the step direction.
    pub fn end(&self) -> i64 {
        self.end
    }

    /// Signed loop step.
    pub fn incr(&self) -> i64 {
        self.incr
    }

    /// The scheduling policy this loop was installed with.
    pub fn schedule(&self) -> Schedule {
        self.schedule
    }

    /// Number of threads in the team.
    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// Maps a span of zero-based iteration indices back to loop space.
    #[cfg(feature = "adaptive")]
    pub(crate) fn index_span_to_loop(&self, claim: Span) -> Span {
        Span::new(
            self.start + claim.start * self.incr,
            self.start + claim.end * self.incr,
        )
    }
}

/// The fetch-and-add fast path lets every thread overshoot the shared cursor
/// by one chunk; the flag precomputed here proves those overshoots cannot
/// wrap a signed word.
#[cfg(feature = "atomics")]
fn dynamic_fast_path_is_safe(end: i64, incr: i64, chunk_size: i64, num_threads: usize) -> bool {
    let threads = match i64::try_from(num_threads) {
        Ok(threads) => threads,
        Err(_) => return false,
    };
    let slack = chunk_size
        .checked_mul(incr)
        .and_then(|step| step.checked_mul(threads.saturating_add(1)));
    match slack {
        Some(slack) => end.checked_add(slack).is_some(),
        None => false,
    }
}
