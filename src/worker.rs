// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Per-thread scheduling state, and the static, dynamic and guided policies.

use crate::macros::log_trace;
#[cfg(feature = "atomics")]
use crate::util::{clamp_to_end, reached_end};
use crate::util::{ceil_div, trip_count, Span};
use crate::work_share::{Schedule, WorkShare};
use std::sync::atomic::Ordering;

/// Outcome of one [`Worker::static_next`] request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaticNext {
    /// A range was produced; the worker may receive more on a later trip.
    Range(Span),
    /// A range was produced and it contains the team's final iteration.
    Last(Span),
    /// Nothing left for this worker.
    Done,
}

/// A worker's private view of a [`WorkShare`]: its team identity plus the
/// policy state that never crosses threads.
///
/// Create one per thread with [`WorkShare::worker`] and keep it on that
/// thread for the whole loop.
pub struct Worker<'ws> {
    pub(crate) ws: &'ws WorkShare,
    pub(crate) team_id: usize,
    /// Static-schedule trip counter; -1 once this worker has produced the
    /// team's final range.
    static_trip: i64,
    /// Victim selection draws; per-worker so that stealing never contends
    /// on a shared generator.
    #[cfg(feature = "adaptive")]
    pub(crate) rng: Lcg,
    /// NUMA node of this worker and its index within the node's thread
    /// table, when a placement table was attached.
    #[cfg(feature = "numa")]
    pub(crate) numa_place: Option<(usize, usize)>,
}

impl<'ws> Worker<'ws> {
    pub(crate) fn new(ws: &'ws WorkShare, team_id: usize) -> Self {
        #[cfg(feature = "numa")]
        let numa_place = ws
            .numa
            .as_ref()
            .map(|topology| (topology.node_of(team_id), topology.index_in_node(team_id)));
        Self {
            ws,
            team_id,
            static_trip: 0,
            #[cfg(feature = "adaptive")]
            rng: Lcg::new(team_id as u32),
            #[cfg(feature = "numa")]
            numa_place,
        }
    }

    /// Index of this worker within the team.
    pub fn team_id(&self) -> usize {
        self.team_id
    }

    /// Whether this worker produced the range containing the team's final
    /// iteration under the static schedule.
    pub fn took_last(&self) -> bool {
        self.static_trip == -1
    }

    /// Claims the next range under the policy carried by the work share, or
    /// returns [`None`] once the loop is drained.
    pub fn next(&mut self) -> Option<Span> {
        match self.ws.schedule {
            Schedule::Static { .. } => match self.static_next() {
                StaticNext::Range(span) | StaticNext::Last(span) => Some(span),
                StaticNext::Done => None,
            },
            Schedule::Dynamic { .. } => {
                #[cfg(feature = "atomics")]
                {
                    self.dynamic_next()
                }
                #[cfg(not(feature = "atomics"))]
                {
                    self.dynamic_next_locked()
                }
            }
            Schedule::Guided { .. } => {
                #[cfg(feature = "atomics")]
                {
                    self.guided_next()
                }
                #[cfg(not(feature = "atomics"))]
                {
                    self.guided_next_locked()
                }
            }
            #[cfg(feature = "adaptive")]
            Schedule::Adaptive { .. } => self.adaptive_next(),
        }
    }

    /// Static schedule: closed-form partitioning, no shared writes.
    ///
    /// With a zero chunk size the loop is split so that each worker makes a
    /// single trip; otherwise chunks are dealt round-robin, offset by the
    /// team id. [`StaticNext::Last`] marks the range holding the team's
    /// final iteration; the worker that received it keeps reporting it via
    /// [`took_last()`](Self::took_last).
    pub fn static_next(&mut self) -> StaticNext {
        let ws = self.ws;
        if self.static_trip == -1 {
            return StaticNext::Done;
        }

        let nthreads = ws.num_threads as i64;

        // Degenerate teams take the whole loop in one trip.
        if nthreads == 1 {
            self.static_trip = -1;
            return if ws.start == ws.end {
                StaticNext::Done
            } else {
                StaticNext::Last(Span::new(ws.start, ws.end))
            };
        }

        let chunk = ws.schedule.chunk_size();
        let n = trip_count(ws.start, ws.end, ws.incr);
        let i = self.team_id as i64;

        if chunk == 0 {
            // One trip per thread: split into ceil(n / nthreads) blocks in
            // zero-based space, then transform back.
            if self.static_trip > 0 {
                return StaticNext::Done;
            }

            let q = ceil_div(n, nthreads);
            let s0 = q * i;
            let e0 = (s0 + q).min(n);

            if s0 >= e0 {
                self.static_trip = 1;
                return StaticNext::Done;
            }

            let span = Span::new(ws.start + s0 * ws.incr, ws.start + e0 * ws.incr);
            log_trace!("[thread {i}] static trip over {span:?}");
            if e0 == n {
                self.static_trip = -1;
                StaticNext::Last(span)
            } else {
                self.static_trip = 1;
                StaticNext::Range(span)
            }
        } else {
            // On trip t, thread i owns the chunk starting (t * nthreads + i)
            // chunks in.
            let s0 = (self.static_trip * nthreads + i) * chunk;
            let e0 = (s0 + chunk).min(n);

            if s0 >= n {
                return StaticNext::Done;
            }

            let span = Span::new(ws.start + s0 * ws.incr, ws.start + e0 * ws.incr);
            log_trace!("[thread {i}] static trip {} over {span:?}", self.static_trip);
            if e0 == n {
                self.static_trip = -1;
                StaticNext::Last(span)
            } else {
                self.static_trip += 1;
                StaticNext::Range(span)
            }
        }
    }

    /// Dynamic schedule, lock-free path: claims up to one chunk of
    /// iterations by atomically advancing the shared cursor.
    #[cfg(feature = "atomics")]
    pub fn dynamic_next(&mut self) -> Option<Span> {
        let ws = self.ws;
        let end = ws.end;
        let incr = ws.incr;
        let chunk = ws.schedule.chunk_size();

        if ws.mode {
            // Overflow was ruled out at init time, so a blind fetch-and-add
            // claims a whole chunk in one shot.
            let step = chunk * incr;
            let start = ws.next.fetch_add(step, Ordering::SeqCst);
            if reached_end(start, end, incr) {
                return None;
            }
            let span = Span::new(start, clamp_to_end(start + step, end, incr));
            log_trace!("[thread {}] dynamic claim {span:?}", self.team_id);
            return Some(span);
        }

        let mut start = ws.next.load(Ordering::SeqCst);
        loop {
            if start == end {
                return None;
            }
            let nend = dynamic_claim_end(start, end, incr, chunk);
            match ws
                .next
                .compare_exchange(start, nend, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => {
                    let span = Span::new(start, nend);
                    log_trace!("[thread {}] dynamic claim {span:?}", self.team_id);
                    return Some(span);
                }
                // Someone else claimed first: retry from the observed cursor.
                Err(observed) => start = observed,
            }
        }
    }

    /// Dynamic schedule under the work-share lock, for configurations
    /// without atomic claims.
    pub fn dynamic_next_locked(&mut self) -> Option<Span> {
        let ws = self.ws;
        let _guard = ws.lock.lock().unwrap();

        let start = ws.next.load(Ordering::Relaxed);
        if start == ws.end {
            return None;
        }
        let nend = dynamic_claim_end(start, ws.end, ws.incr, ws.schedule.chunk_size());
        ws.next.store(nend, Ordering::Relaxed);
        let span = Span::new(start, nend);
        log_trace!("[thread {}] dynamic claim {span:?}", self.team_id);
        Some(span)
    }

    /// Guided schedule, lock-free path: each claim takes the remaining work
    /// divided by the team size, but never less than the configured chunk.
    #[cfg(feature = "atomics")]
    pub fn guided_next(&mut self) -> Option<Span> {
        let ws = self.ws;
        let end = ws.end;
        let incr = ws.incr;
        let chunk = ws.schedule.chunk_size();
        let nthreads = ws.num_threads as i64;

        let mut start = ws.next.load(Ordering::SeqCst);
        loop {
            if start == end {
                return None;
            }
            let nend = guided_claim_end(start, end, incr, chunk, nthreads);
            match ws
                .next
                .compare_exchange(start, nend, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => {
                    let span = Span::new(start, nend);
                    log_trace!("[thread {}] guided claim {span:?}", self.team_id);
                    return Some(span);
                }
                Err(observed) => start = observed,
            }
        }
    }

    /// Guided schedule under the work-share lock.
    pub fn guided_next_locked(&mut self) -> Option<Span> {
        let ws = self.ws;
        let _guard = ws.lock.lock().unwrap();

        let start = ws.next.load(Ordering::Relaxed);
        if start == ws.end {
            return None;
        }
        let nend = guided_claim_end(
            start,
            ws.end,
            ws.incr,
            ws.schedule.chunk_size(),
            ws.num_threads as i64,
        );
        ws.next.store(nend, Ordering::Relaxed);
        let span = Span::new(start, nend);
        log_trace!("[thread {}] guided claim {span:?}", self.team_id);
        Some(span)
    }
}

/// End of a dynamic claim starting at `start`: one chunk, clamped to the
/// remaining distance in the step direction.
fn dynamic_claim_end(start: i64, end: i64, incr: i64, chunk: i64) -> i64 {
    let left = end - start;
    let step = chunk.saturating_mul(incr);
    let step = if incr > 0 {
        step.min(left)
    } else {
        step.max(left)
    };
    start + step
}

/// End of a guided claim starting at `start`. The remaining trip count is
/// truncated, so the final claim falls back to `end` directly.
fn guided_claim_end(start: i64, end: i64, incr: i64, chunk: i64, nthreads: i64) -> i64 {
    let n = (end - start) / incr;
    let q = ceil_div(n, nthreads).max(chunk);
    if q <= n {
        start + q * incr
    } else {
        end
    }
}

/// Linear-congruential generator with the classic `rand_r` constants,
/// yielding 15 bits per draw. One per worker, seeded from the team id.
#[cfg(feature = "adaptive")]
pub(crate) struct Lcg(u32);

#[cfg(feature = "adaptive")]
impl Lcg {
    pub(crate) fn new(seed: u32) -> Self {
        Lcg(seed)
    }

    fn next(&mut self) -> u32 {
        self.0 = self.0.wrapping_mul(1_103_515_245).wrapping_add(12_345);
        (self.0 >> 16) & 0x7fff
    }

    /// Draws a value uniformly-ish from `0..n`.
    pub(crate) fn pick(&mut self, n: usize) -> usize {
        debug_assert!(n > 0);
        self.next() as usize % n
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::num::NonZeroUsize;

    fn team(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    fn span(start: i64, end: i64) -> Span {
        Span { start, end }
    }

    #[test]
    fn test_static_unchunked_is_one_trip_per_thread() {
        let ws = WorkShare::new(0, 10, 1, Schedule::Static { chunk_size: 0 }, team(4));
        let mut workers: Vec<_> = (0..4).map(|id| ws.worker(id)).collect();

        assert_eq!(workers[0].static_next(), StaticNext::Range(span(0, 3)));
        assert_eq!(workers[1].static_next(), StaticNext::Range(span(3, 6)));
        assert_eq!(workers[2].static_next(), StaticNext::Range(span(6, 9)));
        assert_eq!(workers[3].static_next(), StaticNext::Last(span(9, 10)));

        for worker in &mut workers {
            assert_eq!(worker.static_next(), StaticNext::Done);
        }
        assert!(!workers[0].took_last());
        assert!(workers[3].took_last());
    }

    #[test]
    fn test_static_unchunked_leaves_extra_threads_idle() {
        // 2 iterations split over 4 threads: one each for the first two.
        let ws = WorkShare::new(0, 2, 1, Schedule::Static { chunk_size: 0 }, team(4));
        let mut workers: Vec<_> = (0..4).map(|id| ws.worker(id)).collect();

        assert_eq!(workers[0].static_next(), StaticNext::Range(span(0, 1)));
        assert_eq!(workers[1].static_next(), StaticNext::Last(span(1, 2)));
        assert_eq!(workers[2].static_next(), StaticNext::Done);
        assert_eq!(workers[3].static_next(), StaticNext::Done);
    }

    #[test]
    fn test_static_chunked_deals_chunks_round_robin() {
        let ws = WorkShare::new(0, 13, 1, Schedule::Static { chunk_size: 2 }, team(3));
        let mut workers: Vec<_> = (0..3).map(|id| ws.worker(id)).collect();

        let mut claims: Vec<Vec<Span>> = vec![Vec::new(); 3];
        for (id, worker) in workers.iter_mut().enumerate() {
            loop {
                match worker.static_next() {
                    StaticNext::Range(span) | StaticNext::Last(span) => claims[id].push(span),
                    StaticNext::Done => break,
                }
            }
        }

        assert_eq!(claims[0], [span(0, 2), span(6, 8), span(12, 13)]);
        assert_eq!(claims[1], [span(2, 4), span(8, 10)]);
        assert_eq!(claims[2], [span(4, 6), span(10, 12)]);
        assert!(workers[0].took_last());
        assert!(!workers[1].took_last());
        assert!(!workers[2].took_last());
    }

    #[test]
    fn test_static_negative_increment() {
        let ws = WorkShare::new(10, 0, -1, Schedule::Static { chunk_size: 0 }, team(4));
        let mut workers: Vec<_> = (0..4).map(|id| ws.worker(id)).collect();

        assert_eq!(workers[0].static_next(), StaticNext::Range(span(10, 7)));
        assert_eq!(workers[1].static_next(), StaticNext::Range(span(7, 4)));
        assert_eq!(workers[2].static_next(), StaticNext::Range(span(4, 1)));
        assert_eq!(workers[3].static_next(), StaticNext::Last(span(1, 0)));
    }

    #[test]
    fn test_static_single_thread_takes_everything() {
        let ws = WorkShare::new(3, 17, 2, Schedule::Static { chunk_size: 0 }, team(1));
        let mut worker = ws.worker(0);
        assert_eq!(worker.static_next(), StaticNext::Last(span(3, 17)));
        assert_eq!(worker.static_next(), StaticNext::Done);
        assert!(worker.took_last());
    }

    #[cfg(feature = "atomics")]
    #[test]
    fn test_dynamic_fast_path_sequence() {
        let ws = WorkShare::new(0, 100, 1, Schedule::Dynamic { chunk_size: 7 }, team(4));
        assert!(ws.mode);
        let mut worker = ws.worker(0);

        let mut spans = Vec::new();
        while let Some(claim) = worker.dynamic_next() {
            spans.push(claim);
        }
        assert_eq!(spans.len(), 15);
        for (k, claim) in spans.iter().enumerate() {
            let start = 7 * k as i64;
            assert_eq!(*claim, span(start, (start + 7).min(100)));
        }
        assert_eq!(*spans.last().unwrap(), span(98, 100));
    }

    #[cfg(feature = "atomics")]
    #[test]
    fn test_dynamic_cas_path_sequence() {
        // Bounds close to the top of the signed range disable the
        // fetch-and-add fast path; claims must be identical regardless.
        let end = i64::MAX - 10;
        let start = end - 20;
        let ws = WorkShare::new(start, end, 1, Schedule::Dynamic { chunk_size: 7 }, team(4));
        assert!(!ws.mode);
        let mut worker = ws.worker(0);

        let mut spans = Vec::new();
        while let Some(claim) = worker.dynamic_next() {
            spans.push(claim);
        }
        assert_eq!(
            spans,
            [
                span(start, start + 7),
                span(start + 7, start + 14),
                span(start + 14, end),
            ]
        );
    }

    #[cfg(feature = "atomics")]
    #[test]
    fn test_dynamic_negative_increment() {
        let ws = WorkShare::new(100, 0, -7, Schedule::Dynamic { chunk_size: 7 }, team(2));
        let mut worker = ws.worker(0);

        let mut indices = Vec::new();
        while let Some(claim) = worker.dynamic_next() {
            indices.extend(claim.steps(-7));
        }
        let expected: Vec<i64> = (0..15).map(|k| 100 - 7 * k).collect();
        assert_eq!(indices, expected);
    }

    #[test]
    fn test_dynamic_locked_sequence() {
        let ws = WorkShare::new(0, 20, 1, Schedule::Dynamic { chunk_size: 8 }, team(2));
        let mut worker = ws.worker(0);
        assert_eq!(worker.dynamic_next_locked(), Some(span(0, 8)));
        assert_eq!(worker.dynamic_next_locked(), Some(span(8, 16)));
        assert_eq!(worker.dynamic_next_locked(), Some(span(16, 20)));
        assert_eq!(worker.dynamic_next_locked(), None);
    }

    #[cfg(feature = "atomics")]
    #[test]
    fn test_guided_claims_decay_towards_the_floor() {
        let ws = WorkShare::new(0, 1000, 1, Schedule::Guided { chunk_size: 1 }, team(4));
        let mut worker = ws.worker(0);

        let mut lengths = Vec::new();
        while let Some(claim) = worker.guided_next() {
            lengths.push(claim.count(1));
        }

        // First claim is remaining/nthreads, then the sizes decay
        // geometrically.
        assert_eq!(lengths[0], 250);
        assert_eq!(lengths[1], 188);
        for pair in lengths.windows(2) {
            assert!(pair[1] <= pair[0]);
        }
        assert!(lengths.iter().all(|&len| len >= 1));
        assert_eq!(lengths.iter().sum::<i64>(), 1000);
    }

    #[cfg(feature = "atomics")]
    #[test]
    fn test_guided_claims_respect_the_chunk_floor() {
        let ws = WorkShare::new(0, 400, 1, Schedule::Guided { chunk_size: 50 }, team(4));
        let mut worker = ws.worker(0);

        let mut lengths = Vec::new();
        while let Some(claim) = worker.guided_next() {
            lengths.push(claim.count(1));
        }
        // The floor kicks in once remaining/nthreads drops below the chunk
        // size; the very last claim may be smaller than the floor.
        assert_eq!(lengths, [100, 75, 57, 50, 50, 50, 18]);
    }

    #[cfg(feature = "atomics")]
    #[test]
    fn test_guided_negative_increment_covers_the_loop() {
        let ws = WorkShare::new(90, -3, -3, Schedule::Guided { chunk_size: 2 }, team(3));
        let mut worker = ws.worker(0);

        let mut indices = Vec::new();
        while let Some(claim) = worker.guided_next() {
            indices.extend(claim.steps(-3));
        }
        let expected: Vec<i64> = (0..31).map(|k| 90 - 3 * k).collect();
        assert_eq!(indices, expected);
    }

    #[test]
    fn test_guided_locked_sequence() {
        let ws = WorkShare::new(0, 100, 1, Schedule::Guided { chunk_size: 10 }, team(2));
        let mut worker = ws.worker(0);
        assert_eq!(worker.guided_next_locked(), Some(span(0, 50)));
        assert_eq!(worker.guided_next_locked(), Some(span(50, 75)));
        assert_eq!(worker.guided_next_locked(), Some(span(75, 88)));
        assert_eq!(worker.guided_next_locked(), Some(span(88, 98)));
        assert_eq!(worker.guided_next_locked(), Some(span(98, 100)));
        assert_eq!(worker.guided_next_locked(), None);
    }

    #[cfg(feature = "adaptive")]
    #[test]
    fn test_lcg_draws_stay_in_range_and_differ_across_seeds() {
        let mut a = Lcg::new(0);
        let mut b = Lcg::new(1);
        let draws_a: Vec<usize> = (0..50).map(|_| a.pick(8)).collect();
        let draws_b: Vec<usize> = (0..50).map(|_| b.pick(8)).collect();
        assert!(draws_a.iter().all(|&draw| draw < 8));
        assert_ne!(draws_a, draws_b);
    }
}
