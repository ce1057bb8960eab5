// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Adaptive schedule: per-worker deques with random-victim work stealing.
//!
//! Deques hold zero-based iteration indices in `[0, n)`; claims are mapped
//! back to loop space at the API boundary, so the protocol is identical for
//! every increment. The owner of a deque pops at `begin` without taking the
//! lock on the fast path; thieves shrink `end` under the lock. Both sides
//! publish their speculative update, fence, then read the opposing bound:
//! at most one of them can observe a stale value, and the loser detects the
//! collision via `begin > end` and rolls back.

use crate::macros::{log_debug, log_trace};
use crate::util::{ceil_div, Span};
use crate::worker::Worker;
use crossbeam_utils::CachePadded;
use std::sync::atomic::{fence, AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;

/// One worker's deque of remaining iterations.
pub(crate) struct AdaptiveChunk {
    /// First remaining index; only ever advanced, only by the owner.
    begin: AtomicI64,
    /// Past-the-last remaining index; only ever lowered, only under `lock`.
    end: AtomicI64,
    /// Serializes resizing between the owner's slow path and thieves.
    lock: Mutex<()>,
    /// Iterations claimed by the owner since the last reconciliation with
    /// the shared counter.
    nb_exec: AtomicI64,
    /// Set on the owner's first access, once the initial share is in place.
    is_init: AtomicBool,
}

impl AdaptiveChunk {
    fn empty() -> Self {
        Self {
            begin: AtomicI64::new(0),
            end: AtomicI64::new(0),
            lock: Mutex::new(()),
            nb_exec: AtomicI64::new(0),
            is_init: AtomicBool::new(false),
        }
    }

    /// Owner-side pop of up to `chunk_size` indices from the head.
    fn try_local_work(&self, chunk_size: i64) -> Option<Span> {
        let begin = self.begin.load(Ordering::Relaxed) + chunk_size;
        self.begin.store(begin, Ordering::Relaxed);
        fence(Ordering::SeqCst);

        if begin <= self.end.load(Ordering::Relaxed) {
            // Uncontested claim.
            self.nb_exec.fetch_add(chunk_size, Ordering::Relaxed);
            return Some(Span::new(begin - chunk_size, begin));
        }

        // Collided with a thief, or only scraps remain: roll back, then
        // re-clamp under the lock.
        let begin = begin - chunk_size;
        self.begin.store(begin, Ordering::Relaxed);
        let guard = self.lock.lock().unwrap();
        let mut size = self.end.load(Ordering::Relaxed) - begin;
        if size <= 0 {
            return None;
        }
        size = size.min(chunk_size);
        self.begin.store(begin + size, Ordering::Relaxed);
        drop(guard);

        self.nb_exec.fetch_add(size, Ordering::Relaxed);
        Some(Span::new(begin, begin + size))
    }
}

/// Shared adaptive state: one deque per worker plus the termination counter.
pub(crate) struct AdaptiveShare {
    chunks: Box<[CachePadded<AdaptiveChunk>]>,
    /// Iterations not yet claimed by any worker, across the whole team.
    iterations_left: CachePadded<AtomicI64>,
    /// Total trip count, fixed at init.
    total: i64,
}

impl AdaptiveShare {
    pub(crate) fn new(total: i64, num_threads: usize) -> Self {
        Self {
            chunks: (0..num_threads)
                .map(|_| CachePadded::new(AdaptiveChunk::empty()))
                .collect(),
            iterations_left: CachePadded::new(AtomicI64::new(total)),
            total,
        }
    }

    fn is_finished(&self) -> bool {
        self.iterations_left.load(Ordering::SeqCst) == 0
    }

    /// First touch by the owner: carves this worker's part of the equal
    /// initial split, mirroring the one-trip static partition.
    fn init_worker(&self, team_id: usize) {
        let chunk = &self.chunks[team_id];
        let nthreads = self.chunks.len() as i64;
        let q = ceil_div(self.total, nthreads);
        let begin = (q * team_id as i64).min(self.total);
        let end = (begin + q).min(self.total);

        // Thieves probing this deque pre-screen on `end > begin`, so the
        // bounds must only become visible together.
        let guard = chunk.lock.lock().unwrap();
        chunk.begin.store(begin, Ordering::Relaxed);
        chunk.end.store(end, Ordering::Relaxed);
        drop(guard);
        chunk.is_init.store(true, Ordering::Release);
    }
}

impl Worker<'_> {
    /// Adaptive schedule: drains the local deque, then steals from peers.
    ///
    /// Returns [`None`] only once every iteration of the loop has been
    /// claimed by some team member.
    ///
    /// # Panics
    ///
    /// Panics if the work share was not installed with
    /// [`Schedule::Adaptive`](crate::Schedule::Adaptive).
    pub fn adaptive_next(&mut self) -> Option<Span> {
        let ws = self.ws;
        let share = ws
            .adaptive
            .as_ref()
            .expect("the work share was not installed with the adaptive schedule");
        let local = &share.chunks[self.team_id];

        if !local.is_init.load(Ordering::Acquire) {
            share.init_worker(self.team_id);
        }

        let chunk_size = ws.schedule.chunk_size();

        if let Some(claim) = local.try_local_work(chunk_size) {
            log_trace!("[thread {}] local claim {claim:?}", self.team_id);
            return Some(ws.index_span_to_loop(claim));
        }

        // Reconcile this worker's claim count; once the shared counter hits
        // zero the whole loop has been claimed and everyone can stop.
        let executed = local.nb_exec.swap(0, Ordering::Relaxed);
        let left = share.iterations_left.fetch_sub(executed, Ordering::SeqCst) - executed;
        debug_assert!(left >= 0);
        if left == 0 {
            return None;
        }

        while !share.is_finished() {
            if let Some(claim) = self.steal_once(share, chunk_size) {
                return Some(ws.index_span_to_loop(claim));
            }
        }
        None
    }

    /// One steal attempt: picks a victim, then tries to take half of its
    /// remaining deque.
    fn steal_once(&mut self, share: &AdaptiveShare, chunk_size: i64) -> Option<Span> {
        #[cfg(feature = "numa")]
        {
            let ws = self.ws;
            if let (Some((node, my_index)), Some(topology)) =
                (self.numa_place, ws.numa.as_deref())
            {
                let node_threads = topology.node_threads(node);
                let attempts = 1 + node_threads.len() / 2;
                for _ in 0..attempts {
                    let Some(victim_id) = self.pick_numa_victim(node_threads, my_index) else {
                        continue;
                    };
                    let victim = &share.chunks[victim_id];
                    if victim.end.load(Ordering::Relaxed) > victim.begin.load(Ordering::Relaxed) {
                        return self.steal_from(share, victim_id, chunk_size);
                    }
                }
                if share.is_finished() {
                    return None;
                }
                #[cfg(feature = "pws-strict")]
                return None;
                #[cfg(not(feature = "pws-strict"))]
                {
                    let victim_id = self.pick_global_victim()?;
                    return self.steal_from(share, victim_id, chunk_size);
                }
            }
        }

        let victim_id = self.pick_global_victim()?;
        self.steal_from(share, victim_id, chunk_size)
    }

    /// Draws a uniform victim from the whole team, excluding this worker.
    fn pick_global_victim(&mut self) -> Option<usize> {
        let nthreads = self.ws.num_threads;
        if nthreads == 1 {
            return None;
        }
        loop {
            let victim_id = self.rng.pick(nthreads);
            if victim_id != self.team_id {
                return Some(victim_id);
            }
        }
    }

    /// Draws a uniform victim among the threads of this worker's NUMA node,
    /// excluding this worker.
    #[cfg(feature = "numa")]
    fn pick_numa_victim(&mut self, node_threads: &[usize], my_index: usize) -> Option<usize> {
        if node_threads.len() == 1 {
            return None;
        }
        loop {
            let index = self.rng.pick(node_threads.len());
            if index != my_index {
                return Some(node_threads[index]);
            }
        }
    }

    /// Takes half of the victim's remaining deque. Up to `chunk_size`
    /// iterations are returned for immediate execution; the rest is parked
    /// in this worker's own deque for future local claims.
    fn steal_from(&self, share: &AdaptiveShare, victim_id: usize, chunk_size: i64) -> Option<Span> {
        debug_assert_ne!(victim_id, self.team_id);
        let victim = &share.chunks[victim_id];

        // Cheap unlocked pre-screen: nothing left to take.
        if victim.end.load(Ordering::Relaxed) <= victim.begin.load(Ordering::Relaxed) {
            return None;
        }

        let guard = victim.lock.lock().unwrap();
        let size =
            (victim.end.load(Ordering::Relaxed) - victim.begin.load(Ordering::Relaxed)) / 2;
        if size <= 0 {
            return None;
        }

        let end = victim.end.load(Ordering::Relaxed) - size;
        victim.end.store(end, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        if end < victim.begin.load(Ordering::Relaxed) {
            // The owner advanced past the shrunken end first: undo and give
            // up on this victim.
            victim.end.store(end + size, Ordering::Relaxed);
            return None;
        }
        drop(guard);

        let keep = size.min(chunk_size);
        let claim = Span::new(end, end + keep);

        let local = &share.chunks[self.team_id];
        let guard = local.lock.lock().unwrap();
        local.begin.store(end + keep, Ordering::Relaxed);
        local.end.store(end + size, Ordering::Relaxed);
        drop(guard);

        local.nb_exec.fetch_add(keep, Ordering::Relaxed);
        log_debug!(
            "[thread {}] stole [{}, {}) from thread {victim_id}",
            self.team_id,
            end,
            end + size
        );
        Some(claim)
    }
}
