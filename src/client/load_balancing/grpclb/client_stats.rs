/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to
 * deal in the Software without restriction, including without limitation the
 * rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
 * sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
 * IN THE SOFTWARE.
 *
 */

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use super::messages::{ClientStats, ClientStatsPerToken};

/// Thread-safe accumulator for the per-interval call counters reported to the
/// remote balancer.
///
/// Every RPC touches at least two counters, so the scalars are plain atomics;
/// only the per-token drop map takes a short critical section.  `drain`
/// resets each counter as it reads it; concurrent updates land in either the
/// drained report or the next one, never both and never neither.
#[derive(Default)]
pub(crate) struct LbClientStats {
    num_calls_started: AtomicI64,
    num_calls_finished: AtomicI64,
    num_calls_finished_with_client_failed_to_send: AtomicI64,
    num_calls_finished_known_received: AtomicI64,
    num_calls_dropped: Mutex<HashMap<String, i64>>,
}

impl LbClientStats {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Records the dispatch of one RPC attempt.
    pub(crate) fn call_started(&self) {
        self.num_calls_started.fetch_add(1, Ordering::Relaxed);
    }

    /// Records the completion of one RPC attempt previously recorded by
    /// `call_started`.
    pub(crate) fn call_finished(&self, bytes_sent: bool, bytes_received: bool) {
        self.num_calls_finished.fetch_add(1, Ordering::Relaxed);
        if !bytes_sent {
            self.num_calls_finished_with_client_failed_to_send
                .fetch_add(1, Ordering::Relaxed);
        } else if bytes_received {
            self.num_calls_finished_known_received
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records one RPC dropped at pick time under the given token.  A dropped
    /// call is both started and finished from the balancer's perspective.
    pub(crate) fn call_dropped(&self, token: &str) {
        self.num_calls_started.fetch_add(1, Ordering::Relaxed);
        self.num_calls_finished.fetch_add(1, Ordering::Relaxed);
        let mut dropped = self.num_calls_dropped.lock().unwrap();
        *dropped.entry(token.to_string()).or_insert(0) += 1;
    }

    /// Produces one report and zeroes all counters.
    pub(crate) fn drain(&self) -> ClientStats {
        let dropped = std::mem::take(&mut *self.num_calls_dropped.lock().unwrap());
        let mut calls_finished_with_drop: Vec<ClientStatsPerToken> = dropped
            .into_iter()
            .map(|(load_balance_token, num_calls)| ClientStatsPerToken {
                load_balance_token,
                num_calls,
            })
            .collect();
        calls_finished_with_drop.sort_by(|a, b| a.load_balance_token.cmp(&b.load_balance_token));

        ClientStats {
            num_calls_started: self.num_calls_started.swap(0, Ordering::Relaxed),
            num_calls_finished: self.num_calls_finished.swap(0, Ordering::Relaxed),
            num_calls_finished_with_client_failed_to_send: self
                .num_calls_finished_with_client_failed_to_send
                .swap(0, Ordering::Relaxed),
            num_calls_finished_known_received: self
                .num_calls_finished_known_received
                .swap(0, Ordering::Relaxed),
            calls_finished_with_drop,
        }
    }
}
