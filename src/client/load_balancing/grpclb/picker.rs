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
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tonic::Status;

use super::client_stats::LbClientStats;
use super::messages::ServerEntry;
use crate::client::load_balancing::{CompletedCall, PickResult, Picker};
use crate::client::name_resolution::Address;
use crate::service::Request;

/// The reserved request metadata header carrying the picked backend's
/// load-balance token.
pub const LB_TOKEN_METADATA_KEY: &str = "lb-token";

/// The picker installed while the balancer-provided server list is being
/// served and the child policy is Ready.
///
/// Every pick consumes one position in the server list's pick sequence: drop
/// positions fail the request and account it under their token, all other
/// positions delegate to the child picker.  The drop index is owned by the
/// policy and shared across picker rebuilds for the same server list, so
/// connectivity churn does not shift the drop positions; it is replaced only
/// when the server list itself changes.
pub(crate) struct GrpclbPicker {
    entries: Arc<[ServerEntry]>,
    // Token by backend address; attached to each outgoing request so the
    // backend can attribute it to the balancer decision that produced it.
    tokens: Arc<HashMap<Address, String>>,
    drop_index: Arc<AtomicUsize>,
    child_picker: Arc<dyn Picker>,
    stats: Arc<LbClientStats>,
}

impl GrpclbPicker {
    pub(crate) fn new(
        entries: Arc<[ServerEntry]>,
        tokens: Arc<HashMap<Address, String>>,
        drop_index: Arc<AtomicUsize>,
        child_picker: Arc<dyn Picker>,
        stats: Arc<LbClientStats>,
    ) -> Self {
        debug_assert!(!entries.is_empty());
        Self {
            entries,
            tokens,
            drop_index,
            child_picker,
            stats,
        }
    }
}

impl Picker for GrpclbPicker {
    fn pick(&self, request: &Request) -> PickResult {
        let idx = self.drop_index.fetch_add(1, Ordering::Relaxed) % self.entries.len();
        if let ServerEntry::Drop { token } = &self.entries[idx] {
            self.stats.call_dropped(token);
            return PickResult::Drop(Status::unavailable(
                "request dropped by the remote load balancer's drop policy",
            ));
        }

        match self.child_picker.pick(request) {
            PickResult::Pick(mut pick) => {
                if let Some(token) = self.tokens.get(&pick.subchannel.address()) {
                    if !token.is_empty() {
                        match token.parse() {
                            Ok(value) => {
                                pick.metadata.insert(LB_TOKEN_METADATA_KEY, value);
                            }
                            Err(_) => {
                                tracing::warn!("discarding unencodable lb token {token:?}");
                            }
                        }
                    }
                }
                self.stats.call_started();
                let stats = self.stats.clone();
                let inner = pick.on_complete.take();
                pick.on_complete = Some(Arc::new(move |call: &CompletedCall| {
                    stats.call_finished(call.bytes_sent, call.bytes_received);
                    if let Some(inner) = &inner {
                        inner(call);
                    }
                }));
                PickResult::Pick(pick)
            }
            other => other,
        }
    }
}
