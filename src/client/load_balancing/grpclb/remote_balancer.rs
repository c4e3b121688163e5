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

//! The client side of the `BalanceLoad` stream.
//!
//! A background task owns the stream: it connects to the configured balancer
//! addresses, performs the initial handshake, forwards server lists and
//! fallback directives to the policy, and periodically reports drained call
//! statistics.  All effects reach the policy through its event queue followed
//! by a `schedule_work` call, so policy state is only ever touched on the
//! channel's serial context.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tonic::{async_trait, Status};

use super::client_stats::LbClientStats;
use super::messages::{
    InitialLoadBalanceRequest, LoadBalanceRequest, LoadBalanceResponse,
};
use super::BalancerEvent;
use crate::client::backoff::{ExponentialBackoff, DEFAULT_EXPONENTIAL_CONFIG};
use crate::client::load_balancing::WorkScheduler;
use crate::client::name_resolution::{Address, LoadBalancerAddress};
use crate::rt::{BoxedTaskHandle, Runtime};

/// The policy's seam to the RPC fabric it shares with application traffic.
/// Opens `BalanceLoad` streams to a balancer address.
#[async_trait]
pub trait BalancerTransport: Send + Sync {
    /// Opens the bidirectional BalanceLoad stream to the balancer at
    /// `address`.  `server_name` is the balancer's declared name and must be
    /// used as the authority for the transport handshake; it may differ from
    /// the channel's target.
    async fn connect(
        &self,
        address: Address,
        server_name: String,
    ) -> Result<Box<dyn BalancerStream>, Status>;
}

/// One open BalanceLoad stream.  Dropping the stream closes its send side
/// and releases the underlying connection to the balancer.
#[async_trait]
pub trait BalancerStream: Send {
    async fn send(&mut self, request: LoadBalanceRequest) -> Result<(), Status>;

    /// Receives the next message from the balancer.  Ok(None) signals a
    /// server-initiated end of stream.
    async fn recv(&mut self) -> Result<Option<LoadBalanceResponse>, Status>;
}

/// Handle to the balancer client task.  Dropping the handle aborts the task,
/// which closes the stream and cancels the pending report timer.
pub(crate) struct BalancerClient {
    addresses: watch::Sender<Vec<Address>>,
    task: BoxedTaskHandle,
}

impl BalancerClient {
    pub(crate) fn new(
        transport: Arc<dyn BalancerTransport>,
        target: String,
        addresses: Vec<Address>,
        events: mpsc::UnboundedSender<BalancerEvent>,
        work_scheduler: Arc<dyn WorkScheduler>,
        runtime: Arc<dyn Runtime>,
        stats: Arc<LbClientStats>,
    ) -> Self {
        let (addr_tx, addr_rx) = watch::channel(addresses);
        let worker = Worker {
            transport,
            target,
            addr_rx,
            events,
            work_scheduler,
            runtime: runtime.clone(),
            stats,
        };
        let task = runtime.spawn(Box::pin(worker.run()));
        Self {
            addresses: addr_tx,
            task,
        }
    }

    /// Replaces the balancer address list.  If the address currently in use
    /// is still present the stream is kept; otherwise the task reconnects
    /// starting from the head of the new list.
    pub(crate) fn update_addresses(&self, addresses: Vec<Address>) {
        self.addresses.send_if_modified(|current| {
            if *current == addresses {
                return false;
            }
            *current = addresses;
            true
        });
    }
}

impl Drop for BalancerClient {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// What ended a connected stream.
enum StreamEnd {
    // The stream failed or was closed by the balancer; retry the same
    // address.  `established` is set if the handshake had completed, in
    // which case the retry skips backoff so a dead balancer is replaced by
    // the next configured one promptly.
    Closed { established: bool },
    // The current address is no longer configured; reconnect from the head
    // of the new list without backoff.
    AddressesChanged,
    // The policy dropped its handle; exit the task.
    Stopped,
}

struct Worker {
    transport: Arc<dyn BalancerTransport>,
    target: String,
    addr_rx: watch::Receiver<Vec<Address>>,
    events: mpsc::UnboundedSender<BalancerEvent>,
    work_scheduler: Arc<dyn WorkScheduler>,
    runtime: Arc<dyn Runtime>,
    stats: Arc<LbClientStats>,
}

impl Worker {
    async fn run(self) {
        let Worker {
            transport,
            target,
            mut addr_rx,
            events,
            work_scheduler,
            runtime,
            stats,
        } = self;

        let push_event = |event: BalancerEvent| {
            if events.send(event).is_ok() {
                work_scheduler.schedule_work();
            }
        };

        let mut backoff = ExponentialBackoff::new(DEFAULT_EXPONENTIAL_CONFIG)
            .expect("default backoff config is valid");
        // Index into the current address list of the balancer being tried.
        let mut addr_idx = 0;

        loop {
            let addresses = addr_rx.borrow_and_update().clone();
            if addresses.is_empty() {
                if addr_rx.changed().await.is_err() {
                    return;
                }
                addr_idx = 0;
                continue;
            }
            if addr_idx >= addresses.len() {
                // Every configured balancer refused the connection; cycle
                // again after backoff.
                addr_idx = 0;
                let delay = backoff.backoff_duration();
                tokio::select! {
                    _ = runtime.sleep(delay) => {}
                    changed = addr_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
                continue;
            }

            let address = addresses[addr_idx].clone();
            let server_name = address
                .attributes
                .get::<LoadBalancerAddress>()
                .map(|a| a.server_name.clone())
                .unwrap_or_default();

            let stream = tokio::select! {
                result = transport.connect(address.clone(), server_name) => result,
                changed = addr_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    addr_idx = 0;
                    continue;
                }
            };
            let mut stream = match stream {
                Ok(stream) => stream,
                Err(status) => {
                    tracing::warn!("failed to connect to balancer {address}: {status}");
                    push_event(BalancerEvent::StreamDisconnected);
                    addr_idx += 1;
                    continue;
                }
            };

            let end = run_stream(
                stream.as_mut(),
                &address,
                &target,
                &mut addr_rx,
                &push_event,
                &runtime,
                &stats,
                &mut backoff,
            )
            .await;
            drop(stream);

            match end {
                StreamEnd::Closed { established } => {
                    push_event(BalancerEvent::StreamDisconnected);
                    if !established {
                        let delay = backoff.backoff_duration();
                        tokio::select! {
                            _ = runtime.sleep(delay) => {}
                            changed = addr_rx.changed() => {
                                if changed.is_err() {
                                    return;
                                }
                                addr_idx = 0;
                            }
                        }
                    }
                    // Retry the same address unless the list changed.
                }
                StreamEnd::AddressesChanged => {
                    addr_idx = 0;
                }
                StreamEnd::Stopped => return,
            }
        }
    }
}

// Performs the handshake on a freshly opened stream and then services it
// until it ends or becomes obsolete.
#[allow(clippy::too_many_arguments)]
async fn run_stream(
    stream: &mut dyn BalancerStream,
    current_address: &Address,
    target: &str,
    addr_rx: &mut watch::Receiver<Vec<Address>>,
    push_event: &impl Fn(BalancerEvent),
    runtime: &Arc<dyn Runtime>,
    stats: &Arc<LbClientStats>,
    backoff: &mut ExponentialBackoff,
) -> StreamEnd {
    let initial = LoadBalanceRequest::Initial(InitialLoadBalanceRequest {
        name: target.to_string(),
    });
    if let Err(status) = stream.send(initial).await {
        tracing::warn!("failed to send initial request to balancer: {status}");
        return StreamEnd::Closed { established: false };
    }

    let report_interval = match stream.recv().await {
        Ok(Some(LoadBalanceResponse::Initial(initial))) => initial.client_stats_report_interval,
        Ok(Some(_)) => {
            tracing::warn!("balancer sent a non-initial message first; closing the stream");
            return StreamEnd::Closed { established: false };
        }
        Ok(None) => return StreamEnd::Closed { established: false },
        Err(status) => {
            tracing::warn!("balancer stream failed during handshake: {status}");
            return StreamEnd::Closed { established: false };
        }
    };
    backoff.reset();
    tracing::debug!(
        "balancer stream to {current_address} established, report interval {report_interval:?}"
    );

    // One liveness report is always sent after stream (re)start; subsequent
    // all-zero reports are suppressed.
    let mut first_report = true;

    enum Action {
        Response(Result<Option<LoadBalanceResponse>, Status>),
        ReportTick,
        AddressesChanged(Result<(), watch::error::RecvError>),
    }

    loop {
        let action = {
            let report_tick = async {
                if report_interval.is_zero() {
                    // A zero interval disables stats reporting.
                    std::future::pending::<()>().await
                } else {
                    runtime.sleep(report_interval).await
                }
            };
            tokio::select! {
                response = stream.recv() => Action::Response(response),
                _ = report_tick => Action::ReportTick,
                changed = addr_rx.changed() => Action::AddressesChanged(changed),
            }
        };

        match action {
            Action::Response(Ok(Some(LoadBalanceResponse::ServerList(list)))) => {
                match list.parse_entries() {
                    Ok(entries) => push_event(BalancerEvent::ServerList(entries)),
                    Err(err) => {
                        tracing::warn!("rejecting invalid server list from balancer: {err}");
                    }
                }
            }
            Action::Response(Ok(Some(LoadBalanceResponse::Fallback))) => {
                push_event(BalancerEvent::Fallback);
            }
            Action::Response(Ok(Some(LoadBalanceResponse::Initial(_)))) => {
                tracing::warn!("ignoring duplicate initial response from balancer");
            }
            Action::Response(Ok(None)) => return StreamEnd::Closed { established: true },
            Action::Response(Err(status)) => {
                tracing::warn!("balancer stream to {current_address} failed: {status}");
                return StreamEnd::Closed { established: true };
            }
            Action::ReportTick => {
                let report = stats.drain();
                if first_report || !report.is_zero() {
                    if let Err(status) = stream.send(LoadBalanceRequest::Stats(report)).await {
                        tracing::warn!("failed to report client stats: {status}");
                        return StreamEnd::Closed { established: true };
                    }
                }
                first_report = false;
            }
            Action::AddressesChanged(Err(_)) => return StreamEnd::Stopped,
            Action::AddressesChanged(Ok(())) => {
                if !addr_rx.borrow_and_update().contains(current_address) {
                    return StreamEnd::AddressesChanged;
                }
            }
        }
    }
}
