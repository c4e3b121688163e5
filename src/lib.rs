/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 *
 */

//! A client-side look-aside load balancing (grpclb) policy for gRPC.
//!
//! The policy obtains the set of usable backends from a remote load balancer
//! over a bidirectional `BalanceLoad` stream, steers each RPC to one of them,
//! reports aggregated call statistics back to the balancer, and falls back to
//! a resolver-supplied backend list when the balancer is unreachable or
//! explicitly requests it.
//!
//! This crate is in progress and not recommended for any production use.  All
//! APIs are unstable.  Proceed at your own risk.

#![allow(dead_code)]

pub mod attributes;
pub mod client;
pub mod rt;
pub mod service;
