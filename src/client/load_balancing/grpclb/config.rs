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
use std::error::Error;
use std::sync::Arc;

use serde::Deserialize;

use crate::client::load_balancing::{round_robin, LbPolicyBuilder, GLOBAL_LB_REGISTRY};
use crate::client::service_config::ParsedJsonLbConfig;

// The JSON shape of the grpclb policy's service config entry:
// {"childPolicy": [{"round_robin": {}}, ...]}
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawConfig {
    child_policy: Option<Vec<HashMap<String, serde_json::Value>>>,
}

/// The parsed grpclb configuration: the child policy that performs the
/// per-request pick over balancer-provided backends.
#[derive(Clone)]
pub(crate) struct GrpclbConfig {
    pub(crate) child_builder: Arc<dyn LbPolicyBuilder>,
}

impl GrpclbConfig {
    /// Returns the default configuration: a round_robin child.
    pub(crate) fn default_config() -> Self {
        round_robin::reg();
        GrpclbConfig {
            child_builder: GLOBAL_LB_REGISTRY
                .get_policy(round_robin::POLICY_NAME)
                .unwrap(),
        }
    }

    /// Parses a grpclb JSON config.  `childPolicy` entries are tried in
    /// order; the first naming a registered policy wins.  An absent or empty
    /// `childPolicy` selects round_robin.
    pub(crate) fn parse(
        config: &ParsedJsonLbConfig,
    ) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let raw: RawConfig = config
            .convert_to()
            .map_err(|err| format!("failed to parse grpclb config: {err}"))?;

        let Some(entries) = raw.child_policy else {
            return Ok(Self::default_config());
        };
        if entries.is_empty() {
            return Ok(Self::default_config());
        }

        for entry in &entries {
            if entry.len() != 1 {
                return Err(format!(
                    "each childPolicy entry must contain exactly one policy, found {}",
                    entry.len()
                )
                .into());
            }
            let name = entry.keys().next().unwrap();
            if let Some(builder) = GLOBAL_LB_REGISTRY.get_policy(name) {
                return Ok(GrpclbConfig {
                    child_builder: builder,
                });
            }
        }
        Err("no supported policies found in childPolicy".into())
    }
}
