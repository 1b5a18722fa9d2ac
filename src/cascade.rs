//! Transport cascade planning.
//!
//! A cycle tries each usable transport kind exactly once, in preference
//! order. A kind with no configured endpoint or no runtime support is
//! skipped outright and never counts as a failure.

use crate::transport::{CapabilityProbe, TransportEndpoints, TransportKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CascadeStep {
    pub kind: TransportKind,
    pub endpoint: String,
}

#[derive(Debug, Clone, Default)]
pub struct CascadePlan {
    steps: Vec<CascadeStep>,
}

impl CascadePlan {
    pub fn steps(&self) -> &[CascadeStep] {
        &self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }
}

pub fn plan(endpoints: &TransportEndpoints, probe: &dyn CapabilityProbe) -> CascadePlan {
    let mut steps = Vec::new();
    for kind in TransportKind::PREFERENCE_ORDER {
        let Some(endpoint) = endpoints.get(kind) else {
            tracing::debug!(kind = kind.as_str(), "transport skipped: no endpoint");
            continue;
        };
        if !probe.supports(kind) {
            tracing::debug!(kind = kind.as_str(), "transport skipped: unsupported");
            continue;
        }
        steps.push(CascadeStep {
            kind,
            endpoint: endpoint.to_string(),
        });
    }
    CascadePlan { steps }
}
