//! Declarative header rules.
//!
//! Each definition describes, per header phase, either a fixed immediate
//! response or a set of removals, overwrites and appends. Maps are ordered
//! so the emitted mutation is deterministic.

use std::collections::BTreeMap;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::filter::{
    Filter, FilterResult, HeaderMutationWriter, ImmediateResponseBuilder, RequestContext,
};

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderRulesDefinition {
    /// Unique name used in `EXTPROC_FILTERS`.
    pub name: String,
    #[serde(default)]
    pub request_headers: PhaseRules,
    #[serde(default)]
    pub response_headers: PhaseRules,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseRules {
    #[serde(default)]
    pub header_mutation: MutationRules,
    /// When present, the phase is answered with this response and the
    /// mutation rules are ignored.
    #[serde(default)]
    pub immediate_response: Option<ImmediateRule>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct MutationRules {
    #[serde(default)]
    pub remove: Vec<String>,
    #[serde(default)]
    pub set: BTreeMap<String, String>,
    #[serde(default)]
    pub append: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ImmediateRule {
    pub status: u16,
    #[serde(default)]
    pub body: String,
}

pub struct HeaderRules {
    def: HeaderRulesDefinition,
}

impl HeaderRules {
    pub fn new(def: HeaderRulesDefinition) -> Self {
        Self { def }
    }

    fn apply(rules: &PhaseRules, writer: &mut HeaderMutationWriter) -> FilterResult {
        if let Some(resp) = &rules.immediate_response {
            return Ok(Some(
                ImmediateResponseBuilder::new()
                    .http_status(resp.status)
                    .body(resp.body.as_bytes())
                    .build(),
            ));
        }
        let m = &rules.header_mutation;
        writer.remove_headers(&m.remove);
        for (k, v) in &m.set {
            writer.set_header(k, v);
        }
        for (k, v) in &m.append {
            writer.append_header(k, v);
        }
        Ok(None)
    }
}

#[async_trait::async_trait]
impl Filter for HeaderRules {
    fn name(&self) -> &str {
        &self.def.name
    }

    async fn on_request_headers(
        &self,
        _cancel: &CancellationToken,
        writer: &mut HeaderMutationWriter,
        _req: &mut RequestContext,
    ) -> FilterResult {
        Self::apply(&self.def.request_headers, writer)
    }

    async fn on_response_headers(
        &self,
        _cancel: &CancellationToken,
        writer: &mut HeaderMutationWriter,
        _req: &mut RequestContext,
    ) -> FilterResult {
        Self::apply(&self.def.response_headers, writer)
    }
}
