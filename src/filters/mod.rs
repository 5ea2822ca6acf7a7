//! Filters shipped with the server binary.
//!
//! The chain is assembled from an ordered list of names
//! (`EXTPROC_FILTERS`). Built-in names map to fixed filters; any other name
//! must match a `headerRules` definition from the filter configuration.

use std::sync::Arc;

use crate::service::ExtProcessorBuilder;

pub mod access_log;
pub mod header_rules;
pub mod same_site;

use self::access_log::AccessLog;
use self::header_rules::{HeaderRules, HeaderRulesDefinition};
use self::same_site::SameSiteLax;

/// Filter configuration loaded from the JSON file named by
/// `EXTPROC_FILTER_CONFIG`.
#[derive(Clone, Debug, Default, serde::Deserialize)]
pub struct FilterConfig {
    /// Declarative header rule filters, each addressable by its `name`.
    #[serde(default, alias = "headerRules")]
    pub header_rules: Vec<HeaderRulesDefinition>,
}

/// Adds the named filters to `builder`, in order. Unknown names are
/// skipped with a warning.
pub fn register(
    mut builder: ExtProcessorBuilder,
    order: &[String],
    cfg: &FilterConfig,
) -> ExtProcessorBuilder {
    for name in order {
        builder = match name.as_str() {
            "access_log" => builder.stream_filter(Arc::new(AccessLog)),
            "same_site_lax" => builder.filter(Arc::new(SameSiteLax)),
            name => match cfg.header_rules.iter().find(|d| d.name == name) {
                Some(def) => builder.filter(Arc::new(HeaderRules::new(def.clone()))),
                None => {
                    tracing::warn!(filter = %name, "unknown filter name, skipping");
                    builder
                }
            },
        };
    }
    builder
}

/// Parses the ordered filter list from `EXTPROC_FILTERS`. Names are
/// trimmed and lower-cased; unset means just `access_log`.
pub fn parse_filter_order() -> Vec<String> {
    match std::env::var("EXTPROC_FILTERS") {
        Ok(var) => parse_filter_list(&var),
        Err(_) => vec!["access_log".into()],
    }
}

pub(crate) fn parse_filter_list(var: &str) -> Vec<String> {
    var.split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}
