//! Zone configuration: the resolver settings selected per request by the
//! leading socketmap token (spec.md §3 `ZoneConfig`).
//!
//! Grounded in `examples/original_source/postfix_mta_sts_resolver/responder.py`,
//! which builds one `ZoneEntry(strict, resolver)` per configured zone plus
//! a default, at construction time.

use std::collections::HashMap;

use crate::config::{Config, ZoneSpec};
use crate::error::ExitError;
use crate::resolver::STSResolver;

/// A zone's immutable, constructed-at-startup resolver settings.
pub struct ZoneEntry {
    pub strict_testing: bool,
    pub require_sni: bool,
    pub resolver: STSResolver,
}

impl ZoneEntry {
    fn build(spec: &ZoneSpec) -> Result<Self, ExitError> {
        let resolver = STSResolver::new(spec.timeout)
            .map_err(|err| ExitError::Config(format!("could not build resolver: {err}")))?;
        Ok(Self {
            strict_testing: spec.strict_testing,
            require_sni: spec.require_sni,
            resolver,
        })
    }
}

/// Every configured zone plus the default, ready for per-request lookup
/// by leading token.
pub struct Zones {
    default: ZoneEntry,
    named: HashMap<String, ZoneEntry>,
}

impl Zones {
    pub fn from_config(config: &Config) -> Result<Self, ExitError> {
        let default = ZoneEntry::build(&config.default_zone)?;
        let mut named = HashMap::with_capacity(config.zones.len());
        for (name, spec) in &config.zones {
            named.insert(name.clone(), ZoneEntry::build(spec)?);
        }
        Ok(Self { default, named })
    }

    /// Exact zone-name match, else the default zone.
    pub fn select(&self, name: &str) -> &ZoneEntry {
        self.named.get(name).unwrap_or(&self.default)
    }
}
