//! DNS packet collector assembly.
//!
//! The bind spec and region CIDRs are parsed here, so a malformed section
//! fails before any socket is opened.

use std::sync::Arc;

use anyhow::Result;

use sysbeat_collector::{CollectorSpec, DnsConfig};
use sysbeat_core::config::DnsSection;

use super::{AssemblyContext, build_dispatcher};

/// Build the collector spec for one `[[dns]]` section.
pub fn spec(section: &DnsSection, ctx: &AssemblyContext) -> Result<CollectorSpec> {
    let config = DnsConfig::from_core(section)
        .map_err(|e| anyhow::anyhow!("dns collector '{}': {}", section.name, e))?;

    let dispatcher = build_dispatcher(&section.name, &section.pipeline, ctx)?;
    Ok(CollectorSpec::Dns {
        config,
        dispatcher: Arc::new(dispatcher),
    })
}
