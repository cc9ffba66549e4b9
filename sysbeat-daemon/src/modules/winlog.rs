//! Windows event log collector assembly.
//!
//! Converts a `[[winlog]]` section into a `WinlogConfig` and pairs it with
//! the dispatcher built from the section's pipeline block.

use std::sync::Arc;

use anyhow::Result;

use sysbeat_collector::{CollectorSpec, WinlogConfig};
use sysbeat_core::config::WinlogSection;

use super::{AssemblyContext, build_dispatcher};

/// Build the collector spec for one `[[winlog]]` section.
pub fn spec(section: &WinlogSection, ctx: &AssemblyContext) -> Result<CollectorSpec> {
    let config = WinlogConfig::from_core(section);
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("winlog collector '{}': {}", section.name, e))?;

    let dispatcher = build_dispatcher(&section.name, &section.pipeline, ctx)?;
    Ok(CollectorSpec::Winlog {
        config,
        dispatcher: Arc::new(dispatcher),
    })
}
