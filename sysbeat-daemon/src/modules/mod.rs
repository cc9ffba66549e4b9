//! Collector assembly.
//!
//! Turns each `[[winlog]]` / `[[dns]]` section into a [`CollectorSpec`]
//! the registry can create or update. The `pipeline` block of a section
//! becomes the collector's [`Dispatcher`]: sink stages in declaration order
//! and a hook table keyed by discriminant id.
//!
//! # Hook names
//!
//! | name    | hook                                   |
//! |---------|----------------------------------------|
//! | `logon` | [`LogonHook`] (audit + access record)  |
//! | `trace` | [`TraceHook`] (tracing summary)        |

pub mod dns;
pub mod winlog;

use std::sync::Arc;

use anyhow::Result;

use sysbeat_collector::CollectorSpec;
use sysbeat_collector::dispatch::{Dispatcher, Hook, HookTable, JsonLinesSink, TraceHook, TracingSink};
use sysbeat_collector::winlog::LogonHook;
use sysbeat_core::audit::AuditSink;
use sysbeat_core::checkpoint::CheckpointStore;
use sysbeat_core::config::{DEFAULT_HOOK_KEY, PipelineSection, SinkSection, SysbeatConfig};
use sysbeat_core::event::NodeIdentity;

/// Shared collaborators used while assembling dispatchers.
#[derive(Clone)]
pub struct AssemblyContext {
    /// Node identity stamped on every exported record.
    pub node: NodeIdentity,
    /// Checkpoint store (also the logon hook's record store).
    pub checkpoints: Arc<dyn CheckpointStore>,
    /// Audit sink for hooks.
    pub audit: Arc<dyn AuditSink>,
}

/// Build a spec for every collector section, winlog first, in file order.
pub fn collector_specs(config: &SysbeatConfig, ctx: &AssemblyContext) -> Result<Vec<CollectorSpec>> {
    let mut specs = Vec::with_capacity(config.winlog.len() + config.dns.len());
    for section in &config.winlog {
        specs.push(winlog::spec(section, ctx)?);
    }
    for section in &config.dns {
        specs.push(dns::spec(section, ctx)?);
    }
    Ok(specs)
}

/// Build a dispatcher from a pipeline section.
pub fn build_dispatcher(
    source: &str,
    pipeline: &PipelineSection,
    ctx: &AssemblyContext,
) -> Result<Dispatcher> {
    let mut dispatcher = Dispatcher::new(source);

    for sink in &pipeline.sinks {
        dispatcher = match sink {
            SinkSection::Stdout => {
                dispatcher.with_stage(Arc::new(JsonLinesSink::stdout(ctx.node.clone())))
            }
            SinkSection::File { path } => {
                let stage = JsonLinesSink::file(path, ctx.node.clone()).map_err(|e| {
                    anyhow::anyhow!("collector '{}': failed to open sink {}: {}", source, path, e)
                })?;
                dispatcher.with_stage(Arc::new(stage))
            }
            SinkSection::Tracing => dispatcher.with_stage(Arc::new(TracingSink::new())),
        };
    }

    let mut hooks = HookTable::new();
    for (key, name) in &pipeline.hooks {
        let hook = resolve_hook(name, ctx)
            .ok_or_else(|| anyhow::anyhow!("collector '{}': unknown hook '{}'", source, name))?;
        if key == DEFAULT_HOOK_KEY {
            hooks.set_fallback(hook);
        } else {
            let id: u64 = key
                .parse()
                .map_err(|e| anyhow::anyhow!("collector '{}': hook key '{}': {}", source, key, e))?;
            hooks.insert(id, hook);
        }
    }

    tracing::debug!(
        collector = source,
        stages = dispatcher.stage_count(),
        hooks = ?hooks,
        "dispatcher assembled"
    );
    Ok(dispatcher.with_hooks(hooks))
}

fn resolve_hook(name: &str, ctx: &AssemblyContext) -> Option<Arc<dyn Hook>> {
    match name {
        "logon" => Some(Arc::new(LogonHook::new(
            Arc::clone(&ctx.checkpoints),
            Arc::clone(&ctx.audit),
        ))),
        "trace" => Some(Arc::new(TraceHook)),
        _ => None,
    }
}
