// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

#![deny(clippy::all, clippy::pedantic)]
#![deny(rustdoc::all)]
#![allow(rustdoc::missing_crate_level_docs)]

mod collab;
mod script;

use crate::script::Script;
use args::{CmdArgs, Parser};
use color_eyre::eyre::{Result, WrapErr, eyre};
use engine::{Engine, EngineConfig, Snapshot};
use serde::Serialize;
use std::sync::Arc;
use store::{Datastore, MemDatastore};
use tracectl::{custom_target, get_trace_ctl, trace_target};
use tracing::{info, level_filters::LevelFilter};

trace_target!("vpnsync", LevelFilter::INFO, &[]);
fn init_logging() {
    let tctl = get_trace_ctl();
    tctl.set_default_level(LevelFilter::INFO);
    custom_target!("serde_yaml_ng", LevelFilter::ERROR, &[]);
}

/// What is printed once the script is replayed
#[derive(Serialize)]
struct Output {
    replay: script::ReplayReport,
    calls: collab::CallCounters,
    datastore: Snapshot,
}

async fn run(config: EngineConfig, script: Script) -> Result<Output> {
    let (collab, counters) = collab::dry_run(script.dpns.clone(), script.gateway_mac);
    let store: Arc<dyn Datastore> = Arc::new(MemDatastore::new());
    let engine = Engine::new(store, collab, config)
        .await
        .wrap_err("Failed to start engine")?;
    let replay = script.replay(&engine).await?;
    let datastore = engine.snapshot().await.wrap_err("Failed to read datastore")?;
    let calls = counters.lock().clone();
    Ok(Output {
        replay,
        calls,
        datastore,
    })
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let args = CmdArgs::parse();
    if let Some(tracing) = args.tracing() {
        get_trace_ctl()
            .setup_from_string(tracing)
            .wrap_err("Invalid tracing configuration")?;
    }
    if args.show_tracing_tags() {
        get_trace_ctl().dump_targets_by_tag();
        return Ok(());
    }
    if args.show_tracing_targets() {
        get_trace_ctl().dump();
        return Ok(());
    }

    init_logging();
    let config = args.engine_config().map_err(|e| eyre!(e))?;
    let script = match args.script() {
        Some(path) => Script::load(path)?,
        None => Script::from_stdin()?,
    };
    info!("Replaying {} steps", script.steps.len());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_time()
        .thread_name("vpnsync")
        .build()
        .wrap_err("Tokio runtime creation failed")?;
    let output = runtime.block_on(run(config, script))?;

    let yaml = serde_yaml_ng::to_string(&output).wrap_err("Failed to serialize output")?;
    print!("{yaml}");
    Ok(())
}
