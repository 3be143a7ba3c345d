//! Agent wiring
//!
//! Builds every action over one shared command runner, starts discovery and
//! both HTTP servers, and on SIGTERM/SIGINT reverts all live executions
//! before returning.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::action::{ActionDescription, ActionRouter, HostIdentity};
use crate::config::AgentConfig;
use crate::discovery::HostDiscovery;
use crate::exec::{CommandRunner, CommandValidator, HostLauncher, HostRunner};
use crate::fill::{DiskFillAction, MemFillAction};
use crate::host::{CpuFrequencyAction, ShutdownAction, StopProcessAction};
use crate::metrics;
use crate::network::actions::{NetworkAction, NetworkAttack};
use crate::network::AgentPorts;
use crate::server::{self, AppState};
use crate::stress::{StressAction, StressKind};
use crate::sysfs::protect_from_oom_killer;

/// Host facilities the actions are built over
#[derive(Clone)]
pub struct HostContext {
    pub runner: Arc<dyn CommandRunner>,
    pub launcher: HostLauncher,
    pub host: HostIdentity,
    /// Executable providing the `memfill` subcommand
    pub agent_binary: PathBuf,
}

impl HostContext {
    /// Context of the running host
    pub fn detect(config: &AgentConfig) -> Result<Self> {
        let launcher = HostLauncher::detect();
        let runner = HostRunner::new(launcher)
            .with_validator(CommandValidator::with_allowed(config.tools.allowed_tools()));
        let agent_binary =
            std::env::current_exe().context("Failed to locate the agent executable")?;
        Ok(Self {
            runner: Arc::new(runner),
            launcher,
            host: HostIdentity::current(),
            agent_binary,
        })
    }
}

/// Register every action of the catalogue
pub fn build_actions(config: &AgentConfig, ctx: &HostContext) -> ActionRouter {
    let mut router = ActionRouter::new();
    let tools = &config.tools;
    let ports = AgentPorts {
        port: config.http.port,
        health_port: config.http.health_port,
    };

    for kind in StressKind::ALL {
        router.register(
            StressAction::new(kind, ctx.runner.clone(), tools.proc_root.clone()),
            ctx.host.clone(),
        );
    }
    for attack in NetworkAttack::ALL {
        router.register(
            NetworkAction::new(attack, ctx.runner.clone(), ports),
            ctx.host.clone(),
        );
    }

    router.register(
        DiskFillAction::new(ctx.runner.clone(), ctx.launcher),
        ctx.host.clone(),
    );
    router.register(
        MemFillAction::new(ctx.runner.clone(), ctx.agent_binary.clone()),
        ctx.host.clone(),
    );
    router.register(
        CpuFrequencyAction::new(tools.cpu_root.clone()),
        ctx.host.clone(),
    );
    router.register(StopProcessAction::new(), ctx.host.clone());
    router.register(
        ShutdownAction::new(ctx.runner.clone(), ctx.launcher, tools.proc_root.clone()),
        ctx.host.clone(),
    );

    #[cfg(target_os = "linux")]
    router.register(
        crate::host::TimeTravelAction::new(ctx.runner.clone(), Arc::new(crate::host::HostClock)),
        ctx.host.clone(),
    );

    router
}

/// Descriptors of the full catalogue, ordered by id
pub fn describe_all(config: &AgentConfig) -> Result<Vec<ActionDescription>> {
    let ctx = HostContext::detect(config)?;
    Ok(build_actions(config, &ctx).descriptions())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

/// Run the agent until a termination signal arrives
pub async fn run(config: AgentConfig) -> Result<()> {
    protect_from_oom_killer(&config.tools.proc_root);
    metrics::init().context("Failed to initialize metrics")?;

    let ctx = HostContext::detect(&config)?;
    let actions = build_actions(&config, &ctx);
    info!(actions = actions.ids().len(), "Actions registered");

    let token = CancellationToken::new();
    let discovery = Arc::new(HostDiscovery::new(
        config.discovery.clone(),
        ctx.runner.clone(),
        config.tools.cpu_root.clone(),
    ));
    let discovery_task = discovery.clone().spawn_refresh(token.child_token());

    let ready = Arc::new(AtomicBool::new(false));
    let extension = tokio::spawn(server::serve(
        server::extension_router(AppState {
            actions: actions.clone(),
            discovery,
        }),
        config.http.port,
        token.child_token(),
    ));
    let health = tokio::spawn(server::serve(
        server::health_router(ready.clone()),
        config.http.health_port,
        token.child_token(),
    ));
    ready.store(true, Ordering::SeqCst);
    info!(
        port = config.http.port,
        health_port = config.http.health_port,
        "Host fault agent started"
    );

    tokio::select! {
        _ = shutdown_signal() => {}
        _ = token.cancelled() => {}
    }

    ready.store(false, Ordering::SeqCst);
    let stopped = actions.stop_all().await;
    info!(stopped, "Reverted live executions");
    token.cancel();

    for (name, handle) in [("extension", extension), ("health", health)] {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("{} server failed: {:#}", name, e),
            Err(e) => warn!("{} server task ended abnormally: {}", name, e),
        }
    }
    if let Err(e) = discovery_task.await {
        warn!("Discovery task ended abnormally: {}", e);
    }
    Ok(())
}
