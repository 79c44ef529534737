use anyhow::Context;
use cartwatch::adapters::{Browser, ConsoleOperator, HttpBrowser, HumanChannel, WebhookNotifier};
use cartwatch::cli::{output, Cli, Commands, OutputMode};
use cartwatch::config::AppConfig;
use cartwatch::coordination::{install_signal_handlers, GracefulShutdown};
use cartwatch::error::CartwatchError;
use cartwatch::stores::StoreRegistry;
use cartwatch::supervisor::MonitorSupervisor;
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn};

mod main_runtime;

use main_runtime::{init_logging, init_logging_simple};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mode = OutputMode::from_json_flag(cli.json);
    let registry = StoreRegistry::with_builtin();

    match &cli.command {
        Commands::Stores => {
            for kind in registry.kinds() {
                println!("{kind}");
            }
            Ok(())
        }
        Commands::Check => {
            init_logging_simple();
            let config = load_config(&cli)?;
            validate(&config, &registry)?;
            output::print_items(&output::product_rows(&config), mode)
        }
        Commands::Run => {
            let config = load_config(&cli)?;
            init_logging(&config.logging);
            validate(&config, &registry)?;
            run(config, &registry, mode).await
        }
    }
}

/// Config file plus `CARTWATCH__*` environment overrides, not yet validated
fn load_config(cli: &Cli) -> anyhow::Result<AppConfig> {
    AppConfig::load_from(&cli.config).with_context(|| format!("loading {}", cli.config.display()))
}

fn validate(config: &AppConfig, registry: &StoreRegistry) -> Result<(), CartwatchError> {
    config
        .validate(registry)
        .map_err(CartwatchError::InvalidConfig)
}

async fn run(config: AppConfig, registry: &StoreRegistry, mode: OutputMode) -> anyhow::Result<()> {
    let webhook = config.webhook_url().map(WebhookNotifier::new);
    let browser: Arc<dyn Browser> = Arc::new(HttpBrowser::new(
        config.bot.user_agent.clone(),
        config.bot.page_timeout(),
    ));
    let human: Arc<dyn HumanChannel> = Arc::new(ConsoleOperator::stdin(
        config.bot.capture_dir.clone(),
        webhook.clone(),
    ));

    let supervisor = MonitorSupervisor::from_config(&config, registry, browser, human)?;
    info!(
        "Watching {} product(s) across {} store(s)",
        config.product_targets().len(),
        supervisor.plans().len()
    );

    let shutdown = Arc::new(GracefulShutdown::new());
    install_signal_handlers(shutdown.clone());
    let cancel = shutdown.token();

    let report = tokio::select! {
        report = supervisor.run_all(&cancel) => report,
        _ = shutdown.forced() => {
            warn!("Exiting without waiting for monitors");
            std::process::exit(130);
        }
    };

    output::print_report(&report, mode)?;

    let extra = report.double_purchase_count();
    if extra > 0 {
        error!("{} extra order(s) were placed, check your store accounts", extra);
        if let Some(webhook) = &webhook {
            webhook
                .notify_error(&format!("{extra} extra order(s) placed after a race was won"))
                .await;
        }
    }

    Ok(())
}
