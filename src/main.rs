use std::{process, sync::Arc};

use refolo::{
    application::{
        error::AppError,
        purge::{CdnClient, CdnPurgeConsumer, PurgeFailurePolicy, VariantRules},
        queue::{ConsumerGroup, RevalidationQueue},
        regen::RegenerationConsumer,
        repos::CacheStateRepo,
        trigger::RevalidationTrigger,
        worker::{WorkerConfig, run_worker},
    },
    config,
    domain::entry::FreshnessRules,
    infra::{
        cdn::HttpCdnClient,
        db::{PostgresQueue, PostgresQueueConfig, PostgresRepositories},
        error::InfraError,
        renderer::HttpRenderer,
        telemetry,
    },
};
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Revalidate(args) => run_revalidate(settings, args).await,
        config::Command::Migrate(_) => run_migrate(settings).await,
    }
}

async fn init_repositories(settings: &config::Settings) -> Result<PostgresRepositories, AppError> {
    let database_url = settings
        .database
        .url
        .as_ref()
        .ok_or_else(|| InfraError::configuration("database url is not configured"))
        .map_err(AppError::from)?;

    let pool =
        PostgresRepositories::connect(database_url, settings.database.max_connections.get())
            .await
            .map_err(|err| AppError::from(InfraError::database(err.to_string())))?;

    PostgresRepositories::run_migrations(&pool)
        .await
        .map_err(|err| AppError::from(InfraError::database(err.to_string())))?;

    Ok(PostgresRepositories::new(pool))
}

struct PipelineContext {
    state: Arc<dyn CacheStateRepo>,
    queue: Arc<dyn RevalidationQueue>,
    freshness: FreshnessRules,
    cdn: Option<Arc<dyn CdnClient>>,
    settings: config::Settings,
}

fn build_pipeline_context(
    repositories: PostgresRepositories,
    settings: config::Settings,
) -> Result<PipelineContext, AppError> {
    let queue = Arc::new(PostgresQueue::new(
        repositories.clone(),
        PostgresQueueConfig {
            visibility_timeout: settings.queue.visibility_timeout,
            max_receive_count: settings.queue.max_receive_count,
        },
    ));

    let freshness = FreshnessRules::new(
        settings.regeneration.default_ttl,
        settings.regeneration.route_ttls.clone(),
    );

    let cdn: Option<Arc<dyn CdnClient>> = HttpCdnClient::from_settings(&settings.cdn)
        .map_err(AppError::from)?
        .map(|client| Arc::new(client) as Arc<dyn CdnClient>);

    Ok(PipelineContext {
        state: Arc::new(repositories),
        queue,
        freshness,
        cdn,
        settings,
    })
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let repositories = init_repositories(&settings).await?;
    let app = build_pipeline_context(repositories, settings)?;

    let renderer = Arc::new(HttpRenderer::new(&app.settings.regeneration)?);
    let regeneration = Arc::new(RegenerationConsumer::new(
        app.state.clone(),
        renderer,
        app.freshness.clone(),
    ));

    let policy = match app.settings.cdn.failure_mode {
        config::PurgeFailureMode::WholeBatch => PurgeFailurePolicy::WholeBatch,
        config::PurgeFailureMode::PerMessage => PurgeFailurePolicy::PerMessage,
    };
    let purge = Arc::new(CdnPurgeConsumer::new(
        app.cdn.clone(),
        VariantRules::new(
            app.settings.cdn.fragment_suffix.clone(),
            app.settings.cdn.data_prefix.clone(),
        ),
        policy,
    ));

    let worker_config = WorkerConfig {
        batch_size: app.settings.queue.batch_size,
        poll_interval: app.settings.queue.poll_interval,
        batch_deadline: app.settings.queue.batch_deadline,
    };

    let regen_handle = tokio::spawn(run_worker(
        app.queue.clone(),
        ConsumerGroup::Regeneration,
        regeneration,
        worker_config.clone(),
    ));
    let purge_handle = tokio::spawn(run_worker(
        app.queue.clone(),
        ConsumerGroup::CdnPurge,
        purge,
        worker_config,
    ));

    info!("Workers running; waiting for shutdown signal");
    tokio::signal::ctrl_c()
        .await
        .map_err(|err| AppError::from(InfraError::Io(err)))?;
    info!("Shutdown signal received; stopping workers");

    // In-flight batches die unacknowledged and redeliver after the
    // visibility window; nothing half-processed gets acknowledged.
    regen_handle.abort();
    purge_handle.abort();
    let _ = regen_handle.await;
    let _ = purge_handle.await;

    Ok(())
}

async fn run_revalidate(
    settings: config::Settings,
    args: config::RevalidateArgs,
) -> Result<(), AppError> {
    let repositories = init_repositories(&settings).await?;
    let app = build_pipeline_context(repositories, settings)?;

    let trigger = RevalidationTrigger::new(app.state, app.queue, app.freshness);

    let ticket = match (&args.path, &args.tag) {
        (Some(path), tag) => {
            trigger
                .revalidate_path(&args.host, path, tag.as_deref())
                .await?
        }
        (None, Some(tag)) => trigger.revalidate_tag(&args.host, tag).await?,
        (None, None) => {
            return Err(AppError::validation(
                "revalidate requires --path and/or --tag",
            ));
        }
    };

    info!(
        tag = %ticket.tag,
        paths = ticket.paths.len(),
        enqueued = ticket.enqueued,
        "Revalidation enqueued"
    );
    Ok(())
}

async fn run_migrate(settings: config::Settings) -> Result<(), AppError> {
    let repositories = init_repositories(&settings).await?;
    repositories
        .health_check()
        .await
        .map_err(|err| AppError::from(InfraError::database(err.to_string())))?;
    info!("Migrations applied");
    Ok(())
}
