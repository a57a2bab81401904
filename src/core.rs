//! Startup wiring: collaborators, background tasks, session supervisor.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::api::MtopClient;
use crate::codec::NoopCipher;
use crate::config::AppConfig;
use crate::credentials::CredentialCache;
use crate::dedup::{DedupLedger, DedupWindows};
use crate::dispatch::{DispatchDeps, Dispatcher};
use crate::llm::OpenAiReplyGenerator;
use crate::session::{run_supervisor, SessionRunner};
use crate::store::SqliteContextStore;
use crate::threadref::ThreadRefTracker;
use crate::traits::{ConversationStore, CredentialProvider, ReplyGenerator};

pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();

    // Ctrl-C flips the token; everything long-lived selects on it.
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                cancel.cancel();
            }
        });
    }

    // Health endpoint.
    {
        let bind = config.daemon.health_bind.clone();
        let port = config.daemon.health_port;
        tokio::spawn(async move {
            if let Err(e) = crate::daemon::start_health_server(&bind, port).await {
                error!(error = %e, "health server failed");
            }
        });
    }

    // Credentials: the supervisor re-reads these each attempt, but the own
    // identity must be resolvable before the pipeline is worth building.
    let provider: Arc<dyn CredentialProvider> = Arc::new(CredentialCache::new(
        &config.credentials.cache_path,
        &config.credentials.browser_state_path,
        &config.credentials.cookie_env,
    ));
    let Some(creds) = provider.credentials(false).await? else {
        anyhow::bail!(
            "no credentials found: set {} or provide {}",
            config.credentials.cookie_env,
            config.credentials.cache_path
        );
    };
    let own_id = creds.user_id()?;
    info!(own_id = %own_id, "credentials loaded");

    let sqlite_store =
        Arc::new(SqliteContextStore::new(&config.state.db_path, config.state.max_history).await?);
    let store: Arc<dyn ConversationStore> = sqlite_store.clone();

    // Daily history cleanup.
    {
        let store = sqlite_store.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(24 * 60 * 60));
            tick.tick().await; // the first tick fires immediately
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        if let Err(e) = store.clear_history(30).await {
                            warn!(error = %e, "history cleanup failed");
                        }
                    }
                }
            }
        });
    }

    let api_key = config.llm_api_key();
    if api_key.is_empty() {
        warn!("no LLM api key configured; generation will fail and fall back");
    }
    let system_prompt = match &config.llm.prompt_path {
        Some(path) => match std::fs::read_to_string(path) {
            Ok(prompt) => Some(prompt),
            Err(e) => {
                warn!(path, error = %e, "prompt file unreadable, using built-in prompt");
                None
            }
        },
        None => None,
    };
    let generator: Arc<dyn ReplyGenerator> = Arc::new(OpenAiReplyGenerator::new(
        &config.llm.base_url,
        &api_key,
        &config.llm.model,
        system_prompt,
    )?);

    let ledger = Arc::new(DedupLedger::new(DedupWindows {
        ingress: Duration::from_secs(config.dedup.ingress_window_secs),
        notice: Duration::from_secs(config.dedup.notice_window_secs),
        shipping: Duration::from_secs(config.dedup.shipping_window_secs),
        burst_guard: Duration::from_secs(config.dedup.burst_guard_secs),
    }));

    // Periodic GC of dedup records.
    {
        let ledger = ledger.clone();
        let cancel = cancel.clone();
        let sweep_interval = Duration::from_secs(config.dedup.sweep_interval_secs);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(sweep_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => ledger.sweep(Instant::now()),
                }
            }
        });
    }

    let threads = Arc::new(ThreadRefTracker::new());
    let dispatcher = Dispatcher::spawn(
        config.dispatch.workers,
        config.dispatch.queue_capacity,
        DispatchDeps {
            store,
            generator,
            threads: threads.clone(),
            ledger,
            own_id,
            context_limit: config.state.max_history,
        },
        cancel.clone(),
    );

    let runner = SessionRunner {
        config: config.session.clone(),
        api: Arc::new(MtopClient::new()?),
        cipher: Arc::new(NoopCipher),
        handler: dispatcher.clone(),
        threads,
    };

    run_supervisor(runner, provider, cancel.clone()).await?;

    // Let in-flight replies finish before the process exits.
    cancel.cancel();
    dispatcher.drain().await;
    info!("goodbye");
    Ok(())
}
