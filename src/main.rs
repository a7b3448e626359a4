use transcriptai::{bootstrap, router, spawn_warmup, Settings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let settings = Settings::from_env();
    log::info!(
        "starting transcriptai (data dir: {}, live={}, mic={}, batch_only={})",
        settings.data_dir.display(),
        settings.live_transcription,
        settings.live_mic,
        settings.live_batch_only
    );

    let bind_addr = format!("{}:{}", settings.host, settings.port);
    let state = bootstrap(settings).await?;
    let warmup = spawn_warmup(&state);

    let db = state.db.clone();
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    log::info!("listening on http://{bind_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            log::info!("shutdown signal received");
        })
        .await?;

    warmup.abort();
    db.cleanup().await;
    Ok(())
}
