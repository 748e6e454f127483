//! Detection server binary.
//!
use std::{net::SocketAddr, sync::Arc};

use anyhow::Result;
use clap::Parser;
use detect_server::{
    annotate::Annotator,
    app,
    config::Args,
    meter::spawn_meter_logger,
    nn::{load_labels, YoloModel},
    storage::DiskStorage,
    utils::resolve_model,
    AppState,
};
use env_logger::TimestampPrecision;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logger
    env_logger::builder()
        .format_timestamp(Some(TimestampPrecision::Millis))
        .init();

    let storage = Arc::new(DiskStorage::new(&args.storage_dir)?);

    // Build the model once, it is shared by all requests
    let model_path = resolve_model(&args.model, args.model_url.as_deref()).await?;
    let labels = load_labels(args.labels.as_deref())?;
    let model = YoloModel::new(&model_path, labels, args.yolo_params())?;

    let annotator = match &args.font {
        Some(font) => Annotator::with_font(font)?,
        None => {
            log::info!("No font given, drawing boxes without labels");
            Annotator::new()
        }
    };

    let state = Arc::new(AppState::new(
        storage,
        Arc::new(model),
        annotator,
        args.settings(),
    ));

    if args.sweep_on_start {
        state.sweeper.start();
    }

    spawn_meter_logger();

    // Serve HTTP server
    let addr: SocketAddr = args.address.parse()?;
    log::info!("Serving on http://{}", addr);
    axum::Server::bind(&addr)
        .serve(app(state).into_make_service())
        .await?;

    Ok(())
}
