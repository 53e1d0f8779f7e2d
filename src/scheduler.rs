//! Periodic scheduler: walks the target image list on a fixed cadence
//! and dispatches missing images to the coordinator.

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::coordinator;
use crate::image_list::ImageListCache;
use crate::state::AppState;

/// Run the scheduler loop until shutdown. Each tick snapshots the target
/// list and the local image set, dispatches one independent task per
/// missing image, and waits for all of that tick's tasks before the next
/// tick can start (a long-running pull may still straddle many ticks if
/// it outlives the interval, since ticks never preempt in-flight work).
pub async fn run(state: AppState, list: &ImageListCache, interval: std::time::Duration, mut shutdown: watch::Receiver<bool>) {
    info!(interval_secs = interval.as_secs(), "starting periodic preheat scheduler");
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // skip the immediate first tick

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                run_tick(&state, list).await;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("scheduler shutting down");
                    break;
                }
            }
        }
    }
}

async fn run_tick(state: &AppState, list: &ImageListCache) {
    let targets = list.snapshot().await;
    let local = match state.engine().list().await {
        Ok(set) => set,
        Err(e) => {
            warn!(error = %e, "failed to list local images, skipping this tick");
            return;
        }
    };

    let missing: Vec<String> = targets
        .into_iter()
        .filter(|image| !image.is_empty() && !local.contains(image))
        .collect();

    if missing.is_empty() {
        return;
    }
    info!(count = missing.len(), "dispatching preheat tasks for missing images");

    let mut tasks = Vec::with_capacity(missing.len());
    for image in missing {
        let state = state.clone();
        tasks.push(tokio::spawn(async move {
            match coordinator::preheat(&state, &image).await {
                Ok(()) => {}
                Err(coordinator::PreheatError::AlreadyInFlight) => {
                    debug!(image = %image, "preheat already in flight on this node, skipping");
                }
                Err(e) => error!(image = %image, error = %e, "preheat task failed"),
            }
        }));
    }

    for task in tasks {
        let _ = task.await;
    }
}
