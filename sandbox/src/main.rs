// Copyright 2025 eraflo
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Khora Fiber Sandbox
// Simulated game loop driving fibers once per frame

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use khora_fiber::{FiberError, FiberTask, FiberTaskSource, FiberTaskStatus, Fibers};

const FRAME_TIME: Duration = Duration::from_millis(16);
const MAX_FRAMES: u64 = 600;

/// Starts a fake asset load on a worker thread.
///
/// The worker marshals its result back to the game loop thread, where the
/// returned task completes during a tick.
fn load_asset(
    fibers: &Fibers,
    name: &'static str,
    latency: Duration,
    loaded_bytes: Arc<AtomicUsize>,
) -> FiberTask {
    let source = fibers.source::<()>();
    let task = source.task();
    let scheduler = fibers.scheduler().clone();

    thread::spawn(move || {
        thread::sleep(latency);
        scheduler.post(
            move |source: FiberTaskSource<()>| {
                log::info!("Asset '{name}' arrived on the game thread.");
                loaded_bytes.fetch_add(name.len() * 1024, Ordering::Relaxed);
                if let Err(e) = source.resolve(()) {
                    log::error!("Failed to deliver asset '{name}': {e}");
                }
            },
            source,
        );
    });
    task
}

/// The level-loading fiber: waits for every asset, then fades in.
async fn load_level(fibers: Fibers) -> Result<usize, FiberError> {
    let loaded_bytes = Arc::new(AtomicUsize::new(0));
    let assets = [
        ("mesh.glb", Duration::from_millis(40)),
        ("albedo.png", Duration::from_millis(90)),
        ("theme.ogg", Duration::from_millis(10)),
    ]
    .map(|(name, latency)| load_asset(&fibers, name, latency, Arc::clone(&loaded_bytes)));

    fibers.all_of(&assets).await?;
    let bytes = loaded_bytes.load(Ordering::Relaxed);
    log::info!("Level assets loaded ({bytes} bytes), fading in...");

    fibers.delay(Duration::from_millis(250)).await?;
    fibers.yield_now().await;
    Ok(bytes)
}

fn main() -> Result<()> {
    use env_logger::{Builder, Env};

    Builder::from_env(Env::default().default_filter_or("info")).init();

    let fibers = Fibers::default();
    let level = fibers.spawn(load_level(fibers.clone()));

    // A request that never answers, abandoned after half a second.
    let stalled = fibers.source::<usize>();
    let stalled_task = stalled.task();
    let watchdog = fibers.with_timeout(&stalled_task, Duration::from_millis(500));

    let mut level_bytes = None;
    let mut watchdog_fired = false;
    for _ in 0..MAX_FRAMES {
        let report = fibers.tick(FRAME_TIME);
        if report.executed + report.marshalled > 0 {
            log::debug!("Frame {}: {report:?}", report.frame);
        }

        // Completed handles are only valid until the next tick, so read them now.
        if level_bytes.is_none() && level.is_completed() {
            level_bytes = Some(level.result()?);
        }
        if !watchdog_fired && watchdog.is_completed() {
            watchdog_fired = true;
            if stalled_task.status()? == FiberTaskStatus::Pending {
                log::warn!("Stalled request timed out, canceling it.");
                stalled_task.cancel()?;
            }
        }

        if level_bytes.is_some() && watchdog_fired {
            break;
        }
        thread::sleep(FRAME_TIME);
    }

    log::info!(
        "Level ready after {} frames with {} bytes of assets. {:?}",
        fibers.scheduler().frame(),
        level_bytes.unwrap_or_default(),
        fibers.stats()
    );
    Ok(())
}
