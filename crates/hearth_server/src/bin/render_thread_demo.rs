//! # Render Thread Demo
//!
//! Drives a toy renderer on its own thread the way an engine main loop would:
//! allocate mesh ids from a pool, upload vertex data as shared copy-on-write
//! buffers, request frames, and sync before shutdown.
//!
//! Run with: `RUST_LOG=debug cargo run --features demo --bin render_thread_demo [config.toml]`

use std::collections::HashMap;

use hearth_core::memory::alloc;
use hearth_core::CowData;
use hearth_server::{IdPool, Server, ServerConfig, ServerResult, ServerWrap};
use tracing::info;
use tracing_subscriber::EnvFilter;

const FRAMES: u32 = 240;

/// Stand-in for a GPU-owning renderer.
#[derive(Default)]
struct ToyRenderer {
    next_id: u32,
    meshes: HashMap<u32, CowData<f32>>,
    vertices_submitted: u64,
}

impl Server for ToyRenderer {
    fn init(&mut self) {
        info!("renderer init");
    }

    fn finish(&mut self) {
        info!(meshes = self.meshes.len(), "renderer finish");
        self.meshes.clear();
    }

    fn draw(&mut self, _swap_buffers: bool, _frame_step: f64) {
        self.vertices_submitted += self.meshes.values().map(|m| m.len() as u64).sum::<u64>();
    }
}

fn load_config() -> ServerResult<ServerConfig> {
    match std::env::args().nth(1) {
        Some(path) => {
            let text = std::fs::read_to_string(&path).map_err(|e| {
                hearth_server::ServerError::InvalidConfig(format!("failed to read {path}: {e}"))
            })?;
            ServerConfig::from_toml_str(&text)
        }
        None => Ok(ServerConfig::default()),
    }
}

fn main() -> ServerResult<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_thread_names(true)
        .init();

    let config = load_config()?;
    let pool = IdPool::from_config(&config);
    let wrap = ServerWrap::start(ToyRenderer::default(), config)?;

    // One quad's worth of vertices, shared by every mesh until edited.
    let quad = CowData::try_from_vec(vec![0.0_f32, 0.0, 1.0, 0.0, 1.0, 1.0, 0.0, 1.0])?;

    for i in 0..8_u16 {
        let id = pool.acquire(&wrap, |renderer| {
            renderer.next_id += 1;
            renderer.next_id
        });
        let mut vertices = quad.clone();
        if i % 2 == 1 {
            // Forks: this mesh gets private storage, the quad is untouched.
            vertices.set(0, f32::from(i));
        }
        wrap.call(move |renderer| {
            renderer.meshes.insert(id, vertices);
        });
    }

    for frame in 0..FRAMES {
        wrap.draw(true, 1.0 / 60.0);
        if frame % 60 == 59 {
            let meshes = wrap.call_ret(|renderer| renderer.meshes.len());
            info!(frame, meshes, "checkpoint");
        }
    }
    wrap.sync();

    pool.free_cached(&wrap, |_renderer, _unused_id| {});
    info!(
        frames_requested = FRAMES,
        frames_drawn = wrap.frames_drawn(),
        stats = ?wrap.queue_stats(),
        "main loop done"
    );

    let renderer = wrap.finish();
    info!(
        vertices = renderer.vertices_submitted,
        quad_shared_by = quad.refcount(),
        live_blocks = alloc::stats().live_blocks,
        "shutdown"
    );
    Ok(())
}
