//! The seam between the worker pool and world generation.
//!
//! The pool treats generation as an opaque, synchronous, possibly slow and
//! possibly failing call. Anything implementing [`ChunkGenerator`] can be
//! plugged in; closures work too, which keeps test stubs short.

use anyhow::{Context, bail};
use chunkstream_core::types::{ChunkCoordinates, ChunkData, GenerationConfig};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

/// Largest chunk edge accepted by [`FlatChunkGenerator`].
pub const MAX_CHUNK_SIZE: usize = 256;

/// Produces the contents of one chunk.
///
/// Called from the blocking thread pool, one call per worker at a time. The
/// `cancel` token is triggered when the requester no longer wants the result;
/// long generators may poll it between phases and bail out early, but the pool
/// never depends on it.
pub trait ChunkGenerator: Send + Sync + 'static {
    /// # Errors
    ///
    /// Any error is reported to the requester as a generation failure.
    fn generate(
        &self,
        coords: ChunkCoordinates,
        config: &GenerationConfig,
        cancel: &CancellationToken,
    ) -> anyhow::Result<ChunkData>;
}

impl<F> ChunkGenerator for F
where
    F: Fn(ChunkCoordinates, &GenerationConfig, &CancellationToken) -> anyhow::Result<ChunkData>
        + Send
        + Sync
        + 'static,
{
    fn generate(
        &self,
        coords: ChunkCoordinates,
        config: &GenerationConfig,
        cancel: &CancellationToken,
    ) -> anyhow::Result<ChunkData> {
        self(coords, config, cancel)
    }
}

const PALETTE: [&str; 5] = ["water", "sand", "grass", "forest", "stone"];

/// Deterministic stand-in for the real terrain generator.
///
/// Fills a `size x size` grid of palette indices from a hash of the seed and
/// the world position of each tile, so neighbouring chunks line up and the
/// same request always yields the same chunk.
pub struct FlatChunkGenerator {
    default_size: usize,
}

impl FlatChunkGenerator {
    pub const fn new(default_size: usize) -> Self {
        Self { default_size }
    }

    fn size(&self, config: &GenerationConfig) -> anyhow::Result<usize> {
        match config.get("size") {
            None | Some(Value::Null) => Ok(self.default_size),
            Some(value) => {
                let size = value
                    .as_u64()
                    .context("`size` must be a positive integer")?;
                if size == 0 || size > MAX_CHUNK_SIZE as u64 {
                    bail!("`size` must be between 1 and {MAX_CHUNK_SIZE}, got {size}");
                }
                Ok(size as usize)
            }
        }
    }
}

impl ChunkGenerator for FlatChunkGenerator {
    fn generate(
        &self,
        coords: ChunkCoordinates,
        config: &GenerationConfig,
        cancel: &CancellationToken,
    ) -> anyhow::Result<ChunkData> {
        let seed = seed_of(config)?;
        let size = self.size(config)?;
        let origin_x = i64::from(coords.x) * size as i64;
        let origin_y = i64::from(coords.y) * size as i64;

        let mut tiles = Vec::with_capacity(size * size);
        for row in 0..size {
            if cancel.is_cancelled() {
                bail!("generation of chunk {coords} abandoned");
            }
            for col in 0..size {
                let height = mix(seed, origin_x + col as i64, origin_y + row as i64);
                tiles.push((height % PALETTE.len() as u64) as u8);
            }
        }

        Ok(json!({
            "size": size,
            "palette": PALETTE,
            "tiles": tiles,
        }))
    }
}

fn seed_of(config: &GenerationConfig) -> anyhow::Result<u64> {
    match config.get("seed") {
        None | Some(Value::Null) => Ok(0),
        Some(Value::String(s)) => Ok(s
            .bytes()
            .fold(0xcbf2_9ce4_8422_2325_u64, |acc, b| {
                (acc ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3)
            })),
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_i64().map(|v| v as u64))
            .context("`seed` must be an integer or a string"),
        Some(_) => bail!("`seed` must be an integer or a string"),
    }
}

// splitmix64 over the seed and tile position.
fn mix(seed: u64, x: i64, y: i64) -> u64 {
    let mut z = seed
        ^ (x as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15)
        ^ (y as u64).wrapping_mul(0xc2b2_ae3d_27d4_eb4f);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}
