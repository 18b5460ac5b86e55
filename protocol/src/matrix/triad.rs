//! # Triad Types
//!
//! A triad is a unit of data placed at a point in the matrix cube. Its id,
//! payload, creator, timestamp and position never change after creation;
//! only the validation fields (`validated`, `consensus`,
//! `validation_attempts`) move, and `validated` only ever goes from `false`
//! to `true`.

use rand::Rng;
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::TRIAD_ID_BYTES;

/// Integer coordinates inside the matrix cube.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Position {
    pub fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    /// Samples each axis independently and uniformly from `[0, dimensions)`.
    ///
    /// Placement is purely random. There is no attempt to seek an "optimal"
    /// spot; neighbor structure emerges from where triads happen to land.
    pub fn random(dimensions: u32) -> Self {
        let mut rng = rand::thread_rng();
        Self {
            x: rng.gen_range(0..dimensions),
            y: rng.gen_range(0..dimensions),
            z: rng.gen_range(0..dimensions),
        }
    }

    /// Euclidean distance to another position.
    pub fn distance(&self, other: &Position) -> f64 {
        let dx = self.x as f64 - other.x as f64;
        let dy = self.y as f64 - other.y as f64;
        let dz = self.z as f64 - other.z as f64;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }

    /// Returns `true` if every component lies in `[0, dimensions)`.
    pub fn within(&self, dimensions: u32) -> bool {
        self.x < dimensions && self.y < dimensions && self.z < dimensions
    }
}

/// A signed record placed in the matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Triad {
    /// 128-bit random id, 32 lowercase hex characters.
    pub id: String,
    /// Opaque payload supplied by the creator.
    pub data: Value,
    /// Address of the creating wallet.
    pub validator: String,
    /// Creation time, Unix milliseconds.
    pub timestamp: u64,
    pub position: Position,
    #[serde(default)]
    pub validated: bool,
    /// Last computed consensus score, in `[0, 1]`.
    #[serde(default)]
    pub consensus: f64,
    #[serde(default)]
    pub validation_attempts: u32,
}

impl Triad {
    /// Builds a pending triad with a fresh id and a random position.
    pub fn new(data: Value, validator: impl Into<String>, dimensions: u32) -> Self {
        Self {
            id: generate_triad_id(),
            data,
            validator: validator.into(),
            timestamp: now_millis(),
            position: Position::random(dimensions),
            validated: false,
            consensus: 0.0,
            validation_attempts: 0,
        }
    }
}

/// 128 bits from the OS RNG, hex encoded.
pub fn generate_triad_id() -> String {
    let mut bytes = [0u8; TRIAD_ID_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Current wall-clock time in Unix milliseconds.
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
