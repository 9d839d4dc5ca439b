//! Connection status of the Redis store

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum RedisHealthStatus {
    /// No connection attempt yet, or the last one failed
    Disconnected,
    Healthy,
    CircuitOpen,
    /// The owning store was closed
    Closed,
}

impl RedisHealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RedisHealthStatus::Disconnected => "disconnected",
            RedisHealthStatus::Healthy => "healthy",
            RedisHealthStatus::CircuitOpen => "circuit_open",
            RedisHealthStatus::Closed => "closed",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => RedisHealthStatus::Healthy,
            2 => RedisHealthStatus::CircuitOpen,
            3 => RedisHealthStatus::Closed,
            _ => RedisHealthStatus::Disconnected,
        }
    }
}

/// Point-in-time view of [`RedisHealth`], serializable for reports
#[derive(Debug, Clone, Serialize)]
pub struct RedisHealthSnapshot {
    pub status: RedisHealthStatus,
    pub connected_since: Option<DateTime<Utc>>,
    /// Connections established over the store's lifetime
    pub connects: u32,
    /// Established connections later dropped on I/O errors
    pub connection_losses: u32,
}

#[derive(Debug)]
pub struct RedisHealth {
    status: AtomicU8,
    connected_since: Mutex<Option<DateTime<Utc>>>,
    connects: AtomicU32,
    connection_losses: AtomicU32,
}

impl RedisHealth {
    pub fn new() -> Self {
        Self {
            status: AtomicU8::new(RedisHealthStatus::Disconnected as u8),
            connected_since: Mutex::new(None),
            connects: AtomicU32::new(0),
            connection_losses: AtomicU32::new(0),
        }
    }

    fn set_connected_since(&self, value: Option<DateTime<Utc>>) {
        *self
            .connected_since
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = value;
    }

    pub fn set_connected(&self) {
        self.status
            .store(RedisHealthStatus::Healthy as u8, Ordering::Release);
        self.connects.fetch_add(1, Ordering::AcqRel);
        self.set_connected_since(Some(Utc::now()));
    }

    /// The live connection was dropped after an I/O error.
    pub fn set_lost(&self) {
        let previous = self
            .status
            .swap(RedisHealthStatus::Disconnected as u8, Ordering::AcqRel);
        if previous == RedisHealthStatus::Healthy as u8 {
            self.connection_losses.fetch_add(1, Ordering::AcqRel);
        }
        self.set_connected_since(None);
    }

    /// A connection attempt failed.
    pub fn set_disconnected(&self) {
        self.status
            .store(RedisHealthStatus::Disconnected as u8, Ordering::Release);
    }

    pub fn set_circuit_open(&self) {
        self.status
            .store(RedisHealthStatus::CircuitOpen as u8, Ordering::Release);
    }

    pub fn set_closed(&self) {
        self.status
            .store(RedisHealthStatus::Closed as u8, Ordering::Release);
        self.set_connected_since(None);
    }

    pub fn status(&self) -> RedisHealthStatus {
        RedisHealthStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn is_healthy(&self) -> bool {
        self.status() == RedisHealthStatus::Healthy
    }

    pub fn snapshot(&self) -> RedisHealthSnapshot {
        RedisHealthSnapshot {
            status: self.status(),
            connected_since: *self
                .connected_since
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
            connects: self.connects.load(Ordering::Acquire),
            connection_losses: self.connection_losses.load(Ordering::Acquire),
        }
    }
}

impl Default for RedisHealth {
    fn default() -> Self {
        Self::new()
    }
}
