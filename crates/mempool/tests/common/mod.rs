//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::prelude::*;

use nebula_mempool::{MemConfig, MemSystem};

/// One captured log event
#[derive(Debug, Clone)]
pub struct Captured {
    pub level: Level,
    pub target: String,
    pub message: String,
}

/// Layer that records every event it sees
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<Captured>>>,
}

impl EventLog {
    pub fn events(&self) -> Vec<Captured> {
        self.events.lock().unwrap().clone()
    }

    /// Events at `level` whose message contains `needle`
    pub fn count(&self, level: Level, needle: &str) -> usize {
        self.events()
            .iter()
            .filter(|event| event.level == level && event.message.contains(needle))
            .count()
    }
}

struct MessageVisitor(String);

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{value:?}");
        }
    }
}

impl<S: Subscriber> Layer<S> for EventLog {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor(String::new());
        event.record(&mut visitor);
        self.events.lock().unwrap().push(Captured {
            level: *event.metadata().level(),
            target: event.metadata().target().to_string(),
            message: visitor.0,
        });
    }
}

/// Run `f` with every event on this thread recorded.
pub fn capture<R>(f: impl FnOnce() -> R) -> (R, EventLog) {
    let log = EventLog::default();
    let subscriber = tracing_subscriber::registry().with(log.clone());
    let result = tracing::subscriber::with_default(subscriber, f);
    (result, log)
}

/// Allocator without guard bands or fill patterns
pub fn plain() -> MemSystem {
    MemSystem::new(MemConfig::production()).unwrap()
}

/// Allocator with guard bands, fill patterns and WARN-level overflow logs
pub fn guarded() -> MemSystem {
    MemSystem::new(MemConfig::debug()).unwrap()
}

/// Allocator with a static arena of `arena_size` bytes and no guard bands
pub fn with_arena(arena_size: usize) -> MemSystem {
    MemSystem::new(MemConfig::production().with_arena_size(arena_size)).unwrap()
}

/// Fill an object's payload with bytes derived from `seed`.
pub fn stamp(system: &MemSystem, object: nebula_mempool::ObjRef, seed: u8) {
    system.with_payload_mut(object, |payload| {
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte = seed.wrapping_add(i as u8);
        }
    });
}

/// Whether an object's payload still matches [`stamp`]
pub fn has_stamp(system: &MemSystem, object: nebula_mempool::ObjRef, seed: u8) -> bool {
    system.with_payload(object, |payload| {
        payload
            .iter()
            .enumerate()
            .all(|(i, &byte)| byte == seed.wrapping_add(i as u8))
    })
}
