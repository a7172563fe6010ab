// Copyright (c) 2026 Middleware Developers
// SPDX-License-Identifier: AGPL-3.0

pub mod audit;
pub mod db;
pub mod event_bus;
pub mod rate_limit;
pub mod repositories;

pub use audit::AuditSink;
pub use event_bus::{EventBus, EventBusBuilder, EventSink};
pub use repositories::{InMemoryConfigStore, PostgresConfigStore};
