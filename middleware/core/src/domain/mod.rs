// Copyright (c) 2026 Middleware Developers
// SPDX-License-Identifier: AGPL-3.0

pub mod audit;
pub mod config;
pub mod credential;
pub mod error;
pub mod events;
pub mod filter;
pub mod job;
pub mod repository;
pub mod schema;
pub mod service;
