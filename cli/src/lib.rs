// Copyright (c) 2026 Middleware Developers
// SPDX-License-Identifier: AGPL-3.0
//! `middlewared` CLI library: daemon lifecycle and client commands.

pub mod commands;
pub mod daemon;
pub mod logging;
