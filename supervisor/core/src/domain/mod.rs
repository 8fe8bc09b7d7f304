// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain Layer
//!
//! Pure types and rules of the runtime: nothing in here touches the OS
//! directly. Side effects are reached through the traits declared in
//! [`process`], [`health`], [`secrets`] and [`host`].

pub mod config;
pub mod error;
pub mod events;
pub mod health;
pub mod host;
pub mod manifest;
pub mod ports;
pub mod process;
pub mod resolver;
pub mod secrets;
pub mod state;
pub mod template;
