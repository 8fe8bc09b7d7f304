// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! deskbundle CLI library - exposes testable components
//!
//! # Architecture
//!
//! - **Layer:** Interface / Presentation Layer
//! - **Purpose:** Resolves bundle paths, drives one supervisor session and
//!   renders its progress and failures for a terminal

pub mod paths;
pub mod report;
pub mod run;
