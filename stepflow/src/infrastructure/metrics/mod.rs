// /////////////////////////////////////////////////////////////////////////////
// StepFlow Pipeline Framework
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Telemetry sink implementations: Prometheus metrics and tracing-backed
//! spans.

pub mod observer;
pub mod service;

pub use observer::TracingSpanHandle;
pub use service::MetricsService;
