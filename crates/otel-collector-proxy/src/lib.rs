// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod admission;
pub mod batch;
pub mod batcher;
pub mod config;
pub mod egress;
pub mod errors;
pub mod health;
pub mod http_utils;
pub mod ledger;
pub mod merge;
pub mod metrics;
pub mod pipeline;
pub mod proxy;
pub mod queue;
pub mod rate_limit;
pub mod retry;
pub mod router;
pub mod worker_pool;
