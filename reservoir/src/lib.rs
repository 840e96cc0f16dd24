// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

#![doc = include_str!("../README.md")]
#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub use reservoir_core::{EventSender, FnSender, HarvestResult, PriorityItem, SendError};

pub use crate::config::ReservoirConfig;
pub use crate::harvester::{HarvestWait, Harvester, HarvesterBuilder, HarvesterJoinHandle};
pub use crate::manager::{ReservoirManager, ReservoirManagerBuilder};
pub use crate::priority::PrioritySampler;
pub use crate::reservoir::Reservoir;

pub mod config;
mod harvester;
mod manager;
pub mod metrics;
pub mod priority;
pub(crate) mod rate_limit;
mod reservoir;

#[cfg(feature = "test-util")]
pub use reservoir_core::test_util;

#[doc(hidden)]
pub use reservoir_core as core;
