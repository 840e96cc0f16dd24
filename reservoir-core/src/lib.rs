// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

#![doc = include_str!("../README.md")]
#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub use crate::harvest::HarvestResult;
pub use crate::item::PriorityItem;
pub use crate::sender::{EventSender, FnSender, SendError};

pub mod harvest;
pub mod item;
pub mod sender;

/// In-memory events and senders for testing code that feeds or drains reservoirs.
#[cfg(feature = "test-util")]
pub mod test_util;
