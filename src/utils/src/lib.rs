// Copyright 2023 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Helpers shared by the checkpoint and RDMA transport crates.

pub use vmm_sys_util::{errno, eventfd, tempfile};

pub mod byte_order;
pub mod time;
