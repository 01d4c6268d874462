// Copyright 2023 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The libibverbs/librdmacm connection layer, compiled with the `rdma`
//! feature. Address resolution and connection management go through the
//! RDMA connection manager; capability negotiation rides in the
//! connection private data.

mod connection;
pub mod ffi;

pub use connection::{
    accept_destination, connect_source, ConnectionConfig, VerbsBackend,
};
