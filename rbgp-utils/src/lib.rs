//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

#![forbid(unsafe_code)]

pub mod bgp;
pub mod bytes;
pub mod ip;
pub mod task;
pub mod test;
