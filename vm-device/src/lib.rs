// Copyright © 2019 Intel Corporation. All Rights Reserved.
// Copyright © 2026 The snapfuzz Authors
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Minimal device model: devices answering guest MMIO accesses and the bus
//! routing those accesses to them.

mod bus;

pub use self::bus::{Bus, BusDevice, BusRange, Error as BusError};
