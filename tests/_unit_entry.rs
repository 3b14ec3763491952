// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

#![allow(clippy::all)]

mod unit_tests {
    pub mod support;

    pub mod test_data_in;
    pub mod test_data_wait_hash;
    pub mod test_models;
    pub mod test_nop;
    pub mod test_r2t;
    pub mod test_sn_ordering;
    pub mod test_task_mgmt;
}
