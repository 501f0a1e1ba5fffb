// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

mod clean_layer;
mod settings;
mod staging;
pub mod symlink_index;

pub use clean_layer::*;
pub use settings::*;
pub use staging::*;
