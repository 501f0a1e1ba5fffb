// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

mod dualpath;
mod remove;
mod tempdir;
mod transfer;

pub use dualpath::DualPath;
pub use remove::*;
pub use tempdir::*;
pub use transfer::*;
