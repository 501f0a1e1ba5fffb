// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use anyhow::{bail, Context, Result};
use either::Either;
use std::{
    ffi::{OsStr, OsString},
    fs,
    os::unix::ffi::OsStrExt,
    path::Path,
};

fn os_str_strip_prefix<'a>(s: &'a OsStr, prefix: &OsStr) -> Option<&'a OsStr> {
    if s.as_bytes().starts_with(prefix.as_bytes()) {
        Some(OsStr::from_bytes(&s.as_bytes()[prefix.as_bytes().len()..]))
    } else {
        None
    }
}

fn read_param_file<P: AsRef<Path>>(path: P, file_prefix_symbol: &str) -> Result<Vec<OsString>> {
    let contents = fs::read_to_string(path)?;
    contents
        .lines()
        .enumerate()
        .map(|(lineno, line)| {
            if line.starts_with(file_prefix_symbol) {
                bail!("line {lineno}: recursive parameter file expansion is not supported");
            }
            Ok(OsString::from(line))
        })
        .collect()
}

fn expand_single_param(param: OsString, prefix: &str) -> Result<impl Iterator<Item = OsString>> {
    match os_str_strip_prefix(&param, OsStr::from_bytes(prefix.as_bytes())) {
        Some(path) => Ok(Either::Left(
            read_param_file(path, prefix)
                .with_context(|| format!("error processing parameter {:?}", param))?
                .into_iter(),
        )),
        None => Ok(Either::Right(std::iter::once(param))),
    }
}

/// Expands command line arguments containing parameter files, denoted by an
/// argument starting with `@`.
///
/// For an argument `@file`, the arguments read from the file are inserted in
/// place of the original `@file` argument. Arguments in the parameter file
/// are terminated by newlines. Nested expansion is unsupported.
fn expand_params<I>(itr: I) -> Result<Vec<OsString>>
where
    I: IntoIterator,
    I::Item: Into<OsString>,
{
    let mut expanded = Vec::new();

    for item in itr {
        let param: OsString = item.into();
        expanded.extend(expand_single_param(param, "@")?);
    }

    Ok(expanded)
}

/// [`expand_params`] applied to the arguments of the current process.
pub fn expanded_args_os() -> Result<Vec<OsString>> {
    expand_params(std::env::args_os())
}
