/*
Copyright 2024 The Hyperlight Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

//! Parsing of session argument strings such as
//! `label="vmm", ram_quota=8M, cap_quota=20, priority=3`.

use crate::error::VmSessionError;
use crate::Result;

/// Splits `args` at top-level commas, leaving quoted strings intact.
fn split(args: &str) -> impl Iterator<Item = &str> {
    let mut in_quotes = false;
    args.split(move |c: char| {
        if c == '"' {
            in_quotes = !in_quotes;
        }
        c == ',' && !in_quotes
    })
    .map(str::trim)
    .filter(|arg| !arg.is_empty())
}

/// The raw value of `key`, if present.
pub fn find_arg<'a>(args: &'a str, key: &str) -> Option<&'a str> {
    split(args).find_map(|arg| {
        let (k, v) = arg.split_once('=')?;
        (k.trim() == key).then(|| v.trim())
    })
}

fn invalid(key: &str, value: &str) -> VmSessionError {
    VmSessionError::InvalidSessionArgs(format!("{}={}", key, value))
}

/// The value of `key` as an unsigned number, accepting the suffixes `K`,
/// `M` and `G` as well as a `0x` prefix. Returns `default` if absent.
pub fn ulong_value(args: &str, key: &str, default: u64) -> Result<u64> {
    let Some(value) = find_arg(args, key) else {
        return Ok(default);
    };
    let (digits, shift) = match value.chars().last() {
        Some('K' | 'k') => (&value[..value.len() - 1], 10),
        Some('M' | 'm') => (&value[..value.len() - 1], 20),
        Some('G' | 'g') => (&value[..value.len() - 1], 30),
        _ => (value, 0),
    };
    let number = match digits.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => digits.parse::<u64>(),
    }
    .map_err(|_| invalid(key, value))?;
    number
        .checked_mul(1 << shift)
        .ok_or_else(|| invalid(key, value))
}

/// The value of `key` as a signed number. Returns `default` if absent.
pub fn long_value(args: &str, key: &str, default: i64) -> Result<i64> {
    match find_arg(args, key) {
        Some(value) => value.parse::<i64>().map_err(|_| invalid(key, value)),
        None => Ok(default),
    }
}

/// The value of `key` with surrounding quotes removed.
pub fn string_value(args: &str, key: &str) -> Option<String> {
    find_arg(args, key).map(|value| {
        value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .unwrap_or(value)
            .to_string()
    })
}
