// Layered stream I/O runtime: stackable filters over arbitrary transports.
//
// SPDX-License-Identifier: Apache-2.0
//
// Written in 2021-2025 by
//     Dr. Maxim Orlovsky <orlovsky@ubideco.org>
//     Alexis Sellier <alexis@cloudhead.io>
//
// Copyright 2022-2025 UBIDECO Labs, InDCS, Lugano, Switzerland. All Rights reserved.
// Copyright 2021-2023 Alexis Sellier <alexis@cloudhead.io>. All Rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not use this file except
// in compliance with the License. You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software distributed under the License
// is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express
// or implied. See the License for the specific language governing permissions and limitations under
// the License.


//! Helpers parsing `key=value` options of handle and accepter descriptors.
//!
//! Each helper returns `Ok(None)` when the option doesn't match the key, so option parsers can
//! try keys one after another and fail with [`Error::Inval`] on an option nobody recognized.

use crate::Error;

/// Matches `key=value` options, returning the value.
pub fn check_keyvalue<'a>(arg: &'a str, key: &str) -> Option<&'a str> {
    arg.strip_prefix(key)?.strip_prefix('=')
}

/// Matches boolean options: a bare `key` means `true`, otherwise the value must be one of
/// `true`/`false`, `yes`/`no`, `on`/`off` or `1`/`0`.
pub fn check_keybool(arg: &str, key: &str) -> Result<Option<bool>, Error> {
    if arg == key {
        return Ok(Some(true));
    }
    let Some(val) = check_keyvalue(arg, key) else {
        return Ok(None);
    };
    match val.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(Some(true)),
        "false" | "no" | "off" | "0" => Ok(Some(false)),
        _ => Err(Error::Inval),
    }
}

/// Matches data size options (decimal, or hexadecimal with a `0x` prefix).
pub fn check_keyds(arg: &str, key: &str) -> Result<Option<usize>, Error> {
    let Some(val) = check_keyvalue(arg, key) else {
        return Ok(None);
    };
    let size = match val.strip_prefix("0x").or_else(|| val.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(hex, 16),
        None => val.parse(),
    };
    size.map(Some).map_err(|_| Error::Inval)
}

/// Matches permission options, see [`parse_mode`].
pub fn check_keymode(arg: &str, key: &str) -> Result<Option<u32>, Error> {
    check_keyvalue(arg, key).map(parse_mode).transpose()
}

/// Parses a single permission class: either one octal digit or any combination of the `r`, `w`
/// and `x` characters.
pub fn parse_mode(val: &str) -> Result<u32, Error> {
    let mut chars = val.chars();
    if let Some(digit) = chars.clone().next().and_then(|c| c.to_digit(8)) {
        chars.next();
        return match chars.next() {
            None => Ok(digit),
            Some(_) => Err(Error::Inval),
        };
    }
    chars.try_fold(0, |mode, c| match c {
        'r' => Ok(mode | 4),
        'w' => Ok(mode | 2),
        'x' => Ok(mode | 1),
        _ => Err(Error::Inval),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modes() {
        assert_eq!(parse_mode("rwx"), Ok(7));
        assert_eq!(parse_mode("7"), Ok(7));
        assert_eq!(parse_mode("rx"), Ok(5));
        assert_eq!(parse_mode("w"), Ok(2));
        assert_eq!(parse_mode("0"), Ok(0));
        assert_eq!(parse_mode("z"), Err(Error::Inval));
        assert_eq!(parse_mode("8"), Err(Error::Inval));
        assert_eq!(parse_mode("77"), Err(Error::Inval));
        assert_eq!(parse_mode("r7"), Err(Error::Inval));
    }

    #[test]
    fn keymode() {
        assert_eq!(check_keymode("umode=rw", "umode"), Ok(Some(6)));
        assert_eq!(check_keymode("gmode=rw", "umode"), Ok(None));
        assert_eq!(check_keymode("umode=q", "umode"), Err(Error::Inval));
    }

    #[test]
    fn keyvalue() {
        assert_eq!(check_keyvalue("infile=/tmp/x", "infile"), Some("/tmp/x"));
        assert_eq!(check_keyvalue("infile=", "infile"), Some(""));
        assert_eq!(check_keyvalue("infilex=1", "infile"), None);
        assert_eq!(check_keyvalue("infile", "infile"), None);
    }

    #[test]
    fn keybool() {
        assert_eq!(check_keybool("create", "create"), Ok(Some(true)));
        assert_eq!(check_keybool("create=off", "create"), Ok(Some(false)));
        assert_eq!(check_keybool("create=Yes", "create"), Ok(Some(true)));
        assert_eq!(check_keybool("created", "create"), Ok(None));
        assert_eq!(check_keybool("create=maybe", "create"), Err(Error::Inval));
    }

    #[test]
    fn keyds() {
        assert_eq!(check_keyds("readbuf=4096", "readbuf"), Ok(Some(4096)));
        assert_eq!(check_keyds("readbuf=0x100", "readbuf"), Ok(Some(256)));
        assert_eq!(check_keyds("readbuf=-1", "readbuf"), Err(Error::Inval));
        assert_eq!(check_keyds("other=1", "readbuf"), Ok(None));
    }
}
