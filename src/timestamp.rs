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


use std::fmt::{self, Display, Formatter};
use std::time::SystemTime;

/// Wall-clock UNIX timestamp with millisecond resolution, used to mark trace records.
#[derive(Wrapper, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, From)]
#[wrapper(LowerHex, UpperHex)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates timestamp matching the current moment.
    ///
    /// A system clock set before the UNIX epoch produces the zero timestamp.
    pub fn now() -> Self {
        let duration = SystemTime::now().duration_since(SystemTime::UNIX_EPOCH).unwrap_or_default();
        Self(duration.as_millis() as u64)
    }

    pub fn secs(self) -> u64 { self.0 / 1000 }

    pub fn subsec_millis(self) -> u64 { self.0 % 1000 }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:03}", self.secs(), self.subsec_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display() {
        assert_eq!(Timestamp::from(1_700_000_000_042).to_string(), "1700000000.042");
        assert_eq!(Timestamp::from(5).to_string(), "0.005");
    }

    #[test]
    fn parts() {
        let ts = Timestamp::from(11_500);
        assert_eq!(ts.secs(), 11);
        assert_eq!(ts.subsec_millis(), 500);
        assert!(Timestamp::now() > ts);
    }
}
