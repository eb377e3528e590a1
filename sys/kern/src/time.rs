// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implementation of kernel time.

/// In-kernel timestamp representation.
///
/// This is measured in timer interrupts since boot.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd)]
#[repr(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Advances by one timer tick.
    pub fn tick(&mut self) {
        self.0 = self.0.wrapping_add(1);
    }

    /// Low word, as handed to user code.
    pub fn low_word(self) -> u32 {
        self.0 as u32
    }
}
